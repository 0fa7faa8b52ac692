//! Study results (`/KetquaHoctap.aspx`): per-subject scores, grading and the
//! cumulative point average.

use serde::Serialize;
use std::fmt;
use tracing::debug;

use crate::ctms::markup::{self, Document};

/// Weights of the attendance, midterm and final components, in tenths.
const ATTENDANCE_WEIGHT: f64 = 1.0;
const MIDTERM_WEIGHT: f64 = 2.0;
const FINAL_WEIGHT: f64 = 7.0;

/// Inclusive lower bounds on the 10-point average, highest first.
const GRADE_TABLE: &[(f64, f64, &str)] = &[
    (9.0, 4.0, "A+"),
    (8.5, 4.0, "A"),
    (8.0, 3.5, "B+"),
    (7.0, 3.0, "B"),
    (6.5, 2.5, "C+"),
    (5.5, 2.0, "C"),
    (5.0, 1.5, "D+"),
    (4.0, 1.0, "D"),
];

const INFO_ROW: &str = "#leftcontent > table.ThongtinSV > tbody > tr";
const RESULT_ROWS: &str = "#leftcontent > table.RowEffect.CenterElement > tbody > tr";

/// A component score cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    Value(f64),
    /// The portal renders `"?"` for scores that are not published yet.
    Pending,
}

impl Serialize for Score {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Score::Value(v) => s.serialize_f64(*v),
            Score::Pending => s.serialize_str("?"),
        }
    }
}

impl Score {
    /// Parse a score cell. Empty cells yield `None`; unparseable text is treated as empty.
    pub fn parse(text: &str) -> Option<Score> {
        match text.trim() {
            "" => None,
            "?" => Some(Score::Pending),
            v => match v.replace(',', ".").parse() {
                Ok(value) => Some(Score::Value(value)),
                Err(_) => {
                    debug!(cell = v, "Treating unreadable score cell as empty");
                    None
                }
            },
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            Score::Value(v) => Some(v),
            Score::Pending => None,
        }
    }
}

/// Four-point value and letter for a 10-point average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Grade {
    pub point: f64,
    pub letter: &'static str,
}

/// Convert a 10-point average to its four-point grade.
pub fn grade(average: f64) -> Grade {
    GRADE_TABLE
        .iter()
        .find(|(min, _, _)| average >= *min)
        .map(|&(_, point, letter)| Grade { point, letter })
        .unwrap_or(Grade {
            point: 0.0,
            letter: "F",
        })
}

/// Overall standing derived from the cumulative four-point average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Classification {
    Excellent,
    Good,
    Fair,
    Average,
    Weak,
}

impl Classification {
    pub fn from_cumulative(cpa: f64) -> Self {
        if cpa >= 3.6 {
            Self::Excellent
        } else if cpa >= 3.2 {
            Self::Good
        } else if cpa >= 2.5 {
            Self::Fair
        } else if cpa >= 2.0 {
            Self::Average
        } else {
            Self::Weak
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Excellent => "Excellent",
            Self::Good => "Good",
            Self::Fair => "Fair",
            Self::Average => "Average",
            Self::Weak => "Weak",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectResult {
    pub subject: String,
    pub credits: u32,
    pub class_id: String,
    pub teacher: String,
    /// Attendance ("điểm chuyên cần").
    pub attendance: Option<Score>,
    /// Midterm ("điểm điều kiện").
    pub midterm: Option<Score>,
    /// Final exam ("điểm học kỳ").
    pub final_exam: Option<Score>,
    pub average: Option<f64>,
    pub grade: Option<Grade>,
}

impl SubjectResult {
    /// Build a row, grading it only when all three components are numeric.
    pub fn new(
        subject: String,
        credits: u32,
        class_id: String,
        teacher: String,
        attendance: Option<Score>,
        midterm: Option<Score>,
        final_exam: Option<Score>,
    ) -> Self {
        let numeric = |s: Option<Score>| s.and_then(Score::value);
        let average = match (numeric(attendance), numeric(midterm), numeric(final_exam)) {
            (Some(cc), Some(dk), Some(hk)) => Some(weighted_average(cc, dk, hk)),
            _ => None,
        };

        Self {
            subject,
            credits,
            class_id,
            teacher,
            attendance,
            midterm,
            final_exam,
            average,
            grade: average.map(grade),
        }
    }
}

/// `0.1·cc + 0.2·dk + 0.7·hk`, rounded to hundredths.
///
/// Summed in tenths so averages landing on a grade bound compare equal to it.
fn weighted_average(cc: f64, dk: f64, hk: f64) -> f64 {
    let tenths = ATTENDANCE_WEIGHT * cc + MIDTERM_WEIGHT * dk + FINAL_WEIGHT * hk;
    (tenths * 10.0).round() / 100.0
}

/// `Σ(point·credits) / Σ(credits)` over graded subjects; 0 when nothing is graded.
pub fn cumulative_average(results: &[SubjectResult]) -> f64 {
    let (points, credits) = results
        .iter()
        .filter_map(|r| r.grade.map(|g| (g.point, r.credits)))
        .fold((0.0, 0u32), |(points, credits), (point, c)| {
            (points + point * f64::from(c), credits + c)
        });

    if credits == 0 {
        0.0
    } else {
        points / f64::from(credits)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StudentInfo {
    pub name: String,
    pub birthday: String,
    pub training_form: String,
    pub student_id: String,
    pub faculty: String,
    pub department: String,
    pub course: String,
    pub classroom: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultsReport {
    pub info: StudentInfo,
    pub results: Vec<SubjectResult>,
    pub cumulative: f64,
    pub classification: Classification,
}

impl ResultsReport {
    pub fn from_results(info: StudentInfo, results: Vec<SubjectResult>) -> Self {
        let cumulative = cumulative_average(&results);
        Self {
            info,
            results,
            cumulative,
            classification: Classification::from_cumulative(cumulative),
        }
    }
}

/// Extract the results report from a study results page.
pub fn parse_results(doc: &Document) -> ResultsReport {
    ResultsReport::from_results(parse_student_info(doc), parse_subject_rows(doc))
}

fn parse_student_info(doc: &Document) -> StudentInfo {
    let cell = |row: usize, col: usize| {
        doc.label_at(&format!(
            "{INFO_ROW}:nth-child({row}) > td:nth-child({col})"
        ))
        .unwrap_or_default()
    };

    StudentInfo {
        name: cell(1, 2),
        birthday: cell(1, 4),
        training_form: cell(2, 2),
        student_id: cell(2, 4),
        faculty: cell(3, 2),
        department: cell(3, 4),
        course: cell(4, 2),
        classroom: cell(4, 4),
        mode: parse_mode(doc),
    }
}

/// The study mode line is a bare text node directly under `#leftcontent`.
fn parse_mode(doc: &Document) -> String {
    let Some(content) = doc.by_id("leftcontent") else {
        return String::new();
    };

    content
        .children()
        .filter_map(|node| node.value().as_text().map(|t| markup::collapse_whitespace(t)))
        .find(|t| !t.is_empty())
        .unwrap_or_default()
}

fn parse_subject_rows(doc: &Document) -> Vec<SubjectResult> {
    doc.select_all(RESULT_ROWS)
        .into_iter()
        .filter_map(|row| {
            let cells: Vec<String> = markup::child_elements(row)
                .into_iter()
                .filter(|c| c.value().name() == "td")
                .map(markup::text)
                .collect();

            // Header rows use <th>; malformed rows are skipped.
            if cells.len() < 7 {
                return None;
            }

            Some(SubjectResult::new(
                cells[0].clone(),
                cells[1].parse().unwrap_or(0),
                cells[2].clone(),
                cells[3].clone(),
                Score::parse(&cells[4]),
                Score::parse(&cells[5]),
                Score::parse(&cells[6]),
            ))
        })
        .collect()
}
