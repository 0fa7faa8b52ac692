use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use ctms::ctms::models::exams::ExamFilter;

/// Command-line client for the CTMS academic portal
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    /// Print request timing statistics to stderr when done
    #[arg(long)]
    pub stats: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load the home page and report whether the stored session is signed in
    Status,
    /// Sign in; the password is read from CTMS_PASSWORD when not given
    Login {
        username: String,
        #[arg(long, env = "CTMS_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Sign out and forget the stored session
    Logout,
    /// Study results with grade points and classification
    Results,
    /// Purchased service windows
    Services,
    /// Weekly schedule
    Schedule {
        /// Any day of the week to show (YYYY-MM-DD); defaults to the current week
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Read a schedule note by id (fetches the schedule first)
    Note {
        id: u64,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Exam calendar
    Exams {
        #[arg(long, value_enum, default_value_t = ExamFilterArg::All)]
        filter: ExamFilterArg,
    },
    /// Credit-class subscription
    Subscribe {
        #[command(subcommand)]
        action: Option<SubscribeAction>,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum SubscribeAction {
    /// List open and subscribed classes
    List,
    /// Subscribe to a class by its numeric id
    Add { class_id: u64 },
    /// Cancel a subscription by its numeric class id
    Remove { class_id: u64 },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExamFilterArg {
    All,
    Ended,
    Coming,
}

impl From<ExamFilterArg> for ExamFilter {
    fn from(value: ExamFilterArg) -> Self {
        match value {
            ExamFilterArg::All => ExamFilter::All,
            ExamFilterArg::Ended => ExamFilter::Ended,
            ExamFilterArg::Coming => ExamFilter::Coming,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TracingFormat {
    /// Human-readable output for terminals
    Pretty,
    /// One JSON object per line
    Json,
}

#[cfg(debug_assertions)]
const DEFAULT_TRACING_FORMAT: TracingFormat = TracingFormat::Pretty;
#[cfg(not(debug_assertions))]
const DEFAULT_TRACING_FORMAT: TracingFormat = TracingFormat::Json;

fn default_tracing_format() -> TracingFormat {
    DEFAULT_TRACING_FORMAT
}
