//! JSON decoding of relay envelopes with readable failure messages.

/// Decode `body`, describing failures with the serde path, the type mismatch
/// and a snippet of the offending line.
///
/// Relay bodies embed whole portal pages with Vietnamese text, so the snippet
/// is cut on character boundaries rather than bytes.
pub fn parse_json_with_context<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, String> {
    let jd = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(jd).map_err(|err| {
        let inner = err.inner();
        let (line, column) = (inner.line(), inner.column());
        let path = err.path().to_string();

        let msg = inner.to_string();
        let loc = format!(" at line {line} column {column}");
        let msg = msg.strip_suffix(&loc).unwrap_or(&msg);

        let mut out = String::new();
        if !path.is_empty() && path != "." {
            out.push_str(&format!("at path '{path}': "));
        }
        out.push_str(&format!(
            "{} (line {line} col {column})\n{}",
            describe_mismatch(msg),
            error_snippet(body, line, column, 24)
        ));
        out
    })
}

/// Rewrite "invalid type: X, expected Y" as "expected Y, got X".
fn describe_mismatch(msg: &str) -> String {
    if let Some(rest) = msg.strip_prefix("invalid type: ")
        && let Some((actual, expected)) = rest.split_once(", expected ")
    {
        return format!("expected {expected}, got {actual}");
    }
    msg.to_owned()
}

fn error_snippet(body: &str, line: usize, column: usize, context_len: usize) -> String {
    let target: Vec<char> = body
        .lines()
        .nth(line.saturating_sub(1))
        .unwrap_or("")
        .chars()
        .collect();
    if target.is_empty() {
        return "(empty line)".to_owned();
    }

    // serde_json columns are 1-based byte offsets; treat them as char offsets,
    // which is exact for ASCII and close enough elsewhere.
    let error_idx = column.saturating_sub(1).min(target.len());
    let half = context_len / 2;
    let start = error_idx.saturating_sub(half);
    let end = (error_idx + half).min(target.len());

    let slice: String = target[start..end].iter().collect();
    let indicator = " ".repeat(error_idx - start) + "^";
    format!("...{slice}...\n   {indicator}")
}
