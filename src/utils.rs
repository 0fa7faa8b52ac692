use md5::{Digest, Md5};
use std::time::{Duration, Instant};

/// Format a `Duration` as a human-readable string with automatic unit scaling.
///
/// Produces output like `1.94ms` or `2.34s` using Rust's Debug format.
pub fn fmt_duration(d: Duration) -> String {
    format!("{d:.2?}")
}

/// Log a warning if a portal request took longer than `threshold`.
pub fn log_if_slow(start: Instant, threshold: Duration, path: &str) {
    let elapsed = start.elapsed();
    if elapsed > threshold {
        tracing::warn!(duration = fmt_duration(elapsed), path, "slow portal request");
    }
}

/// Convert a relay-reported runtime in seconds into a `Duration`.
///
/// Negative, NaN or absurd values collapse to zero rather than failing.
pub fn runtime_from_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_default()
}

/// Lowercase hex MD5 digest, the form CTMS expects for login passwords.
pub fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}
