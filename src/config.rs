//! Application configuration.
//!
//! Loaded with figment from an optional `ctms.toml` in the working directory,
//! overridden by `CTMS_`-prefixed environment variables (e.g. `CTMS_RELAY_URL`).

use anyhow::Context;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_FILE: &str = "ctms.toml";
pub const ENV_PREFIX: &str = "CTMS_";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Level for this crate's logs when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Base URL of the relay middleware.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Origin of the CTMS portal the relay forwards to.
    #[serde(default = "default_portal_url")]
    pub portal_url: String,
    /// JSON file holding the persisted session token.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Accepts `30s`, `1500ms`, `2m` or a bare number of seconds.
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
    /// Requests per minute sent to the relay. Zero disables limiting.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_relay_url() -> String {
    "http://localhost".to_owned()
}

fn default_portal_url() -> String {
    "http://ctms.fithou.net.vn".to_owned()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("ctms-store.json")
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_rate_limit() -> u32 {
    30
}

impl Config {
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::figment()
            .extract()
            .context("Failed to load configuration")
    }
}

/// Parse a duration string with fundu, treating bare numbers as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let parser = DurationParser::with_time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
    ]);
    let parsed = parser
        .parse(input.trim())
        .map_err(|e| format!("invalid duration `{input}`: {e}"))?;
    Duration::try_from(parsed).map_err(|e| format!("invalid duration `{input}`: {e}"))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
