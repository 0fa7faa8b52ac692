//! Error types for the CTMS portal client.

use std::time::Duration;

use crate::utils::fmt_duration;

/// Failure reported by the relay transport.
///
/// `Unreachable` and `Malformed` mean no usable relay envelope came back.
/// `Upstream` means the relay answered but the portal replied with a non-2xx
/// status; the portal body (if any) is still carried so it can be classified.
#[derive(Debug, thiserror::Error)]
pub enum TransportFailure {
    #[error("relay is unreachable")]
    Unreachable(#[source] anyhow::Error),
    #[error("relay returned a malformed envelope: {0}")]
    Malformed(String),
    #[error("portal responded with status {status}")]
    Upstream {
        status: u16,
        body: Option<String>,
        runtime: Duration,
    },
}

impl TransportFailure {
    /// Portal-side latency reported by the relay, when the relay answered at all.
    pub fn runtime(&self) -> Option<Duration> {
        match self {
            Self::Upstream { runtime, .. } => Some(*runtime),
            _ => None,
        }
    }
}

/// Machine classification of a [`CtmsError`], used for logging and the `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Maintenance,
    SessionExpired,
    PolicyBlocked,
    FeaturePrecondition,
    SubmissionRejected,
    InvalidHandler,
    Parse,
}

#[derive(Debug, thiserror::Error)]
pub enum CtmsError {
    #[error("relay request failed after {}", fmt_duration(*c2m))]
    Transport {
        #[source]
        source: TransportFailure,
        c2m: Duration,
    },
    #[error("CTMS is under maintenance: {message}")]
    Maintenance { message: String, c2m: Duration },
    #[error("session expired or this account may not access the requested page")]
    SessionExpired { c2m: Duration },
    #[error("CTMS requires a password change; complete it on the portal before continuing")]
    PolicyBlocked { c2m: Duration },
    #[error("{0}")]
    FeaturePrecondition(String),
    #[error("submission rejected: {0}")]
    SubmissionRejected(String),
    #[error("cannot subscribe to unknown event type `{0}`")]
    InvalidHandler(String),
    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },
}

impl CtmsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Maintenance { .. } => ErrorKind::Maintenance,
            Self::SessionExpired { .. } => ErrorKind::SessionExpired,
            Self::PolicyBlocked { .. } => ErrorKind::PolicyBlocked,
            Self::FeaturePrecondition(_) => ErrorKind::FeaturePrecondition,
            Self::SubmissionRejected(_) => ErrorKind::SubmissionRejected,
            Self::InvalidHandler(_) => ErrorKind::InvalidHandler,
            Self::Parse { .. } => ErrorKind::Parse,
        }
    }

    /// Client-to-relay overhead measured for the failed request, if a request was made.
    pub fn c2m(&self) -> Option<Duration> {
        match self {
            Self::Transport { c2m, .. }
            | Self::Maintenance { c2m, .. }
            | Self::SessionExpired { c2m }
            | Self::PolicyBlocked { c2m } => Some(*c2m),
            _ => None,
        }
    }

    /// Portal status behind a failure, when the relay delivered one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Transport {
                source: TransportFailure::Upstream { status, .. },
                ..
            } => Some(*status),
            Self::Maintenance { .. } => Some(503),
            _ => None,
        }
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::FeaturePrecondition(message.into())
    }

    pub(crate) fn parse(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Parse {
            what,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_timing() {
        let err = CtmsError::SessionExpired {
            c2m: Duration::from_millis(12),
        };
        assert_eq!(err.kind(), ErrorKind::SessionExpired);
        assert_eq!(err.c2m(), Some(Duration::from_millis(12)));

        let err = CtmsError::precondition("prefetch required");
        assert_eq!(err.kind(), ErrorKind::FeaturePrecondition);
        assert_eq!(err.c2m(), None);
        assert_eq!(err.to_string(), "prefetch required");
    }

    #[test]
    fn test_maintenance_message_in_display() {
        let err = CtmsError::Maintenance {
            message: "Portal under maintenance".to_owned(),
            c2m: Duration::ZERO,
        };
        assert!(err.to_string().ends_with("Portal under maintenance"));
    }

    #[test]
    fn test_upstream_runtime() {
        let failure = TransportFailure::Upstream {
            status: 500,
            body: None,
            runtime: Duration::from_millis(80),
        };
        assert_eq!(failure.runtime(), Some(Duration::from_millis(80)));
        assert_eq!(
            TransportFailure::Malformed("x".into()).runtime(),
            None
        );
    }

    #[test]
    fn test_upstream_status() {
        let err = CtmsError::Transport {
            source: TransportFailure::Upstream {
                status: 502,
                body: None,
                runtime: Duration::ZERO,
            },
            c2m: Duration::ZERO,
        };
        assert_eq!(err.upstream_status(), Some(502));

        let err = CtmsError::Transport {
            source: TransportFailure::Malformed("x".into()),
            c2m: Duration::ZERO,
        };
        assert_eq!(err.upstream_status(), None);
        assert_eq!(CtmsError::SessionExpired { c2m: Duration::ZERO }.upstream_status(), None);
    }
}
