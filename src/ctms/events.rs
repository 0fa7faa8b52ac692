//! Named-event dispatch decoupling the client from its consumers.
//!
//! Handlers run synchronously on the publishing task, in registration order.
//! A handler that returns an error or panics is logged and skipped; the
//! remaining handlers still observe the event.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use super::api::Envelope;
use super::errors::CtmsError;
use super::models::exams::ExamRecord;
use super::models::grades::ResultsReport;
use super::models::schedule::{Note, WeeklySchedule};
use super::models::services::ServicesReport;
use super::models::subscription::SubscriptionPage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Every successful request.
    Global,
    /// Every transport or classification failure.
    Error,
    Login,
    Logout,
    Results,
    Services,
    Schedule,
    Note,
    Exams,
    Subscribe,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Error => "error",
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Results => "results",
            Self::Services => "services",
            Self::Schedule => "schedule",
            Self::Note => "note",
            Self::Exams => "exams",
            Self::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = CtmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "global" => Self::Global,
            "error" => Self::Error,
            "login" => Self::Login,
            "logout" => Self::Logout,
            "results" => Self::Results,
            "services" => Self::Services,
            "schedule" => Self::Schedule,
            "note" => Self::Note,
            "exams" | "tests" => Self::Exams,
            "subscribe" => Self::Subscribe,
            other => return Err(CtmsError::InvalidHandler(other.to_owned())),
        })
    }
}

/// Payload handed to handlers. Borrowed for the duration of the publish call.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    Envelope(&'a Envelope),
    Error(&'a CtmsError),
    Results(&'a ResultsReport),
    Services(&'a ServicesReport),
    Schedule(&'a WeeklySchedule),
    Note(&'a Note),
    Exams(&'a [ExamRecord]),
    Subscription(&'a SubscriptionPage),
}

type Handler = Arc<dyn Fn(&Event<'_>) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
pub struct EventRegistry {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Append a handler for an event named by string, e.g. from configuration.
    pub fn subscribe_named<F>(&self, name: &str, handler: F) -> Result<(), CtmsError>
    where
        F: Fn(&Event<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let kind = name.parse()?;
        self.subscribe(kind, handler);
        Ok(())
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Invoke every handler of `kind` in registration order.
    pub fn publish(&self, kind: EventKind, event: Event<'_>) {
        // Clone the list so handlers may subscribe without deadlocking.
        let handlers: Vec<Handler> = match self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
        {
            Some(list) if !list.is_empty() => list.clone(),
            _ => {
                debug!(event = %kind, "No handler registered");
                return;
            }
        };

        for (index, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event = %kind, index, error = ?e, "Event handler failed"),
                Err(_) => warn!(event = %kind, index, "Event handler panicked"),
            }
        }
    }
}
