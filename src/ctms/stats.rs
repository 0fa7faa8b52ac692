//! Request timing counters fed by the `global` and `error` events.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::errors::{CtmsError, ErrorKind};
use super::events::{Event, EventKind, EventRegistry};

#[derive(Debug, Default)]
pub struct RequestStats {
    requests: AtomicU64,
    failures: AtomicU64,
    relay_failures: AtomicU64,
    portal_failures: AtomicU64,
    c2m_count: AtomicU64,
    c2m_micros: AtomicU64,
    m2s_count: AtomicU64,
    m2s_micros: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSummary {
    /// Every request that reached the transport, successful or not.
    pub requests: u64,
    pub failures: u64,
    /// No usable envelope came back from the relay.
    pub relay_failures: u64,
    /// The relay answered but the portal replied with status 400 or above.
    pub portal_failures: u64,
    /// Mean client-to-relay overhead over successful and failed requests, in milliseconds.
    pub avg_c2m_ms: f64,
    /// Mean relay-to-portal latency of successful requests, in milliseconds.
    pub avg_m2s_ms: f64,
}

impl RequestStats {
    /// Create counters and subscribe them to `events`.
    pub fn attach(events: &EventRegistry) -> Arc<Self> {
        let stats = Arc::new(Self::default());

        let s = stats.clone();
        events.subscribe(EventKind::Global, move |event| {
            if let Event::Envelope(envelope) = event {
                s.record(envelope.c2m, envelope.m2s);
            }
            Ok(())
        });

        let s = stats.clone();
        events.subscribe(EventKind::Error, move |event| {
            if let Event::Error(error) = event {
                s.record_failure(error);
            }
            Ok(())
        });

        stats
    }

    fn record(&self, c2m: Duration, m2s: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        add_sample(&self.c2m_count, &self.c2m_micros, c2m);
        add_sample(&self.m2s_count, &self.m2s_micros, m2s);
    }

    fn record_failure(&self, error: &CtmsError) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
        if let Some(c2m) = error.c2m() {
            add_sample(&self.c2m_count, &self.c2m_micros, c2m);
        }

        match error.upstream_status() {
            Some(status) if status >= 400 => {
                self.portal_failures.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => {}
            None if error.kind() == ErrorKind::Transport => {
                self.relay_failures.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
            portal_failures: self.portal_failures.load(Ordering::Relaxed),
            avg_c2m_ms: average_ms(&self.c2m_count, &self.c2m_micros),
            avg_m2s_ms: average_ms(&self.m2s_count, &self.m2s_micros),
        }
    }
}

fn add_sample(count: &AtomicU64, total_micros: &AtomicU64, value: Duration) {
    count.fetch_add(1, Ordering::Relaxed);
    total_micros.fetch_add(value.as_micros() as u64, Ordering::Relaxed);
}

fn average_ms(count: &AtomicU64, total_micros: &AtomicU64) -> f64 {
    match count.load(Ordering::Relaxed) {
        0 => 0.0,
        n => total_micros.load(Ordering::Relaxed) as f64 / n as f64 / 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctms::errors::TransportFailure;

    #[test]
    fn test_empty_summary() {
        let stats = RequestStats::default();
        let summary = stats.summary();
        assert_eq!(summary.requests, 0);
        assert_eq!(summary.avg_c2m_ms, 0.0);
    }

    #[test]
    fn test_records_averages_and_failures() {
        let events = EventRegistry::new();
        let stats = RequestStats::attach(&events);

        stats.record(Duration::from_millis(10), Duration::from_millis(100));
        stats.record(Duration::from_millis(30), Duration::from_millis(300));
        events.publish(
            EventKind::Error,
            Event::Error(&CtmsError::SessionExpired {
                c2m: Duration::from_millis(50),
            }),
        );

        let summary = stats.summary();
        assert_eq!(summary.requests, 3);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.relay_failures, 0);
        assert_eq!(summary.portal_failures, 0);
        // Failed calls count towards the overhead average but not the portal latency.
        assert_eq!(summary.avg_c2m_ms, 30.0);
        assert_eq!(summary.avg_m2s_ms, 200.0);
    }

    #[test]
    fn test_relay_and_portal_failures_are_split() {
        let events = EventRegistry::new();
        let stats = RequestStats::attach(&events);

        let relay_down = CtmsError::Transport {
            source: TransportFailure::Unreachable(anyhow::anyhow!("connection refused")),
            c2m: Duration::from_millis(4),
        };
        let portal_error = CtmsError::Transport {
            source: TransportFailure::Upstream {
                status: 500,
                body: None,
                runtime: Duration::ZERO,
            },
            c2m: Duration::from_millis(8),
        };
        let maintenance = CtmsError::Maintenance {
            message: "Bảo trì".to_owned(),
            c2m: Duration::from_millis(12),
        };
        for error in [&relay_down, &portal_error, &maintenance] {
            events.publish(EventKind::Error, Event::Error(error));
        }

        let summary = stats.summary();
        assert_eq!(summary.requests, 3);
        assert_eq!(summary.failures, 3);
        assert_eq!(summary.relay_failures, 1);
        assert_eq!(summary.portal_failures, 2);
        assert_eq!(summary.avg_c2m_ms, 8.0);
        assert_eq!(summary.avg_m2s_ms, 0.0);
    }
}
