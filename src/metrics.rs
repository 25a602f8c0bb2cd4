//! Per-session counters in the Prometheus text format (RED: Rate, Errors, Duration).

use crate::operation::OperationKind;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds of the duration histogram buckets, in seconds. +Inf is the count.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

const KINDS: usize = OperationKind::ALL.len();

#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        // Non-cumulative storage: only the first matching bucket is bumped.
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

/// Lock-free statistics shared by a session and its operations.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    connections_total: AtomicU64,
    connection_failures: AtomicU64,
    requests: [AtomicU64; KINDS],
    errors: [AtomicU64; KINDS],
    cancelled: [AtomicU64; KINDS],
    durations: [DurationHistogram; KINDS],
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn inc_connections(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_connection_failures(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_request(&self, kind: OperationKind) {
        self.requests[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_error(&self, kind: OperationKind) {
        self.errors[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_cancelled(&self, kind: OperationKind) {
        self.cancelled[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn observe_duration(&self, kind: OperationKind, duration: Duration) {
        self.durations[kind.index()].observe(duration);
    }

    /// Connections opened so far, rebinds included.
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn connection_failures(&self) -> u64 {
        self.connection_failures.load(Ordering::Relaxed)
    }

    /// Operations of `kind` that started executing.
    pub fn requests(&self, kind: OperationKind) -> u64 {
        self.requests[kind.index()].load(Ordering::Relaxed)
    }

    pub fn errors(&self, kind: OperationKind) -> u64 {
        self.errors[kind.index()].load(Ordering::Relaxed)
    }

    pub fn cancellations(&self, kind: OperationKind) -> u64 {
        self.cancelled[kind.index()].load(Ordering::Relaxed)
    }

    /// Render in the Prometheus exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "# HELP ldap_session_connections_total Total number of directory connections opened.")?;
        writeln!(out, "# TYPE ldap_session_connections_total counter")?;
        writeln!(out, "ldap_session_connections_total {}", self.connections())?;

        writeln!(out, "# HELP ldap_session_connection_failures_total Total number of failed connection attempts.")?;
        writeln!(out, "# TYPE ldap_session_connection_failures_total counter")?;
        writeln!(out, "ldap_session_connection_failures_total {}", self.connection_failures())?;

        for (name, help, counters) in [
            ("requests", "Total operations executed by kind.", &self.requests),
            ("errors", "Total failed operations by kind.", &self.errors),
            ("cancelled", "Total cancelled operations by kind.", &self.cancelled),
        ] {
            writeln!(out, "# HELP ldap_session_{}_total {}", name, help)?;
            writeln!(out, "# TYPE ldap_session_{}_total counter", name)?;
            for kind in OperationKind::ALL {
                let val = counters[kind.index()].load(Ordering::Relaxed);
                writeln!(out, "ldap_session_{}_total{{op=\"{}\"}} {}", name, kind, val)?;
            }
        }

        writeln!(out, "# HELP ldap_session_operation_duration_seconds Operation duration in seconds by kind.")?;
        writeln!(out, "# TYPE ldap_session_operation_duration_seconds histogram")?;
        for kind in OperationKind::ALL {
            let hist = &self.durations[kind.index()];
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                writeln!(
                    out,
                    "ldap_session_operation_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}",
                    kind, le, cum
                )?;
            }
            writeln!(
                out,
                "ldap_session_operation_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}",
                kind, count
            )?;
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            writeln!(out, "ldap_session_operation_duration_seconds_sum{{op=\"{}\"}} {}", kind, sum_secs)?;
            writeln!(out, "ldap_session_operation_duration_seconds_count{{op=\"{}\"}} {}", kind, count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_by_kind() {
        let m = SessionMetrics::new();
        m.inc_request(OperationKind::Search);
        m.inc_request(OperationKind::Search);
        m.inc_error(OperationKind::Search);
        m.inc_cancelled(OperationKind::Bind);
        m.inc_connections();
        assert_eq!(m.requests(OperationKind::Search), 2);
        assert_eq!(m.errors(OperationKind::Search), 1);
        assert_eq!(m.cancellations(OperationKind::Bind), 1);
        assert_eq!(m.requests(OperationKind::Delete), 0);
        assert_eq!(m.connections(), 1);
    }

    #[test]
    fn test_render_format() {
        let m = SessionMetrics::new();
        m.inc_connections();
        m.inc_request(OperationKind::WhoAmI);
        m.observe_duration(OperationKind::Search, Duration::from_millis(30));
        let out = m.render();
        assert!(out.contains("ldap_session_connections_total 1\n"));
        assert!(out.contains("ldap_session_requests_total{op=\"whoami\"} 1\n"));
        assert!(out.contains("ldap_session_operation_duration_seconds_bucket{op=\"search\",le=\"0.025\"} 0\n"));
        assert!(out.contains("ldap_session_operation_duration_seconds_bucket{op=\"search\",le=\"0.05\"} 1\n"));
        assert!(out.contains("ldap_session_operation_duration_seconds_bucket{op=\"search\",le=\"+Inf\"} 1\n"));
        assert!(out.contains("ldap_session_operation_duration_seconds_count{op=\"search\"} 1\n"));
    }
}
