//! Heartbeat supervision: a maximum-interval liveness check.
//!
//! `report` records the monotonic now; the supervisor thread compares the
//! age of the last report against the configured maximum on every internal
//! cycle.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::status::{HealthError, MonitorStatus, StatusCell};

pub struct HeartbeatMonitor {
    status: StatusCell,
    max_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl HeartbeatMonitor {
    pub fn new(max_interval: Duration) -> HeartbeatMonitor {
        HeartbeatMonitor {
            status: StatusCell::new(),
            max_interval,
            last: Mutex::new(None),
        }
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// Record a liveness report.
    pub fn report(&self) -> Result<(), HealthError> {
        match self.status.status() {
            MonitorStatus::Running => {}
            MonitorStatus::Disabled => return Err(HealthError::NotAllowed),
            MonitorStatus::Failed => return Err(HealthError::WrongState),
        }
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        Ok(())
    }

    /// Called by the supervisor when it begins cycling: the interval
    /// starts counting from here, not from the first report.
    pub(crate) fn mark_started(&self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if last.is_none() {
            *last = Some(Instant::now());
        }
    }

    /// Supervisor-side expiry check.
    pub(crate) fn check_expiry(&self, now: Instant) {
        if self.status.status() != MonitorStatus::Running {
            return;
        }
        let last = *self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = last {
            if now.saturating_duration_since(last) > self.max_interval {
                warn!(
                    max_interval_ms = self.max_interval.as_millis() as u64,
                    "heartbeat interval exceeded"
                );
                self.status.fail();
            }
        }
    }

    pub fn status(&self) -> MonitorStatus {
        self.status.status()
    }

    pub fn enable(&self) {
        self.status.enable();
    }

    pub fn disable(&self) {
        self.status.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_reports_keep_it_running() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(100));
        monitor.report().unwrap();
        monitor.check_expiry(Instant::now());
        assert_eq!(monitor.status(), MonitorStatus::Running);
    }

    #[test]
    fn stale_report_fails() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(10));
        monitor.report().unwrap();
        monitor.check_expiry(Instant::now() + Duration::from_millis(50));
        assert_eq!(monitor.status(), MonitorStatus::Failed);
        // Terminal.
        monitor.enable();
        assert_eq!(monitor.status(), MonitorStatus::Failed);
        assert!(monitor.report().is_err());
    }

    #[test]
    fn disabled_is_not_checked() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(10));
        monitor.report().unwrap();
        monitor.disable();
        monitor.check_expiry(Instant::now() + Duration::from_secs(1));
        assert_eq!(monitor.status(), MonitorStatus::Disabled);
    }

    #[test]
    fn never_reported_counts_from_start_mark() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(10));
        monitor.mark_started();
        monitor.check_expiry(Instant::now() + Duration::from_millis(50));
        assert_eq!(monitor.status(), MonitorStatus::Failed);
    }
}
