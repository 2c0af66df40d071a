//! Logic supervision: a state-machine validator over a static set of
//! allowed transitions.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::status::{HealthError, MonitorStatus, StatusCell, Tag};

/// A named state of the supervised machine, compared by hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicState(u64);

impl LogicState {
    pub fn new(name: &str) -> LogicState {
        LogicState(Tag::new(name).raw())
    }

    pub fn from_raw(raw: u64) -> LogicState {
        LogicState(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

pub struct LogicMonitorBuilder {
    initial: LogicState,
    allowed: HashSet<(u64, u64)>,
}

impl LogicMonitorBuilder {
    pub fn new(initial: LogicState) -> LogicMonitorBuilder {
        LogicMonitorBuilder {
            initial,
            allowed: HashSet::new(),
        }
    }

    pub fn add_transition(mut self, from: LogicState, to: LogicState) -> LogicMonitorBuilder {
        self.allowed.insert((from.raw(), to.raw()));
        self
    }

    pub fn build(self) -> LogicMonitor {
        LogicMonitor {
            status: StatusCell::new(),
            allowed: self.allowed,
            current: AtomicU64::new(self.initial.raw()),
        }
    }
}

pub struct LogicMonitor {
    status: StatusCell,
    allowed: HashSet<(u64, u64)>,
    current: AtomicU64,
}

impl LogicMonitor {
    /// Validate and apply a transition. A missing edge fails the monitor;
    /// failure is terminal even across `enable`.
    pub fn transition(&self, to: LogicState) -> Result<(), HealthError> {
        match self.status.status() {
            MonitorStatus::Running => {}
            MonitorStatus::Disabled => return Err(HealthError::NotAllowed),
            MonitorStatus::Failed => return Err(HealthError::WrongState),
        }
        let from = self.current.load(Ordering::Acquire);
        if self.allowed.contains(&(from, to.raw())) {
            self.current.store(to.raw(), Ordering::Release);
            Ok(())
        } else {
            warn!(from, to = to.raw(), "disallowed logic transition");
            self.status.fail();
            Err(HealthError::InvalidTransition)
        }
    }

    pub fn state(&self) -> LogicState {
        LogicState::from_raw(self.current.load(Ordering::Acquire))
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

    fn boot_monitor() -> LogicMonitor {
        let init = LogicState::new("Init");
        let run = LogicState::new("Run");
        let stop = LogicState::new("Stop");
        LogicMonitorBuilder::new(init)
            .add_transition(init, run)
            .add_transition(run, stop)
            .build()
    }

    #[test]
    fn allowed_path_is_accepted() {
        let monitor = boot_monitor();
        monitor.transition(LogicState::new("Run")).unwrap();
        monitor.transition(LogicState::new("Stop")).unwrap();
        assert_eq!(monitor.state(), LogicState::new("Stop"));
        assert_eq!(monitor.status(), MonitorStatus::Running);
    }

    #[test]
    fn missing_edge_fails_terminally() {
        let monitor = boot_monitor();
        assert_eq!(
            monitor.transition(LogicState::new("Stop")).unwrap_err(),
            HealthError::InvalidTransition
        );
        assert_eq!(monitor.status(), MonitorStatus::Failed);
        // Terminal even across enable.
        monitor.enable();
        assert_eq!(monitor.status(), MonitorStatus::Failed);
        assert_eq!(
            monitor.transition(LogicState::new("Run")).unwrap_err(),
            HealthError::WrongState
        );
    }

    #[test]
    fn disabled_rejects_without_failing() {
        let monitor = boot_monitor();
        monitor.disable();
        assert_eq!(
            monitor.transition(LogicState::new("Run")).unwrap_err(),
            HealthError::NotAllowed
        );
        assert_eq!(monitor.status(), MonitorStatus::Disabled);
        monitor.enable();
        assert!(monitor.transition(LogicState::new("Run")).is_ok());
    }
}
