//! Shared monitor vocabulary: status, tags, ranges, errors.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Status of a sub-monitor. `Failed` is terminal: no later operation may
/// observe `Running` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorStatus {
    Running = 0,
    Disabled = 1,
    Failed = 2,
}

/// A stable 64-bit tag hashed from a monitor or deadline name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u64);

impl Tag {
    pub fn new(name: &str) -> Tag {
        let digest = Sha256::digest(name.as_bytes());
        Tag(u64::from_le_bytes(
            digest[..8].try_into().unwrap_or([0u8; 8]),
        ))
    }

    pub fn from_raw(raw: u64) -> Tag {
        Tag(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:016x}", self.0)
    }
}

/// Inclusive duration window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min: Duration,
    pub max: Duration,
}

impl TimeRange {
    pub fn from_millis(min_ms: u64, max_ms: u64) -> TimeRange {
        TimeRange {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    pub fn contains(&self, value: Duration) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HealthError {
    #[error("no such tag")]
    NotFound,
    #[error("deadline is already running")]
    AlreadyRunning,
    #[error("operation rejected in the current state")]
    WrongState,
    #[error("monitor is disabled")]
    NotAllowed,
    #[error("transition is not part of the allowed set")]
    InvalidTransition,
    #[error("watchdog device error")]
    Watchdog,
}

/// Atomic status shared between a monitor and its handles.
///
/// `enable`/`disable` are idempotent and never resurrect a failed monitor.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new() -> StatusCell {
        StatusCell(AtomicU8::new(MonitorStatus::Running as u8))
    }

    pub(crate) fn status(&self) -> MonitorStatus {
        match self.0.load(Ordering::Acquire) {
            0 => MonitorStatus::Running,
            1 => MonitorStatus::Disabled,
            _ => MonitorStatus::Failed,
        }
    }

    pub(crate) fn fail(&self) {
        self.0.store(MonitorStatus::Failed as u8, Ordering::Release);
    }

    pub(crate) fn disable(&self) {
        let _ = self.0.compare_exchange(
            MonitorStatus::Running as u8,
            MonitorStatus::Disabled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn enable(&self) {
        let _ = self.0.compare_exchange(
            MonitorStatus::Disabled as u8,
            MonitorStatus::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_disable_round_trip_is_idempotent() {
        let cell = StatusCell::new();
        cell.enable();
        assert_eq!(cell.status(), MonitorStatus::Running);
        cell.disable();
        cell.disable();
        assert_eq!(cell.status(), MonitorStatus::Disabled);
        cell.enable();
        cell.enable();
        assert_eq!(cell.status(), MonitorStatus::Running);
    }

    #[test]
    fn failed_is_terminal_across_enable() {
        let cell = StatusCell::new();
        cell.fail();
        cell.enable();
        cell.disable();
        cell.enable();
        assert_eq!(cell.status(), MonitorStatus::Failed);
    }

    #[test]
    fn tags_are_stable_and_distinct() {
        assert_eq!(Tag::new("cycle"), Tag::new("cycle"));
        assert_ne!(Tag::new("cycle"), Tag::new("boot"));
    }

    #[test]
    fn range_containment() {
        let range = TimeRange::from_millis(50, 150);
        assert!(range.contains(Duration::from_millis(50)));
        assert!(range.contains(Duration::from_millis(150)));
        assert!(!range.contains(Duration::from_millis(49)));
        assert!(!range.contains(Duration::from_millis(151)));
    }
}
