//! Deadline supervision: tracks that tagged activities finish within a
//! configured duration window.
//!
//! Deadlines are evaluated at stop time only; the supervisor thread plays
//! no part here. A stop outside `[min, max]` fails the whole monitor, and
//! failure is terminal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::warn;

use crate::status::{HealthError, MonitorStatus, StatusCell, Tag, TimeRange};

pub struct DeadlineMonitorBuilder {
    deadlines: Vec<(Tag, TimeRange)>,
}

impl Default for DeadlineMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadlineMonitorBuilder {
    /// A monitor built with no deadlines is legal; lookups then answer
    /// `NotFound`.
    pub fn new() -> DeadlineMonitorBuilder {
        DeadlineMonitorBuilder {
            deadlines: Vec::new(),
        }
    }

    pub fn add_deadline(mut self, tag: Tag, range: TimeRange) -> DeadlineMonitorBuilder {
        self.deadlines.push((tag, range));
        self
    }

    pub fn build(self) -> DeadlineMonitor {
        let shared = Arc::new(Shared {
            status: StatusCell::new(),
        });
        let deadlines = self
            .deadlines
            .into_iter()
            .map(|(tag, range)| {
                (
                    tag,
                    Arc::new(DeadlineState {
                        range,
                        started: Mutex::new(None),
                    }),
                )
            })
            .collect();
        DeadlineMonitor { shared, deadlines }
    }
}

#[derive(Debug)]
struct Shared {
    status: StatusCell,
}

#[derive(Debug)]
struct DeadlineState {
    range: TimeRange,
    started: Mutex<Option<Instant>>,
}

pub struct DeadlineMonitor {
    shared: Arc<Shared>,
    deadlines: HashMap<Tag, Arc<DeadlineState>>,
}

impl DeadlineMonitor {
    /// An owned handle for one tag. While a started handle is alive the
    /// deadline is open; dropping it implies stop.
    pub fn get_deadline(&self, tag: Tag) -> Result<Deadline, HealthError> {
        let state = self.deadlines.get(&tag).ok_or(HealthError::NotFound)?;
        Ok(Deadline {
            shared: Arc::clone(&self.shared),
            state: Arc::clone(state),
        })
    }

    /// A one-off deadline not named in the configuration, sharing this
    /// monitor's status.
    pub fn create_custom_deadline(&self, range: TimeRange) -> Deadline {
        Deadline {
            shared: Arc::clone(&self.shared),
            state: Arc::new(DeadlineState {
                range,
                started: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> MonitorStatus {
        self.shared.status.status()
    }

    pub fn enable(&self) {
        self.shared.status.enable();
    }

    pub fn disable(&self) {
        self.shared.status.disable();
    }
}

#[derive(Debug)]
pub struct Deadline {
    shared: Arc<Shared>,
    state: Arc<DeadlineState>,
}

impl Deadline {
    /// Open the interval. Rejected while disabled and while already open.
    pub fn start(&self) -> Result<DeadlineGuard<'_>, HealthError> {
        self.raw_start()?;
        Ok(DeadlineGuard {
            deadline: self,
            stopped: false,
        })
    }

    pub fn range(&self) -> TimeRange {
        self.state.range
    }

    pub(crate) fn raw_start(&self) -> Result<(), HealthError> {
        match self.shared.status.status() {
            MonitorStatus::Running => {}
            MonitorStatus::Disabled => return Err(HealthError::NotAllowed),
            MonitorStatus::Failed => return Err(HealthError::WrongState),
        }
        let mut started = self.state.started.lock().unwrap_or_else(|e| e.into_inner());
        if started.is_some() {
            return Err(HealthError::AlreadyRunning);
        }
        *started = Some(Instant::now());
        Ok(())
    }

    /// Close the interval and judge the elapsed time against the window.
    pub(crate) fn raw_stop(&self) -> Result<(), HealthError> {
        match self.shared.status.status() {
            MonitorStatus::Running => {}
            MonitorStatus::Disabled => return Err(HealthError::NotAllowed),
            MonitorStatus::Failed => return Err(HealthError::WrongState),
        }
        let opened = self
            .state
            .started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(HealthError::WrongState)?;
        let elapsed = opened.elapsed();
        if !self.state.range.contains(elapsed) {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                min_ms = self.state.range.min.as_millis() as u64,
                max_ms = self.state.range.max.as_millis() as u64,
                "deadline violated"
            );
            self.shared.status.fail();
        }
        Ok(())
    }
}

/// RAII view of an open deadline; stops on drop.
#[derive(Debug)]
pub struct DeadlineGuard<'a> {
    deadline: &'a Deadline,
    stopped: bool,
}

impl DeadlineGuard<'_> {
    pub fn stop(mut self) {
        self.stop_once();
    }

    fn stop_once(&mut self) {
        if !self.stopped {
            self.stopped = true;
            let _ = self.deadline.raw_stop();
        }
    }
}

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        self.stop_once();
    }
}
