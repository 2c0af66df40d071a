//! The cyclic health supervisor.
//!
//! Built by [`HealthMonitorBuilder`] from any number of named sub-monitors
//! and two cycle durations: the internal processing cycle gates heartbeat
//! checks and recovery emission, the supervisor API cycle gates watchdog
//! kicks. Once a sub-monitor fails, the aggregate is failed; each failure
//! emits one recovery request per configured process group, and when the
//! failure stays unrecovered past the recovery window the watchdog stops
//! being serviced so the device resets the machine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::deadline::{DeadlineMonitor, DeadlineMonitorBuilder};
use crate::heartbeat::HeartbeatMonitor;
use crate::logic::{LogicMonitor, LogicMonitorBuilder};
use crate::status::{HealthError, MonitorStatus};
use crate::watchdog::{WatchdogConfig, WatchdogDevice};

/// Consumer of recovery requests; the daemon wires this to the process
/// group manager's recovery queue.
pub trait RecoverySink: Send + Sync {
    fn request_recovery(&self, group: &str);
}

const DEFAULT_CYCLE: Duration = Duration::from_millis(50);
const DEFAULT_RECOVERY_WINDOW: Duration = Duration::from_secs(10);

pub struct HealthMonitorBuilder {
    deadline_monitors: Vec<(String, DeadlineMonitorBuilder)>,
    logic_monitors: Vec<(String, LogicMonitorBuilder)>,
    heartbeat_monitors: Vec<(String, Duration)>,
    /// monitor name → process groups to recover on its failure.
    recovery_groups: Vec<(String, String)>,
    internal_cycle: Duration,
    api_cycle: Duration,
    recovery_window: Duration,
    watchdog_config: WatchdogConfig,
}

impl Default for HealthMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitorBuilder {
    pub fn new() -> HealthMonitorBuilder {
        HealthMonitorBuilder {
            deadline_monitors: Vec::new(),
            logic_monitors: Vec::new(),
            heartbeat_monitors: Vec::new(),
            recovery_groups: Vec::new(),
            internal_cycle: DEFAULT_CYCLE,
            api_cycle: DEFAULT_CYCLE,
            recovery_window: DEFAULT_RECOVERY_WINDOW,
            watchdog_config: WatchdogConfig::default(),
        }
    }

    pub fn add_deadline_monitor(
        mut self,
        name: &str,
        builder: DeadlineMonitorBuilder,
    ) -> HealthMonitorBuilder {
        self.deadline_monitors.push((name.to_string(), builder));
        self
    }

    pub fn add_logic_monitor(
        mut self,
        name: &str,
        builder: LogicMonitorBuilder,
    ) -> HealthMonitorBuilder {
        self.logic_monitors.push((name.to_string(), builder));
        self
    }

    pub fn add_heartbeat_monitor(
        mut self,
        name: &str,
        max_interval: Duration,
    ) -> HealthMonitorBuilder {
        self.heartbeat_monitors
            .push((name.to_string(), max_interval));
        self
    }

    /// Recover `group` when the named monitor fails.
    pub fn on_failure_recover(mut self, monitor: &str, group: &str) -> HealthMonitorBuilder {
        self.recovery_groups
            .push((monitor.to_string(), group.to_string()));
        self
    }

    pub fn with_internal_processing_cycle(mut self, cycle: Duration) -> HealthMonitorBuilder {
        self.internal_cycle = cycle;
        self
    }

    pub fn with_supervisor_api_cycle(mut self, cycle: Duration) -> HealthMonitorBuilder {
        self.api_cycle = cycle;
        self
    }

    pub fn with_recovery_window(mut self, window: Duration) -> HealthMonitorBuilder {
        self.recovery_window = window;
        self
    }

    pub fn with_watchdog_config(mut self, config: WatchdogConfig) -> HealthMonitorBuilder {
        self.watchdog_config = config;
        self
    }

    pub fn build(self) -> HealthMonitor {
        let deadline = self
            .deadline_monitors
            .into_iter()
            .map(|(name, builder)| (name, Arc::new(builder.build())))
            .collect();
        let logic = self
            .logic_monitors
            .into_iter()
            .map(|(name, builder)| (name, Arc::new(builder.build())))
            .collect();
        let heartbeat = self
            .heartbeat_monitors
            .into_iter()
            .map(|(name, interval)| (name, Arc::new(HeartbeatMonitor::new(interval))))
            .collect();
        HealthMonitor {
            inner: Arc::new(Inner {
                deadline,
                logic,
                heartbeat,
                recovery_groups: self.recovery_groups,
                internal_cycle: self.internal_cycle,
                api_cycle: self.api_cycle,
                recovery_window: self.recovery_window,
                watchdog_config: self.watchdog_config,
                stop: AtomicBool::new(false),
            }),
            thread: None,
        }
    }
}

struct Inner {
    deadline: HashMap<String, Arc<DeadlineMonitor>>,
    logic: HashMap<String, Arc<LogicMonitor>>,
    heartbeat: HashMap<String, Arc<HeartbeatMonitor>>,
    recovery_groups: Vec<(String, String)>,
    internal_cycle: Duration,
    api_cycle: Duration,
    recovery_window: Duration,
    watchdog_config: WatchdogConfig,
    stop: AtomicBool,
}

impl Inner {
    fn monitor_status(&self, name: &str) -> Option<MonitorStatus> {
        self.deadline
            .get(name)
            .map(|m| m.status())
            .or_else(|| self.logic.get(name).map(|m| m.status()))
            .or_else(|| self.heartbeat.get(name).map(|m| m.status()))
    }

    fn failed_monitors(&self) -> Vec<String> {
        let mut failed = Vec::new();
        for (name, monitor) in &self.deadline {
            if monitor.status() == MonitorStatus::Failed {
                failed.push(name.clone());
            }
        }
        for (name, monitor) in &self.logic {
            if monitor.status() == MonitorStatus::Failed {
                failed.push(name.clone());
            }
        }
        for (name, monitor) in &self.heartbeat {
            if monitor.status() == MonitorStatus::Failed {
                failed.push(name.clone());
            }
        }
        failed
    }
}

pub struct HealthMonitor {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn deadline_monitor(&self, name: &str) -> Option<Arc<DeadlineMonitor>> {
        self.inner.deadline.get(name).cloned()
    }

    pub fn logic_monitor(&self, name: &str) -> Option<Arc<LogicMonitor>> {
        self.inner.logic.get(name).cloned()
    }

    pub fn heartbeat_monitor(&self, name: &str) -> Option<Arc<HeartbeatMonitor>> {
        self.inner.heartbeat.get(name).cloned()
    }

    pub fn status_of(&self, name: &str) -> Option<MonitorStatus> {
        self.inner.monitor_status(name)
    }

    /// Aggregate: failed when any sub-monitor has failed, running
    /// otherwise.
    pub fn aggregate_status(&self) -> MonitorStatus {
        if self.inner.failed_monitors().is_empty() {
            MonitorStatus::Running
        } else {
            MonitorStatus::Failed
        }
    }

    /// Start the supervisor thread. Consumes the watchdog; it is disabled
    /// again when the supervisor stops.
    pub fn start(
        &mut self,
        mut watchdog: Box<dyn WatchdogDevice>,
        sink: Arc<dyn RecoverySink>,
    ) -> Result<(), HealthError> {
        // The effective kick interval is the coarser of the configured
        // API cycle and what the clock can actually resolve.
        let api_cycle = self.inner.api_cycle.max(monotonic_resolution());
        watchdog.init(api_cycle, &self.inner.watchdog_config)?;
        watchdog.enable()?;

        info!(
            internal_cycle_ms = self.inner.internal_cycle.as_millis() as u64,
            api_cycle_ms = api_cycle.as_millis() as u64,
            "health supervisor starting"
        );

        let inner = Arc::clone(&self.inner);
        self.inner.stop.store(false, Ordering::Release);
        let handle = thread::Builder::new()
            .name("lifeline-health".into())
            .spawn(move || {
                let mut watchdog = watchdog;
                run(&inner, watchdog.as_mut(), sink.as_ref(), api_cycle)
            })
            .map_err(|_| HealthError::WrongState)?;
        self.thread = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(inner: &Inner, watchdog: &mut dyn WatchdogDevice, sink: &dyn RecoverySink, api_cycle: Duration) {
    for monitor in inner.heartbeat.values() {
        monitor.mark_started();
    }

    let mut reported: HashSet<String> = HashSet::new();
    let mut failed_since: Option<Instant> = None;
    let mut last_kick = Instant::now();
    let mut next_tick = Instant::now() + inner.internal_cycle;

    // Service once up front so the device never starves during a long
    // first cycle.
    let _ = watchdog.service();

    while !inner.stop.load(Ordering::Acquire) {
        let now = Instant::now();

        for monitor in inner.heartbeat.values() {
            monitor.check_expiry(now);
        }

        let failed = inner.failed_monitors();
        if failed.is_empty() {
            failed_since = None;
        } else {
            failed_since.get_or_insert(now);
            for name in &failed {
                if reported.insert(name.clone()) {
                    warn!(monitor = %name, "sub-monitor failed; emitting recovery requests");
                    for (_, group) in inner
                        .recovery_groups
                        .iter()
                        .filter(|(monitor, _)| monitor == name)
                    {
                        debug!(group = %group, "requesting recovery");
                        sink.request_recovery(group);
                    }
                }
            }
        }

        let starve = failed_since
            .map(|since| now.saturating_duration_since(since) > inner.recovery_window)
            .unwrap_or(false);
        if starve {
            // Unrecovered past the window: stop kicking and let the
            // device reset the machine.
            error!("health failure unrecovered past the window; watchdog starving");
        } else if now.saturating_duration_since(last_kick) >= api_cycle {
            let _ = watchdog.service();
            last_kick = now;
        }

        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        }
        next_tick += inner.internal_cycle;
    }

    let _ = watchdog.disable();
    info!("health supervisor stopped");
}

/// Resolution of the monotonic clock.
fn monotonic_resolution() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_getres(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    } else {
        Duration::from_millis(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{Tag, TimeRange};
    use crate::watchdog::SoftWatchdog;
    use std::sync::Mutex;

    struct CollectingSink {
        requests: Mutex<Vec<String>>,
    }

    impl CollectingSink {
        fn new() -> Arc<CollectingSink> {
            Arc::new(CollectingSink {
                requests: Mutex::new(Vec::new()),
            })
        }

        fn drain(&self) -> Vec<String> {
            std::mem::take(&mut *self.requests.lock().unwrap())
        }
    }

    impl RecoverySink for CollectingSink {
        fn request_recovery(&self, group: &str) {
            self.requests.lock().unwrap().push(group.to_string());
        }
    }

    fn short_cycle_builder() -> HealthMonitorBuilder {
        HealthMonitorBuilder::new()
            .with_internal_processing_cycle(Duration::from_millis(5))
            .with_supervisor_api_cycle(Duration::from_millis(5))
            .with_watchdog_config(WatchdogConfig {
                timeout: Duration::from_secs(1),
            })
    }

    #[test]
    fn watchdog_is_kicked_while_healthy() {
        let mut monitor = short_cycle_builder().build();
        let dog = SoftWatchdog::new();
        let (kicks, enabled) = dog.probes();
        let sink = CollectingSink::new();
        monitor.start(Box::new(dog), sink).unwrap();
        thread::sleep(Duration::from_millis(60));
        monitor.stop();
        assert!(kicks.load(Ordering::Acquire) >= 2);
        assert!(!enabled.load(Ordering::Acquire));
    }

    #[test]
    fn heartbeat_expiry_emits_recovery_once() {
        let mut monitor = short_cycle_builder()
            .add_heartbeat_monitor("pulse", Duration::from_millis(10))
            .on_failure_recover("pulse", "MainPG")
            .build();
        let sink = CollectingSink::new();
        monitor
            .start(Box::new(SoftWatchdog::new()), Arc::clone(&sink) as _)
            .unwrap();
        thread::sleep(Duration::from_millis(80));
        monitor.stop();
        assert_eq!(monitor.aggregate_status(), MonitorStatus::Failed);
        assert_eq!(sink.drain(), vec!["MainPG".to_string()]);
    }

    #[test]
    fn aggregate_follows_sub_monitors() {
        let monitor = short_cycle_builder()
            .add_deadline_monitor(
                "deadlines",
                DeadlineMonitorBuilder::new()
                    .add_deadline(Tag::new("d"), TimeRange::from_millis(0, 1000)),
            )
            .build();
        assert_eq!(monitor.aggregate_status(), MonitorStatus::Running);
        let dm = monitor.deadline_monitor("deadlines").unwrap();
        let deadline = dm.get_deadline(Tag::new("d")).unwrap();
        deadline.start().unwrap().stop();
        // In-window stop: still healthy.
        assert_eq!(monitor.aggregate_status(), MonitorStatus::Running);
        assert_eq!(monitor.status_of("deadlines"), Some(MonitorStatus::Running));
    }

    #[test]
    fn logic_failure_fails_aggregate() {
        let init = crate::logic::LogicState::new("A");
        let monitor = short_cycle_builder()
            .add_logic_monitor("machine", LogicMonitorBuilder::new(init))
            .build();
        let lm = monitor.logic_monitor("machine").unwrap();
        let _ = lm.transition(crate::logic::LogicState::new("B"));
        assert_eq!(monitor.aggregate_status(), MonitorStatus::Failed);
    }
}
