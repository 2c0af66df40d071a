//! The lifecycle manager daemon.
//!
//! Start-up order matters: descriptor slots 3 and 4 are reserved before
//! anything can claim them, termination signals are routed into the
//! shared shutdown flag, the topology blob is loaded, the health
//! supervisor is armed, and only then does the manager loop run. Exit is
//! zero after a clean all-off sequence.

mod device;
mod signal;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use lifeline_core::channel::{COMMS_FD_SLOT, WAKE_FD_SLOT};
use lifeline_core::config::Config;
use lifeline_core::launcher::UnixProcessHost;
use lifeline_core::manager::ProcessGroupManager;
use lifeline_core::recovery::RecoveryRequest;
use lifeline_core::Identifier;
use lifeline_health::supervisor::{HealthMonitorBuilder, RecoverySink};
use lifeline_health::watchdog::{SoftWatchdog, WatchdogDevice};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Optional path of a watchdog device; without it a software stand-in is
/// used.
const WATCHDOG_ENV: &str = "LIFELINE_WATCHDOG";

/// Bridges health-supervisor recovery requests into the manager's queue.
struct ManagerRecoverySink {
    core: Arc<lifeline_core::manager::Core>,
}

impl RecoverySink for ManagerRecoverySink {
    fn request_recovery(&self, group: &str) {
        self.core.recovery().push(RecoveryRequest {
            group: Identifier::new(group),
            state: None,
        });
        self.core.nudge();
    }
}

/// Park `/dev/null` on the well-known descriptor slots so nothing else
/// claims them before children are forked.
fn reserve_comms_slots() -> anyhow::Result<()> {
    let null = std::fs::OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .context("opening /dev/null")?;
    for slot in [COMMS_FD_SLOT, WAKE_FD_SLOT] {
        let rc = unsafe { libc::dup2(std::os::fd::AsRawFd::as_raw_fd(&null), slot) };
        if rc < 0 {
            anyhow::bail!("reserving descriptor slot {slot} failed");
        }
    }
    Ok(())
}

fn watchdog_device() -> Box<dyn WatchdogDevice> {
    match std::env::var(WATCHDOG_ENV) {
        Ok(path) => Box::new(device::FileWatchdog::new(PathBuf::from(path))),
        Err(_) => Box::new(SoftWatchdog::new()),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    reserve_comms_slots()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    signal::install_termination_handler(Arc::clone(&shutdown))
        .context("installing signal handlers")?;

    let config = Config::load().context("loading configuration blob")?;
    info!(
        groups = config.groups.len(),
        processes = config.total_processes(),
        "topology loaded"
    );

    let host = Arc::new(UnixProcessHost::new());
    let mut manager =
        ProcessGroupManager::new(config, Arc::clone(&host) as _, Arc::clone(&shutdown))?;
    if let Some(fd) = manager.core().wake_fd() {
        host.set_wake_fd(fd);
    }

    let mut health = HealthMonitorBuilder::new().build();
    let sink = Arc::new(ManagerRecoverySink {
        core: manager.core(),
    });
    health
        .start(watchdog_device(), sink)
        .map_err(|e| anyhow::anyhow!("starting health supervisor: {e}"))?;

    // Drain the process state notifications toward the supervision side.
    let notifier = {
        let core = manager.core();
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("lifeline-notifier".into())
            .spawn(move || {
                while !shutdown.load(std::sync::atomic::Ordering::Acquire) {
                    for change in core.drain_state_changes() {
                        tracing::debug!(
                            pid = change.pid,
                            state = ?change.state,
                            "process state change"
                        );
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
            })
            .context("spawning notifier thread")?
    };

    info!("lifecycle manager started");
    let outcome = manager.run();
    health.stop();
    let _ = notifier.join();

    match outcome {
        Ok(()) => {
            info!("lifecycle manager completed");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "lifecycle manager failed");
            Err(e.into())
        }
    }
}
