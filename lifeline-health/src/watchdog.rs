//! Watchdog device interface.
//!
//! The actual device (ioctl wrapper over `/dev/watchdog` or a platform
//! equivalent) lives behind [`WatchdogDevice`] and is injected at
//! construction time; [`SoftWatchdog`] stands in for it everywhere a real
//! reset would be unwelcome.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::status::HealthError;

/// Static device parameters handed to `init`.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Device timeout the implementation should program.
    pub timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            timeout: Duration::from_secs(5),
        }
    }
}

pub trait WatchdogDevice: Send {
    /// Validate the configuration against the service cycle the supervisor
    /// will run at.
    fn init(&mut self, cycle: Duration, config: &WatchdogConfig) -> Result<(), HealthError>;

    fn enable(&mut self) -> Result<(), HealthError>;

    fn disable(&mut self) -> Result<(), HealthError>;

    /// Kick the device.
    fn service(&mut self) -> Result<(), HealthError>;

    /// Program the shortest possible timeout and wait for the device to
    /// reset the machine.
    fn fire(&mut self) -> !;
}

/// In-process stand-in recording every interaction; `fire` parks forever
/// instead of resetting anything.
pub struct SoftWatchdog {
    kicks: Arc<AtomicUsize>,
    enabled: Arc<AtomicBool>,
    cycle: Option<Duration>,
}

impl Default for SoftWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftWatchdog {
    pub fn new() -> SoftWatchdog {
        SoftWatchdog {
            kicks: Arc::new(AtomicUsize::new(0)),
            enabled: Arc::new(AtomicBool::new(false)),
            cycle: None,
        }
    }

    /// Shared counters for assertions.
    pub fn probes(&self) -> (Arc<AtomicUsize>, Arc<AtomicBool>) {
        (Arc::clone(&self.kicks), Arc::clone(&self.enabled))
    }
}

impl WatchdogDevice for SoftWatchdog {
    fn init(&mut self, cycle: Duration, config: &WatchdogConfig) -> Result<(), HealthError> {
        if cycle.is_zero() || config.timeout <= cycle {
            // Servicing slower than the device timeout would reset the
            // machine on a healthy system.
            return Err(HealthError::Watchdog);
        }
        self.cycle = Some(cycle);
        Ok(())
    }

    fn enable(&mut self) -> Result<(), HealthError> {
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn disable(&mut self) -> Result<(), HealthError> {
        self.enabled.store(false, Ordering::Release);
        Ok(())
    }

    fn service(&mut self) -> Result<(), HealthError> {
        self.kicks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn fire(&mut self) -> ! {
        error!("watchdog fire requested; parking thread");
        loop {
            std::thread::park();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_rejects_cycle_slower_than_timeout() {
        let mut dog = SoftWatchdog::new();
        let config = WatchdogConfig {
            timeout: Duration::from_millis(50),
        };
        assert!(dog.init(Duration::from_millis(100), &config).is_err());
        assert!(dog
            .init(
                Duration::from_millis(10),
                &WatchdogConfig {
                    timeout: Duration::from_millis(50)
                }
            )
            .is_ok());
    }

    #[test]
    fn service_counts_kicks() {
        let mut dog = SoftWatchdog::new();
        let (kicks, enabled) = dog.probes();
        dog.enable().unwrap();
        assert!(enabled.load(Ordering::Acquire));
        dog.service().unwrap();
        dog.service().unwrap();
        assert_eq!(kicks.load(Ordering::Acquire), 2);
        dog.disable().unwrap();
        assert!(!enabled.load(Ordering::Acquire));
    }
}
