//! Linux watchdog device backed by plain writes.
//!
//! Writing any byte to the device kicks it; writing the magic `V` right
//! before close disarms it. Devices that need more than this go behind
//! their own [`WatchdogDevice`] implementation.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use lifeline_health::status::HealthError;
use lifeline_health::watchdog::{WatchdogConfig, WatchdogDevice};
use tracing::{error, info};

pub struct FileWatchdog {
    path: PathBuf,
    device: Option<File>,
}

impl FileWatchdog {
    pub fn new(path: PathBuf) -> FileWatchdog {
        FileWatchdog { path, device: None }
    }
}

impl WatchdogDevice for FileWatchdog {
    fn init(&mut self, cycle: Duration, config: &WatchdogConfig) -> Result<(), HealthError> {
        if cycle.is_zero() || config.timeout <= cycle {
            return Err(HealthError::Watchdog);
        }
        Ok(())
    }

    fn enable(&mut self) -> Result<(), HealthError> {
        let device = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                error!(path = %self.path.display(), error = %e, "opening watchdog device failed");
                HealthError::Watchdog
            })?;
        info!(path = %self.path.display(), "watchdog armed");
        self.device = Some(device);
        Ok(())
    }

    fn disable(&mut self) -> Result<(), HealthError> {
        if let Some(mut device) = self.device.take() {
            // Magic close: disarm instead of resetting on close.
            let _ = device.write_all(b"V");
        }
        Ok(())
    }

    fn service(&mut self) -> Result<(), HealthError> {
        match &mut self.device {
            Some(device) => device.write_all(b"k").map_err(|_| HealthError::Watchdog),
            None => Err(HealthError::Watchdog),
        }
    }

    fn fire(&mut self) -> ! {
        // Stop feeding and wait for the device to reset the machine.
        error!("watchdog fire: ceasing service and waiting for reset");
        drop(self.device.take());
        loop {
            std::thread::park();
        }
    }
}
