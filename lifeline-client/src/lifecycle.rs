//! Lifecycle client: how an application process reports readiness.
//!
//! The protocol over the shared segment on descriptor slot 3: post
//! `send_sync`, wait for the manager's `reply_sync` acknowledgement, and
//! post `send_sync` once more on teardown so the manager may close the
//! channel. Reporting twice is a local error.

use std::mem::size_of;
use std::os::fd::BorrowedFd;

use lifeline_core::channel::{CommsRegion, CommsSync, COMMS_FD_SLOT, RUNNING_ACK_TIMEOUT};
use lifeline_core::osal::SharedRegion;
use std::sync::Arc;
use tracing::debug;

use crate::ClientError;

pub struct LifecycleClient {
    comms: CommsRegion,
    reported: bool,
}

impl LifecycleClient {
    /// Attach to the comms segment inherited from the launcher.
    pub fn from_environment() -> Result<LifecycleClient, ClientError> {
        // Safety: slot 3 is reserved by the launcher for the comms region
        // of exactly this layout.
        let region = unsafe {
            let fd = BorrowedFd::borrow_raw(COMMS_FD_SLOT);
            SharedRegion::attach(fd, size_of::<CommsSync>())
                .map_err(|e| ClientError::Setup(e.to_string()))?
        };
        // Safety: initialized by the launcher before fork.
        let comms = unsafe { CommsRegion::from_raw_region(Arc::new(region)) };
        Ok(LifecycleClient::from_region(comms))
    }

    /// Attach to an explicit region; used by in-process tests.
    pub fn from_region(comms: CommsRegion) -> LifecycleClient {
        LifecycleClient {
            comms,
            reported: false,
        }
    }

    /// Report `Running` and wait for the manager's acknowledgement.
    pub fn report_running(&mut self) -> Result<(), ClientError> {
        if self.reported {
            return Err(ClientError::InvalidTransition);
        }
        let sync = self.comms.sync();
        sync.set_pid(std::process::id() as i32);
        sync.send_sync
            .post()
            .map_err(|_| ClientError::CommunicationError)?;
        if !sync.reply_sync.timed_wait(RUNNING_ACK_TIMEOUT) {
            return Err(ClientError::CommunicationError);
        }
        debug!("running report acknowledged");
        self.reported = true;
        Ok(())
    }
}

impl Drop for LifecycleClient {
    fn drop(&mut self) {
        if self.reported {
            // Final post: the manager may close the channel.
            let _ = self.comms.sync().send_sync.post();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_core::config::CommsType;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn report_running_handshake() {
        let comms = CommsRegion::anonymous(CommsType::Reporting).unwrap();
        let manager_side = comms.clone();
        // Manager side: see the report, acknowledge it.
        let manager = thread::spawn(move || {
            let sync = manager_side.sync();
            assert!(sync.send_sync.timed_wait(Duration::from_secs(2)));
            sync.reply_sync.post().unwrap();
        });

        let mut client = LifecycleClient::from_region(comms.clone());
        client.report_running().unwrap();
        manager.join().unwrap();
        assert_eq!(comms.sync().pid(), std::process::id() as i32);

        // Second report is a local error.
        assert_eq!(
            client.report_running().unwrap_err(),
            ClientError::InvalidTransition
        );

        // Drop posts the release token.
        drop(client);
        assert!(comms.sync().send_sync.timed_wait(Duration::from_millis(100)));
    }

    #[test]
    fn unacknowledged_report_is_a_communication_error() {
        let comms = CommsRegion::anonymous(CommsType::Reporting).unwrap();
        let mut client = LifecycleClient::from_region(comms);
        assert_eq!(
            client.report_running().unwrap_err(),
            ClientError::CommunicationError
        );
    }
}
