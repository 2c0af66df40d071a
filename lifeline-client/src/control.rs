//! Control client: how a state manager requests group transitions.
//!
//! Requests go through the single-slot mailbox of the control channel on
//! descriptor slot 3; the manager is woken through the shared semaphore on
//! slot 4. A successful `set_state` is acknowledged immediately but
//! answered asynchronously once the transition round settles; the client
//! retains at most [`MAX_OUTSTANDING`] unanswered requests.

use std::mem::size_of;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lifeline_core::channel::{
    comms_region_len, CommsRegion, ControlMessage, CONTROL_POLL_DELAY, COMMS_FD_SLOT, WAKE_FD_SLOT,
};
use lifeline_core::config::CommsType;
use lifeline_core::error::ControlCode;
use lifeline_core::ident::Identifier;
use lifeline_core::osal::{RawSemaphore, SharedRegion};
use tracing::debug;

use crate::ClientError;

/// Most asynchronous requests a client keeps in flight; the manager is not
/// required to answer beyond this bound.
pub const MAX_OUTSTANDING: usize = 4;

/// A pending asynchronous outcome.
#[derive(Debug)]
pub struct Ticket {
    pub group: Identifier,
    pub state: Identifier,
}

pub struct ControlClient {
    comms: CommsRegion,
    wake: Arc<SharedRegion>,
    outstanding: AtomicUsize,
}

impl ControlClient {
    /// Attach to the regions inherited from the launcher.
    pub fn from_environment() -> Result<ControlClient, ClientError> {
        // Safety: slots 3 and 4 are reserved by the launcher for the
        // control channel and the manager wake semaphore.
        let (comms, wake) = unsafe {
            let comms_fd = BorrowedFd::borrow_raw(COMMS_FD_SLOT);
            let comms = SharedRegion::attach(comms_fd, comms_region_len(CommsType::StateManager))
                .map_err(|e| ClientError::Setup(e.to_string()))?;
            let wake_fd = BorrowedFd::borrow_raw(WAKE_FD_SLOT);
            let wake = SharedRegion::attach(wake_fd, size_of::<RawSemaphore>())
                .map_err(|e| ClientError::Setup(e.to_string()))?;
            (CommsRegion::from_raw_region(Arc::new(comms)), Arc::new(wake))
        };

        // A state manager reports readiness like any other comms-enabled
        // process: the manager blocks the start phase on this handshake.
        let sync = comms.sync();
        sync.set_pid(std::process::id() as i32);
        sync.send_sync
            .post()
            .map_err(|_| ClientError::CommunicationError)?;
        if !sync
            .reply_sync
            .timed_wait(lifeline_core::channel::RUNNING_ACK_TIMEOUT)
        {
            return Err(ClientError::CommunicationError);
        }

        Ok(ControlClient::from_regions(comms, wake))
    }

    /// Attach to explicit regions; used by in-process tests.
    pub fn from_regions(comms: CommsRegion, wake: Arc<SharedRegion>) -> ControlClient {
        ControlClient {
            comms,
            wake,
            outstanding: AtomicUsize::new(0),
        }
    }

    fn wake_sem(&self) -> &RawSemaphore {
        // Safety: the wake region holds exactly one initialized semaphore.
        unsafe { self.wake.at::<RawSemaphore>(0) }
    }

    fn request(&self, msg: ControlMessage) -> Result<ControlMessage, ClientError> {
        let channel = self
            .comms
            .control_channel()
            .ok_or_else(|| ClientError::Setup("not a state-manager channel".into()))?;
        channel
            .send_request(msg, self.wake_sem())
            .map_err(|_| ClientError::CommunicationError)
    }

    /// Request a transition of `group` to `state`. The immediate reply
    /// only rejects; the final outcome arrives through [`Self::wait_outcome`].
    pub fn set_state(&self, group: &str, state: &str) -> Result<Ticket, ClientError> {
        if self.outstanding.load(Ordering::Acquire) >= MAX_OUTSTANDING {
            return Err(ClientError::TooManyOutstanding);
        }
        let group_id = Identifier::new(group);
        let state_id = Identifier::new(&format!("{group}/{state}"));
        let mut msg = ControlMessage::new(ControlCode::SetStateRequest);
        msg.pg_name = group_id.raw();
        msg.pg_state = state_id.raw();

        let reply = self.request(msg)?;
        debug!(code = ?reply.code(), group, state, "set_state acknowledged");
        match reply.code() {
            ControlCode::SetStateSuccess => {
                self.outstanding.fetch_add(1, Ordering::AcqRel);
                Ok(Ticket {
                    group: group_id,
                    state: state_id,
                })
            }
            other => Err(ClientError::Rejected(other)),
        }
    }

    /// Poll the response mailbox for the next asynchronous outcome.
    pub fn poll_outcome(&self) -> Option<ControlMessage> {
        let channel = self.comms.control_channel()?;
        let msg = channel.take_response()?;
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .ok();
        Some(msg)
    }

    /// Wait up to `timeout` for a transition's final result, translated
    /// into the execution error domain.
    pub fn wait_result(&self, timeout: Duration) -> Result<(), ClientError> {
        match self.wait_outcome(timeout) {
            Some(msg) => match msg.code().exec_error() {
                None => Ok(()),
                Some(err) => Err(ClientError::Execution(err)),
            },
            None => Err(ClientError::CommunicationError),
        }
    }

    /// Wait up to `timeout` for the next asynchronous outcome.
    pub fn wait_outcome(&self, timeout: Duration) -> Option<ControlMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.poll_outcome() {
                return Some(msg);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(CONTROL_POLL_DELAY);
        }
    }

    /// Read the stored execution error of a group in an undefined state.
    pub fn get_execution_error(&self, group: &str) -> Result<u64, ClientError> {
        let mut msg = ControlMessage::new(ControlCode::GetExecutionErrorRequest);
        msg.pg_name = Identifier::new(group).raw();
        let reply = self.request(msg)?;
        match reply.code() {
            ControlCode::ExecutionErrorSuccess => Ok(reply.execution_error),
            other => Err(ClientError::Rejected(other)),
        }
    }

    /// Check whether a group/state pair exists in the topology.
    pub fn validate_process_group_state(
        &self,
        group: &str,
        state: &str,
    ) -> Result<(), ClientError> {
        let mut msg = ControlMessage::new(ControlCode::ValidateProcessGroupStateRequest);
        msg.pg_name = Identifier::new(group).raw();
        msg.pg_state = Identifier::new(&format!("{group}/{state}")).raw();
        let reply = self.request(msg)?;
        match reply.code() {
            ControlCode::ValidateProcessGroupStateSuccess => Ok(()),
            other => Err(ClientError::Rejected(other)),
        }
    }

    /// Ask for the outcome of the initial machine state transition. The
    /// answer is deferred until the outcome exists.
    pub fn get_initial_machine_state(
        &self,
        timeout: Duration,
    ) -> Result<ControlCode, ClientError> {
        let msg = ControlMessage::new(ControlCode::GetInitialMachineStateRequest);
        let reply = self.request(msg)?;
        match reply.code() {
            // Echoed request code: the result arrives as a response.
            ControlCode::GetInitialMachineStateRequest => self
                .wait_outcome(timeout)
                .map(|msg| msg.code())
                .ok_or(ClientError::CommunicationError),
            other => Err(ClientError::Rejected(other)),
        }
    }
}
