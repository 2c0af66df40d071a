//! Shared-memory mailboxes between the manager and its children.
//!
//! Every launched child shares one region with the manager, laid out as a
//! [`CommsSync`] header followed, for state managers only, by a
//! [`ControlChannel`]. The header carries the two readiness semaphores; the
//! control channel adds a single-slot request mailbox, a single-slot
//! response mailbox, and an acknowledgement semaphore toward the client.
//! Each slot has exactly one writer and one reader at a time.
//!
//! The structures are `#[repr(C)]` and operate on whatever memory they are
//! placed in, so tests exercise the full protocol in-process.

use std::cell::UnsafeCell;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::CommsType;
use crate::error::{ControlCode, CoreError};
use crate::osal::{RawSemaphore, SharedRegion};

/// Well-known descriptor the child finds its comms region on.
pub const COMMS_FD_SLOT: i32 = 3;
/// Well-known descriptor of the manager wake semaphore region.
pub const WAKE_FD_SLOT: i32 = 4;

/// Client-side polling resolution while waiting for an acknowledgement.
pub const CONTROL_POLL_DELAY: Duration = Duration::from_millis(1);
/// Longest a client waits for the manager before reporting a
/// communication error.
pub const CLIENT_IPC_TIMEOUT: Duration = Duration::from_millis(500);
/// Longest a lifecycle client waits for the running acknowledgement.
pub const RUNNING_ACK_TIMEOUT: Duration = Duration::from_millis(1000);

// ─── Message ──────────────────────────────────────────────────

/// Routing address of a control client: its process group and node index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ClientId {
    pub group: u16,
    pub node: u16,
}

impl ClientId {
    pub const INVALID: ClientId = ClientId {
        group: 0xFFFF,
        node: 0xFFFF,
    };

    pub fn is_valid(&self) -> bool {
        *self != ClientId::INVALID
    }
}

/// One control-channel message. Plain data: identifiers travel as raw
/// hashes.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ControlMessage {
    code: u32,
    pub pg_name: u64,
    pub pg_state: u64,
    pub client: ClientId,
    pub execution_error: u64,
}

impl ControlMessage {
    pub fn new(code: ControlCode) -> ControlMessage {
        ControlMessage {
            code: code as u32,
            pg_name: 0,
            pg_state: 0,
            client: ClientId::INVALID,
            execution_error: 0,
        }
    }

    pub fn code(&self) -> ControlCode {
        ControlCode::from_raw(self.code)
    }

    pub fn set_code(&mut self, code: ControlCode) {
        self.code = code as u32;
    }
}

// ─── Single-slot mailbox ──────────────────────────────────────

/// One message slot with a full flag. Single producer, single consumer.
#[repr(C)]
pub struct MessageSlot {
    full: AtomicBool,
    msg: UnsafeCell<ControlMessage>,
}

// Safety: the message payload is only written while `full` is false (one
// writer) and only read after observing `full` with acquire ordering.
unsafe impl Sync for MessageSlot {}

impl MessageSlot {
    fn reset(&self) {
        self.full.store(false, Ordering::Release);
    }

    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    /// Deposit a message if the slot is free.
    pub fn put(&self, msg: ControlMessage) -> bool {
        if self.is_full() {
            return false;
        }
        unsafe {
            *self.msg.get() = msg;
        }
        self.full.store(true, Ordering::Release);
        true
    }

    /// Copy the current message out without clearing the slot.
    pub fn peek(&self) -> Option<ControlMessage> {
        if self.is_full() {
            Some(unsafe { *self.msg.get() })
        } else {
            None
        }
    }

    /// Consume the message, freeing the slot.
    pub fn take(&self) -> Option<ControlMessage> {
        let msg = self.peek()?;
        self.reset();
        Some(msg)
    }

    /// Overwrite the message in place and free the slot. Used by the
    /// manager to turn a request into its immediate reply.
    pub fn finish(&self, msg: ControlMessage) {
        unsafe {
            *self.msg.get() = msg;
        }
        self.reset();
    }
}

// ─── Comms header ─────────────────────────────────────────────

/// Shared header present for every child with a comms channel.
#[repr(C)]
pub struct CommsSync {
    /// Posted by the child: running report, and once more on release.
    pub send_sync: RawSemaphore,
    /// Posted by the manager to acknowledge the report.
    pub reply_sync: RawSemaphore,
    comms_type: AtomicU32,
    pid: AtomicI32,
}

impl CommsSync {
    /// Initialize in place inside a fresh region.
    pub fn init(&self, kind: CommsType) -> Result<(), CoreError> {
        self.send_sync.init(0, true).map_err(CoreError::Os)?;
        self.reply_sync.init(0, true).map_err(CoreError::Os)?;
        self.comms_type.store(kind as u32, Ordering::Release);
        self.pid.store(0, Ordering::Release);
        Ok(())
    }

    pub fn kind(&self) -> CommsType {
        match self.comms_type.load(Ordering::Acquire) {
            1 => CommsType::Reporting,
            2 => CommsType::StateManager,
            3 => CommsType::SelfManager,
            _ => CommsType::None,
        }
    }

    /// Set by the child library so the manager can cross-check.
    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }
}

// ─── Control channel ──────────────────────────────────────────

/// Request/response mailboxes for a state manager, co-located with its
/// [`CommsSync`] in the same region.
#[repr(C)]
pub struct ControlChannel {
    request: MessageSlot,
    response: MessageSlot,
    /// Posted by the manager toward the client: request acknowledged or
    /// response available.
    ack: RawSemaphore,
    /// Outstanding deferred initial-machine-state replies owed here.
    deferred_initial: AtomicU32,
}

impl ControlChannel {
    pub fn init(&self) -> Result<(), CoreError> {
        self.request.reset();
        self.response.reset();
        self.ack.init(0, true).map_err(CoreError::Os)?;
        self.deferred_initial.store(0, Ordering::Release);
        Ok(())
    }

    // ── Manager side ──

    /// The pending request, if any, without consuming it.
    pub fn pending_request(&self) -> Option<ControlMessage> {
        self.request.peek()
    }

    /// Write the immediate reply into the request slot, free it, and wake
    /// the client.
    pub fn acknowledge_request(&self, reply: ControlMessage) {
        self.request.finish(reply);
        let _ = self.ack.post();
    }

    /// Offer an asynchronous outcome. False when the previous response has
    /// not been collected yet; the caller re-arms and retries later.
    pub fn send_response(&self, msg: ControlMessage) -> bool {
        if self.response.put(msg) {
            let _ = self.ack.post();
            true
        } else {
            false
        }
    }

    pub fn deferred_initial(&self) -> u32 {
        self.deferred_initial.load(Ordering::Acquire)
    }

    pub fn add_deferred_initial(&self) -> u32 {
        self.deferred_initial.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn settle_deferred_initial(&self) {
        self.deferred_initial.fetch_sub(1, Ordering::AcqRel);
    }

    // ── Client side ──

    /// Send a request and wait for the manager's immediate reply, which
    /// arrives as the mutated request message.
    pub fn send_request(
        &self,
        msg: ControlMessage,
        wake_manager: &RawSemaphore,
    ) -> Result<ControlMessage, CoreError> {
        if !self.request.put(msg) {
            return Err(CoreError::SharedMemory("request slot busy".into()));
        }
        let _ = wake_manager.post();
        if !self.ack.timed_wait(CLIENT_IPC_TIMEOUT) {
            return Err(CoreError::SharedMemory(
                "manager did not acknowledge request".into(),
            ));
        }
        let deadline = Instant::now() + CLIENT_IPC_TIMEOUT;
        while self.request.is_full() {
            if Instant::now() >= deadline {
                return Err(CoreError::SharedMemory(
                    "manager did not release request slot".into(),
                ));
            }
            thread::sleep(CONTROL_POLL_DELAY);
        }
        // The manager rewrote the message in place before releasing it.
        Ok(unsafe { *self.request.msg.get() })
    }

    /// Poll for an asynchronous outcome.
    pub fn take_response(&self) -> Option<ControlMessage> {
        self.response.take()
    }
}

// ─── Region layout ────────────────────────────────────────────

fn control_offset() -> usize {
    let align = align_of::<ControlChannel>();
    size_of::<CommsSync>().div_ceil(align) * align
}

/// Bytes a comms region needs for the given channel kind.
pub fn comms_region_len(kind: CommsType) -> usize {
    match kind {
        CommsType::StateManager => control_offset() + size_of::<ControlChannel>(),
        _ => size_of::<CommsSync>(),
    }
}

/// A typed view over a comms region.
#[derive(Clone)]
pub struct CommsRegion {
    region: Arc<SharedRegion>,
}

impl CommsRegion {
    /// Allocate and initialize a fresh region for a child of the given
    /// comms kind.
    pub fn create(kind: CommsType) -> Result<CommsRegion, CoreError> {
        let region = SharedRegion::create(comms_region_len(kind))?;
        Self::initialize(region, kind)
    }

    /// Like [`CommsRegion::create`] but without a backing descriptor; for
    /// in-process use and tests.
    pub fn anonymous(kind: CommsType) -> Result<CommsRegion, CoreError> {
        let region = SharedRegion::anonymous(comms_region_len(kind))?;
        Self::initialize(region, kind)
    }

    fn initialize(region: SharedRegion, kind: CommsType) -> Result<CommsRegion, CoreError> {
        let comms = CommsRegion {
            region: Arc::new(region),
        };
        comms.sync().init(kind)?;
        if let Some(channel) = comms.control_channel() {
            channel.init()?;
        }
        Ok(comms)
    }

    /// Attach to an inherited region, trusting the comms-type tag in the
    /// header to pick the layout.
    ///
    /// # Safety
    /// `region` must have been initialized by [`CommsRegion::create`].
    pub unsafe fn from_raw_region(region: Arc<SharedRegion>) -> CommsRegion {
        CommsRegion { region }
    }

    pub fn sync(&self) -> &CommsSync {
        // Safety: the region is at least CommsSync-sized and was
        // initialized in place.
        unsafe { self.region.at::<CommsSync>(0) }
    }

    pub fn control_channel(&self) -> Option<&ControlChannel> {
        if self.region.len() < comms_region_len(CommsType::StateManager) {
            return None;
        }
        // Safety: the region covers the control channel and was
        // initialized in place.
        Some(unsafe { self.region.at::<ControlChannel>(control_offset()) })
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn slot_put_take_round_trip() {
        let comms = CommsRegion::anonymous(CommsType::StateManager).unwrap();
        let channel = comms.control_channel().unwrap();
        let mut msg = ControlMessage::new(ControlCode::SetStateRequest);
        msg.pg_name = 42;
        assert!(channel.send_response(msg));
        // Second response is refused until the first is collected.
        assert!(!channel.send_response(msg));
        let got = channel.take_response().unwrap();
        assert_eq!(got.code(), ControlCode::SetStateRequest);
        assert_eq!(got.pg_name, 42);
        assert!(channel.take_response().is_none());
    }

    #[test]
    fn request_ack_round_trip_across_threads() {
        let comms = CommsRegion::anonymous(CommsType::StateManager).unwrap();
        let wake = SharedRegion::anonymous(size_of::<RawSemaphore>()).unwrap();
        let wake_sem: &RawSemaphore = unsafe { wake.at(0) };
        wake_sem.init(0, true).unwrap();

        thread::scope(|scope| {
            let channel = comms.control_channel().unwrap();
            // Manager side: wait for the wake, process, acknowledge.
            scope.spawn(|| {
                assert!(wake_sem.timed_wait(Duration::from_secs(2)));
                let mut request = channel.pending_request().unwrap();
                assert_eq!(request.code(), ControlCode::SetStateRequest);
                request.set_code(ControlCode::SetStateSuccess);
                channel.acknowledge_request(request);
            });
            // Client side.
            let mut msg = ControlMessage::new(ControlCode::SetStateRequest);
            msg.pg_state = 7;
            let reply = channel.send_request(msg, wake_sem).unwrap();
            assert_eq!(reply.code(), ControlCode::SetStateSuccess);
            assert_eq!(reply.pg_state, 7);
        });
    }

    #[test]
    fn plain_region_has_no_control_channel() {
        let comms = CommsRegion::anonymous(CommsType::Reporting).unwrap();
        assert!(comms.control_channel().is_none());
        assert_eq!(comms.sync().kind(), CommsType::Reporting);
    }

    #[test]
    fn reporting_handshake() {
        let comms = CommsRegion::anonymous(CommsType::Reporting).unwrap();
        let sync = comms.sync();
        sync.send_sync.post().unwrap();
        assert!(sync.send_sync.timed_wait(Duration::from_millis(50)));
        sync.reply_sync.post().unwrap();
        assert!(sync.reply_sync.timed_wait(Duration::from_millis(50)));
    }
}
