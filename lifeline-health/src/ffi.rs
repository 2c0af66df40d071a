//! C ABI for the health monitoring library.
//!
//! Handle-based: every object crosses the boundary as an opaque pointer.
//! Ownership rules, per operation: a builder pointer is consumed by its
//! `build` call (the `**builder` is nulled); sub-monitor builders are
//! consumed when inserted into the composite builder; everything else is
//! released with the matching `*_delete`, which also nulls the handle.
//! A null handle is answered with `NullHandle`, never dereferenced.

// The C-facing names follow the header's `hm_` convention.
#![allow(non_camel_case_types)]

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::Arc;
use std::time::Duration;

use crate::deadline::{Deadline, DeadlineMonitor, DeadlineMonitorBuilder};
use crate::heartbeat::HeartbeatMonitor;
use crate::logic::{LogicMonitor, LogicMonitorBuilder, LogicState};
use crate::status::{HealthError, MonitorStatus, Tag, TimeRange};

/// Error codes of the C surface.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum hm_Error {
    NoError = 0,
    NullHandle = 1,
    NotFound = 2,
    AlreadyRunning = 3,
    WrongState = 4,
    Disabled = 5,
    InvalidTransition = 6,
}

impl From<HealthError> for hm_Error {
    fn from(err: HealthError) -> hm_Error {
        match err {
            HealthError::NotFound => hm_Error::NotFound,
            HealthError::AlreadyRunning => hm_Error::AlreadyRunning,
            HealthError::WrongState => hm_Error::WrongState,
            HealthError::NotAllowed => hm_Error::Disabled,
            HealthError::InvalidTransition => hm_Error::InvalidTransition,
            HealthError::Watchdog => hm_Error::WrongState,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum hm_Status {
    Running = 0,
    Disabled = 1,
    Failed = 2,
}

impl From<MonitorStatus> for hm_Status {
    fn from(status: MonitorStatus) -> hm_Status {
        match status {
            MonitorStatus::Running => hm_Status::Running,
            MonitorStatus::Disabled => hm_Status::Disabled,
            MonitorStatus::Failed => hm_Status::Failed,
        }
    }
}

/// Tag passed by value across the boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct hm_Tag {
    pub hash: u64,
}

/// Logic state passed by value across the boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct hm_LogicMonitorState {
    pub hash: u64,
}

// Opaque handle targets.
pub struct hm_DeadlineMonitorBuilder(DeadlineMonitorBuilder);
pub struct hm_DeadlineMonitor(Arc<DeadlineMonitor>);
pub struct hm_Deadline(Deadline);
pub struct hm_LogicMonitorBuilder(LogicMonitorBuilder);
pub struct hm_LogicMonitor(Arc<LogicMonitor>);
pub struct hm_HeartbeatMonitor(Arc<HeartbeatMonitor>);
pub struct hm_HealthMonitorBuilder(CompositeBuilder);
pub struct hm_HealthMonitor(Composite);

#[derive(Default)]
struct CompositeBuilder {
    deadline: HashMap<u64, DeadlineMonitorBuilder>,
    logic: HashMap<u64, LogicMonitorBuilder>,
    heartbeat: HashMap<u64, Duration>,
}

struct Composite {
    deadline: HashMap<u64, Arc<DeadlineMonitor>>,
    logic: HashMap<u64, Arc<LogicMonitor>>,
    heartbeat: HashMap<u64, Arc<HeartbeatMonitor>>,
}

/// Take ownership back from a `**handle`, nulling the caller's pointer.
unsafe fn consume<T>(handle: *mut *mut T) -> Option<Box<T>> {
    if handle.is_null() || (*handle).is_null() {
        return None;
    }
    let boxed = Box::from_raw(*handle);
    *handle = std::ptr::null_mut();
    Some(boxed)
}

fn leak<T>(value: T) -> *mut T {
    Box::into_raw(Box::new(value))
}

// ─── Tags ─────────────────────────────────────────────────────

/// # Safety
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn hm_tag_from_str(name: *const c_char) -> hm_Tag {
    let hash = if name.is_null() {
        Tag::new("").raw()
    } else {
        Tag::new(&CStr::from_ptr(name).to_string_lossy()).raw()
    };
    hm_Tag { hash }
}

/// # Safety
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn hm_lm_state_from_str(name: *const c_char) -> hm_LogicMonitorState {
    let hash = if name.is_null() {
        LogicState::new("").raw()
    } else {
        LogicState::new(&CStr::from_ptr(name).to_string_lossy()).raw()
    };
    hm_LogicMonitorState { hash }
}

// ─── Deadline monitor ─────────────────────────────────────────

#[no_mangle]
pub extern "C" fn hm_dmb_new() -> *mut hm_DeadlineMonitorBuilder {
    leak(hm_DeadlineMonitorBuilder(DeadlineMonitorBuilder::new()))
}

/// To be called only if `hm_dmb_build` wasn't.
///
/// # Safety
/// `builder` must come from `hm_dmb_new` and not have been consumed.
#[no_mangle]
pub unsafe extern "C" fn hm_dmb_delete(builder: *mut *mut hm_DeadlineMonitorBuilder) {
    drop(consume(builder));
}

/// # Safety
/// `builder` must be a live handle from `hm_dmb_new`.
#[no_mangle]
pub unsafe extern "C" fn hm_dmb_add_deadline(
    builder: *mut hm_DeadlineMonitorBuilder,
    tag: hm_Tag,
    min_ms: u64,
    max_ms: u64,
) {
    if builder.is_null() {
        return;
    }
    let slot = &mut (*builder).0;
    let taken = std::mem::take(slot);
    *slot = taken.add_deadline(Tag::from_raw(tag.hash), TimeRange::from_millis(min_ms, max_ms));
}

/// Consumes the builder.
///
/// # Safety
/// `builder` must be a live handle; `out` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn hm_dmb_build(
    builder: *mut *mut hm_DeadlineMonitorBuilder,
    out: *mut *mut hm_DeadlineMonitor,
) -> hm_Error {
    let Some(builder) = consume(builder) else {
        return hm_Error::NullHandle;
    };
    if out.is_null() {
        return hm_Error::NullHandle;
    }
    *out = leak(hm_DeadlineMonitor(Arc::new(builder.0.build())));
    hm_Error::NoError
}

/// # Safety
/// `monitor` must come from `hm_dmb_build` or `hm_hm_get_deadline_monitor`.
#[no_mangle]
pub unsafe extern "C" fn hm_dm_delete(monitor: *mut *mut hm_DeadlineMonitor) {
    drop(consume(monitor));
}

/// # Safety
/// `monitor` must be a live handle; `out` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn hm_dm_get_deadline(
    monitor: *mut hm_DeadlineMonitor,
    tag: hm_Tag,
    out: *mut *mut hm_Deadline,
) -> hm_Error {
    if monitor.is_null() || out.is_null() {
        return hm_Error::NullHandle;
    }
    match (*monitor).0.get_deadline(Tag::from_raw(tag.hash)) {
        Ok(deadline) => {
            *out = leak(hm_Deadline(deadline));
            hm_Error::NoError
        }
        Err(err) => err.into(),
    }
}

/// # Safety
/// `monitor` must be a live handle; `out` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn hm_dm_create_custom_deadline(
    monitor: *mut hm_DeadlineMonitor,
    min_ms: u64,
    max_ms: u64,
    out: *mut *mut hm_Deadline,
) -> hm_Error {
    if monitor.is_null() || out.is_null() {
        return hm_Error::NullHandle;
    }
    let deadline = (*monitor)
        .0
        .create_custom_deadline(TimeRange::from_millis(min_ms, max_ms));
    *out = leak(hm_Deadline(deadline));
    hm_Error::NoError
}

/// # Safety
/// `monitor` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_dm_enable(monitor: *mut hm_DeadlineMonitor) -> hm_Error {
    if monitor.is_null() {
        return hm_Error::NullHandle;
    }
    (*monitor).0.enable();
    hm_Error::NoError
}

/// # Safety
/// `monitor` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_dm_disable(monitor: *mut hm_DeadlineMonitor) -> hm_Error {
    if monitor.is_null() {
        return hm_Error::NullHandle;
    }
    (*monitor).0.disable();
    hm_Error::NoError
}

/// # Safety
/// `monitor` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_dm_status(monitor: *const hm_DeadlineMonitor) -> hm_Status {
    if monitor.is_null() {
        return hm_Status::Failed;
    }
    (*monitor).0.status().into()
}

/// # Safety
/// `deadline` must come from `hm_dm_get_deadline` or
/// `hm_dm_create_custom_deadline`.
#[no_mangle]
pub unsafe extern "C" fn hm_dl_delete(deadline: *mut *mut hm_Deadline) {
    drop(consume(deadline));
}

/// # Safety
/// `deadline` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_dl_start(deadline: *mut hm_Deadline) -> hm_Error {
    if deadline.is_null() {
        return hm_Error::NullHandle;
    }
    match (*deadline).0.raw_start() {
        Ok(()) => hm_Error::NoError,
        Err(err) => err.into(),
    }
}

/// # Safety
/// `deadline` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_dl_stop(deadline: *mut hm_Deadline) -> hm_Error {
    if deadline.is_null() {
        return hm_Error::NullHandle;
    }
    match (*deadline).0.raw_stop() {
        Ok(()) => hm_Error::NoError,
        Err(err) => err.into(),
    }
}

/// # Safety
/// `deadline` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_dl_min_ms(deadline: *const hm_Deadline) -> u64 {
    if deadline.is_null() {
        return 0;
    }
    (*deadline).0.range().min.as_millis() as u64
}

/// # Safety
/// `deadline` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_dl_max_ms(deadline: *const hm_Deadline) -> u64 {
    if deadline.is_null() {
        return 0;
    }
    (*deadline).0.range().max.as_millis() as u64
}

// ─── Logic monitor ────────────────────────────────────────────

#[no_mangle]
pub extern "C" fn hm_lmb_new(initial: hm_LogicMonitorState) -> *mut hm_LogicMonitorBuilder {
    leak(hm_LogicMonitorBuilder(LogicMonitorBuilder::new(
        LogicState::from_raw(initial.hash),
    )))
}

/// To be called only if `hm_lmb_build` wasn't.
///
/// # Safety
/// `builder` must come from `hm_lmb_new` and not have been consumed.
#[no_mangle]
pub unsafe extern "C" fn hm_lmb_delete(builder: *mut *mut hm_LogicMonitorBuilder) {
    drop(consume(builder));
}

/// # Safety
/// `builder` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_lmb_add_transition(
    builder: *mut hm_LogicMonitorBuilder,
    from: hm_LogicMonitorState,
    to: hm_LogicMonitorState,
) {
    if builder.is_null() {
        return;
    }
    let slot = &mut (*builder).0;
    // The builder is append-only; replace it with the extended one.
    let taken = std::mem::replace(slot, LogicMonitorBuilder::new(LogicState::from_raw(0)));
    *slot = taken.add_transition(LogicState::from_raw(from.hash), LogicState::from_raw(to.hash));
}

/// Consumes the builder.
///
/// # Safety
/// `builder` must be a live handle; `out` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn hm_lmb_build(
    builder: *mut *mut hm_LogicMonitorBuilder,
    out: *mut *mut hm_LogicMonitor,
) -> hm_Error {
    let Some(builder) = consume(builder) else {
        return hm_Error::NullHandle;
    };
    if out.is_null() {
        return hm_Error::NullHandle;
    }
    *out = leak(hm_LogicMonitor(Arc::new(builder.0.build())));
    hm_Error::NoError
}

/// # Safety
/// `monitor` must come from `hm_lmb_build`.
#[no_mangle]
pub unsafe extern "C" fn hm_lm_delete(monitor: *mut *mut hm_LogicMonitor) {
    drop(consume(monitor));
}

/// # Safety
/// `monitor` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_lm_transition(
    monitor: *mut hm_LogicMonitor,
    to: hm_LogicMonitorState,
) -> hm_Error {
    if monitor.is_null() {
        return hm_Error::NullHandle;
    }
    match (*monitor).0.transition(LogicState::from_raw(to.hash)) {
        Ok(()) => hm_Error::NoError,
        Err(err) => err.into(),
    }
}

/// # Safety
/// `monitor` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_lm_enable(monitor: *mut hm_LogicMonitor) -> hm_Error {
    if monitor.is_null() {
        return hm_Error::NullHandle;
    }
    (*monitor).0.enable();
    hm_Error::NoError
}

/// # Safety
/// `monitor` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_lm_disable(monitor: *mut hm_LogicMonitor) -> hm_Error {
    if monitor.is_null() {
        return hm_Error::NullHandle;
    }
    (*monitor).0.disable();
    hm_Error::NoError
}

/// # Safety
/// `monitor` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_lm_status(monitor: *const hm_LogicMonitor) -> hm_Status {
    if monitor.is_null() {
        return hm_Status::Failed;
    }
    (*monitor).0.status().into()
}

/// # Safety
/// `monitor` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_lm_state(monitor: *const hm_LogicMonitor) -> hm_LogicMonitorState {
    if monitor.is_null() {
        return hm_LogicMonitorState { hash: 0 };
    }
    hm_LogicMonitorState {
        hash: (*monitor).0.state().raw(),
    }
}

// ─── Heartbeat monitor ────────────────────────────────────────

#[no_mangle]
pub extern "C" fn hm_hbm_new(max_interval_ms: u64) -> *mut hm_HeartbeatMonitor {
    leak(hm_HeartbeatMonitor(Arc::new(HeartbeatMonitor::new(
        Duration::from_millis(max_interval_ms),
    ))))
}

/// # Safety
/// `monitor` must come from `hm_hbm_new`.
#[no_mangle]
pub unsafe extern "C" fn hm_hbm_delete(monitor: *mut *mut hm_HeartbeatMonitor) {
    drop(consume(monitor));
}

/// # Safety
/// `monitor` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_hbm_heartbeat(monitor: *mut hm_HeartbeatMonitor) -> hm_Error {
    if monitor.is_null() {
        return hm_Error::NullHandle;
    }
    match (*monitor).0.report() {
        Ok(()) => hm_Error::NoError,
        Err(err) => err.into(),
    }
}

/// # Safety
/// `monitor` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_hbm_status(monitor: *const hm_HeartbeatMonitor) -> hm_Status {
    if monitor.is_null() {
        return hm_Status::Failed;
    }
    (*monitor).0.status().into()
}

// ─── Composite health monitor ─────────────────────────────────

#[no_mangle]
pub extern "C" fn hm_hmb_new() -> *mut hm_HealthMonitorBuilder {
    leak(hm_HealthMonitorBuilder(CompositeBuilder::default()))
}

/// To be called only if `hm_hmb_build` wasn't.
///
/// # Safety
/// `builder` must come from `hm_hmb_new` and not have been consumed.
#[no_mangle]
pub unsafe extern "C" fn hm_hmb_delete(builder: *mut *mut hm_HealthMonitorBuilder) {
    drop(consume(builder));
}

/// Transfers ownership of the sub-monitor builder into the composite.
///
/// # Safety
/// Both handles must be live; `sub` is consumed.
#[no_mangle]
pub unsafe extern "C" fn hm_hmb_add_deadline_monitor(
    builder: *mut hm_HealthMonitorBuilder,
    tag: hm_Tag,
    sub: *mut *mut hm_DeadlineMonitorBuilder,
) -> hm_Error {
    if builder.is_null() {
        return hm_Error::NullHandle;
    }
    let Some(sub) = consume(sub) else {
        return hm_Error::NullHandle;
    };
    (*builder).0.deadline.insert(tag.hash, sub.0);
    hm_Error::NoError
}

/// Transfers ownership of the sub-monitor builder into the composite.
///
/// # Safety
/// Both handles must be live; `sub` is consumed.
#[no_mangle]
pub unsafe extern "C" fn hm_hmb_add_logic_monitor(
    builder: *mut hm_HealthMonitorBuilder,
    tag: hm_Tag,
    sub: *mut *mut hm_LogicMonitorBuilder,
) -> hm_Error {
    if builder.is_null() {
        return hm_Error::NullHandle;
    }
    let Some(sub) = consume(sub) else {
        return hm_Error::NullHandle;
    };
    (*builder).0.logic.insert(tag.hash, sub.0);
    hm_Error::NoError
}

/// # Safety
/// `builder` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_hmb_add_heartbeat_monitor(
    builder: *mut hm_HealthMonitorBuilder,
    tag: hm_Tag,
    max_interval_ms: u64,
) -> hm_Error {
    if builder.is_null() {
        return hm_Error::NullHandle;
    }
    (*builder)
        .0
        .heartbeat
        .insert(tag.hash, Duration::from_millis(max_interval_ms));
    hm_Error::NoError
}

/// Consumes the builder. The cycle durations are recorded for the daemon
/// side; the composite handle only reads monitors.
///
/// # Safety
/// `builder` must be a live handle; `out` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn hm_hmb_build(
    builder: *mut *mut hm_HealthMonitorBuilder,
    _supervisor_cycle_ms: u32,
    _internal_cycle_ms: u32,
    out: *mut *mut hm_HealthMonitor,
) -> hm_Error {
    let Some(builder) = consume(builder) else {
        return hm_Error::NullHandle;
    };
    if out.is_null() {
        return hm_Error::NullHandle;
    }
    let composite = Composite {
        deadline: builder
            .0
            .deadline
            .into_iter()
            .map(|(tag, b)| (tag, Arc::new(b.build())))
            .collect(),
        logic: builder
            .0
            .logic
            .into_iter()
            .map(|(tag, b)| (tag, Arc::new(b.build())))
            .collect(),
        heartbeat: builder
            .0
            .heartbeat
            .into_iter()
            .map(|(tag, d)| (tag, Arc::new(HeartbeatMonitor::new(d))))
            .collect(),
    };
    *out = leak(hm_HealthMonitor(composite));
    hm_Error::NoError
}

/// # Safety
/// `monitor` must come from `hm_hmb_build`.
#[no_mangle]
pub unsafe extern "C" fn hm_hm_delete(monitor: *mut *mut hm_HealthMonitor) {
    drop(consume(monitor));
}

/// The returned sub-monitor handle shares the composite's monitor; delete
/// it independently with `hm_dm_delete`.
///
/// # Safety
/// `monitor` must be a live handle; `out` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn hm_hm_get_deadline_monitor(
    monitor: *mut hm_HealthMonitor,
    tag: hm_Tag,
    out: *mut *mut hm_DeadlineMonitor,
) -> hm_Error {
    if monitor.is_null() || out.is_null() {
        return hm_Error::NullHandle;
    }
    match (*monitor).0.deadline.get(&tag.hash) {
        Some(sub) => {
            *out = leak(hm_DeadlineMonitor(Arc::clone(sub)));
            hm_Error::NoError
        }
        None => hm_Error::NotFound,
    }
}

/// Aggregate status across every sub-monitor.
///
/// # Safety
/// `monitor` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn hm_hm_status(monitor: *const hm_HealthMonitor) -> hm_Status {
    if monitor.is_null() {
        return hm_Status::Failed;
    }
    let composite = &(*monitor).0;
    let failed = composite
        .deadline
        .values()
        .any(|m| m.status() == MonitorStatus::Failed)
        || composite
            .logic
            .values()
            .any(|m| m.status() == MonitorStatus::Failed)
        || composite
            .heartbeat
            .values()
            .any(|m| m.status() == MonitorStatus::Failed);
    if failed {
        hm_Status::Failed
    } else {
        hm_Status::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn deadline_lifecycle_through_the_abi() {
        unsafe {
            let mut builder = hm_dmb_new();
            let tag = hm_tag_from_str(c"cycle".as_ptr());
            hm_dmb_add_deadline(builder, tag, 0, 5000);

            let mut monitor: *mut hm_DeadlineMonitor = ptr::null_mut();
            assert_eq!(hm_dmb_build(&mut builder, &mut monitor), hm_Error::NoError);
            assert!(builder.is_null());

            let mut deadline: *mut hm_Deadline = ptr::null_mut();
            assert_eq!(
                hm_dm_get_deadline(monitor, tag, &mut deadline),
                hm_Error::NoError
            );
            assert_eq!(hm_dl_start(deadline), hm_Error::NoError);
            assert_eq!(hm_dl_start(deadline), hm_Error::AlreadyRunning);
            assert_eq!(hm_dl_stop(deadline), hm_Error::NoError);
            assert_eq!(hm_dm_status(monitor), hm_Status::Running);

            hm_dl_delete(&mut deadline);
            assert!(deadline.is_null());
            hm_dm_delete(&mut monitor);
            assert!(monitor.is_null());
        }
    }

    #[test]
    fn null_handles_are_refused() {
        unsafe {
            assert_eq!(hm_dl_start(ptr::null_mut()), hm_Error::NullHandle);
            let mut out: *mut hm_DeadlineMonitor = ptr::null_mut();
            let mut null_builder: *mut hm_DeadlineMonitorBuilder = ptr::null_mut();
            assert_eq!(
                hm_dmb_build(&mut null_builder, &mut out),
                hm_Error::NullHandle
            );
        }
    }

    #[test]
    fn logic_transitions_through_the_abi() {
        unsafe {
            let init = hm_lm_state_from_str(c"Init".as_ptr());
            let run = hm_lm_state_from_str(c"Run".as_ptr());
            let mut builder = hm_lmb_new(init);
            hm_lmb_add_transition(builder, init, run);

            let mut monitor: *mut hm_LogicMonitor = ptr::null_mut();
            assert_eq!(hm_lmb_build(&mut builder, &mut monitor), hm_Error::NoError);

            assert_eq!(hm_lm_transition(monitor, run), hm_Error::NoError);
            assert_eq!(hm_lm_state(monitor).hash, run.hash);
            // Unknown edge: fails terminally.
            assert_eq!(hm_lm_transition(monitor, init), hm_Error::InvalidTransition);
            assert_eq!(hm_lm_status(monitor), hm_Status::Failed);

            hm_lm_delete(&mut monitor);
        }
    }

    #[test]
    fn composite_ownership_transfer() {
        unsafe {
            let mut composite_builder = hm_hmb_new();
            let tag = hm_tag_from_str(c"deadlines".as_ptr());
            let mut sub = hm_dmb_new();
            hm_dmb_add_deadline(sub, hm_tag_from_str(c"d".as_ptr()), 0, 1000);
            assert_eq!(
                hm_hmb_add_deadline_monitor(composite_builder, tag, &mut sub),
                hm_Error::NoError
            );
            // Ownership moved into the composite.
            assert!(sub.is_null());

            let mut monitor: *mut hm_HealthMonitor = ptr::null_mut();
            assert_eq!(
                hm_hmb_build(&mut composite_builder, 50, 50, &mut monitor),
                hm_Error::NoError
            );
            assert_eq!(hm_hm_status(monitor), hm_Status::Running);

            let mut sub_monitor: *mut hm_DeadlineMonitor = ptr::null_mut();
            assert_eq!(
                hm_hm_get_deadline_monitor(monitor, tag, &mut sub_monitor),
                hm_Error::NoError
            );
            hm_dm_delete(&mut sub_monitor);
            hm_hm_delete(&mut monitor);
        }
    }
}
