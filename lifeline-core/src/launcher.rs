//! Process launching: fork/exec with scheduling, credentials, limits, and
//! comms setup.
//!
//! The manager talks to the operating system only through [`ProcessHost`],
//! so the graph machinery can be exercised against [`FakeProcessHost`]
//! without forking anything.

use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;
use nix::sched::CpuSet;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, execve, fork, setgid, setgroups, setuid, ForkResult, Gid, Pid, Uid};
use tracing::debug;

use crate::channel::{CommsRegion, COMMS_FD_SLOT, WAKE_FD_SLOT};
use crate::config::{CommsType, ProcessConfig, SchedPolicy};

/// Environment variable carrying the configured short name to the child.
pub const PROCESS_IDENTIFIER_ENV: &str = "PROCESSIDENTIFIER";

/// Result of one reaper wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A child exited; `status` is the exit code, or 128 plus the signal
    /// number for a signalled exit.
    Reaped { pid: i32, status: i32 },
    /// Nothing to wait for right now.
    NoChildren,
    /// The wait was interrupted by a signal.
    Interrupted,
}

pub struct SpawnedChild {
    pub pid: i32,
    /// Shared comms region, present unless the process has no channel.
    pub comms: Option<CommsRegion>,
}

/// Capability set injected at construction time: fork, signal, wait.
pub trait ProcessHost: Send + Sync {
    fn spawn(&self, cfg: &ProcessConfig) -> Result<SpawnedChild, Errno>;

    /// Polite "please exit".
    fn request_termination(&self, pid: i32) -> Result<(), Errno>;

    /// Forceful kill.
    fn force_termination(&self, pid: i32) -> Result<(), Errno>;

    /// Block until any child exits.
    fn wait_any_child(&self) -> WaitOutcome;
}

// ─── Unix implementation ──────────────────────────────────────

pub struct UnixProcessHost {
    /// Descriptor of the manager wake region, duplicated into state-manager
    /// children on the well-known slot. Negative until wired up.
    wake_fd: AtomicI32,
}

impl Default for UnixProcessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixProcessHost {
    pub fn new() -> UnixProcessHost {
        UnixProcessHost {
            wake_fd: AtomicI32::new(-1),
        }
    }

    /// Wire the wake-region descriptor once the manager core exists.
    pub fn set_wake_fd(&self, fd: i32) {
        self.wake_fd.store(fd, Ordering::Release);
    }
}

impl ProcessHost for UnixProcessHost {
    fn spawn(&self, cfg: &ProcessConfig) -> Result<SpawnedChild, Errno> {
        let comms = match cfg.comms {
            CommsType::None => None,
            kind => Some(CommsRegion::create(kind).map_err(|_| Errno::ENOMEM)?),
        };

        // Everything the child needs is prepared before the fork; only
        // async-signal-safe calls happen on the child side.
        let exec = ExecImage::prepare(cfg)?;

        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                debug!(pid = child.as_raw(), process = %cfg.short_name, "forked child");
                Ok(SpawnedChild {
                    pid: child.as_raw(),
                    comms,
                })
            }
            ForkResult::Child => {
                let wake_fd = self.wake_fd.load(Ordering::Acquire);
                let wake_fd = (wake_fd >= 0).then_some(wake_fd);
                let outcome = setup_child(cfg, &exec, comms.as_ref(), wake_fd);
                // Reaching here means exec failed; exit immediately without
                // running any destructors in the forked image.
                let _ = outcome;
                unsafe { libc::_exit(127) }
            }
        }
    }

    fn request_termination(&self, pid: i32) -> Result<(), Errno> {
        kill(Pid::from_raw(pid), Signal::SIGTERM)
    }

    fn force_termination(&self, pid: i32) -> Result<(), Errno> {
        kill(Pid::from_raw(pid), Signal::SIGKILL)
    }

    fn wait_any_child(&self) -> WaitOutcome {
        match waitpid(None, None) {
            Ok(WaitStatus::Exited(pid, code)) => WaitOutcome::Reaped {
                pid: pid.as_raw(),
                status: code,
            },
            Ok(WaitStatus::Signaled(pid, signal, _)) => WaitOutcome::Reaped {
                pid: pid.as_raw(),
                status: 128 + signal as i32,
            },
            Ok(_) => WaitOutcome::Interrupted,
            Err(Errno::ECHILD) => WaitOutcome::NoChildren,
            Err(Errno::EINTR) => WaitOutcome::Interrupted,
            Err(_) => WaitOutcome::NoChildren,
        }
    }
}

/// The pre-built exec image: C strings assembled before fork.
struct ExecImage {
    path: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    workdir: Option<CString>,
}

impl ExecImage {
    fn prepare(cfg: &ProcessConfig) -> Result<ExecImage, Errno> {
        let path_str = cfg.executable.to_string_lossy().into_owned();
        let path = CString::new(path_str.clone()).map_err(|_| Errno::EINVAL)?;

        let mut argv = Vec::with_capacity(cfg.argv.len().max(1));
        if cfg.argv.is_empty() {
            argv.push(path.clone());
        } else {
            for arg in &cfg.argv {
                argv.push(CString::new(arg.as_str()).map_err(|_| Errno::EINVAL)?);
            }
        }

        let mut envp = Vec::with_capacity(cfg.envp.len() + 1);
        for var in &cfg.envp {
            envp.push(CString::new(var.as_str()).map_err(|_| Errno::EINVAL)?);
        }
        envp.push(
            CString::new(format!("{PROCESS_IDENTIFIER_ENV}={}", cfg.short_name))
                .map_err(|_| Errno::EINVAL)?,
        );

        let workdir = cfg
            .executable
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| CString::new(p.to_string_lossy().into_owned()).map_err(|_| Errno::EINVAL))
            .transpose()?;

        Ok(ExecImage {
            path,
            argv,
            envp,
            workdir,
        })
    }
}

/// Child-side setup between fork and exec. Order matters: descriptors,
/// scheduling, affinity, groups before uid, working directory, limits,
/// security transition, exec.
fn setup_child(
    cfg: &ProcessConfig,
    exec: &ExecImage,
    comms: Option<&CommsRegion>,
    wake_fd: Option<i32>,
) -> Errno {
    if let Some(comms) = comms {
        if let Some(fd) = comms.region().fd() {
            // dup2 clears CLOEXEC on the new slot.
            if unsafe { libc::dup2(fd.as_raw_fd(), COMMS_FD_SLOT) } < 0 {
                return Errno::last();
            }
        }
        if cfg.comms == CommsType::StateManager {
            if let Some(wake) = wake_fd {
                if unsafe { libc::dup2(wake, WAKE_FD_SLOT) } < 0 {
                    return Errno::last();
                }
            }
        }
    }

    if let Err(e) = apply_scheduling(cfg) {
        return e;
    }
    if let Err(e) = apply_affinity(cfg.affinity_mask) {
        return e;
    }
    if !cfg.supplementary_gids.is_empty() {
        let gids: Vec<Gid> = cfg
            .supplementary_gids
            .iter()
            .map(|&g| Gid::from_raw(g))
            .collect();
        if let Err(e) = setgroups(&gids) {
            return e;
        }
    }
    if cfg.gid != 0 {
        if let Err(e) = setgid(Gid::from_raw(cfg.gid)) {
            return e;
        }
    }
    if cfg.uid != 0 {
        if let Err(e) = setuid(Uid::from_raw(cfg.uid)) {
            return e;
        }
    }
    if let Some(dir) = &exec.workdir {
        if let Err(e) = chdir(dir.as_c_str()) {
            return e;
        }
    }
    if let Err(e) = apply_rlimits(cfg) {
        return e;
    }
    apply_security_policy(cfg.security_policy.as_deref());

    match execve(&exec.path, &exec.argv, &exec.envp) {
        Ok(infallible) => match infallible {},
        Err(e) => e,
    }
}

fn apply_scheduling(cfg: &ProcessConfig) -> Result<(), Errno> {
    let policy = match cfg.sched_policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::RoundRobin => libc::SCHED_RR,
        SchedPolicy::Other => libc::SCHED_OTHER,
    };
    let min = unsafe { libc::sched_get_priority_min(policy) };
    let max = unsafe { libc::sched_get_priority_max(policy) };
    if min < 0 || max < 0 {
        return Err(Errno::last());
    }
    let priority = cfg.priority.clamp(min, max);
    let param = libc::sched_param {
        sched_priority: priority,
    };
    if unsafe { libc::sched_setscheduler(0, policy, &param) } != 0 {
        return Err(Errno::last());
    }
    if cfg.sched_policy == SchedPolicy::Other && cfg.priority != 0 {
        if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, cfg.priority) } != 0 {
            return Err(Errno::last());
        }
    }
    Ok(())
}

fn apply_affinity(mask: u64) -> Result<(), Errno> {
    if mask == 0 {
        return Ok(());
    }
    let mut set = CpuSet::new();
    for cpu in 0..64usize {
        if mask & (1 << cpu) != 0 {
            set.set(cpu)?;
        }
    }
    nix::sched::sched_setaffinity(Pid::from_raw(0), &set)
}

fn apply_rlimits(cfg: &ProcessConfig) -> Result<(), Errno> {
    let pairs = [
        (libc::RLIMIT_AS, cfg.limits.address_space),
        (libc::RLIMIT_STACK, cfg.limits.stack),
        (libc::RLIMIT_CPU, cfg.limits.cpu_time),
        (libc::RLIMIT_DATA, cfg.limits.data),
    ];
    for (resource, limit) in pairs {
        if let Some(value) = limit {
            let lim = libc::rlimit {
                rlim_cur: value,
                rlim_max: value,
            };
            if unsafe { libc::setrlimit(resource, &lim) } != 0 {
                return Err(Errno::last());
            }
        }
    }
    Ok(())
}

/// Security policy transition. Not supported on this platform; the label is
/// accepted and ignored.
fn apply_security_policy(_label: Option<&str>) {}

/// Apply the manager's own scheduling and security configuration when the
/// topology carries an entry representing the manager itself.
pub fn apply_own_scheduling(cfg: &ProcessConfig) -> Result<(), crate::error::CoreError> {
    apply_scheduling(cfg).map_err(crate::error::CoreError::Os)?;
    apply_security_policy(cfg.security_policy.as_deref());
    Ok(())
}

// ─── Test double ──────────────────────────────────────────────

/// A scriptable [`ProcessHost`] that never forks.
///
/// Spawns allocate monotonically increasing pids and record the spawn
/// order. Exits are driven by the test (or scripted per short name) and
/// delivered through [`ProcessHost::wait_any_child`] exactly like the real
/// reaper sees them.
pub struct FakeProcessHost {
    next_pid: AtomicI32,
    events: (
        crossbeam_channel::Sender<(i32, i32)>,
        crossbeam_channel::Receiver<(i32, i32)>,
    ),
    state: Mutex<FakeState>,
    /// Post the running report automatically for reporting processes.
    auto_report: AtomicBool,
    /// Deliver an exit automatically when termination is requested.
    die_on_term: AtomicBool,
}

#[derive(Default)]
struct FakeState {
    spawn_order: Vec<String>,
    pids: Vec<(String, i32)>,
    comms: Vec<(String, CommsRegion)>,
    termination_order: Vec<i32>,
    /// Pids whose exit has already been delivered; signalling them fails
    /// with `ESRCH` like the real thing.
    dead: Vec<i32>,
    /// Exit statuses to inject on the next spawns of a given name.
    planned_exits: Vec<(String, i32)>,
    /// Names whose running report is withheld.
    suppressed_reports: Vec<String>,
}

impl Default for FakeProcessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProcessHost {
    pub fn new() -> FakeProcessHost {
        FakeProcessHost {
            next_pid: AtomicI32::new(1000),
            events: crossbeam_channel::unbounded(),
            state: Mutex::new(FakeState::default()),
            auto_report: AtomicBool::new(true),
            die_on_term: AtomicBool::new(true),
        }
    }

    /// The next spawn of `name` exits immediately with `status`.
    pub fn plan_exit(&self, name: &str, status: i32) {
        self.state
            .lock()
            .unwrap()
            .planned_exits
            .push((name.to_string(), status));
    }

    /// Withhold the automatic running report for `name`.
    pub fn suppress_report(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .suppressed_reports
            .push(name.to_string());
    }

    /// The comms region handed out for the most recent spawn of `name`.
    pub fn comms_of(&self, name: &str) -> Option<CommsRegion> {
        self.state
            .lock()
            .unwrap()
            .comms
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, region)| region.clone())
    }

    /// Pids in the order their polite termination was requested.
    pub fn termination_order(&self) -> Vec<i32> {
        self.state.lock().unwrap().termination_order.clone()
    }

    pub fn set_auto_report(&self, on: bool) {
        self.auto_report.store(on, Ordering::Release);
    }

    pub fn set_die_on_term(&self, on: bool) {
        self.die_on_term.store(on, Ordering::Release);
    }

    /// Deliver an exit for a live pid, as if the child died.
    pub fn exit(&self, pid: i32, status: i32) {
        let _ = self.deliver_exit(pid, status);
    }

    fn deliver_exit(&self, pid: i32, status: i32) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        if state.dead.contains(&pid) {
            return Err(Errno::ESRCH);
        }
        state.dead.push(pid);
        let _ = self.events.0.send((pid, status));
        Ok(())
    }

    pub fn spawn_order(&self) -> Vec<String> {
        self.state.lock().unwrap().spawn_order.clone()
    }

    /// The most recent pid spawned under `name`.
    pub fn pid_of(&self, name: &str) -> Option<i32> {
        self.state
            .lock()
            .unwrap()
            .pids
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|&(_, pid)| pid)
    }
}

impl ProcessHost for FakeProcessHost {
    fn spawn(&self, cfg: &ProcessConfig) -> Result<SpawnedChild, Errno> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let comms = match cfg.comms {
            CommsType::None => None,
            kind => Some(CommsRegion::anonymous(kind).map_err(|_| Errno::ENOMEM)?),
        };

        let (planned, suppressed) = {
            let mut state = self.state.lock().unwrap();
            state.spawn_order.push(cfg.short_name.clone());
            state.pids.push((cfg.short_name.clone(), pid));
            if let Some(region) = &comms {
                state.comms.push((cfg.short_name.clone(), region.clone()));
            }
            let planned = state
                .planned_exits
                .iter()
                .position(|(n, _)| n == &cfg.short_name)
                .map(|i| state.planned_exits.remove(i).1);
            let suppressed = state.suppressed_reports.contains(&cfg.short_name);
            (planned, suppressed)
        };

        if let Some(status) = planned {
            let _ = self.deliver_exit(pid, status);
        } else if !suppressed && self.auto_report.load(Ordering::Acquire) {
            // Reporting processes and state managers both post readiness.
            if let Some(comms) = &comms {
                let _ = comms.sync().send_sync.post();
            }
        }
        Ok(SpawnedChild { pid, comms })
    }

    fn request_termination(&self, pid: i32) -> Result<(), Errno> {
        {
            let mut state = self.state.lock().unwrap();
            if state.dead.contains(&pid) {
                return Err(Errno::ESRCH);
            }
            state.termination_order.push(pid);
        }
        if self.die_on_term.load(Ordering::Acquire) {
            let _ = self.deliver_exit(pid, 128 + 15);
        }
        Ok(())
    }

    fn force_termination(&self, pid: i32) -> Result<(), Errno> {
        self.deliver_exit(pid, 128 + 9)
    }

    fn wait_any_child(&self) -> WaitOutcome {
        match self.events.1.recv_timeout(Duration::from_millis(5)) {
            Ok((pid, status)) => WaitOutcome::Reaped { pid, status },
            Err(_) => WaitOutcome::NoChildren,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use std::path::PathBuf;

    fn cfg(name: &str, comms: CommsType) -> ProcessConfig {
        ProcessConfig {
            short_name: name.into(),
            executable: PathBuf::from(format!("/bin/{name}")),
            argv: vec![],
            envp: vec![],
            uid: 0,
            gid: 0,
            supplementary_gids: vec![],
            affinity_mask: 0,
            sched_policy: SchedPolicy::Other,
            priority: 0,
            limits: ResourceLimits::default(),
            security_policy: None,
            comms,
            self_terminating: false,
            startup_timeout: Duration::from_millis(200),
            termination_timeout: Duration::from_millis(200),
            restart_attempts: 0,
            execution_error_code: 0,
            dependencies: vec![],
        }
    }

    #[test]
    fn fake_spawn_records_order_and_pids() {
        let host = FakeProcessHost::new();
        host.spawn(&cfg("a", CommsType::None)).unwrap();
        host.spawn(&cfg("b", CommsType::None)).unwrap();
        assert_eq!(host.spawn_order(), ["a", "b"]);
        assert!(host.pid_of("a").unwrap() < host.pid_of("b").unwrap());
    }

    #[test]
    fn planned_exit_is_delivered_through_wait() {
        let host = FakeProcessHost::new();
        host.plan_exit("a", 1);
        let child = host.spawn(&cfg("a", CommsType::None)).unwrap();
        match host.wait_any_child() {
            WaitOutcome::Reaped { pid, status } => {
                assert_eq!(pid, child.pid);
                assert_eq!(status, 1);
            }
            other => panic!("expected reap, got {other:?}"),
        }
    }

    #[test]
    fn reporting_spawn_posts_running() {
        let host = FakeProcessHost::new();
        let child = host.spawn(&cfg("r", CommsType::Reporting)).unwrap();
        let comms = child.comms.unwrap();
        assert!(comms.sync().send_sync.timed_wait(Duration::from_millis(50)));
    }

    #[test]
    fn termination_request_delivers_signal_status() {
        let host = FakeProcessHost::new();
        let child = host.spawn(&cfg("t", CommsType::None)).unwrap();
        host.request_termination(child.pid).unwrap();
        assert_eq!(
            host.wait_any_child(),
            WaitOutcome::Reaped {
                pid: child.pid,
                status: 128 + 15
            }
        );
    }

    #[test]
    fn exec_image_appends_process_identifier() {
        let image = ExecImage::prepare(&cfg("named", CommsType::None)).unwrap();
        let last = image.envp.last().unwrap().to_str().unwrap();
        assert_eq!(last, format!("{PROCESS_IDENTIFIER_ENV}=named"));
        assert_eq!(image.argv.len(), 1);
    }
}
