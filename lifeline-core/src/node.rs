//! Per-process runtime state and the lifecycle work executed by the pool.
//!
//! `do_work` is what a worker thread runs for a dequeued node: in a start
//! phase it forks, registers, and waits for the running report; in a stop
//! phase it requests termination and waits for the reaper to confirm.
//! Successor nodes are enqueued only after the node's own terminal event.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::channel::CommsRegion;
use crate::config::{CommsType, GroupConfig, ProcessConfig, RequiredState};
use crate::error::ControlCode;
use crate::graph::{Graph, GraphState};
use crate::manager::Core;
use crate::pidmap::{NodeRef, RegisterOutcome};

/// Grace between forceful-kill attempts.
pub const SIGKILL_GRACE: Duration = Duration::from_millis(500);

/// Runtime state of one managed process. Monotone within a round; `Idle`
/// is re-entered only from `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
pub enum ProcessState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Terminating = 3,
    Terminated = 4,
}

impl ProcessState {
    fn from_raw(raw: u8) -> ProcessState {
        match raw {
            0 => ProcessState::Idle,
            1 => ProcessState::Starting,
            2 => ProcessState::Running,
            3 => ProcessState::Terminating,
            _ => ProcessState::Terminated,
        }
    }
}

/// A state change of a comms-enabled process, queued toward the health
/// supervisor. Delivery is lossy by contract; the supervisor reads what it
/// can keep up with.
#[derive(Debug, Clone, Copy)]
pub struct ProcessStateChange {
    pub pid: i32,
    pub state: ProcessState,
    pub group_state: u64,
    pub at: Instant,
}

/// One-shot gate a worker parks on while waiting for the reaper.
struct Gate {
    opened: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Gate {
        Gate {
            opened: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn arm(&self) {
        *self.opened.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    fn open(&self) {
        *self.opened.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cv.notify_all();
    }

    /// True if the gate opened within the timeout.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.opened.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |opened| !*opened)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

pub struct ProcessNode {
    index: u16,
    config: ProcessConfig,
    /// Nodes whose start waits for this one to be running.
    successors_running: Vec<u16>,
    /// Nodes whose start waits for this one to have terminated.
    successors_terminated: Vec<u16>,

    state: AtomicU8,
    pid: AtomicI32,
    status: AtomicI32,
    /// Remaining dependency count for the current phase.
    dependencies: AtomicU32,
    in_requested: AtomicBool,
    included: AtomicBool,
    head: AtomicBool,
    restart_counter: AtomicU32,

    /// Comms region of the current start attempt.
    comms: Mutex<Option<CommsRegion>>,
    /// Control channel of a state manager, kept until termination.
    control: Mutex<Option<CommsRegion>>,

    terminator: Gate,
    has_terminator: AtomicBool,
}

impl ProcessNode {
    /// Build the node arena for a group, wiring successor lists from the
    /// static dependency table.
    pub fn build_nodes(cfg: &GroupConfig) -> Vec<ProcessNode> {
        let mut nodes: Vec<ProcessNode> = cfg
            .processes
            .iter()
            .enumerate()
            .map(|(index, process)| ProcessNode {
                index: index as u16,
                config: process.clone(),
                successors_running: Vec::new(),
                successors_terminated: Vec::new(),
                state: AtomicU8::new(ProcessState::Idle as u8),
                pid: AtomicI32::new(0),
                status: AtomicI32::new(0),
                dependencies: AtomicU32::new(0),
                in_requested: AtomicBool::new(false),
                included: AtomicBool::new(false),
                head: AtomicBool::new(false),
                restart_counter: AtomicU32::new(0),
                comms: Mutex::new(None),
                control: Mutex::new(None),
                terminator: Gate::new(),
                has_terminator: AtomicBool::new(false),
            })
            .collect();

        for (index, process) in cfg.processes.iter().enumerate() {
            for dep in &process.dependencies {
                let target = dep.process as usize;
                match dep.state {
                    RequiredState::Running => {
                        nodes[target].successors_running.push(index as u16)
                    }
                    RequiredState::Terminated => {
                        nodes[target].successors_terminated.push(index as u16)
                    }
                }
            }
        }
        nodes
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn state(&self) -> ProcessState {
        ProcessState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn mark_requested(&self, requested: bool) {
        self.in_requested.store(requested, Ordering::Release);
    }

    pub fn is_head_node(&self) -> bool {
        self.head.load(Ordering::Acquire)
    }

    pub fn is_included(&self) -> bool {
        self.included.load(Ordering::Acquire)
    }

    pub fn control_channel(&self) -> Option<CommsRegion> {
        self.control.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Pure state-advance rule: `Terminated` always wins, `Idle` re-enters
    /// only from `Terminated`, anything else must be monotone.
    fn try_advance(&self, new_state: ProcessState) -> bool {
        let old = self.state();
        if new_state == ProcessState::Terminated
            || (new_state == ProcessState::Idle && old == ProcessState::Terminated)
        {
            self.state.store(new_state as u8, Ordering::Release);
            true
        } else if new_state >= old {
            self.state
                .compare_exchange(
                    old as u8,
                    new_state as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        } else {
            false
        }
    }

    fn set_state(&self, core: &Core, graph: &Graph, new_state: ProcessState) -> bool {
        let advanced = self.try_advance(new_state);
        if advanced && self.config.comms != CommsType::None && new_state != ProcessState::Idle {
            core.notify_state_change(ProcessStateChange {
                pid: self.pid(),
                state: new_state,
                group_state: graph.requested_state().raw(),
                at: Instant::now(),
            });
        }
        advanced
    }

    // ─── Round construction ───────────────────────────────────

    /// Recompute inclusion and the dependency count for the upcoming
    /// phase. Returns whether this node takes part.
    pub fn construct_round(&self, graph: &Graph, starting: bool) -> bool {
        let included = if starting {
            let mut deps = self.config.dependencies.len() as u32;
            // Predecessors already in the required state satisfy their
            // dependency up front.
            for dep in &self.config.dependencies {
                if let Some(node) = graph.node(dep.process as usize) {
                    let met = match dep.state {
                        RequiredState::Running => node.state() == ProcessState::Running,
                        RequiredState::Terminated => node.state() == ProcessState::Terminated,
                    };
                    if met {
                        deps -= 1;
                    }
                }
            }
            self.dependencies.store(deps, Ordering::Release);
            self.in_requested.load(Ordering::Acquire) && self.state() != ProcessState::Running
        } else {
            let stop_deps = self
                .successors_running
                .iter()
                .filter_map(|&i| graph.node(i as usize))
                .filter(|n| n.state() == ProcessState::Running)
                .count() as u32;
            self.dependencies.store(stop_deps, Ordering::Release);
            let state = self.state();
            !(state == ProcessState::Idle || state == ProcessState::Terminated)
                && !self.in_requested.load(Ordering::Acquire)
        };
        self.included.store(included, Ordering::Release);
        self.head
            .store(included && self.dependencies.load(Ordering::Acquire) == 0, Ordering::Release);
        included
    }

    // ─── Worker entry point ───────────────────────────────────

    pub fn do_work(&self, core: &Core, graph: &Graph) {
        if graph.state() == GraphState::InTransition {
            if graph.is_starting() {
                self.start_process(core, graph);
            } else {
                self.terminate_process(core, graph);
            }
        }
        graph.node_executed(core);
    }

    // ─── Starting ─────────────────────────────────────────────

    fn start_process(&self, core: &Core, graph: &Graph) {
        debug!(
            process = %self.config.short_name,
            executable = %self.config.executable.display(),
            "starting process"
        );
        self.restart_counter
            .store(self.config.restart_attempts, Ordering::Release);
        loop {
            self.status.store(0, Ordering::Release);
            if self.set_state(core, graph, ProcessState::Idle) {
                let error_code = self.config.execution_error_code;
                self.pid.store(0, Ordering::Release);
                self.set_state(core, graph, ProcessState::Starting);

                if self.config.comms == CommsType::SelfManager {
                    // That's us: nothing to fork, report running directly.
                    debug!(
                        process = %self.config.short_name,
                        "found the manager itself in the requested state; reporting running"
                    );
                    self.pid.store(std::process::id() as i32, Ordering::Release);
                    self.set_state(core, graph, ProcessState::Running);
                    self.process_successor_nodes(core, graph);
                    return;
                }

                match core.host.spawn(&self.config) {
                    Ok(child) => {
                        self.pid.store(child.pid, Ordering::Release);
                        *self.comms.lock().unwrap_or_else(|e| e.into_inner()) =
                            child.comms.clone();
                        if self.config.comms == CommsType::StateManager {
                            self.register_control_channel(core, graph, child.comms);
                        }
                        self.handle_process_started(core, graph, error_code);
                    }
                    Err(errno) => {
                        warn!(
                            process = %self.config.short_name,
                            error = %errno,
                            "fork failed"
                        );
                        self.set_state(core, graph, ProcessState::Terminated);
                        graph.abort(core, error_code, ControlCode::SetStateFailed);
                    }
                }
            }
            *self.comms.lock().unwrap_or_else(|e| e.into_inner()) = None;

            if self.status.load(Ordering::Acquire) == 0 {
                break;
            }
            let remaining = self.restart_counter.load(Ordering::Acquire);
            if remaining == 0 {
                break;
            }
            self.restart_counter.store(remaining - 1, Ordering::Release);
        }
        debug!(process = %self.config.short_name, "start attempt finished");
    }

    /// Make the fresh control channel visible to the manager loop before
    /// any wait for the running report.
    fn register_control_channel(&self, core: &Core, graph: &Graph, comms: Option<CommsRegion>) {
        if let Some(comms) = comms {
            *self.control.lock().unwrap_or_else(|e| e.into_inner()) = Some(comms);
            core.register_state_manager(NodeRef {
                group: graph.index() as u16,
                node: self.index,
            });
        }
    }

    fn handle_process_started(&self, core: &Core, graph: &Graph, error_code: u64) {
        let me = NodeRef {
            group: graph.index() as u16,
            node: self.index,
        };
        match core.pid_map.register_if_not_reaped(self.pid(), me) {
            RegisterOutcome::Inserted => {
                self.handle_process_still_starting(core, graph, error_code);
            }
            RegisterOutcome::AlreadyReaped(status) => {
                // The child exited before we could register it; deliver the
                // terminal event ourselves, then classify.
                self.terminated(core, graph, status);
                self.handle_process_already_terminated(core, graph, error_code);
            }
            RegisterOutcome::Full => {
                error!(process = %self.config.short_name, "could not add pid to map");
                self.restart_counter.store(0, Ordering::Release);
                self.terminate_process(core, graph);
                graph.abort(core, error_code, ControlCode::SetStateFailed);
            }
        }
    }

    fn handle_process_still_starting(&self, core: &Core, graph: &Graph, error_code: u64) {
        if graph.state() != GraphState::InTransition {
            return;
        }
        if self.wait_for_running_report() && self.status.load(Ordering::Acquire) == 0 {
            self.handle_process_running(core, graph, error_code);
        } else {
            warn!(
                process = %self.config.short_name,
                "timed out waiting for the running report"
            );
            let reason = if self.status.load(Ordering::Acquire) != 0 {
                ControlCode::FailedUnexpectedTerminationOnEnter
            } else {
                ControlCode::SetStateFailed
            };
            self.terminate_process(core, graph);
            if self.restart_counter.load(Ordering::Acquire) == 0 {
                graph.abort(core, error_code, reason);
            }
        }
    }

    /// For a non-reporting process the fork itself is the report; everyone
    /// else must post on the shared segment within the startup timeout.
    fn wait_for_running_report(&self) -> bool {
        if self.config.comms == CommsType::None {
            return true;
        }
        let comms = self.comms.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match comms {
            Some(region) => {
                let sync = region.sync();
                if sync.send_sync.timed_wait(self.config.startup_timeout) {
                    let _ = sync.reply_sync.post();
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    fn handle_process_already_terminated(&self, core: &Core, graph: &Graph, error_code: u64) {
        let status = self.status.load(Ordering::Acquire);
        if status != 0 || self.config.comms != CommsType::None {
            // Only a self-terminating, non-reporting process may legally
            // exit with zero status before the running report.
            warn!(
                process = %self.config.short_name,
                pid = self.pid(),
                "process terminated before reporting running"
            );
            if self.restart_counter.load(Ordering::Acquire) == 0 {
                graph.abort(core, error_code, ControlCode::FailedUnexpectedTerminationOnEnter);
            }
        } else {
            self.queue_termination_successor_jobs(core, graph);
        }
    }

    fn handle_process_running(&self, core: &Core, graph: &Graph, error_code: u64) {
        debug!(
            process = %self.config.short_name,
            pid = self.pid(),
            "process running"
        );
        // Running has been reported or assumed; a terminated state here is
        // either a fresh failure (not eligible for restart) or a clean
        // self-terminating exit.
        let clean_self_exit =
            self.config.self_terminating && self.status.load(Ordering::Acquire) == 0;
        if self.set_state(core, graph, ProcessState::Running) || clean_self_exit {
            self.process_successor_nodes(core, graph);
        } else if self.restart_counter.load(Ordering::Acquire) == 0 {
            graph.abort(core, error_code, ControlCode::SetStateFailed);
        }
        // Anything dependent on this process terminating is handled when
        // the reaper delivers the exit.
    }

    fn process_successor_nodes(&self, core: &Core, graph: &Graph) {
        for &index in &self.successors_running {
            if let Some(successor) = graph.node(index as usize) {
                if successor.is_included()
                    && successor.dependencies.load(Ordering::Acquire) > 0
                    && successor.dependencies.fetch_sub(1, Ordering::AcqRel) == 1
                {
                    graph.try_queue_node(core, index);
                }
            }
        }
    }

    // ─── Stopping ─────────────────────────────────────────────

    fn terminate_process(&self, core: &Core, graph: &Graph) {
        debug!(process = %self.config.short_name, "terminating process");
        if self.set_state(core, graph, ProcessState::Terminating) {
            if self.config.comms == CommsType::SelfManager {
                debug!(
                    process = %self.config.short_name,
                    "found the manager itself in a stop phase; reporting terminated"
                );
                self.set_state(core, graph, ProcessState::Terminated);
            } else {
                self.request_and_await_termination(core, graph);
            }
        }
        if !graph.is_starting() || self.status.load(Ordering::Acquire) == 0 {
            self.queue_termination_successor_jobs(core, graph);
        }
    }

    fn request_and_await_termination(&self, core: &Core, graph: &Graph) {
        self.terminator.arm();
        self.has_terminator.store(true, Ordering::Release);
        let pid = self.pid();
        debug!(process = %self.config.short_name, pid, "requesting termination");

        let polite_failed = core.host.request_termination(pid).is_err();
        if polite_failed || self.terminator.wait_timeout(self.config.termination_timeout) {
            debug!(process = %self.config.short_name, "termination wait finished");
        } else {
            self.force_termination(core, graph, pid);
        }
        self.has_terminator.store(false, Ordering::Release);
    }

    fn force_termination(&self, core: &Core, graph: &Graph, pid: i32) {
        warn!(
            process = %self.config.short_name,
            pid,
            "no response to polite termination; sending kill"
        );
        while core.host.force_termination(pid).is_ok()
            && graph.state() == GraphState::InTransition
            && !self.terminator.wait_timeout(SIGKILL_GRACE)
        {
            error!(process = %self.config.short_name, pid, "process survived kill");
        }
    }

    /// Fan out to whatever was waiting for this node to terminate: in a
    /// start phase the explicit terminated-dependencies, in a stop phase
    /// the reverse of the start dependencies.
    fn queue_termination_successor_jobs(&self, core: &Core, graph: &Graph) {
        let process_job = |index: u16| {
            if let Some(successor) = graph.node(index as usize) {
                if successor.is_included()
                    && successor.dependencies.load(Ordering::Acquire) > 0
                    && successor.dependencies.fetch_sub(1, Ordering::AcqRel) == 1
                {
                    graph.try_queue_node(core, index);
                }
            }
        };

        if graph.is_starting() {
            for &index in &self.successors_terminated {
                process_job(index);
            }
        } else {
            for dep in &self.config.dependencies {
                if let Some(predecessor) = graph.node(dep.process as usize) {
                    if predecessor.state() != ProcessState::Terminated {
                        process_job(dep.process as u16);
                    }
                }
            }
        }
    }

    // ─── Reaper delivery ──────────────────────────────────────

    /// Classify a crash against the graph's phase.
    fn unexpected_termination(&self, core: &Core, graph: &Graph) {
        warn!(
            process = %self.config.short_name,
            pid = self.pid(),
            "unexpected termination"
        );
        let error_code = self.config.execution_error_code;
        match graph.state() {
            GraphState::Success => {
                // The group was settled: report and head for recovery.
                graph.abort(core, error_code, ControlCode::FailedUnexpectedTermination);
            }
            state => {
                if self.state() == ProcessState::Starting {
                    // A worker is blocked on the running report; wake it
                    // early rather than letting the timeout run out.
                    let comms = self.comms.lock().unwrap_or_else(|e| e.into_inner()).clone();
                    if let Some(region) = comms {
                        let _ = region.sync().send_sync.post();
                    }
                } else if state == GraphState::InTransition {
                    graph.abort(core, error_code, ControlCode::FailedUnexpectedTerminationOnEnter);
                }
            }
        }
    }

    /// Deliver a collected exit status. Called from the reaper thread, or
    /// from the registering worker when the exit arrived first.
    pub fn terminated(&self, core: &Core, graph: &Graph, process_status: i32) {
        debug!(
            process = %self.config.short_name,
            pid = self.pid(),
            status = process_status,
            "child terminated"
        );
        let mut status = process_status;
        if !self.config.self_terminating || process_status != 0 {
            // A clean exit still counts as a failure for a process that is
            // not supposed to terminate on its own.
            if status == 0 {
                status = -1;
            }
            self.status.store(status, Ordering::Release);
            if graph.is_starting() {
                self.unexpected_termination(core, graph);
            }
        } else {
            self.status.store(status, Ordering::Release);
        }
        self.set_state(core, graph, ProcessState::Terminated);

        let had_channel = {
            let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
            control.take().is_some()
        };
        if had_channel {
            core.unregister_state_manager(NodeRef {
                group: graph.index() as u16,
                node: self.index,
            });
        }

        // A graph stalled on a self-terminating process gets unstuck here.
        if self.config.self_terminating && !self.successors_terminated.is_empty() {
            self.queue_termination_successor_jobs(core, graph);
        }
        // A worker blocked in the termination wait gets its gate opened.
        if self.has_terminator.swap(false, Ordering::AcqRel) {
            self.terminator.open();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::chain_config;

    fn nodes() -> Vec<ProcessNode> {
        ProcessNode::build_nodes(&chain_config().groups[0])
    }

    #[test]
    fn successor_lists_follow_dependencies() {
        let nodes = nodes();
        // a <- b <- c on running.
        assert_eq!(nodes[0].successors_running, vec![1]);
        assert_eq!(nodes[1].successors_running, vec![2]);
        assert!(nodes[2].successors_running.is_empty());
    }

    #[test]
    fn state_rule_is_monotone() {
        let nodes = nodes();
        let node = &nodes[0];
        assert!(node.try_advance(ProcessState::Starting));
        assert!(node.try_advance(ProcessState::Running));
        // Backwards (except the terminated/idle pair) is refused.
        assert!(!node.try_advance(ProcessState::Starting));
        assert!(node.try_advance(ProcessState::Terminated));
        // Idle re-enters only from terminated.
        assert!(node.try_advance(ProcessState::Idle));
        assert!(!node.try_advance(ProcessState::Idle) || node.state() == ProcessState::Idle);
    }

    #[test]
    fn terminated_always_wins() {
        let nodes = nodes();
        let node = &nodes[1];
        assert!(node.try_advance(ProcessState::Terminated));
        assert_eq!(node.state(), ProcessState::Terminated);
    }

    #[test]
    fn gate_opens_and_times_out() {
        let gate = Gate::new();
        gate.arm();
        assert!(!gate.wait_timeout(Duration::from_millis(10)));
        gate.open();
        assert!(gate.wait_timeout(Duration::from_millis(10)));
    }
}
