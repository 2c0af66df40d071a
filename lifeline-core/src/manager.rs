//! The top-level manager: shared core state and the single-threaded
//! request-routing loop.
//!
//! The loop wakes on the shared wake semaphore (or a 100 ms fallback),
//! drains control-channel requests, emits pending events, injects recovery
//! transitions for groups stuck in an undefined state, and consumes the
//! health supervisor's recovery queue. Shutdown drives every group to its
//! off state under two hard budgets, then force-kills whatever is left.

use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::channel::{ClientId, ControlMessage};
use crate::config::{CommsType, Config, NUM_WORKER_THREADS};
use crate::error::{ControlCode, CoreError};
use crate::graph::{Graph, GraphState};
use crate::ident::Identifier;
use crate::jobs::{JobQueue, WorkerPool};
use crate::launcher::ProcessHost;
use crate::node::{ProcessNode, ProcessStateChange};
use crate::osal::{RawSemaphore, SharedRegion};
use crate::pidmap::{NodeRef, ProcessMap};
use crate::reaper::Reaper;
use crate::recovery::{RecoveryQueue, RecoveryRequest};

/// Fallback wake period of the manager loop.
const MANAGER_WAKE_TIMEOUT: Duration = Duration::from_millis(100);
/// Budget for draining cancellations at shutdown.
const SHUTDOWN_CANCEL_BUDGET: Duration = Duration::from_secs(2);
/// Budget for the final transition to off at shutdown.
const SHUTDOWN_OFF_BUDGET: Duration = Duration::from_secs(1);
/// Poll interval while waiting out the shutdown budgets.
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// State shared by the manager loop, the worker pool, and the reaper.
///
/// The manager owns the groups; each group owns its nodes. Jobs carry
/// arena indices, and upward calls from node work go through this context,
/// which keeps the node/graph/manager references acyclic.
pub struct Core {
    pub config: Config,
    pub groups: Vec<Graph>,
    pub pid_map: ProcessMap,
    pub jobs: Arc<JobQueue>,
    pub host: Arc<dyn ProcessHost>,

    /// Region holding the wake semaphore; its descriptor is inherited by
    /// state-manager children.
    wake: SharedRegion,
    running: AtomicBool,
    shutdown: Arc<AtomicBool>,
    initial_state_result: AtomicU32,
    /// Live state-manager nodes, newest first.
    state_managers: Mutex<Vec<NodeRef>>,
    state_changes: (Sender<ProcessStateChange>, Receiver<ProcessStateChange>),
    recovery: RecoveryQueue,
}

impl Core {
    pub fn new(
        config: Config,
        host: Arc<dyn ProcessHost>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Arc<Core>, CoreError> {
        let total = config.total_processes().max(1);
        debug!(total, "creating process map and job queue");

        let wake = SharedRegion::create(size_of::<RawSemaphore>())?;
        // Safety: freshly mapped, correctly sized and aligned for the
        // semaphore initialized right below.
        unsafe { wake.at::<RawSemaphore>(0) }
            .init(0, true)
            .map_err(CoreError::Os)?;

        let groups = config
            .groups
            .iter()
            .enumerate()
            .map(|(index, group)| Graph::new(index as u32, group))
            .collect();

        Ok(Arc::new(Core {
            pid_map: ProcessMap::new(total),
            jobs: Arc::new(JobQueue::new(total)),
            groups,
            config,
            host,
            wake,
            running: AtomicBool::new(true),
            shutdown,
            initial_state_result: AtomicU32::new(ControlCode::InitialMachineStateNotSet as u32),
            state_managers: Mutex::new(Vec::new()),
            state_changes: unbounded(),
            recovery: RecoveryQueue::new(),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn wake_sem(&self) -> &RawSemaphore {
        // Safety: initialized in `new`.
        unsafe { self.wake.at::<RawSemaphore>(0) }
    }

    /// Wake the manager loop.
    pub fn nudge(&self) {
        let _ = self.wake_sem().post();
    }

    /// Descriptor of the wake region, duplicated into state-manager
    /// children so their clients can nudge the loop.
    pub fn wake_fd(&self) -> Option<i32> {
        self.wake.fd().map(|fd| fd.as_raw_fd())
    }

    pub fn graph(&self, index: usize) -> Option<&Graph> {
        self.groups.get(index)
    }

    pub fn graph_by_name(&self, name: Identifier) -> Option<&Graph> {
        self.groups.iter().find(|g| g.name() == name)
    }

    pub fn node(&self, node_ref: NodeRef) -> Option<(&Graph, &ProcessNode)> {
        let graph = self.groups.get(node_ref.group as usize)?;
        let node = graph.node(node_ref.node as usize)?;
        Some((graph, node))
    }

    pub fn set_initial_state_result(&self, result: ControlCode) {
        self.initial_state_result
            .store(result as u32, Ordering::Release);
        self.nudge();
    }

    pub fn initial_state_result(&self) -> ControlCode {
        ControlCode::from_raw(self.initial_state_result.load(Ordering::Acquire))
    }

    pub fn register_state_manager(&self, node_ref: NodeRef) {
        let mut managers = self
            .state_managers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !managers.contains(&node_ref) {
            managers.insert(0, node_ref);
        }
    }

    pub fn unregister_state_manager(&self, node_ref: NodeRef) {
        self.state_managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|r| *r != node_ref);
    }

    fn state_managers_of(&self, group: u16) -> Vec<NodeRef> {
        self.state_managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .filter(|r| r.group == group)
            .collect()
    }

    pub fn notify_state_change(&self, change: ProcessStateChange) {
        let _ = self.state_changes.0.send(change);
    }

    /// Drain queued process state changes; consumed by the health bridge.
    pub fn drain_state_changes(&self) -> Vec<ProcessStateChange> {
        self.state_changes.1.try_iter().collect()
    }

    pub fn recovery(&self) -> &RecoveryQueue {
        &self.recovery
    }
}

pub struct ProcessGroupManager {
    core: Arc<Core>,
    pool: Option<WorkerPool>,
}

impl ProcessGroupManager {
    /// Build the shared core and start the worker pool. The manager's own
    /// scheduling and security settings are applied when the topology
    /// contains an entry representing the manager.
    pub fn new(
        config: Config,
        host: Arc<dyn ProcessHost>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<ProcessGroupManager, CoreError> {
        let core = Core::new(config, host, shutdown)?;

        if let Some(own) = core
            .config
            .groups
            .iter()
            .flat_map(|g| g.processes.iter())
            .find(|p| p.comms == CommsType::SelfManager)
        {
            crate::launcher::apply_own_scheduling(own)?;
        }

        let pool = {
            let core = Arc::clone(&core);
            WorkerPool::spawn(
                Arc::clone(&core.jobs),
                NUM_WORKER_THREADS,
                Arc::new(move |node_ref: NodeRef| {
                    if let Some((graph, node)) = core.node(node_ref) {
                        node.do_work(&core, graph);
                    }
                }),
            )
        };

        Ok(ProcessGroupManager {
            core,
            pool: Some(pool),
        })
    }

    pub fn core(&self) -> Arc<Core> {
        Arc::clone(&self.core)
    }

    /// The top-level loop. Returns once a termination signal has been
    /// observed and every group has been driven off.
    pub fn run(&mut self) -> Result<(), CoreError> {
        let reaper = Reaper::spawn(Arc::clone(&self.core));

        let started = self.start_initial_transition();
        if started {
            while !self.core.shutdown_requested() {
                self.core.wake_sem().timed_wait(MANAGER_WAKE_TIMEOUT);
                for graph in &self.core.groups {
                    self.control_client_requests(graph);
                    self.control_client_responses(graph);
                    self.process_group_handler(graph);
                }
                self.recovery_action_handler();
            }
        }

        self.all_process_groups_off();

        self.core.stop();
        self.core.jobs.stop(NUM_WORKER_THREADS);
        if let Some(pool) = self.pool.take() {
            pool.join();
        }
        reaper.join();

        if started {
            Ok(())
        } else {
            Err(CoreError::NoStartupState)
        }
    }

    fn start_initial_transition(&self) -> bool {
        info!(
            group = %self.core.config.machine_group,
            state = %self.core.config.startup_state,
            "starting machine process group"
        );
        match self.core.graph_by_name(self.core.config.machine_group) {
            Some(graph) => {
                graph.start_initial_transition(&self.core, self.core.config.startup_state)
            }
            None => {
                error!("no startup state; manager will not run");
                false
            }
        }
    }

    // ─── Request handling ─────────────────────────────────────

    fn control_client_requests(&self, graph: &Graph) {
        for node_ref in self.core.state_managers_of(graph.index() as u16) {
            let Some((_, node)) = self.core.node(node_ref) else {
                continue;
            };
            let Some(comms) = node.control_channel() else {
                continue;
            };
            let Some(channel) = comms.control_channel() else {
                continue;
            };

            if let Some(mut request) = channel.pending_request() {
                request.client = ClientId {
                    group: node_ref.group,
                    node: node_ref.node,
                };
                debug!(
                    code = ?request.code(),
                    group = %Identifier::from_raw(request.pg_name),
                    state = %Identifier::from_raw(request.pg_state),
                    "control request"
                );
                let reply = match request.code() {
                    ControlCode::SetStateRequest => self.process_state_transition(&mut request),
                    ControlCode::GetExecutionErrorRequest => {
                        self.process_get_execution_error(&mut request)
                    }
                    ControlCode::GetInitialMachineStateRequest => {
                        self.process_get_initial_state(channel)
                    }
                    ControlCode::ValidateProcessGroupStateRequest => {
                        self.process_validate_state(&request)
                    }
                    _ => ControlCode::InvalidRequest,
                };
                request.set_code(reply);
                channel.acknowledge_request(request);
            }

            // Deferred initial-machine-state results.
            let result = self.core.initial_state_result();
            if result != ControlCode::InitialMachineStateNotSet && channel.deferred_initial() > 0 {
                let mut msg = ControlMessage::new(result);
                msg.client = ClientId {
                    group: node_ref.group,
                    node: node_ref.node,
                };
                if channel.send_response(msg) {
                    channel.settle_deferred_initial();
                } else {
                    self.core.nudge();
                }
            }
        }
    }

    fn process_state_transition(&self, request: &mut ControlMessage) -> ControlCode {
        let Some(graph) = self
            .core
            .graph_by_name(Identifier::from_raw(request.pg_name))
        else {
            return ControlCode::SetStateInvalidArguments;
        };
        let target = Identifier::from_raw(request.pg_state);
        let old_state = graph.requested_state();
        let graph_state = graph.state();
        let mut reply = ControlCode::SetStateSuccess;

        if graph_state == GraphState::InTransition {
            if old_state != target {
                graph.set_pending_state(target);
                graph.mark_request_start();
                graph.cancel(&self.core);
            } else {
                reply = ControlCode::SetStateTransitionToSameState;
            }
        } else if graph_state == GraphState::Success && old_state == target {
            reply = ControlCode::SetStateAlreadyInState;
        } else {
            graph.set_pending_state(target);
            graph.mark_request_start();
        }
        graph.set_state_manager(request.client);
        reply
    }

    fn process_get_execution_error(&self, request: &mut ControlMessage) -> ControlCode {
        let Some(graph) = self
            .core
            .graph_by_name(Identifier::from_raw(request.pg_name))
        else {
            return ControlCode::ExecutionErrorInvalidArguments;
        };
        if graph.state() != GraphState::Undefined {
            return ControlCode::ExecutionErrorFailed;
        }
        request.execution_error = graph.last_execution_error();
        ControlCode::ExecutionErrorSuccess
    }

    fn process_get_initial_state(&self, channel: &crate::channel::ControlChannel) -> ControlCode {
        if self
            .core
            .graph_by_name(self.core.config.machine_group)
            .is_none()
            || channel.deferred_initial() == u32::MAX
        {
            return ControlCode::InitialMachineStateNotSet;
        }
        // The answer arrives later as a response message.
        channel.add_deferred_initial();
        ControlCode::GetInitialMachineStateRequest
    }

    fn process_validate_state(&self, request: &ControlMessage) -> ControlCode {
        let known = self
            .core
            .config
            .process_indexes(
                Identifier::from_raw(request.pg_name),
                Identifier::from_raw(request.pg_state),
            )
            .is_some();
        if known {
            ControlCode::ValidateProcessGroupStateSuccess
        } else {
            ControlCode::ValidateProcessGroupStateFailed
        }
    }

    // ─── Response handling ────────────────────────────────────

    fn control_client_responses(&self, graph: &Graph) {
        let event = graph.pending_event();
        if event != ControlCode::NotSet {
            let mut msg = ControlMessage::new(event);
            msg.pg_name = graph.name().raw();
            msg.pg_state = graph.requested_state().raw();
            msg.client = graph.state_manager();
            msg.execution_error = graph.last_execution_error();
            if self.send_response(msg) {
                graph.clear_pending_event(event);
            }
        }

        if let Some(cancel) = graph.take_cancel_message() {
            if !self.send_response(cancel) {
                graph.rearm_cancel_message(cancel);
            }
        }
    }

    /// Route an outcome to its owning client. Delivery to a dead client
    /// counts as done.
    fn send_response(&self, msg: ControlMessage) -> bool {
        if !msg.client.is_valid() {
            return true;
        }
        let Some((_, node)) = self.core.node(NodeRef {
            group: msg.client.group,
            node: msg.client.node,
        }) else {
            return true;
        };
        let Some(comms) = node.control_channel() else {
            return true;
        };
        let Some(channel) = comms.control_channel() else {
            return true;
        };
        debug!(code = ?msg.code(), group = %Identifier::from_raw(msg.pg_name), "sending response");
        if channel.send_response(msg) {
            true
        } else {
            self.core.nudge();
            false
        }
    }

    // ─── Group stepping ───────────────────────────────────────

    fn process_group_handler(&self, graph: &Graph) {
        let graph_state = graph.state();
        if graph_state != GraphState::Success && graph_state != GraphState::Undefined {
            return;
        }

        let pending = graph.set_pending_state(Identifier::empty());
        if pending != Identifier::empty()
            && (pending != graph.requested_state() || graph_state == GraphState::Undefined)
        {
            debug!(group = %graph.name(), state = %pending, "starting pending transition");
            if !graph.start_transition(&self.core, pending) {
                graph.set_pending_event(&self.core, ControlCode::SetStateInvalidArguments);
            }
        }

        // A group stuck in an undefined state with nothing pending gets
        // pushed into its recovery state. Nobody requested it, so there is
        // nowhere to report an error; a failure is retried next pass.
        if graph.state() == GraphState::Undefined {
            let recovery = graph.recovery_state();
            warn!(group = %graph.name(), state = %recovery, "problem discovered; activating recovery state");
            graph.mark_request_start();
            graph.start_transition(&self.core, recovery);
        }
    }

    fn recovery_action_handler(&self) {
        while let Some(RecoveryRequest { group, state }) = self.core.recovery().pop() {
            let Some(graph) = self.core.graph_by_name(group) else {
                error!(group = %group, "recovery request for unknown process group");
                continue;
            };
            let target = state.unwrap_or_else(|| graph.recovery_state());
            debug!(group = %group, state = %target, "processing recovery request");

            match graph.state() {
                GraphState::InTransition => {
                    if graph.requested_state() != target {
                        graph.set_pending_state(target);
                        graph.mark_request_start();
                        graph.cancel(&self.core);
                        self.control_client_responses(graph);
                    } else {
                        debug!(group = %group, "already transitioning to the recovery target");
                    }
                }
                GraphState::Success if graph.requested_state() == target => {
                    debug!(group = %group, "already in the recovery target state");
                }
                _ => {
                    graph.set_pending_state(target);
                    graph.mark_request_start();
                }
            }
        }
    }

    // ─── Shutdown ─────────────────────────────────────────────

    fn wait_for_groups_leaving(&self, state: GraphState, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        for graph in &self.core.groups {
            while graph.state() == state {
                if Instant::now() >= deadline {
                    return false;
                }
                thread::sleep(SHUTDOWN_POLL);
            }
        }
        true
    }

    fn all_process_groups_off(&self) {
        debug!("cancelling all process group transitions");
        for graph in &self.core.groups {
            graph.cancel(&self.core);
        }
        if !self.wait_for_groups_leaving(GraphState::Cancelled, SHUTDOWN_CANCEL_BUDGET) {
            error!("cancellation drain timed out");
        }

        debug!("transitioning all process groups off");
        for graph in &self.core.groups {
            let _ = graph.start_transition_to_off(&self.core);
        }
        if !self.wait_for_groups_leaving(GraphState::InTransition, SHUTDOWN_OFF_BUDGET) {
            error!("transition to off timed out; force-killing remaining children");
            self.core.jobs.stop(NUM_WORKER_THREADS);
            for graph in &self.core.groups {
                for node in graph.nodes() {
                    let pid = node.pid();
                    if pid > 0 && node.state() != crate::node::ProcessState::Terminated {
                        let _ = self.core.host.force_termination(pid);
                    }
                }
            }
            self.drain_remaining_children();
        }
    }

    /// Collect every remaining child so the pid map ends empty.
    fn drain_remaining_children(&self) {
        loop {
            match self.core.host.wait_any_child() {
                crate::launcher::WaitOutcome::Reaped { pid, status } => {
                    match self.core.pid_map.report_reaped(pid, status) {
                        crate::pidmap::ReapOutcome::Consumed(node_ref, status) => {
                            if let Some((graph, node)) = self.core.node(node_ref) {
                                node.terminated(&self.core, graph, status);
                            }
                        }
                        crate::pidmap::ReapOutcome::Inserted => {
                            // Nothing will come back for this pid; the map
                            // must still end empty.
                            let _ = self.core.pid_map.discard_status(pid);
                        }
                        crate::pidmap::ReapOutcome::Full => {}
                    }
                }
                crate::launcher::WaitOutcome::Interrupted => continue,
                crate::launcher::WaitOutcome::NoChildren => break,
            }
        }
    }
}
