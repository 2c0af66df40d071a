//! Per-group runtime: the dependency executor and its state machine.
//!
//! A graph owns the process nodes of one group. A transition round starts
//! with a stop phase (everything that must leave), drains into a start
//! phase (everything that must arrive), and commits when the last in-flight
//! node completes. Graph state moves only along a monotone override
//! lattice; a single compare-and-swap loop applies it, so cancel and abort
//! can race with workers without locks.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::channel::{ClientId, ControlMessage};
use crate::config::GroupConfig;
use crate::error::ControlCode;
use crate::ident::Identifier;
use crate::manager::Core;
use crate::node::ProcessNode;
use crate::pidmap::NodeRef;

/// Graph execution state, ordered by override strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
pub enum GraphState {
    Success = 0,
    InTransition = 1,
    Cancelled = 2,
    Aborting = 3,
    Undefined = 4,
}

impl GraphState {
    fn from_raw(raw: u8) -> GraphState {
        match raw {
            0 => GraphState::Success,
            1 => GraphState::InTransition,
            2 => GraphState::Cancelled,
            3 => GraphState::Aborting,
            _ => GraphState::Undefined,
        }
    }
}

use GraphState::{Aborting, Cancelled, InTransition, Success, Undefined};

/// `LATTICE[attempted][current]` is the state actually reached by an
/// attempted move from the current state. Weaker states never override
/// stronger ones within a round; `Undefined` wraps back to the start of
/// the lattice when the next round begins. Every cell is a fixed point of
/// its row, so one successful compare-and-swap settles the move.
const LATTICE: [[GraphState; 5]; 5] = [
    // attempted Success
    [Success, Success, Cancelled, Aborting, Success],
    // attempted InTransition
    [InTransition, InTransition, Cancelled, Aborting, InTransition],
    // attempted Cancelled
    [Success, Cancelled, Cancelled, Aborting, Undefined],
    // attempted Aborting
    [Aborting, Aborting, Aborting, Aborting, Undefined],
    // attempted Undefined
    [Success, InTransition, Undefined, Undefined, Undefined],
];

pub struct Graph {
    index: u32,
    name: Identifier,
    off_state: Identifier,
    recovery_state: Identifier,
    nodes: Vec<ProcessNode>,

    state: AtomicU8,
    /// True while the current phase starts processes, false while it stops
    /// them.
    starting: AtomicBool,
    nodes_to_execute: AtomicU32,
    nodes_in_flight: AtomicI32,

    requested_state: Mutex<Identifier>,
    pending_state: Mutex<Identifier>,
    last_state_manager: Mutex<ClientId>,
    last_execution_error: AtomicU64,
    abort_code: AtomicU32,
    pending_event: AtomicU32,
    cancel_message: Mutex<Option<ControlMessage>>,
    initial_transition: AtomicBool,
    request_started: Mutex<Option<Instant>>,
}

impl Graph {
    pub fn new(index: u32, cfg: &GroupConfig) -> Graph {
        debug!(group = %cfg.name, nodes = cfg.processes.len(), "creating graph");
        let nodes = ProcessNode::build_nodes(cfg);
        Graph {
            index,
            name: cfg.name,
            off_state: cfg.off_state,
            recovery_state: cfg.recovery_state,
            nodes,
            state: AtomicU8::new(Success as u8),
            starting: AtomicBool::new(false),
            nodes_to_execute: AtomicU32::new(0),
            nodes_in_flight: AtomicI32::new(0),
            requested_state: Mutex::new(cfg.off_state),
            pending_state: Mutex::new(Identifier::empty()),
            last_state_manager: Mutex::new(ClientId::INVALID),
            last_execution_error: AtomicU64::new(0),
            abort_code: AtomicU32::new(ControlCode::NotSet as u32),
            pending_event: AtomicU32::new(ControlCode::NotSet as u32),
            cancel_message: Mutex::new(None),
            initial_transition: AtomicBool::new(false),
            request_started: Mutex::new(None),
        }
    }

    // ─── State accessors ──────────────────────────────────────

    pub fn state(&self) -> GraphState {
        GraphState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn name(&self) -> Identifier {
        self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn recovery_state(&self) -> Identifier {
        self.recovery_state
    }

    pub fn nodes(&self) -> &[ProcessNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&ProcessNode> {
        self.nodes.get(index)
    }

    pub fn is_starting(&self) -> bool {
        self.starting.load(Ordering::Acquire)
    }

    pub fn requested_state(&self) -> Identifier {
        *self.requested_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state_manager(&self) -> ClientId {
        *self
            .last_state_manager
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_execution_error(&self) -> u64 {
        self.last_execution_error.load(Ordering::Acquire)
    }

    pub fn set_last_execution_error(&self, code: u64) {
        self.last_execution_error.store(code, Ordering::Release);
    }

    /// Swap the pending target state, returning the previous one.
    pub fn set_pending_state(&self, new_state: Identifier) -> Identifier {
        let mut pending = self.pending_state.lock().unwrap_or_else(|e| e.into_inner());
        let old = *pending;
        *pending = new_state;
        if new_state != old {
            debug!(group = %self.name, from = %old, to = %new_state, "pending state changed");
        }
        old
    }

    pub fn mark_request_start(&self) {
        *self
            .request_started
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    // ─── Lattice ──────────────────────────────────────────────

    /// Apply one attempted move through the lattice until it settles.
    fn set_state(&self, attempted: GraphState) {
        let mut current = self.state();
        let row = &LATTICE[attempted as usize];
        let mut target = attempted;
        while current != target {
            target = row[current as usize];
            match self.state.compare_exchange(
                current as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(group = %self.name, from = ?current, to = ?target, "graph state");
                    current = target;
                    if attempted == Success && target == Success {
                        let elapsed = self
                            .request_started
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .map(|t| t.elapsed());
                        if let Some(elapsed) = elapsed {
                            info!(
                                group = %self.name,
                                state = %self.requested_state(),
                                elapsed_ms = elapsed.as_millis() as u64,
                                "transition completed"
                            );
                        }
                    }
                }
                Err(actual) => current = GraphState::from_raw(actual),
            }
        }
    }

    // ─── Transition rounds ────────────────────────────────────

    /// Begin a transition toward `target`. False when the state is unknown
    /// for this group or the graph refused to enter transition.
    pub fn start_transition(&self, core: &Core, target: Identifier) -> bool {
        let old_state = {
            let mut requested = self
                .requested_state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let old = *requested;
            *requested = target;
            old
        };

        if let Some(list) = core.config.process_indexes(self.name, target) {
            self.set_state(InTransition);
            if self.state() == InTransition {
                let list = list.to_vec();
                self.queue_stop_jobs(core, &list);
                return true;
            }
        }
        *self
            .requested_state
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = old_state;
        false
    }

    /// The very first transition after start; its outcome feeds the
    /// deferred initial-machine-state protocol.
    pub fn start_initial_transition(&self, core: &Core, target: Identifier) -> bool {
        self.initial_transition.store(true, Ordering::Release);
        self.mark_request_start();
        let ok = self.start_transition(core, target);
        if !ok {
            self.initial_transition.store(false, Ordering::Release);
            core.set_initial_state_result(ControlCode::InitialMachineStateFailed);
        }
        ok
    }

    /// Drive every process out, even when no `Off` state is configured for
    /// the group.
    pub fn start_transition_to_off(&self, core: &Core) -> bool {
        self.mark_request_start();
        *self
            .requested_state
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = self.off_state;
        self.set_state(InTransition);
        if self.state() == InTransition {
            self.queue_stop_jobs(core, &[]);
            true
        } else {
            false
        }
    }

    fn queue_stop_jobs(&self, core: &Core, requested: &[u32]) {
        for node in &self.nodes {
            node.mark_requested(false);
        }
        for &index in requested {
            if let Some(node) = self.nodes.get(index as usize) {
                node.mark_requested(true);
            }
        }
        if !self.queue_head_nodes(core, false) {
            self.queue_start_jobs(core);
        }
    }

    pub(crate) fn queue_start_jobs(&self, core: &Core) {
        if !self.queue_head_nodes(core, true) {
            // Nothing to do: done nothing, success.
            self.set_state(Success);
            self.set_pending_event(core, ControlCode::SetStateSuccess);
        }
    }

    /// Construct the phase and enqueue its head nodes. True when at least
    /// one node went in flight.
    fn queue_head_nodes(&self, core: &Core, starting: bool) -> bool {
        self.starting.store(starting, Ordering::Release);

        let mut executable = 0u32;
        for node in &self.nodes {
            if node.construct_round(self, starting) {
                executable += 1;
            }
        }
        self.nodes_to_execute.store(executable, Ordering::Release);
        self.nodes_in_flight.store(0, Ordering::Release);

        if executable > 0 {
            for (index, node) in self.nodes.iter().enumerate() {
                if node.is_head_node() {
                    self.try_queue_node(core, index as u16);
                }
            }
        }
        self.nodes_in_flight.load(Ordering::Acquire) > 0
    }

    /// Enqueue with retry: a full queue is retried for as long as the
    /// round is still in transition.
    pub(crate) fn try_queue_node(&self, core: &Core, node: u16) {
        while self.state() == InTransition {
            if core.jobs.enqueue(NodeRef {
                group: self.index as u16,
                node,
            }) {
                self.mark_node_in_flight();
                break;
            }
            warn!(group = %self.name, node, "job queue full; retrying enqueue");
        }
    }

    pub(crate) fn mark_node_in_flight(&self) {
        self.nodes_in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Called by a worker when a node's work item completes. Commits the
    /// phase or the round when the last in-flight node lands.
    pub fn node_executed(&self, core: &Core) {
        let current = self.state();
        if current == InTransition {
            if self.nodes_to_execute.load(Ordering::Acquire) > 0 {
                self.nodes_in_flight.fetch_sub(1, Ordering::AcqRel);
                if self.nodes_to_execute.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if self.is_starting() {
                        if self.initial_transition.swap(false, Ordering::AcqRel) {
                            core.set_initial_state_result(ControlCode::InitialMachineStateSuccess);
                        }
                        self.set_state(Success);
                        self.set_pending_event(core, ControlCode::SetStateSuccess);
                    } else {
                        self.queue_start_jobs(core);
                    }
                }
            }
        } else if self.nodes_in_flight.fetch_sub(1, Ordering::AcqRel) <= 1 {
            // Cancelled or aborting and the last node just drained.
            if self.initial_transition.swap(false, Ordering::AcqRel) {
                core.set_initial_state_result(ControlCode::InitialMachineStateFailed);
            }
            self.set_state(Undefined);
            if current == Aborting {
                let reason = ControlCode::from_raw(self.abort_code.load(Ordering::Acquire));
                self.set_pending_event(core, reason);
            } else {
                core.nudge();
            }
        }
    }

    /// Abandon the round for a newer request. In-flight work drains; the
    /// displaced owner is told through the pending event.
    pub fn cancel(&self, core: &Core) {
        self.set_state(Cancelled);
        if self.state() == Cancelled {
            self.set_pending_event(core, ControlCode::SetStateCancelled);
        }
        if self.nodes_in_flight.load(Ordering::Acquire) == 0 {
            if self.initial_transition.swap(false, Ordering::AcqRel) {
                core.set_initial_state_result(ControlCode::InitialMachineStateFailed);
            }
            self.set_state(Undefined);
        }
    }

    /// Record a fatal per-process failure. The first code and reason win.
    /// With nothing in flight (a crash after the round settled) the graph
    /// sinks to undefined immediately; otherwise the drain in
    /// [`Graph::node_executed`] finishes the job.
    pub fn abort(&self, core: &Core, code: u64, reason: ControlCode) {
        if self.state() < Aborting {
            self.set_state(Aborting);
            self.last_execution_error.store(code, Ordering::Release);
            self.abort_code.store(reason as u32, Ordering::Release);
            if self.nodes_in_flight.load(Ordering::Acquire) == 0 {
                if self.initial_transition.swap(false, Ordering::AcqRel) {
                    core.set_initial_state_result(ControlCode::InitialMachineStateFailed);
                }
                self.set_state(Undefined);
                self.set_pending_event(core, reason);
            }
        }
    }

    // ─── Events toward the manager loop ───────────────────────

    pub fn pending_event(&self) -> ControlCode {
        ControlCode::from_raw(self.pending_event.load(Ordering::Acquire))
    }

    pub fn set_pending_event(&self, core: &Core, event: ControlCode) {
        self.pending_event.store(event as u32, Ordering::Release);
        core.nudge();
    }

    pub fn clear_pending_event(&self, expected: ControlCode) {
        let _ = self.pending_event.compare_exchange(
            expected as u32,
            ControlCode::NotSet as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Ownership of outcome events passes to the newest requester. Any
    /// undelivered event is re-addressed to the displaced owner as its
    /// cancellation notice.
    pub fn set_state_manager(&self, client: ClientId) {
        let code = self.pending_event();
        if code != ControlCode::NotSet {
            let mut msg = ControlMessage::new(code);
            msg.pg_name = self.name.raw();
            msg.pg_state = self.requested_state().raw();
            msg.client = self.state_manager();
            *self
                .cancel_message
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(msg);
            self.clear_pending_event(code);
        }
        *self
            .last_state_manager
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = client;
    }

    pub fn take_cancel_message(&self) -> Option<ControlMessage> {
        self.cancel_message
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Put an undeliverable cancel message back for the next pass.
    pub fn rearm_cancel_message(&self, msg: ControlMessage) {
        *self
            .cancel_message
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_cell_is_a_fixed_point_of_its_row() {
        // The CAS loop takes one effective step, so each cell must map to
        // itself under its own row or the move would stall midway.
        for attempted in 0..5usize {
            for current in 0..5usize {
                let step = LATTICE[attempted][current];
                assert_eq!(
                    LATTICE[attempted][step as usize], step,
                    "row {attempted} stalls from {current}"
                );
            }
        }
    }

    #[test]
    fn weaker_states_never_override() {
        // Success must not displace cancelled, aborting, or in-flight
        // drain states.
        assert_eq!(LATTICE[Success as usize][Cancelled as usize], Cancelled);
        assert_eq!(LATTICE[Success as usize][Aborting as usize], Aborting);
        // Cancel does not displace abort.
        assert_eq!(LATTICE[Cancelled as usize][Aborting as usize], Aborting);
        // Abort overrides cancel.
        assert_eq!(LATTICE[Aborting as usize][Cancelled as usize], Aborting);
    }

    #[test]
    fn undefined_wraps_into_the_next_round() {
        // A new request pulls an undefined graph straight into transition,
        // and a settling round can close out of undefined.
        assert_eq!(
            LATTICE[InTransition as usize][Undefined as usize],
            InTransition
        );
        assert_eq!(LATTICE[Success as usize][Undefined as usize], Success);
    }
}
