//! Recovery requests from the health supervisor toward the manager loop.
//!
//! Single writer (the health thread), single reader (the manager loop).
//! A request names a group and optionally a target state; with no state
//! given the group's configured recovery state is used.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::ident::Identifier;

#[derive(Debug, Clone, Copy)]
pub struct RecoveryRequest {
    pub group: Identifier,
    pub state: Option<Identifier>,
}

pub struct RecoveryQueue {
    tx: Sender<RecoveryRequest>,
    rx: Receiver<RecoveryRequest>,
}

impl Default for RecoveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryQueue {
    pub fn new() -> RecoveryQueue {
        let (tx, rx) = unbounded();
        RecoveryQueue { tx, rx }
    }

    pub fn push(&self, request: RecoveryRequest) {
        let _ = self.tx.send(request);
    }

    /// A cloneable handle for the producing side.
    pub fn producer(&self) -> Sender<RecoveryRequest> {
        self.tx.clone()
    }

    pub fn pop(&self) -> Option<RecoveryRequest> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trip() {
        let queue = RecoveryQueue::new();
        assert!(queue.pop().is_none());
        queue.push(RecoveryRequest {
            group: Identifier::new("RecPG"),
            state: None,
        });
        let got = queue.pop().unwrap();
        assert_eq!(got.group, Identifier::new("RecPG"));
        assert!(got.state.is_none());
        assert!(queue.pop().is_none());
    }
}
