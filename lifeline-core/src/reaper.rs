//! The reaper thread: waits for any child exit and feeds the pid map.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::error;

use crate::launcher::WaitOutcome;
use crate::manager::Core;
use crate::pidmap::ReapOutcome;

/// Pause between wait attempts when there is nothing to reap.
const REAPER_IDLE_DELAY: Duration = Duration::from_millis(10);

pub struct Reaper {
    handle: JoinHandle<()>,
}

impl Reaper {
    /// Start the reaper. It runs until [`Core::is_running`] turns false.
    pub fn spawn(core: Arc<Core>) -> Reaper {
        let handle = thread::Builder::new()
            .name("lifeline-reaper".into())
            .spawn(move || run(&core))
            .expect("spawning reaper thread");
        Reaper { handle }
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

fn run(core: &Core) {
    while core.is_running() {
        match core.host.wait_any_child() {
            WaitOutcome::Reaped { pid, status } => {
                match core.pid_map.report_reaped(pid, status) {
                    ReapOutcome::Consumed(node_ref, status) => {
                        if let Some((graph, node)) = core.node(node_ref) {
                            node.terminated(core, graph, status);
                        }
                    }
                    ReapOutcome::Inserted => {}
                    ReapOutcome::Full => {
                        error!("reaper out of pid map resources");
                    }
                }
            }
            WaitOutcome::NoChildren | WaitOutcome::Interrupted => {
                // No children right now, or interrupted by a signal. Back
                // off briefly instead of hogging a core.
                thread::sleep(REAPER_IDLE_DELAY);
            }
        }
    }
}
