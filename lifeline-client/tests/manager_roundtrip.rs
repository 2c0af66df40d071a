//! Full protocol round trips: a control client driving the manager loop
//! over the real shared-memory mailboxes, against the fake process host.

use std::mem::size_of;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lifeline_client::{ClientError, ControlClient};
use lifeline_core::config::{Config, Document};
use lifeline_core::error::{ControlCode, ExecError};
use lifeline_core::graph::GraphState;
use lifeline_core::launcher::FakeProcessHost;
use lifeline_core::manager::{Core, ProcessGroupManager};
use lifeline_core::osal::{RawSemaphore, SharedRegion};

/// One group: a state manager plus a three-process dependency chain.
const TOPOLOGY: &str = r#"{
    "machine": { "main_group": "MainPG", "startup_state": "Boot" },
    "process_groups": [{
        "name": "MainPG",
        "off_state": "Off",
        "recovery_state": "Boot",
        "states": [
            { "name": "Boot", "processes": ["sm"] },
            { "name": "On", "processes": ["sm", "a", "b", "c"] },
            { "name": "Off", "processes": ["sm"] }
        ],
        "processes": [
            { "short_name": "sm", "executable": "/bin/sm",
              "comms": "state_manager", "startup_timeout_ms": 2000 },
            { "short_name": "a", "executable": "/bin/a" },
            { "short_name": "b", "executable": "/bin/b",
              "dependencies": [ { "process": "a", "state": "running" } ] },
            { "short_name": "c", "executable": "/bin/c",
              "comms": "reporting", "startup_timeout_ms": 1500,
              "dependencies": [ { "process": "b", "state": "running" } ] }
        ]
    }]
}"#;

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

struct Harness {
    host: Arc<FakeProcessHost>,
    core: Arc<Core>,
    shutdown: Arc<AtomicBool>,
    handle: thread::JoinHandle<Result<(), lifeline_core::CoreError>>,
}

impl Harness {
    fn start() -> Harness {
        let doc = Document::from_json(TOPOLOGY).unwrap();
        let config = Config::from_blob(&doc.compile().unwrap()).unwrap();
        let host = Arc::new(FakeProcessHost::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut manager =
            ProcessGroupManager::new(config, Arc::clone(&host) as _, Arc::clone(&shutdown))
                .unwrap();
        let core = manager.core();
        let handle = thread::spawn(move || manager.run());
        Harness {
            host,
            core,
            shutdown,
            handle,
        }
    }

    /// Wait for the boot round, then attach a control client to the state
    /// manager's channel and the manager's wake semaphore.
    fn client(&self) -> ControlClient {
        assert!(
            wait_until(Duration::from_secs(5), || {
                self.core.graph(0).map(|g| g.state()) == Some(GraphState::Success)
            }),
            "boot round did not settle"
        );
        let comms = self
            .host
            .comms_of("sm")
            .expect("state manager comms region");
        let wake_fd = self.core.wake_fd().expect("wake descriptor");
        // Safety: the descriptor belongs to this process and holds the
        // manager's wake semaphore region.
        let wake = unsafe {
            SharedRegion::attach(BorrowedFd::borrow_raw(wake_fd), size_of::<RawSemaphore>())
                .unwrap()
        };
        ControlClient::from_regions(comms, Arc::new(wake))
    }

    fn finish(self) -> Arc<Core> {
        self.shutdown.store(true, Ordering::Release);
        self.core.nudge();
        self.handle.join().unwrap().unwrap();
        self.core
    }
}

#[test]
fn set_state_round_trip_and_already_in_state() {
    let harness = Harness::start();
    let client = harness.client();

    let _ticket = client.set_state("MainPG", "On").unwrap();
    let outcome = client
        .wait_outcome(Duration::from_secs(5))
        .expect("asynchronous outcome");
    assert_eq!(outcome.code(), ControlCode::SetStateSuccess);
    assert_eq!(harness.host.spawn_order(), ["sm", "a", "b", "c"]);

    // Settled: the same request is answered immediately.
    assert_eq!(
        client.set_state("MainPG", "On").unwrap_err(),
        ClientError::Rejected(ControlCode::SetStateAlreadyInState)
    );

    let core = harness.finish();
    assert!(core.pid_map.is_empty());
}

#[test]
fn cancel_midway_delivers_cancelled_then_success() {
    let harness = Harness::start();
    let client = harness.client();

    // Hold the chain open at `c`: its running report is withheld until
    // after the cancellation lands.
    harness.host.suppress_report("c");
    let _ticket = client.set_state("MainPG", "On").unwrap();

    // Wait until the chain has reached `c`, i.e. `a` and `b` are running.
    assert!(
        wait_until(Duration::from_secs(5), || harness
            .host
            .pid_of("c")
            .is_some()),
        "chain never reached c"
    );

    // The newer request cancels the round; `c` then reports into the
    // cancelled round and the drain completes.
    let _ticket = client.set_state("MainPG", "Off").unwrap();
    let c_comms = harness.host.comms_of("c").unwrap();
    c_comms.sync().send_sync.post().unwrap();

    let first = client.wait_outcome(Duration::from_secs(5)).unwrap();
    assert_eq!(first.code(), ControlCode::SetStateCancelled);
    let second = client.wait_outcome(Duration::from_secs(5)).unwrap();
    assert_eq!(second.code(), ControlCode::SetStateSuccess);

    // Stop order respects the reverse of the running dependencies.
    let order = harness.host.termination_order();
    let a = harness.host.pid_of("a").unwrap();
    let b = harness.host.pid_of("b").unwrap();
    let c = harness.host.pid_of("c").unwrap();
    let pos = |pid| order.iter().position(|&p| p == pid).unwrap();
    assert!(
        pos(c) < pos(b) && pos(b) < pos(a),
        "stop order must reverse the dependency chain: {order:?}"
    );

    let core = harness.finish();
    assert!(core.pid_map.is_empty());
}

#[test]
fn crash_after_settle_reports_unexpected_termination() {
    let harness = Harness::start();
    let client = harness.client();

    let _ticket = client.set_state("MainPG", "On").unwrap();
    assert_eq!(
        client.wait_outcome(Duration::from_secs(5)).unwrap().code(),
        ControlCode::SetStateSuccess
    );

    harness.host.exit(harness.host.pid_of("a").unwrap(), 1);
    let outcome = client.wait_result(Duration::from_secs(5)).unwrap_err();
    assert_eq!(
        outcome,
        ClientError::Execution(ExecError::FailedUnexpectedTerminationOnExit)
    );

    harness.finish();
}

#[test]
fn validation_and_error_queries() {
    let harness = Harness::start();
    let client = harness.client();

    client.validate_process_group_state("MainPG", "On").unwrap();
    assert_eq!(
        client
            .validate_process_group_state("MainPG", "NoSuchState")
            .unwrap_err(),
        ClientError::Rejected(ControlCode::ValidateProcessGroupStateFailed)
    );
    assert_eq!(
        client
            .validate_process_group_state("GhostPG", "On")
            .unwrap_err(),
        ClientError::Rejected(ControlCode::ValidateProcessGroupStateFailed)
    );

    // The boot round settled successfully, so there is no stored
    // execution error to read.
    assert_eq!(
        client.get_execution_error("MainPG").unwrap_err(),
        ClientError::Rejected(ControlCode::ExecutionErrorFailed)
    );
    assert_eq!(
        client.get_execution_error("GhostPG").unwrap_err(),
        ClientError::Rejected(ControlCode::ExecutionErrorInvalidArguments)
    );

    assert_eq!(
        client
            .get_initial_machine_state(Duration::from_secs(2))
            .unwrap(),
        ControlCode::InitialMachineStateSuccess
    );

    harness.finish();
}
