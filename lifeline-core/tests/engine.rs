//! Engine-level scenarios driven through the manager loop against the fake
//! process host: ordered startup, restart-on-crash, crash-after-settle
//! recovery, and the undefined-state parking of exhausted restarts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lifeline_core::config::{Config, Document};
use lifeline_core::error::ControlCode;
use lifeline_core::graph::GraphState;
use lifeline_core::launcher::FakeProcessHost;
use lifeline_core::manager::{Core, ProcessGroupManager};
use lifeline_core::reaper::Reaper;
use lifeline_core::Identifier;

fn load(json: &str) -> Config {
    let doc = Document::from_json(json).expect("authoring document");
    Config::from_blob(&doc.compile().expect("compile")).expect("load")
}

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

struct RunningManager {
    core: Arc<Core>,
    shutdown: Arc<AtomicBool>,
    handle: thread::JoinHandle<Result<(), lifeline_core::CoreError>>,
}

impl RunningManager {
    fn start(config: Config, host: Arc<FakeProcessHost>) -> RunningManager {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut manager = ProcessGroupManager::new(config, host, Arc::clone(&shutdown))
            .expect("manager construction");
        let core = manager.core();
        let handle = thread::spawn(move || manager.run());
        RunningManager {
            core,
            shutdown,
            handle,
        }
    }

    fn finish(self) {
        self.shutdown.store(true, Ordering::Release);
        self.core.nudge();
        self.handle.join().unwrap().unwrap();
    }
}

#[test]
fn happy_startup_forks_in_dependency_order() {
    let config = load(
        r#"{
            "machine": { "main_group": "OrderPG", "startup_state": "On" },
            "process_groups": [{
                "name": "OrderPG",
                "off_state": "Off",
                "recovery_state": "Off",
                "states": [
                    { "name": "On", "processes": ["a", "b", "c"] },
                    { "name": "Off", "processes": [] }
                ],
                "processes": [
                    { "short_name": "a", "executable": "/bin/a" },
                    { "short_name": "b", "executable": "/bin/b",
                      "dependencies": [ { "process": "a", "state": "running" } ] },
                    { "short_name": "c", "executable": "/bin/c",
                      "dependencies": [ { "process": "b", "state": "running" } ] }
                ]
            }]
        }"#,
    );
    let host = Arc::new(FakeProcessHost::new());
    let running = RunningManager::start(config, Arc::clone(&host));

    let graph_settled = {
        let core = Arc::clone(&running.core);
        wait_until(Duration::from_secs(5), move || {
            core.graph(0).map(|g| g.state()) == Some(GraphState::Success)
        })
    };
    assert!(graph_settled, "startup round did not settle");
    assert_eq!(host.spawn_order(), ["a", "b", "c"]);
    assert_eq!(
        running.core.initial_state_result(),
        ControlCode::InitialMachineStateSuccess
    );

    running.finish();
    assert!(host.pid_of("a").is_some());
    // Every registered pid was consumed on the way down.
    // (post-shutdown the map must be empty)
    // The RunningManager join above already drove all-off.
}

#[test]
fn pid_map_is_empty_after_shutdown() {
    let config = load(
        r#"{
            "machine": { "main_group": "DrainPG", "startup_state": "On" },
            "process_groups": [{
                "name": "DrainPG",
                "off_state": "Off",
                "recovery_state": "Off",
                "states": [
                    { "name": "On", "processes": ["one", "two"] },
                    { "name": "Off", "processes": [] }
                ],
                "processes": [
                    { "short_name": "one", "executable": "/bin/one" },
                    { "short_name": "two", "executable": "/bin/two" }
                ]
            }]
        }"#,
    );
    let host = Arc::new(FakeProcessHost::new());
    let running = RunningManager::start(config, Arc::clone(&host));
    {
        let core = Arc::clone(&running.core);
        assert!(wait_until(Duration::from_secs(5), move || {
            core.graph(0).map(|g| g.state()) == Some(GraphState::Success)
        }));
    }
    let core = Arc::clone(&running.core);
    running.finish();
    assert!(core.pid_map.is_empty());
}

#[test]
fn crash_during_start_is_retried_until_success() {
    let config = load(
        r#"{
            "machine": { "main_group": "RetryPG", "startup_state": "On" },
            "process_groups": [{
                "name": "RetryPG",
                "off_state": "Off",
                "recovery_state": "Off",
                "states": [
                    { "name": "On", "processes": ["flaky"] },
                    { "name": "Off", "processes": [] }
                ],
                "processes": [
                    { "short_name": "flaky", "executable": "/bin/flaky",
                      "comms": "reporting", "restart_attempts": 2,
                      "startup_timeout_ms": 2000 }
                ]
            }]
        }"#,
    );
    let host = Arc::new(FakeProcessHost::new());
    // Two crashes, then the third attempt reports running.
    host.plan_exit("flaky", 1);
    host.plan_exit("flaky", 1);
    let running = RunningManager::start(config, Arc::clone(&host));

    {
        let core = Arc::clone(&running.core);
        assert!(
            wait_until(Duration::from_secs(10), move || {
                core.graph(0).map(|g| g.state()) == Some(GraphState::Success)
            }),
            "transition did not recover from startup crashes"
        );
    }
    assert_eq!(host.spawn_order(), ["flaky", "flaky", "flaky"]);
    running.finish();
}

#[test]
fn crash_after_settle_enters_recovery_state() {
    let config = load(
        r#"{
            "machine": { "main_group": "RecPG", "startup_state": "On" },
            "process_groups": [{
                "name": "RecPG",
                "off_state": "Off",
                "recovery_state": "Fallback",
                "states": [
                    { "name": "On", "processes": ["svc"] },
                    { "name": "Fallback", "processes": [] },
                    { "name": "Off", "processes": [] }
                ],
                "processes": [
                    { "short_name": "svc", "executable": "/bin/svc" }
                ]
            }]
        }"#,
    );
    let host = Arc::new(FakeProcessHost::new());
    let running = RunningManager::start(config, Arc::clone(&host));
    {
        let core = Arc::clone(&running.core);
        assert!(wait_until(Duration::from_secs(5), move || {
            core.graph(0).map(|g| g.state()) == Some(GraphState::Success)
        }));
    }

    // The settled service dies unexpectedly.
    host.exit(host.pid_of("svc").unwrap(), 1);

    let fallback = Identifier::new("RecPG/Fallback");
    {
        let core = Arc::clone(&running.core);
        assert!(
            wait_until(Duration::from_secs(5), move || {
                let graph = core.graph(0).unwrap();
                graph.requested_state() == fallback && graph.state() == GraphState::Success
            }),
            "manager did not inject the recovery transition"
        );
    }
    {
        let graph = running.core.graph(0).unwrap();
        assert_eq!(
            graph.last_execution_error(),
            0,
            "default execution error code is stored"
        );
    }
    running.finish();
}

#[test]
fn exhausted_restarts_park_the_graph_undefined() {
    // No manager loop here: recovery injection would immediately pull the
    // graph out of the state under test.
    let config = load(
        r#"{
            "machine": { "main_group": "DeadPG", "startup_state": "On" },
            "process_groups": [{
                "name": "DeadPG",
                "off_state": "Off",
                "recovery_state": "Off",
                "states": [
                    { "name": "On", "processes": ["doomed"] },
                    { "name": "Off", "processes": [] }
                ],
                "processes": [
                    { "short_name": "doomed", "executable": "/bin/doomed",
                      "comms": "reporting", "startup_timeout_ms": 500,
                      "execution_error_code": 77 }
                ]
            }]
        }"#,
    );
    let host = Arc::new(FakeProcessHost::new());
    host.plan_exit("doomed", 1);
    let shutdown = Arc::new(AtomicBool::new(false));
    let manager = ProcessGroupManager::new(config, Arc::clone(&host) as _, shutdown)
        .expect("manager construction");
    let core = manager.core();
    let reaper = Reaper::spawn(Arc::clone(&core));

    let graph = core.graph(0).unwrap();
    let target = Identifier::new("DeadPG/On");
    assert!(graph.start_transition(&core, target));

    assert!(
        wait_until(Duration::from_secs(5), || graph.state()
            == GraphState::Undefined),
        "graph did not park in the undefined state"
    );
    assert_eq!(graph.last_execution_error(), 77);
    assert_eq!(
        graph.pending_event(),
        ControlCode::FailedUnexpectedTerminationOnEnter
    );

    core.stop();
    core.jobs.stop(lifeline_core::config::NUM_WORKER_THREADS);
    reaper.join();
}
