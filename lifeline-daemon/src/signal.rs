//! Termination signal wiring.
//!
//! Every catchable lifecycle-relevant signal funnels into one shared flag
//! that the manager loop polls. The handler itself only stores an atomic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_termination(_: libc::c_int) {
    if let Some(flag) = SHUTDOWN.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

/// Install handlers for the termination signal set, all driving `flag`.
pub fn install_termination_handler(flag: Arc<AtomicBool>) -> nix::Result<()> {
    let _ = SHUTDOWN.set(flag);
    let action = SigAction::new(
        SigHandler::Handler(handle_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [
        Signal::SIGALRM,
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGIO,
        Signal::SIGPROF,
        Signal::SIGQUIT,
        Signal::SIGTERM,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGVTALRM,
    ] {
        // Safety: the handler only performs an atomic store.
        unsafe {
            sigaction(signal, &action)?;
        }
    }
    Ok(())
}
