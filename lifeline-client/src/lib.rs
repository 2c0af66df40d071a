//! Client-side SDKs: the lifecycle client applications use to report
//! `Running`, and the control client state managers use to request group
//! transitions.
//!
//! Both attach to the shared-memory regions the launcher set up on the
//! well-known descriptor slots before exec.

pub mod control;
pub mod lifecycle;

pub use control::{ControlClient, Ticket};
pub use lifecycle::LifecycleClient;

use lifeline_core::error::{ControlCode, ExecError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("running was already reported")]
    InvalidTransition,
    #[error("communication with the manager failed")]
    CommunicationError,
    #[error("request rejected with {0:?}")]
    Rejected(ControlCode),
    #[error(transparent)]
    Execution(ExecError),
    #[error("too many outstanding asynchronous requests")]
    TooManyOutstanding,
    #[error("client setup failed: {0}")]
    Setup(String),
}
