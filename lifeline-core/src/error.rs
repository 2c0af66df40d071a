use thiserror::Error;

/// Execution error domain exposed to state managers.
///
/// These values travel over the control channel and through
/// `GetExecutionError`, so the discriminants are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum ExecError {
    #[error("some unspecified error occurred")]
    GeneralError = 1,
    #[error("an invalid argument was passed")]
    InvalidArguments = 2,
    #[error("a communication error occurred")]
    CommunicationError = 3,
    #[error("transition to the requested process group state was cancelled by a newer request")]
    Cancelled = 5,
    #[error("requested operation could not be performed")]
    Failed = 6,
    #[error("unexpected termination in a process of the previous process group state")]
    FailedUnexpectedTerminationOnExit = 7,
    #[error("unexpected termination in a process of the target process group state")]
    FailedUnexpectedTerminationOnEnter = 8,
    #[error("transition invalid (e.g. reporting running when already running)")]
    InvalidTransition = 9,
    #[error("process group is already in the requested state")]
    AlreadyInState = 10,
    #[error("transition to the requested state is already in progress")]
    InTransitionToSameState = 11,
}

/// Request and response codes carried in control-channel messages.
///
/// One enum covers both directions: the manager overwrites the request slot
/// code with the immediate outcome when it acknowledges, and asynchronous
/// outcomes arrive later through the response slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlCode {
    NotSet = 0,

    SetStateRequest = 1,
    SetStateSuccess = 2,
    SetStateCancelled = 3,
    SetStateFailed = 4,
    SetStateInvalidArguments = 5,
    SetStateAlreadyInState = 6,
    SetStateTransitionToSameState = 7,
    FailedUnexpectedTermination = 8,
    FailedUnexpectedTerminationOnEnter = 9,

    GetExecutionErrorRequest = 10,
    ExecutionErrorSuccess = 11,
    ExecutionErrorFailed = 12,
    ExecutionErrorInvalidArguments = 13,

    GetInitialMachineStateRequest = 14,
    InitialMachineStateSuccess = 15,
    InitialMachineStateFailed = 16,
    InitialMachineStateNotSet = 17,

    ValidateProcessGroupStateRequest = 18,
    ValidateProcessGroupStateSuccess = 19,
    ValidateProcessGroupStateFailed = 20,

    InvalidRequest = 21,
}

impl ControlCode {
    /// The execution-domain error a response code translates to, if it
    /// denotes one. Client libraries surface this to their callers.
    pub fn exec_error(&self) -> Option<ExecError> {
        match self {
            ControlCode::SetStateCancelled => Some(ExecError::Cancelled),
            ControlCode::SetStateFailed | ControlCode::ExecutionErrorFailed => {
                Some(ExecError::Failed)
            }
            ControlCode::SetStateInvalidArguments
            | ControlCode::ExecutionErrorInvalidArguments
            | ControlCode::InvalidRequest => Some(ExecError::InvalidArguments),
            ControlCode::SetStateAlreadyInState => Some(ExecError::AlreadyInState),
            ControlCode::SetStateTransitionToSameState => Some(ExecError::InTransitionToSameState),
            ControlCode::FailedUnexpectedTermination => {
                Some(ExecError::FailedUnexpectedTerminationOnExit)
            }
            ControlCode::FailedUnexpectedTerminationOnEnter => {
                Some(ExecError::FailedUnexpectedTerminationOnEnter)
            }
            _ => None,
        }
    }

    /// Decode a raw value read out of shared memory. Anything unknown maps
    /// to `InvalidRequest` so a corrupted slot cannot smuggle in a
    /// well-formed request.
    pub fn from_raw(raw: u32) -> ControlCode {
        match raw {
            0 => ControlCode::NotSet,
            1 => ControlCode::SetStateRequest,
            2 => ControlCode::SetStateSuccess,
            3 => ControlCode::SetStateCancelled,
            4 => ControlCode::SetStateFailed,
            5 => ControlCode::SetStateInvalidArguments,
            6 => ControlCode::SetStateAlreadyInState,
            7 => ControlCode::SetStateTransitionToSameState,
            8 => ControlCode::FailedUnexpectedTermination,
            9 => ControlCode::FailedUnexpectedTerminationOnEnter,
            10 => ControlCode::GetExecutionErrorRequest,
            11 => ControlCode::ExecutionErrorSuccess,
            12 => ControlCode::ExecutionErrorFailed,
            13 => ControlCode::ExecutionErrorInvalidArguments,
            14 => ControlCode::GetInitialMachineStateRequest,
            15 => ControlCode::InitialMachineStateSuccess,
            16 => ControlCode::InitialMachineStateFailed,
            17 => ControlCode::InitialMachineStateNotSet,
            18 => ControlCode::ValidateProcessGroupStateRequest,
            19 => ControlCode::ValidateProcessGroupStateSuccess,
            20 => ControlCode::ValidateProcessGroupStateFailed,
            _ => ControlCode::InvalidRequest,
        }
    }
}

/// Errors raised while bringing the daemon up or tearing it down.
/// Configuration problems are rejected at init; the daemon exits non-zero.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("identifier collision: {first:?} and {second:?} hash to the same value")]
    IdentifierCollision { first: String, second: String },

    #[error("environment variable {0} is not set")]
    ConfigPathUnset(&'static str),

    #[error("i/o error reading {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("os error: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("no startup state configured for the machine process group")]
    NoStartupState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_code_raw_round_trip() {
        for code in [
            ControlCode::NotSet,
            ControlCode::SetStateRequest,
            ControlCode::SetStateCancelled,
            ControlCode::FailedUnexpectedTermination,
            ControlCode::ValidateProcessGroupStateFailed,
            ControlCode::InvalidRequest,
        ] {
            assert_eq!(ControlCode::from_raw(code as u32), code);
        }
    }

    #[test]
    fn unknown_raw_maps_to_invalid_request() {
        assert_eq!(ControlCode::from_raw(0xFFFF), ControlCode::InvalidRequest);
    }

    #[test]
    fn response_codes_translate_into_the_execution_domain() {
        assert_eq!(
            ControlCode::SetStateCancelled.exec_error(),
            Some(ExecError::Cancelled)
        );
        assert_eq!(
            ControlCode::FailedUnexpectedTermination.exec_error(),
            Some(ExecError::FailedUnexpectedTerminationOnExit)
        );
        assert_eq!(ControlCode::SetStateSuccess.exec_error(), None);
        assert_eq!(ControlCode::NotSet.exec_error(), None);
    }
}
