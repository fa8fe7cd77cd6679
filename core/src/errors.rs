use thiserror::Error;

use crate::definitions::DeviceState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FacadeError {
    #[error("device manager returned error code {0}")]
    Code(i32),

    #[error("device manager is not reachable")]
    Unavailable,

    #[error("listener registration failed: {0}")]
    Registration(String),
}

#[derive(Error, Debug)]
pub enum SinkError {
    /// No connectable device right now; recoverable once the manager reports a connection.
    #[error("Bluetooth audio sink is unavailable (device {state})")]
    Unavailable { state: DeviceState },

    /// The connected device can not be played to until it is physically reconnected.
    #[error("Bluetooth audio sink device rejected (device {state})")]
    DeviceRejected { state: DeviceState },

    #[error("{op} failed: {source}")]
    FacadeFailure {
        op: &'static str,
        #[source]
        source: FacadeError,
    },

    /// The manager service is running but the device layer does not answer.
    #[error("device manager service is up but the device state is unknown")]
    ServiceFault,

    #[error("Unsupported stream format: {0}")]
    UnsupportedFormat(String),

    /// Manager events need a tokio runtime to be consumed and none is available.
    #[error("manager event dispatcher is not running")]
    NotRunning,
}

impl SinkError {
    pub(crate) fn facade(op: &'static str, source: FacadeError) -> Self {
        SinkError::FacadeFailure { op, source }
    }
}

/// Outcome of a best-effort transition such as relinquish or stop.
///
/// Local session state always moves to the target baseline. `Forced` keeps the facade error
/// that was logged along the way instead of dropping it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Transition {
    Completed,
    Forced(FacadeError),
}

impl Transition {
    pub fn is_clean(&self) -> bool {
        matches!(self, Transition::Completed)
    }

    pub fn error(&self) -> Option<&FacadeError> {
        match self {
            Transition::Completed => None,
            Transition::Forced(e) => Some(e),
        }
    }
}

impl From<Result<(), FacadeError>> for Transition {
    fn from(result: Result<(), FacadeError>) -> Self {
        match result {
            Ok(()) => Transition::Completed,
            Err(e) => Transition::Forced(e),
        }
    }
}
