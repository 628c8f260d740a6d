use thiserror::Error;

use crate::evidence::EquivocationEvidence;

#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Bad signature, unknown signer, wrong shape
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Stale message for view {view} (current {current})")]
    StaleMessage { view: u64, current: u64 },

    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    /// Invalid local setup; fatal at construction
    #[error("Configuration fault: {0}")]
    ConfigurationFault(String),

    #[error("Equivocation by {}", .0.offender().short())]
    Equivocation(Box<EquivocationEvidence>),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("State error: {0}")]
    State(#[from] tessera_state::StateError),

    #[error("Core error: {0}")]
    Core(#[from] tessera_core::CoreError),
}

impl ConsensusError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        ConsensusError::MalformedMessage(msg.into())
    }

    pub fn safety(msg: impl Into<String>) -> Self {
        ConsensusError::SafetyViolation(msg.into())
    }

    /// Only configuration faults stop a node
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::ConfigurationFault(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, ConsensusError::StaleMessage { .. })
    }
}
