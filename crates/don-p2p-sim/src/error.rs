//! Error types for the simulator.

use thiserror::Error;

use don_p2p::P2pError;

/// Errors raised while loading or running a scenario.
#[derive(Debug, Error)]
pub enum SimError {
    /// The scenario references something it does not declare.
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),

    /// The scenario file is not valid JSON for a scenario.
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] serde_json::Error),

    /// A peer service operation failed.
    #[error(transparent)]
    P2p(#[from] P2pError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for simulator operations.
pub type SimResult<T> = Result<T, SimError>;
