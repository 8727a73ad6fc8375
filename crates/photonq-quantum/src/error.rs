//! Quantum state manager error types.

use thiserror::Error;

use crate::state::StateKey;

/// Errors raised by the quantum state manager.
#[derive(Debug, Error)]
pub enum QuantumError {
    /// A key was used that is not registered in the manager.
    #[error("unknown state key: {0:?}")]
    UnknownState(StateKey),

    /// A circuit referenced a gate outside the registered gate table.
    #[error("unknown gate: {0}")]
    UnknownGate(String),

    /// The requested operation is not defined for the active formalism.
    #[error("operation {operation} unsupported in {formalism} formalism")]
    UnsupportedFormalism {
        /// Name of the rejected operation.
        operation: &'static str,
        /// Active formalism name.
        formalism: &'static str,
    },

    /// Amplitude or matrix dimensions do not match the key count.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A measurement was requested without a random sample.
    #[error("measurement requires a random sample in [0, 1)")]
    MissingMeasureSample,
}
