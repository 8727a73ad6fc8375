//! Control plane error types.

use thiserror::Error;

/// Fatal control-plane errors.
///
/// These abort a run during `init` or dispatch. Recoverable conditions
/// (generation/distillation/swap failures, reservation rejection, memory
/// expiry) are ordinary bookkeeping and never surface here.
#[derive(Debug, Error)]
pub enum NetError {
    /// Kernel-level scheduling violation.
    #[error(transparent)]
    Kernel(#[from] photonq_kernel::KernelError),

    /// Quantum state manager failure.
    #[error(transparent)]
    Quantum(#[from] photonq_quantum::QuantumError),

    /// A message or qubit was addressed to a node with no registration.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// A channel references an endpoint that does not exist.
    #[error("channel {channel} has dangling endpoint {endpoint}")]
    DanglingEndpoint {
        /// Channel name.
        channel: String,
        /// Missing node name.
        endpoint: String,
    },

    /// No channel exists from a node toward a destination.
    #[error("node {node} has no channel toward {dst}")]
    MissingChannel {
        /// Sending node.
        node: String,
        /// Destination node.
        dst: String,
    },

    /// A forwarding lookup had no entry for the destination.
    #[error("node {node} has no forwarding entry for {dst}")]
    MissingRoute {
        /// Forwarding node.
        node: String,
        /// Destination node.
        dst: String,
    },

    /// A pairing response referenced a protocol that no longer exists.
    #[error("unpaired protocol: {0}")]
    UnpairedProtocol(String),

    /// Two nodes were registered under the same name.
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),
}
