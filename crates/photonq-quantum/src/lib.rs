//! # photonq-quantum: Quantum State Manager
//!
//! Process-wide store of multi-qubit quantum states keyed by memory
//! identifiers. Supports compose-on-demand (tensor product with SWAP-chain
//! reordering), gate application, and projective measurement with cached
//! operator evaluation.
//!
//! ## Formalisms
//!
//! The representation is selected once at startup and is immutable for the
//! rest of the run:
//!
//! - **Ket**: complex amplitude vector over `2^n` basis states
//! - **Density**: `2^n × 2^n` density matrix (decoherence-capable variant)
//! - **Bell-diagonal**: four real probabilities over the Bell basis, only
//!   ever bipartite; circuits are unsupported in this formalism and state
//!   updates go through the dedicated BDS accessors
//!
//! ## Invariants
//!
//! - every registered key maps to exactly one state;
//! - all keys of a joint state co-own that state (each lists all others);
//! - `new_key` / `set` / `run_circuit` / `remove` are the only operations
//!   that change state identity.

mod cache;
mod circuit;
mod error;
mod gates;
mod manager;
mod state;

pub use circuit::Circuit;
pub use error::QuantumError;
pub use gates::Gate;
pub use manager::{Formalism, QuantumManager, StateView, DEFAULT_CACHE_CAPACITY};
pub use state::{
    BellDiagonalState, StateKey, BELL_PHI_MINUS, BELL_PHI_PLUS, BELL_PSI_MINUS, BELL_PSI_PLUS,
};
