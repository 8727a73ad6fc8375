//! # photonq-net: Entanglement Control Plane
//!
//! Everything above the hardware layer: classical messages, the three
//! entanglement protocols (heralded generation, BBPSSW distillation,
//! swapping), per-node resource management (memory bookkeeping + rule
//! engine), the network manager (reservation, routing, forwarding), the
//! QKD stack (BB84 + cascade), the node model, and the simulation engine
//! that stitches them together.
//!
//! ## Execution model
//!
//! Single-threaded cooperative: the engine pops events from the kernel
//! timeline and dispatches them against the node arena. Protocol steps are
//! pure with respect to the rest of the network — they mutate only their
//! own node's hardware and emit [`Effect`]s (messages to send, events to
//! schedule, bookkeeping updates) that the engine applies afterwards. All
//! cross-node references are names resolved through the arena; nothing
//! holds a pointer across nodes.

mod app;
mod effects;
mod engine;
mod error;
mod generation;
mod message;
mod network;
mod node;
mod purification;
mod qkd;
mod resource;
mod swapping;

pub use app::{Application, KeyManagerApp, RecordingApp};
pub use effects::{Effect, ProtoCtx};
pub use engine::{EventKind, Network};
pub use error::NetError;
pub use generation::{GenerationA, GenerationB, GenerationMessage};
pub use message::{Message, MessageBody, MessageReceiver};
pub use network::{
    compute_forwarding, MemoryTimeCard, NetworkManager, Reservation, ReservationId,
    ReservationMessage, RoutingProtocol,
};
pub use node::{Node, NodeKind};
pub use purification::{Bbpssw, PurificationMessage};
pub use qkd::{
    pair_bb84, pair_cascade, Bb84, Bb84Message, Cascade, CascadeMessage, QkdCtx,
    QkdDetectorBank, QkdOp,
};
pub use resource::{
    MemoryInfo, MemoryState, PairCondition, ProtocolInstance, ResourceManager,
    ResourceManagerMessage, Rule, RuleKind,
};
pub use swapping::{SwappingA, SwappingB, SwappingMessage};
