//! # photonq-kernel: Deterministic Simulation Kernel for PhotonQ
//!
//! This crate provides the discrete-event scheduling core of the PhotonQ
//! quantum network simulator.
//!
//! ## Philosophy
//!
//! The kernel is deliberately small and completely deterministic:
//!
//! - **Reproducibility**: Same seed → same execution → same final state
//! - **Total event order**: events are ordered by (time, priority,
//!   insertion counter); no two distinct events ever compare equal
//! - **Integer time**: all simulation times are integer picoseconds;
//!   fractional delays are resolved with exact rational arithmetic so no
//!   run ever depends on host floating-point behavior
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Kernel                              │
//! │  ┌────────────┐  ┌───────────────┐  ┌────────────────┐   │
//! │  │ Timeline   │  │ EventQueue<K> │  │ SimRng         │   │
//! │  │ (clock +   │  │ (min-heap,    │  │ (per-entity    │   │
//! │  │  contract) │  │  removal ids) │  │  ChaCha8)      │   │
//! │  └────────────┘  └───────────────┘  └────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The event payload type `K` is supplied by the engine layer; the kernel
//! never inspects it. Dispatch (looking up the owning entity and invoking
//! the operation) is the engine's job, which keeps the kernel free of any
//! domain knowledge.

mod error;
mod event;
mod rng;
mod time;
mod timeline;

pub use error::KernelError;
pub use event::{Event, EventId, EventQueue};
pub use rng::SimRng;
pub use time::{
    MICROSECOND, MILLISECOND, NANOSECOND, PICOSECOND, SECOND, ratio_to_ps, sec_to_ps,
};
pub use timeline::{StopTime, Timeline, TimelineSummary};
