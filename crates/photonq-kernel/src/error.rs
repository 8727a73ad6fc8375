//! Kernel error types.

use thiserror::Error;

/// Errors raised by the simulation kernel.
///
/// All kernel errors are precondition violations: a run that hits one is
/// misconfigured and must abort. Recoverable conditions (protocol failures,
/// memory expiration) never surface here — they are ordinary events.
#[derive(Debug, Error)]
pub enum KernelError {
    /// An event was scheduled before the current simulation time.
    #[error("event scheduled in the past: time {time} ps < now {now} ps")]
    ScheduleInPast {
        /// Requested event time.
        time: u64,
        /// Current simulation time.
        now: u64,
    },

    /// Two entities were registered under the same name.
    #[error("duplicate entity name: {0}")]
    DuplicateEntity(String),

    /// An operation referenced an entity name with no registration.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
}
