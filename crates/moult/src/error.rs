//! Error types for the daemon lifecycle library.

use thiserror::Error;

/// Errors surfaced at the library's application boundaries.
///
/// Failures inside lifecycle transitions (drain timeouts, signal collisions,
/// spawn failures) do not appear here: no higher-level recovery is meaningful
/// for them, so they log and terminate the process instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The listener has been stopped; accept loops should break.
    #[error("listener stopped")]
    Stopped,

    /// The connection was already closed once.
    #[error("connection closed twice")]
    DoubleClose,

    /// `stop` was called on an already-stopped listener.
    #[error("listener already stopped")]
    AlreadyStopped,

    /// `close` was called on an already-closed listener.
    #[error("listener already closed")]
    AlreadyClosed,

    /// A flag was given an empty argument.
    #[error("--{flag} requires an argument")]
    EmptyValue {
        /// Name of the offending flag.
        flag: String,
    },

    /// A flag expected an argument but the command line ended.
    #[error("missing value for --{flag}")]
    MissingValue {
        /// Name of the offending flag.
        flag: String,
    },

    /// The command line named a flag that was never registered.
    #[error("unknown flag --{name}")]
    UnknownFlag {
        /// The unrecognized name.
        name: String,
    },

    /// A flag argument failed to parse or resolve.
    #[error("invalid value {value:?} for --{flag}: {reason}")]
    InvalidValue {
        /// Name of the offending flag.
        flag: String,
        /// The raw argument.
        value: String,
        /// What went wrong.
        reason: String,
    },

    /// IO error (bind, accept, descriptor adoption).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
