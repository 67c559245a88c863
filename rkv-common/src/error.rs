//! # Shared Error Type
//!
//! Purpose: A single error enum shared by the engine, the cluster router, the
//! sync client, and the AOF reader/writer, so that RESP error replies and
//! internal `Result`s are built from the same vocabulary.
//!
//! ## Design Principles
//! 1. **One Error, Many Callers**: every crate in the workspace maps its
//!    failures onto this enum instead of inventing a parallel one.
//! 2. **Wire-Shaped Messages**: `Display` renders the same text that ends up
//!    in a RESP `-ERR ...` reply, so callers can forward it verbatim.

use std::fmt;

/// Result alias used throughout the workspace.
pub type RkvResult<T> = Result<T, RkvError>;

/// Errors that can arise while parsing, executing, or replicating commands.
#[derive(Debug, thiserror::Error)]
pub enum RkvError {
    /// Wrong number of arguments for a command.
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    /// Command name is not recognized.
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    /// The key holds a value of a different type than the command expects.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// A numeric argument did not parse as an integer or float.
    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    /// A float argument did not parse.
    #[error("ERR value is not a valid float")]
    NotAFloat,

    /// RESP framing was malformed (bad length prefix, missing CRLF, etc).
    #[error("ERR Protocol error: {0}")]
    Protocol(String),

    /// Command execution panicked; converted to an opaque error at the
    /// single `exec` boundary.
    #[error("ERR unknown error")]
    Unknown,

    /// Cluster command touched keys that do not share the same hash slot.
    #[error("ERR {0} must within one slot in cluster mode")]
    CrossSlot(&'static str),

    /// A multi-key write partially failed while fanning out to peers.
    #[error("ERR part failure: {}", .0.join(","))]
    PartialFailure(Vec<String>),

    /// Two-phase commit could not reach a peer during PREPARE.
    #[error("ERR transaction prepare failed on peer {0}: {1}")]
    PrepareFailed(String, String),

    /// Underlying I/O failure (socket, file).
    #[error("ERR io error: {0}")]
    Io(String),

    /// A lock was poisoned by a panicking holder.
    #[error("ERR internal lock poisoned")]
    LockPoisoned,

    /// Generic server-reported error text, used when relaying a peer's
    /// error reply unchanged.
    #[error("{0}")]
    Server(String),
}

impl From<std::io::Error> for RkvError {
    fn from(err: std::io::Error) -> Self {
        RkvError::Io(err.to_string())
    }
}

impl RkvError {
    /// Renders the error the way it appears after the RESP `-` prefix.
    pub fn wire_message(&self) -> String {
        self.to_string()
    }
}

impl<T> From<std::sync::PoisonError<T>> for RkvError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        RkvError::LockPoisoned
    }
}

impl fmt::Display for ArityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArityKind::Exact(n) => write!(f, "exactly {n}"),
            ArityKind::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

/// Describes the arity contract of a command, used by dispatch to build a
/// `WrongArity` error with a consistent message.
#[derive(Debug, Clone, Copy)]
pub enum ArityKind {
    Exact(usize),
    AtLeast(usize),
}
