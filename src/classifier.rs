//! Raw failure signals and their classification into [`ErrorKind`].
//!
//! Transports, loaders and the platform report failures as [`Signal`]s (or as
//! `std::io::Error`, which converts into a signal). [`ErrorClassifier::classify`] is total:
//! anything it does not recognise maps to [`ErrorKind::Unknown`], so no unclassified failure
//! ever reaches the controller.
//!
//! ```rust
//! use lobbyline::{classify, ErrorKind, Signal};
//!
//! assert_eq!(classify(&Signal::ConnectTimeout), ErrorKind::Timeout);
//! assert_eq!(classify(&Signal::Other("gpu lost".into())), ErrorKind::Unknown);
//! ```

use crate::ErrorKind;
use std::fmt;
use std::io;

/// A raw failure signal, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The connection could not be established in time.
    ConnectTimeout,
    /// An operation on an established connection timed out.
    OperationTimeout,
    /// The lobby does not exist.
    LobbyNotFound,
    /// A resource does not exist.
    ResourceNotFound,
    /// The remote end actively rejected the connection.
    ConnectionRefused,
    /// The connection dropped mid-operation.
    ConnectionReset,
    /// Allocation failed.
    OutOfMemory,
    /// File/socket handle table is full.
    HandlesExhausted,
    /// A server- or platform-side quota was exceeded.
    QuotaExceeded,
    /// An I/O error kind not covered by a more specific variant.
    Io(io::ErrorKind),
    /// Free-form failure from a collaborator.
    Other(String),
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::ConnectTimeout => f.write_str("connect timed out"),
            Signal::OperationTimeout => f.write_str("operation timed out"),
            Signal::LobbyNotFound => f.write_str("lobby not found"),
            Signal::ResourceNotFound => f.write_str("resource not found"),
            Signal::ConnectionRefused => f.write_str("connection refused"),
            Signal::ConnectionReset => f.write_str("connection reset"),
            Signal::OutOfMemory => f.write_str("out of memory"),
            Signal::HandlesExhausted => f.write_str("handles exhausted"),
            Signal::QuotaExceeded => f.write_str("quota exceeded"),
            Signal::Io(kind) => write!(f, "i/o error: {}", kind),
            Signal::Other(msg) => f.write_str(msg),
        }
    }
}

impl From<io::Error> for Signal {
    fn from(err: io::Error) -> Self {
        Signal::from(err.kind())
    }
}

impl From<&io::Error> for Signal {
    fn from(err: &io::Error) -> Self {
        Signal::from(err.kind())
    }
}

impl From<io::ErrorKind> for Signal {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::TimedOut => Signal::OperationTimeout,
            io::ErrorKind::NotFound => Signal::ResourceNotFound,
            io::ErrorKind::ConnectionRefused => Signal::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Signal::ConnectionReset
            }
            io::ErrorKind::OutOfMemory => Signal::OutOfMemory,
            other => Signal::Io(other),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Signal {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Signal::OperationTimeout
    }
}

/// Maps raw signals to [`ErrorKind`].
///
/// Implementors must be total. The default [`StandardClassifier`] uses the fixed mapping;
/// custom classifiers may refine `Other` signals but should keep the fixed variants as-is.
pub trait ErrorClassifier: Send + Sync + std::fmt::Debug {
    fn classify(&self, signal: &Signal) -> ErrorKind;
}

/// The fixed signal → kind mapping.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardClassifier;

impl ErrorClassifier for StandardClassifier {
    fn classify(&self, signal: &Signal) -> ErrorKind {
        classify(signal)
    }
}

/// Classify a signal with the fixed mapping.
pub fn classify(signal: &Signal) -> ErrorKind {
    match signal {
        Signal::ConnectTimeout | Signal::OperationTimeout => ErrorKind::Timeout,
        Signal::LobbyNotFound | Signal::ResourceNotFound => ErrorKind::NotFound,
        Signal::ConnectionRefused => ErrorKind::Refused,
        Signal::OutOfMemory | Signal::HandlesExhausted | Signal::QuotaExceeded => {
            ErrorKind::ResourceExhausted
        }
        Signal::Io(kind) => classify_io_kind(*kind),
        Signal::ConnectionReset | Signal::Other(_) => ErrorKind::Unknown,
    }
}

fn classify_io_kind(kind: io::ErrorKind) -> ErrorKind {
    match kind {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::PermissionDenied => ErrorKind::Refused,
        io::ErrorKind::OutOfMemory => ErrorKind::ResourceExhausted,
        _ => ErrorKind::Unknown,
    }
}

/// Extension for classifying platform errors in place.
pub trait Classify {
    fn classify(&self) -> ErrorKind;
}

impl Classify for io::Error {
    fn classify(&self) -> ErrorKind {
        classify(&Signal::from(self))
    }
}

impl Classify for Signal {
    fn classify(&self) -> ErrorKind {
        classify(self)
    }
}
