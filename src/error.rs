//! Error vocabulary for the join core.
//!
//! [`ErrorKind`] is the closed set every failure is classified into before it crosses the
//! controller boundary. [`FailureCause`] records *why* a Join ended in `Failed`, so a
//! cancelled Join is distinguishable from a transport failure even though both surface
//! as a kind.
use std::fmt;
use std::time::Duration;

/// Closed failure taxonomy.
///
/// Declaration order is significant: it is the tie-break order used by
/// [`ErrorKind::dominant`] (`Timeout` wins over `NotFound`, and so on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// Connection or operation exceeded its time limit.
    Timeout,
    /// The lobby or resource does not exist.
    NotFound,
    /// The transport actively rejected the request.
    Refused,
    /// Memory, handle or quota exhaustion.
    ResourceExhausted,
    /// Anything else, including cancellation and caller contract violations.
    Unknown,
}

impl ErrorKind {
    /// Every kind, in declaration (tie-break) order.
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::Timeout,
        ErrorKind::NotFound,
        ErrorKind::Refused,
        ErrorKind::ResourceExhausted,
        ErrorKind::Unknown,
    ];

    /// Whether a connection attempt failing with this kind may be retried.
    ///
    /// `NotFound` and `ResourceExhausted` are never retried.
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorKind::Timeout | ErrorKind::Refused | ErrorKind::Unknown => true,
            ErrorKind::NotFound | ErrorKind::ResourceExhausted => false,
        }
    }

    /// Stable snake_case name, suitable for log files and metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Refused => "refused",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Unknown => "unknown",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Most common kind in `kinds`; ties go to the kind declared first.
    ///
    /// Returns `None` for an empty input.
    pub fn dominant<I>(kinds: I) -> Option<ErrorKind>
    where
        I: IntoIterator<Item = ErrorKind>,
    {
        let mut counts = [0usize; 5];
        for kind in kinds {
            counts[kind.index()] += 1;
        }
        let mut best: Option<(ErrorKind, usize)> = None;
        for kind in ErrorKind::ALL {
            let count = counts[kind.index()];
            if count == 0 {
                continue;
            }
            match best {
                Some((_, best_count)) if best_count >= count => {}
                _ => best = Some((kind, count)),
            }
        }
        best.map(|(kind, _)| kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a Join (or a single log-worthy step) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCause {
    /// A connection attempt failed; retryable kinds are logged with this cause too.
    Transport,
    /// Every allowed connection attempt failed.
    RetriesExhausted,
    /// The caller cancelled the Join.
    Cancelled,
    /// An individual resource failed to load.
    ResourceLoad,
    /// Every resource in the batch failed to load.
    BatchFailed,
    /// The batch was malformed (duplicate ids).
    InvalidBatch,
}

impl FailureCause {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCause::Transport => "transport",
            FailureCause::RetriesExhausted => "retries_exhausted",
            FailureCause::Cancelled => "cancelled",
            FailureCause::ResourceLoad => "resource_load",
            FailureCause::BatchFailed => "batch_failed",
            FailureCause::InvalidBatch => "invalid_batch",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invalid configuration rejected by a builder.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("max_attempts must be >= 1 (got {0})")]
    InvalidMaxAttempts(u32),
    #[error("max_delay must be greater than zero")]
    MaxDelayMustBePositive,
    #[error("max_delay ({max:?}) must be >= base_delay ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
    #[error("jitter_fraction must be in [0, 1) (got {0})")]
    InvalidJitterFraction(f64),
    #[error("concurrency_limit must be >= 1")]
    InvalidConcurrencyLimit,
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },
}

/// A batch that could not run to completion.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// The same id was submitted more than once.
    #[error("duplicate resource id in batch: {id}")]
    DuplicateId { id: String },
    /// The batch was cancelled before every resource reached a terminal state.
    #[error("batch cancelled")]
    Cancelled,
}

impl BatchError {
    /// Classification of the batch error at the controller boundary.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Unknown
    }

    pub fn cause(&self) -> FailureCause {
        match self {
            BatchError::DuplicateId { .. } => FailureCause::InvalidBatch,
            BatchError::Cancelled => FailureCause::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_split_is_fixed() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Refused.is_retryable());
        assert!(ErrorKind::Unknown.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::ResourceExhausted.is_retryable());
    }

    #[test]
    fn dominant_picks_most_common() {
        let kinds = [ErrorKind::Refused, ErrorKind::NotFound, ErrorKind::Refused];
        assert_eq!(ErrorKind::dominant(kinds), Some(ErrorKind::Refused));
    }

    #[test]
    fn dominant_breaks_ties_by_declaration_order() {
        let kinds = [
            ErrorKind::Unknown,
            ErrorKind::NotFound,
            ErrorKind::Timeout,
            ErrorKind::Unknown,
            ErrorKind::Timeout,
        ];
        assert_eq!(ErrorKind::dominant(kinds), Some(ErrorKind::Timeout));

        let kinds = [ErrorKind::ResourceExhausted, ErrorKind::Refused];
        assert_eq!(ErrorKind::dominant(kinds), Some(ErrorKind::Refused));
    }

    #[test]
    fn dominant_of_nothing_is_none() {
        assert_eq!(ErrorKind::dominant(std::iter::empty()), None);
    }

    #[test]
    fn ordering_matches_declaration() {
        let mut sorted = ErrorKind::ALL;
        sorted.sort();
        assert_eq!(sorted, ErrorKind::ALL);
        assert!(ErrorKind::Timeout < ErrorKind::Unknown);
    }

    #[test]
    fn display_uses_snake_case() {
        assert_eq!(ErrorKind::ResourceExhausted.to_string(), "resource_exhausted");
        assert_eq!(FailureCause::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn config_error_messages() {
        let err = ConfigError::MaxLessThanBase {
            base: Duration::from_secs(2),
            max: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("must be >= base_delay"));
        assert!(ConfigError::InvalidMaxAttempts(0).to_string().contains("got 0"));
    }

    #[test]
    fn batch_error_classifies_as_unknown() {
        let dup = BatchError::DuplicateId { id: "map".into() };
        assert_eq!(dup.kind(), ErrorKind::Unknown);
        assert_eq!(dup.cause(), FailureCause::InvalidBatch);
        assert_eq!(BatchError::Cancelled.cause(), FailureCause::Cancelled);
        assert!(dup.to_string().contains("map"));
    }
}
