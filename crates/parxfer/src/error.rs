//! Named error kinds callers pattern-match on. Ad hoc failures (an individual storage
//! operation failing, a filesystem error) are carried as `anyhow::Error` instead; this enum
//! exists only for the handful of error kinds the dispatcher and tests need to distinguish.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation observed cancellation. Never aggregated into failure counts, never logged
    /// as an error.
    #[error("cancelled")]
    Cancelled,

    /// A precondition on command arguments (count, kind, flag combination) failed before any
    /// job was created.
    #[error("usage error: {0}")]
    Usage(String),

    /// A fatal invariant violation: job arity mismatch, continuation DAG too deep, and similar
    /// "this should be impossible" conditions.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A glob or directory expansion matched zero entries when at least one was required.
    #[error("no match: {0}")]
    NoMatch(String),

    /// The aggregate outcome of a wildcard expansion: `succeeded` out of `issued` sub-jobs
    /// completed successfully.
    #[error("{succeeded}/{issued} succeeded")]
    Aggregate { succeeded: u64, issued: u64 },
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Distinguishes cancellation from genuine failure, unwrapping `anyhow::Error` chains the way
/// `remote_storage::is_cancellation_error` does for the storage adapter's own errors.
pub fn is_cancellation_error(err: &anyhow::Error) -> bool {
    if let Some(e) = err.downcast_ref::<Error>() {
        return e.is_cancelled();
    }
    remote_storage::is_cancellation_error(err)
}

pub fn is_cancellation_error_result<T>(result: &anyhow::Result<T>) -> bool {
    result.as_ref().err().is_some_and(is_cancellation_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_cancelled_variant() {
        let err: anyhow::Error = Error::Cancelled.into();
        assert!(is_cancellation_error(&err));
    }

    #[test]
    fn does_not_flag_other_variants() {
        let err: anyhow::Error = Error::Usage("bad args".into()).into();
        assert!(!is_cancellation_error(&err));
    }
}
