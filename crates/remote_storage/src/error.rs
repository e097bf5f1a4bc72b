use std::fmt::Debug;

/// Marker error used as the root cause of [`DownloadError::Cancelled`] and of ordinary
/// cancellations raised while streaming a download/upload. Callers match on this via
/// [`crate::is_cancellation_error`] rather than on a particular variant, because cancellation
/// can arrive wrapped in an `anyhow::Error` chain built up by several layers of `.context()`.
#[derive(Debug, thiserror::Error)]
#[error("cancelled")]
pub struct TimeoutOrCancel;

/// Errors returned by read-style operations (`list`, `head`, `download`).
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("object not found")]
    NotFound,
    #[error("bad input: {0}")]
    BadInput(anyhow::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DownloadError {
    pub fn is_permanent(&self) -> bool {
        !matches!(self, DownloadError::Cancelled)
    }
}

/// True iff `err` is, or wraps, a cancellation. Cancellation can show up as
/// [`DownloadError::Cancelled`], as an `anyhow::Error` carrying [`TimeoutOrCancel`] in its
/// context chain, or as a [`tokio::task::JoinError`] for a task that was aborted. Aggregate
/// errors built by joining several sub-errors together (see `crate::batch_delete`) are
/// cancellation iff every member is: the predicate unwraps those containers recursively so
/// that this holds regardless of how many layers of `.context()` sit on top.
pub fn is_cancellation_error(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<TimeoutOrCancel>().is_some() {
        return true;
    }
    if matches!(err.downcast_ref::<DownloadError>(), Some(DownloadError::Cancelled)) {
        return true;
    }
    if let Some(join_err) = err.downcast_ref::<tokio::task::JoinError>() {
        return join_err.is_cancelled();
    }
    err.chain()
        .any(|cause| cause.downcast_ref::<TimeoutOrCancel>().is_some())
}
