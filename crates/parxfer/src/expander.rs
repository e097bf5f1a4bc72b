//! Generic two-stage wildcard expansion pipeline shared by `List`, `BatchDownload` and
//! `BatchUpload`. A caller-supplied lister produces opaque items on an unbounded channel; a
//! caller-supplied mapper turns each item into an optional sub-job; a tracking stage counts
//! completions via a notifier channel cloned onto every issued sub-job; the join stage waits
//! for the count to settle and reports a single pass/fail verdict.
//!
//! Sentinel-free by construction: end-of-listing is the lister's sender going out of scope, not
//! a payload value multiplexed onto the item channel.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Error;
use crate::job::{Job, JobOutcome};
use crate::pool::WorkerContext;

/// Runs the full listing -> expansion -> tracking -> join pipeline.
///
/// `lister` receives the item sender and is responsible for dropping it on every exit path
/// (success, error, cancellation); `mapper` turns an item into an optional `Job` to submit —
/// returning `None` means "skip, not issued".
pub async fn wild_operation<T, Lister, ListFut, Mapper>(
    ctx: &WorkerContext,
    lister: Lister,
    mapper: Mapper,
) -> anyhow::Result<()>
where
    T: Send + 'static,
    Lister: FnOnce(mpsc::UnboundedSender<T>) -> ListFut + Send + 'static,
    ListFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    Mapper: Fn(T) -> Option<Job> + Send + 'static,
{
    let (item_tx, mut item_rx) = mpsc::unbounded_channel::<T>();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<JobOutcome>();

    let listing = tokio::spawn(lister(item_tx));

    let cancel = ctx.cancel.clone();
    let submit = ctx.submit.clone();
    let issued = Arc::new(AtomicU64::new(0));
    let issued_in_expansion = issued.clone();
    let expansion = tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = item_rx.recv() => item,
            };
            let Some(item) = item else { break };
            let Some(mut job) = mapper(item) else { continue };
            job.notifier = Some(done_tx.clone());
            issued_in_expansion.fetch_add(1, Ordering::Relaxed);
            if submit.send(job).await.is_err() {
                break;
            }
        }
        // `done_tx` (and its captured clone) drop here, releasing the tracking stage's extra
        // reference; the channel only fully closes once every issued sub-job's own clone is
        // also dropped.
    });

    let tracking = tokio::spawn(async move {
        let mut processed = 0u64;
        let mut succeeded = 0u64;
        let mut cancelled = 0u64;
        while let Some(outcome) = done_rx.recv().await {
            processed += 1;
            match outcome {
                JobOutcome::Succeeded => succeeded += 1,
                JobOutcome::Cancelled => cancelled += 1,
                JobOutcome::Failed => {}
            }
        }
        (processed, succeeded, cancelled)
    });

    let listing_result = listing
        .await
        .map_err(|e| anyhow::anyhow!("listing task panicked: {e}"))?;
    expansion
        .await
        .map_err(|e| anyhow::anyhow!("expansion task panicked: {e}"))?;
    let (processed, succeeded, cancelled) = tracking
        .await
        .map_err(|e| anyhow::anyhow!("tracking task panicked: {e}"))?;
    let total_issued = issued.load(Ordering::Relaxed);

    if processed != total_issued {
        return Err(Error::Invariant(format!(
            "expander processed {processed} but issued {total_issued}"
        ))
        .into());
    }

    listing_result?;

    finish(succeeded, cancelled, total_issued)
}

/// Turns a tracking stage's tallies into the expansion's verdict. Split out from
/// `wild_operation` so the decision itself — as opposed to the concurrency around it — can be
/// exercised directly.
fn finish(succeeded: u64, cancelled: u64, total_issued: u64) -> anyhow::Result<()> {
    if total_issued == 0 {
        return Ok(());
    }
    if succeeded == total_issued {
        Ok(())
    } else if succeeded + cancelled == total_issued {
        // Every non-succeeded sub-job was cancelled, not genuinely failed: this is cancellation
        // of the whole batch, not a partial failure.
        Err(Error::Cancelled.into())
    } else {
        Err(Error::Aggregate {
            succeeded,
            issued: total_issued,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Operation;
    use crate::pool::{Stats, WorkerPool};
    use crate::url::Url;
    use remote_storage::{LocalFs, RemoteStore};
    use std::sync::Arc as StdArc;
    use tokio_util::sync::CancellationToken;

    async fn test_ctx() -> (WorkerPool, WorkerContext) {
        let dir = camino_tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("b")).await.unwrap();
        let storage = RemoteStore::LocalFs(StdArc::new(
            LocalFs::new(dir.path().to_path_buf(), "b".to_string()).unwrap(),
        ));
        std::mem::forget(dir);
        let pool = WorkerPool::new(2, storage, StdArc::new(Stats::new()), CancellationToken::new());
        let ctx = pool.context();
        (pool, ctx)
    }

    #[tokio::test]
    async fn zero_issued_with_successful_listing_is_success() {
        let (pool, ctx) = test_ctx().await;
        let result = wild_operation::<i32, _, _, _>(
            &ctx,
            |tx| async move {
                drop(tx);
                Ok(())
            },
            |_| None,
        )
        .await;
        assert!(result.is_ok());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn listing_failure_short_circuits_with_error() {
        let (pool, ctx) = test_ctx().await;
        let result = wild_operation::<i32, _, _, _>(
            &ctx,
            |tx| async move {
                drop(tx);
                anyhow::bail!("listing blew up")
            },
            |_| None,
        )
        .await;
        assert!(result.is_err());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn all_succeeding_sub_jobs_report_success() {
        let (pool, ctx) = test_ctx().await;
        let result = wild_operation(
            &ctx,
            |tx| async move {
                for i in 0..3 {
                    let _ = tx.send(i);
                }
                Ok(())
            },
            |i: i32| {
                Some(
                    Job::new(
                        format!("item-{i}"),
                        "test".to_string(),
                        Operation::Abort,
                        vec![Url::Local(camino::Utf8PathBuf::new())],
                    )
                    .unwrap(),
                )
            },
        )
        .await;
        assert!(result.is_ok());
        pool.shutdown().await;
    }

    #[test]
    fn finish_is_ok_when_all_issued_succeed() {
        assert!(finish(3, 0, 3).is_ok());
    }

    #[test]
    fn finish_is_ok_with_zero_issued() {
        assert!(finish(0, 0, 0).is_ok());
    }

    #[test]
    fn finish_collapses_to_cancelled_when_every_non_success_was_cancelled() {
        let err = finish(0, 3, 3).unwrap_err();
        assert!(crate::error::is_cancellation_error(&err));
    }

    #[test]
    fn finish_is_aggregate_when_a_genuine_failure_is_mixed_in() {
        let err = finish(1, 1, 3).unwrap_err();
        assert!(!crate::error::is_cancellation_error(&err));
        match err.downcast_ref::<Error>() {
            Some(Error::Aggregate { succeeded, issued }) => {
                assert_eq!(*succeeded, 1);
                assert_eq!(*issued, 3);
            }
            other => panic!("expected Aggregate, got {other:?}"),
        }
    }
}
