//! Specialized delete pipeline: distinct from the generic wildcard expander because the
//! storage adapter batches delete requests server-side (`RemoteStore::delete_objects`) rather
//! than each deletion being its own sub-job.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use remote_storage::RemotePath;

use crate::error::Error;
use crate::job::Job;
use crate::log;
use crate::pool::{WorkerContext, WorkerPool};
use crate::stats::OpClass;
use crate::url::Url;

/// Entry point used by the CLI dispatcher directly: this pipeline does not go through the
/// generic wildcard expander or the worker queue, so there is no notifier to await — the
/// dispatcher calls this and awaits its `Result`.
pub async fn dispatch(urls: Vec<Url>, pool: &WorkerPool) -> anyhow::Result<()> {
    pipeline(&urls, &pool.context()).await
}

/// Entry point used when `BatchDelete` is reached as an ordinary `Job` (e.g. as a
/// continuation) rather than via the dispatcher's fast path; delegates to the same pipeline.
pub async fn run(job: &Job, ctx: &WorkerContext) -> anyhow::Result<()> {
    pipeline(&job.args, ctx).await
}

async fn pipeline(urls: &[Url], ctx: &WorkerContext) -> anyhow::Result<()> {
    let bucket = urls
        .first()
        .and_then(|u| u.bucket())
        .ok_or_else(|| Error::Usage("rm requires remote urls for batch delete".into()))?
        .to_string();

    let (tx, rx) = mpsc::unbounded_channel::<RemotePath>();

    let producer = if urls.len() > 1 {
        let keys: Vec<RemotePath> = urls
            .iter()
            .map(|u| {
                u.key()
                    .cloned()
                    .ok_or_else(|| Error::Usage(format!("{u} is not a remote url")))
            })
            .collect::<Result<_, _>>()?;
        tokio::spawn(explicit_producer(tx, keys, ctx.cancel.clone()))
    } else {
        let prefix = urls[0].key().cloned().unwrap_or_else(RemotePath::empty);
        tokio::spawn(listing_producer(tx, ctx.clone(), prefix))
    };

    run_consumer(&bucket, ctx, rx, producer).await
}

async fn explicit_producer(
    tx: mpsc::UnboundedSender<RemotePath>,
    keys: Vec<RemotePath>,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    for key in keys {
        if cancel.is_cancelled() || tx.send(key).is_err() {
            break;
        }
    }
    Ok(())
}

async fn listing_producer(
    tx: mpsc::UnboundedSender<RemotePath>,
    ctx: WorkerContext,
    prefix: RemotePath,
) -> anyhow::Result<()> {
    let listing = ctx.storage.list(&ctx.cancel, Some(&prefix), true, None).await?;
    for entry in listing.entries {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if entry.kind == remote_storage::EntryKind::Dir {
            continue;
        }
        if tx.send(entry.key).is_err() {
            break;
        }
    }
    Ok(())
}

/// Drains `rx` through the storage adapter's streaming `delete_objects`, recording each outcome
/// against `S3Op` stats and logging one success line per deleted key.
async fn run_consumer(
    bucket: &str,
    ctx: &WorkerContext,
    rx: mpsc::UnboundedReceiver<RemotePath>,
    producer: tokio::task::JoinHandle<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let input = UnboundedReceiverStream::new(rx);
    let outcomes = ctx.storage.delete_objects(ctx.cancel.clone(), input);
    tokio::pin!(outcomes);

    let mut failures = Vec::new();
    let mut deleted = 0u64;
    let mut cancelled = 0u64;
    let mut total = 0u64;
    while let Some(outcome) = outcomes.next().await {
        total += 1;
        let key_desc = format!("s3://{bucket}/{}", outcome.key);
        let result: anyhow::Result<()> = outcome.err.map_or(Ok(()), Err);
        ctx.stats.increment_if_success(OpClass::S3Op, &result);
        match result {
            Ok(()) => {
                deleted += 1;
                log::info("rm", &key_desc, None);
            }
            Err(err) if crate::error::is_cancellation_error(&err) => cancelled += 1,
            Err(err) => {
                log::error("rm", &key_desc, &err);
                failures.push(err);
            }
        }
    }

    producer
        .await
        .map_err(|e| anyhow::anyhow!("batch delete producer panicked: {e}"))??;

    if failures.is_empty() && cancelled == 0 {
        Ok(())
    } else if failures.is_empty() {
        // Every non-deleted key was cancelled, not a genuine failure.
        Err(Error::Cancelled.into())
    } else {
        Err(Error::Aggregate {
            succeeded: deleted,
            issued: total,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_storage::{LocalFs, RemoteStore};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn deletes_explicit_list_of_keys() {
        let dir = camino_tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("b")).await.unwrap();
        for name in ["a.txt", "b.txt"] {
            tokio::fs::write(dir.path().join("b").join(name), b"x").await.unwrap();
        }
        let storage = RemoteStore::LocalFs(Arc::new(
            LocalFs::new(dir.path().to_path_buf(), "b".to_string()).unwrap(),
        ));
        let pool = crate::pool::WorkerPool::new(
            1,
            storage,
            Arc::new(crate::stats::Stats::new()),
            CancellationToken::new(),
        );

        let urls = vec![
            Url::parse("s3://b/a.txt").unwrap(),
            Url::parse("s3://b/b.txt").unwrap(),
        ];
        dispatch(urls, &pool).await.unwrap();
        assert!(!dir.path().join("b/a.txt").exists());
        assert!(!dir.path().join("b/b.txt").exists());
        pool.shutdown().await;
    }
}
