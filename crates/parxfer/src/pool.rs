//! Fixed-size worker pool draining a bounded job queue. Each worker is a tokio task looping on
//! a shared receiver; jobs are load-balanced across workers rather than round-robined, since
//! all of them pull from the same `Arc<Mutex<Receiver<Job>>>`.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub use crate::stats::Stats;
use crate::job::Job;
use remote_storage::RemoteStore;

/// Default bound on the job queue: a runaway wildcard expander backpressures on submission
/// rather than growing memory without limit.
pub const QUEUE_CAPACITY_PER_WORKER: usize = 64;

/// Per-worker view of process-wide state, threaded explicitly rather than reached for through
/// statics: the cancellation root, the shared storage client, the stats table and a handle to
/// resubmit continuation/sub-jobs onto the same queue.
#[derive(Clone)]
pub struct WorkerContext {
    pub cancel: CancellationToken,
    pub storage: RemoteStore,
    pub stats: Arc<Stats>,
    pub submit: mpsc::Sender<Job>,
    pub exit_fn: Arc<dyn Fn(i32) + Send + Sync>,
}

pub struct WorkerPool {
    submit: mpsc::Sender<Job>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    context_template: WorkerContext,
}

impl WorkerPool {
    pub fn new(workers: usize, storage: RemoteStore, stats: Arc<Stats>, cancel: CancellationToken) -> Self {
        Self::with_exit_fn(workers, storage, stats, cancel, Arc::new(|_code| {}))
    }

    pub fn with_exit_fn(
        workers: usize,
        storage: RemoteStore,
        stats: Arc<Stats>,
        cancel: CancellationToken,
        exit_fn: Arc<dyn Fn(i32) + Send + Sync>,
    ) -> Self {
        let workers = workers.max(1);
        let (submit, receiver) = mpsc::channel::<Job>(workers * QUEUE_CAPACITY_PER_WORKER);
        let receiver = Arc::new(Mutex::new(receiver));

        let context_template = WorkerContext {
            cancel,
            storage,
            stats,
            submit: submit.clone(),
            exit_fn,
        };

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let receiver = receiver.clone();
            let ctx = context_template.clone();
            handles.push(tokio::spawn(worker_loop(id, receiver, ctx)));
        }

        Self {
            submit,
            handles,
            context_template,
        }
    }

    pub fn context(&self) -> WorkerContext {
        self.context_template.clone()
    }

    pub async fn submit(&self, job: Job) -> anyhow::Result<()> {
        self.submit
            .send(job)
            .await
            .map_err(|_| anyhow::anyhow!("job queue closed"))
    }

    /// Closes the queue and waits for every worker to drain and exit.
    pub async fn shutdown(self) {
        let WorkerPool { submit, handles, .. } = self;
        drop(submit);
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(_id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>, ctx: WorkerContext) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else { break };
        run_one(job, &ctx).await;
    }
}

/// Executes one job to completion, then evaluates its continuations and signals its notifier —
/// the three steps the worker pool is responsible for around `Job::execute`'s pure dispatch.
async fn run_one(job: Job, ctx: &WorkerContext) {
    let class = job.operation.op_class();
    let result = job.execute(ctx).await;
    ctx.stats.increment_if_success(class, &result);

    if !crate::error::is_cancellation_error_result(&result) {
        crate::log::job_result(&job.command, &job.source_desc, &result);
    }

    let outcome = crate::job::JobOutcome::from_result(&result);
    let continuation = if result.is_ok() { job.on_success } else { job.on_failure };
    if let Some(continuation) = continuation {
        // Best-effort: if the queue is already closed (shutdown in progress) the continuation
        // is simply dropped, which is the same outcome as never having issued it.
        let _ = ctx.submit.send(*continuation).await;
    }

    if let Some(notifier) = job.notifier {
        let _ = notifier.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Operation;
    use crate::url::Url;
    use remote_storage::LocalFs;

    #[tokio::test]
    async fn pool_executes_submitted_job() {
        let dir = camino_tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("b")).await.unwrap();
        let storage = RemoteStore::LocalFs(Arc::new(
            LocalFs::new(dir.path().to_path_buf(), "b".to_string()).unwrap(),
        ));
        let pool = WorkerPool::new(2, storage, Arc::new(Stats::new()), CancellationToken::new());

        let path = dir.path().join("b/file.txt");
        tokio::fs::write(&path, b"hi").await.unwrap();

        let job = Job::new(
            path.to_string(),
            "rm".to_string(),
            Operation::LocalDelete,
            vec![Url::Local(path.clone())],
        )
        .unwrap();
        pool.submit(job).await.unwrap();
        pool.shutdown().await;
        assert!(!path.exists());
    }
}
