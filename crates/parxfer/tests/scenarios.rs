//! End-to-end scenarios against `LocalFs`, exercised through the public job/pool/batch-delete
//! surface rather than live S3 — mirroring `remote_storage`'s own `#[cfg(test)]` style of
//! testing the adapter contract without network access.

use std::sync::Arc;

use camino::Utf8PathBuf;
use remote_storage::{LocalFs, RemoteStore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parxfer::error::Error;
use parxfer::job::{Job, JobOutcome, Operation};
use parxfer::pool::WorkerPool;
use parxfer::stats::{OpClass, Stats};
use parxfer::url::Url;

fn fixture() -> (camino_tempfile::Utf8TempDir, RemoteStore) {
    let dir = camino_tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("b")).unwrap();
    let storage = RemoteStore::LocalFs(Arc::new(
        LocalFs::new(dir.path().to_path_buf(), "b".to_string()).unwrap(),
    ));
    (dir, storage)
}

async fn run_single(pool: &WorkerPool, job: Job) -> anyhow::Result<()> {
    let (notifier, mut done) = mpsc::unbounded_channel::<JobOutcome>();
    let mut job = job;
    job.notifier = Some(notifier);
    pool.submit(job).await.unwrap();
    match done.recv().await {
        Some(JobOutcome::Succeeded) => Ok(()),
        Some(JobOutcome::Cancelled) => Err(Error::Cancelled.into()),
        Some(JobOutcome::Failed) | None => Err(Error::Aggregate { succeeded: 0, issued: 1 }.into()),
    }
}

/// Scenario A: `rm s3://b/a s3://b/b s3://b/c` with all three present.
#[tokio::test]
async fn scenario_a_batch_delete_of_present_keys_succeeds() {
    let (dir, storage) = fixture();
    for name in ["a", "b", "c"] {
        std::fs::write(dir.path().join("b").join(name), b"x").unwrap();
    }
    let stats = Arc::new(Stats::new());
    let pool = WorkerPool::new(2, storage, stats.clone(), CancellationToken::new());

    let urls = vec![
        Url::parse("s3://b/a").unwrap(),
        Url::parse("s3://b/b").unwrap(),
        Url::parse("s3://b/c").unwrap(),
    ];
    parxfer::batch_delete::dispatch(urls, &pool).await.unwrap();

    for name in ["a", "b", "c"] {
        assert!(!dir.path().join("b").join(name).exists());
    }
    assert_eq!(stats.snapshot(OpClass::S3Op), (3, 0));
    pool.shutdown().await;
}

/// Scenario B: wildcard/explicit delete where 2 of 5 keys are missing and fail.
#[tokio::test]
async fn scenario_b_partial_batch_delete_failure_is_aggregate_error() {
    let (dir, storage) = fixture();
    for name in ["k1", "k2", "k3"] {
        std::fs::write(dir.path().join("b").join(name), b"x").unwrap();
    }
    let stats = Arc::new(Stats::new());
    let pool = WorkerPool::new(2, storage, stats.clone(), CancellationToken::new());

    let urls = vec![
        Url::parse("s3://b/k1").unwrap(),
        Url::parse("s3://b/k2").unwrap(),
        Url::parse("s3://b/k3").unwrap(),
        Url::parse("s3://b/missing1").unwrap(),
        Url::parse("s3://b/missing2").unwrap(),
    ];
    let result = parxfer::batch_delete::dispatch(urls, &pool).await;
    let err = result.unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::Aggregate { succeeded, issued }) => {
            assert_eq!(*succeeded, 3);
            assert_eq!(*issued, 5);
        }
        other => panic!("expected Aggregate error, got {other:?}"),
    }
    assert_eq!(stats.snapshot(OpClass::S3Op), (5, 2));
    pool.shutdown().await;
}

/// A single sub-job cancelled via a pre-cancelled token reports `Error::Cancelled` through the
/// same `run_single`/notifier path a wildcard sub-job uses; `expander::finish`'s own unit tests
/// cover how a whole batch of such outcomes collapses into one root-level verdict.
#[tokio::test]
async fn cancelled_subjob_reports_cancelled_not_a_bare_failure() {
    let (dir, storage) = fixture();
    std::fs::write(dir.path().join("b").join("k"), b"x").unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let stats = Arc::new(Stats::new());
    let pool = WorkerPool::new(2, storage, stats.clone(), cancel);

    let dest = dir.path().join("k.local");
    let job = Job::new(
        "s3://b/k",
        "cp",
        Operation::Download,
        vec![Url::parse("s3://b/k").unwrap(), Url::Local(dest)],
    )
    .unwrap();

    let result = run_single(&pool, job).await;
    let err = result.unwrap_err();
    assert!(parxfer::error::is_cancellation_error(&err));
    pool.shutdown().await;
}

/// Scenario C: `cp s3://b/missing /tmp/x` — head fails, no file created at the destination.
#[tokio::test]
async fn scenario_c_download_of_missing_source_creates_no_file() {
    let (dir, storage) = fixture();
    let stats = Arc::new(Stats::new());
    let pool = WorkerPool::new(2, storage, stats.clone(), CancellationToken::new());

    let dest = dir.path().join("x.local");
    let job = Job::new(
        "s3://b/missing",
        "cp",
        Operation::Download,
        vec![Url::parse("s3://b/missing").unwrap(), Url::Local(dest.clone())],
    )
    .unwrap();

    let result = run_single(&pool, job).await;
    assert!(result.is_err());
    assert!(!dest.exists());
    pool.shutdown().await;
}

/// Scenario D: a download cancelled mid-transfer leaves no partial destination file and does
/// not increment the failure counter.
#[tokio::test]
async fn scenario_d_cancelled_download_cleans_up_partial_file() {
    let (dir, storage) = fixture();
    std::fs::write(dir.path().join("b").join("big"), vec![0u8; 1024]).unwrap();
    let stats = Arc::new(Stats::new());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let pool = WorkerPool::new(2, storage, stats.clone(), cancel);

    let dest = dir.path().join("big.local");
    let job = Job::new(
        "s3://b/big",
        "cp",
        Operation::Download,
        vec![Url::parse("s3://b/big").unwrap(), Url::Local(dest.clone())],
    )
    .unwrap();

    let result = run_single(&pool, job).await;
    assert!(result.is_err());
    assert!(!dest.exists());
    assert_eq!(stats.snapshot(OpClass::S3Op).1, 0, "cancellation must not count as a failure");
    pool.shutdown().await;
}

/// Scenario E: batch-upload over an empty source directory is a zero-issued success.
#[tokio::test]
async fn scenario_e_batch_upload_of_empty_directory_is_zero_issued_success() {
    let (dir, storage) = fixture();
    let empty_src = dir.path().join("empty");
    std::fs::create_dir_all(&empty_src).unwrap();
    let stats = Arc::new(Stats::new());
    let pool = WorkerPool::new(2, storage, stats.clone(), CancellationToken::new());

    let job = Job::new(
        empty_src.to_string(),
        "cp",
        Operation::BatchUpload,
        vec![
            Url::Local(Utf8PathBuf::from(empty_src.as_str())),
            Url::parse("s3://b/dst/").unwrap(),
        ],
    )
    .unwrap();

    let result = run_single(&pool, job).await;
    assert!(result.is_ok());
    pool.shutdown().await;
}

/// Scenario F: a glob matching nothing fails with a distinct "no match" error.
#[tokio::test]
async fn scenario_f_glob_matching_nothing_is_distinct_no_match_error() {
    let (dir, storage) = fixture();
    let stats = Arc::new(Stats::new());
    let pool = WorkerPool::new(2, storage, stats.clone(), CancellationToken::new());

    let src = dir.path().join("nothing-here-*.csv");
    let job = Job::new(
        src.to_string(),
        "cp",
        Operation::BatchUpload,
        vec![Url::Local(Utf8PathBuf::from(src.as_str())), Url::parse("s3://b/dst/").unwrap()],
    )
    .unwrap();

    let result = run_single(&pool, job).await;
    let err = result.unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NoMatch(_))));
    pool.shutdown().await;
}
