//! Maps a parsed CLI command onto root [`Job`]s, seeds the worker pool, and waits for
//! completion. Contains no `clap` attributes itself — those live on [`Cli`]/[`Command`] — only
//! precondition checks and `Job` construction, mirroring how `storage_scrubber`'s dispatcher
//! separates argument parsing from the operations it drives.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use remote_storage::StorageClass;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::job::{Job, JobOutcome, Operation};
use crate::pool::WorkerPool;
use crate::url::Url;

/// Set once at startup from `Cli::json`; read by the log sink to decide whether to also emit a
/// JSON line alongside the human-readable one.
pub static JSON_OUTPUT: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "parxfer", about = "Parallel bulk object-storage operations")]
pub struct Cli {
    /// Emit one JSON record per line in addition to human-readable output.
    #[arg(long, global = true)]
    pub json: bool,

    /// Number of concurrent workers. Defaults to the number of logical CPUs.
    #[arg(short = 'j', long, global = true)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Remove one or more objects or files.
    Rm {
        urls: Vec<String>,
    },
    /// Copy an object/file to a destination.
    Cp {
        #[arg(short = 'R', long = "recursive")]
        recursive: bool,
        #[arg(long = "no-clobber")]
        no_clobber: bool,
        #[arg(long = "if-size-differ")]
        if_size_differ: bool,
        #[arg(long = "if-source-newer")]
        if_source_newer: bool,
        #[arg(long)]
        parents: bool,
        #[arg(long = "storage-class")]
        storage_class: Option<String>,
        source: String,
        destination: String,
    },
    /// Move (copy then delete source) an object/file to a destination.
    Mv {
        #[arg(short = 'R', long = "recursive")]
        recursive: bool,
        source: String,
        destination: String,
    },
    /// List objects under a prefix, or `--buckets` to list buckets.
    Ls {
        #[arg(long)]
        buckets: bool,
        url: Option<String>,
    },
    /// Run an arbitrary command, honouring cancellation.
    Run {
        command: Vec<String>,
    },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    JSON_OUTPUT.store(cli.json, std::sync::atomic::Ordering::Relaxed);

    let workers = cli.workers.unwrap_or_else(num_cpus::get);
    let cancel = CancellationToken::new();
    let stats = Arc::new(crate::stats::Stats::new());

    let storage = build_storage(&cli.command).await?;
    let exit_fn: Arc<dyn Fn(i32) + Send + Sync> = Arc::new(|code| std::process::exit(code));
    let pool = WorkerPool::with_exit_fn(workers, storage, stats.clone(), cancel.clone(), exit_fn);

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    let result = dispatch(&cli.command, &pool).await;
    pool.shutdown().await;
    result
}

/// Picks which bucket the storage adapter is bound to for this invocation: the first remote
/// URL's bucket among the command's arguments. Mixed-bucket operations (e.g. a cross-bucket
/// `cp`) are a known limitation — see DESIGN.md.
async fn build_storage(command: &Command) -> anyhow::Result<remote_storage::RemoteStore> {
    let urls = command_urls(command)?;
    let bucket = urls
        .iter()
        .filter_map(|u| Url::parse(u).ok())
        .find_map(|u| u.bucket().map(|b| b.to_string()));

    match bucket {
        Some(bucket_name) => {
            let config = remote_storage::S3Config {
                bucket_name,
                bucket_region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                endpoint: std::env::var("AWS_ENDPOINT_URL").ok(),
            };
            Ok(remote_storage::RemoteStore::S3(Arc::new(
                remote_storage::S3Bucket::new(&config).await?,
            )))
        }
        None => {
            // No remote URL in this invocation: any local-only command (e.g. `run`, local
            // `cp`/`mv`/`rm`) still needs a storage handle to satisfy `WorkerContext`, so bind
            // a `LocalFs` rooted at `/` purely as an unused placeholder.
            let local = remote_storage::LocalFs::new(Utf8PathBuf::from("/"), "unused".to_string())?;
            Ok(remote_storage::RemoteStore::LocalFs(Arc::new(local)))
        }
    }
}

fn command_urls(command: &Command) -> anyhow::Result<Vec<String>> {
    Ok(match command {
        Command::Rm { urls } => urls.clone(),
        Command::Cp {
            source, destination, ..
        } => vec![source.clone(), destination.clone()],
        Command::Mv {
            source, destination, ..
        } => vec![source.clone(), destination.clone()],
        Command::Ls { url, .. } => url.iter().cloned().collect(),
        Command::Run { .. } => vec![],
    })
}

async fn dispatch(command: &Command, pool: &WorkerPool) -> anyhow::Result<()> {
    match command {
        Command::Rm { urls } => dispatch_rm(urls, pool).await,
        Command::Cp {
            recursive,
            storage_class,
            source,
            destination,
            ..
        } => dispatch_cp(*recursive, storage_class.as_deref(), source, destination, pool).await,
        Command::Mv {
            recursive,
            source,
            destination,
        } => dispatch_mv(*recursive, source, destination, pool).await,
        Command::Ls { buckets, url } => dispatch_ls(*buckets, url.as_deref(), pool).await,
        Command::Run { command } => dispatch_run(command, pool).await,
    }
}

async fn dispatch_rm(urls: &[String], pool: &WorkerPool) -> anyhow::Result<()> {
    if urls.is_empty() {
        return Err(Error::Usage("rm requires at least one url".into()).into());
    }
    let parsed: Vec<Url> = urls
        .iter()
        .map(|u| Url::parse(u))
        .collect::<Result<_, _>>()
        .map_err(|e| Error::Usage(e.to_string()))?;

    if urls.len() > 1 || parsed[0].has_wildcard() {
        crate::batch_delete::dispatch(parsed, pool).await
    } else {
        let url = parsed.into_iter().next().unwrap();
        let op = if url.is_remote() {
            Operation::RemoteDelete
        } else {
            Operation::LocalDelete
        };
        run_single(op, vec![url], None, pool).await
    }
}

async fn dispatch_cp(
    recursive: bool,
    storage_class: Option<&str>,
    source: &str,
    destination: &str,
    pool: &WorkerPool,
) -> anyhow::Result<()> {
    let src = Url::parse(source).map_err(|e| Error::Usage(e.to_string()))?;
    let dst = Url::parse(destination).map_err(|e| Error::Usage(e.to_string()))?;
    let class = parse_storage_class(storage_class)?;

    if recursive || src.has_wildcard() {
        let op = if src.is_remote() {
            Operation::BatchDownload
        } else {
            Operation::BatchUpload
        };
        run_single(op, vec![src, dst], class, pool).await
    } else {
        let op = match (src.is_remote(), dst.is_remote()) {
            (true, false) => Operation::Download,
            (false, true) => Operation::Upload,
            (true, true) => Operation::RemoteCopy,
            (false, false) => Operation::LocalCopy,
        };
        run_single(op, vec![src, dst], class, pool).await
    }
}

async fn dispatch_mv(recursive: bool, source: &str, destination: &str, pool: &WorkerPool) -> anyhow::Result<()> {
    if recursive {
        return Err(Error::Usage("mv does not support recursive wildcard batches".into()).into());
    }
    let src = Url::parse(source).map_err(|e| Error::Usage(e.to_string()))?;
    let dst = Url::parse(destination).map_err(|e| Error::Usage(e.to_string()))?;
    let op = match (src.is_remote(), dst.is_remote()) {
        (true, true) => Operation::RemoteMove,
        (false, false) => Operation::LocalMove,
        _ => return Err(Error::Usage("mv requires both endpoints to be local or both remote".into()).into()),
    };
    run_single(op, vec![src, dst], None, pool).await
}

async fn dispatch_ls(buckets: bool, url: Option<&str>, pool: &WorkerPool) -> anyhow::Result<()> {
    if buckets {
        return run_single(Operation::ListBuckets, vec![], None, pool).await;
    }
    let url = url.ok_or_else(|| Error::Usage("ls requires a url unless --buckets is given".into()))?;
    let url = Url::parse(url).map_err(|e| Error::Usage(e.to_string()))?;
    run_single(Operation::List, vec![url], None, pool).await
}

async fn dispatch_run(command: &[String], pool: &WorkerPool) -> anyhow::Result<()> {
    if command.is_empty() {
        return Err(Error::Usage("run requires a command".into()).into());
    }
    let args: Vec<Url> = command
        .iter()
        .map(|a| Url::Local(Utf8PathBuf::from(a)))
        .collect();
    run_single(Operation::ShellExec, args, None, pool).await
}

fn parse_storage_class(raw: Option<&str>) -> Result<Option<StorageClass>, Error> {
    match raw {
        None => Ok(None),
        Some(s) if s.eq_ignore_ascii_case("standard") => Ok(Some(StorageClass::Standard)),
        Some(s) if s.eq_ignore_ascii_case("archival") || s.eq_ignore_ascii_case("glacier") => {
            Ok(Some(StorageClass::Archival))
        }
        Some(other) => Err(Error::Usage(format!("unknown storage class {other:?}"))),
    }
}

/// Submits a single root job and awaits its completion notifier.
async fn run_single(
    op: Operation,
    args: Vec<Url>,
    class: Option<StorageClass>,
    pool: &WorkerPool,
) -> anyhow::Result<()> {
    let source_desc = args.first().map(|u| u.to_string()).unwrap_or_default();
    let (notifier, mut done) = mpsc::unbounded_channel::<JobOutcome>();
    let mut job = Job::new(source_desc, operation_name(op), op, args)
        .map_err(anyhow::Error::from)?
        .with_storage_class(class);
    job.notifier = Some(notifier);

    pool.submit(job).await?;
    match done.recv().await {
        Some(JobOutcome::Succeeded) => Ok(()),
        Some(JobOutcome::Cancelled) => Err(Error::Cancelled.into()),
        Some(JobOutcome::Failed) | None => Err(Error::Aggregate { succeeded: 0, issued: 1 }.into()),
    }
}

fn operation_name(op: Operation) -> &'static str {
    match op {
        Operation::LocalDelete => "rm",
        Operation::LocalMove => "mv",
        Operation::LocalCopy => "cp",
        Operation::ShellExec => "run",
        Operation::RemoteCopy => "cp",
        Operation::RemoteMove => "mv",
        Operation::RemoteDelete => "rm",
        Operation::BatchDownload => "cp",
        Operation::BatchUpload => "cp",
        Operation::BatchDelete => "rm",
        Operation::Download => "cp",
        Operation::Upload => "cp",
        Operation::ListBuckets => "ls",
        Operation::List => "ls",
        Operation::Abort => "abort",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_rm_with_multiple_urls() {
        let cli = Cli::parse_from(["parxfer", "rm", "s3://b/a", "s3://b/b"]);
        match cli.command {
            Command::Rm { urls } => assert_eq!(urls, vec!["s3://b/a", "s3://b/b"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_cp_flags() {
        let cli = Cli::parse_from(["parxfer", "cp", "-R", "/src", "s3://b/dst"]);
        match cli.command {
            Command::Cp {
                recursive,
                source,
                destination,
                ..
            } => {
                assert!(recursive);
                assert_eq!(source, "/src");
                assert_eq!(destination, "s3://b/dst");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn storage_class_rejects_unknown_value() {
        assert!(parse_storage_class(Some("glacier")).is_ok());
        assert!(parse_storage_class(Some("bogus")).is_err());
    }
}
