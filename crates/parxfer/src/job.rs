//! A `Job` is an immutable description of one unit of work: an operation tag, an argument
//! vector of [`Url`]s, optional success/failure continuations, and an optional completion
//! notifier. `Job::execute` is a pure dispatch on `operation` via an exhaustive match, so an
//! unrecognised operation is a compile-time impossibility rather than a runtime default branch.

use camino::Utf8PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use remote_storage::{RemotePath, StorageClass};

use crate::error::Error;
use crate::expander::wild_operation;
use crate::log;
use crate::pool::WorkerContext;
use crate::stats::OpClass;
use crate::url::Url;

/// Continuation chains (`on_success`/`on_failure`) are acyclic by construction; rather than a
/// general cycle check, construction enforces this depth ceiling. In practice chains never
/// exceed 2 (copy -> delete for a move).
pub const MAX_CONTINUATION_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    LocalDelete,
    LocalMove,
    LocalCopy,
    ShellExec,
    RemoteCopy,
    RemoteMove,
    RemoteDelete,
    BatchDownload,
    BatchUpload,
    BatchDelete,
    Download,
    Upload,
    ListBuckets,
    List,
    Abort,
}

impl Operation {
    /// `None` means variable arity (checked separately by the operation's own handler).
    fn fixed_arity(self) -> Option<usize> {
        use Operation::*;
        match self {
            LocalDelete | RemoteDelete => Some(1),
            LocalMove | LocalCopy | RemoteCopy | RemoteMove | Download | Upload | BatchDownload
            | BatchUpload => Some(2),
            List => Some(1),
            ListBuckets => Some(0),
            ShellExec | BatchDelete => None,
            Abort => None,
        }
    }

    pub fn op_class(self) -> OpClass {
        use Operation::*;
        match self {
            LocalDelete | LocalMove | LocalCopy => OpClass::FileOp,
            ShellExec => OpClass::ShellOp,
            RemoteCopy | RemoteMove | RemoteDelete | BatchDownload | BatchUpload | BatchDelete
            | Download | Upload | ListBuckets | List => OpClass::S3Op,
            Abort => OpClass::ShellOp,
        }
    }
}

/// A sub-job's terminal outcome as reported to its notifier. Kept distinct from a plain `bool`
/// so a cancelled sub-job can be told apart from a genuinely failed one without re-inspecting
/// its `anyhow::Result` (which the notifier channel doesn't carry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Cancelled,
    Failed,
}

impl JobOutcome {
    pub fn from_result<T>(result: &anyhow::Result<T>) -> Self {
        match result {
            Ok(_) => JobOutcome::Succeeded,
            Err(err) if crate::error::is_cancellation_error(err) => JobOutcome::Cancelled,
            Err(_) => JobOutcome::Failed,
        }
    }
}

pub struct Job {
    pub source_desc: String,
    pub command: String,
    pub operation: Operation,
    pub args: Vec<Url>,
    pub storage_class: Option<StorageClass>,
    pub on_success: Option<Box<Job>>,
    pub on_failure: Option<Box<Job>>,
    pub notifier: Option<mpsc::UnboundedSender<JobOutcome>>,
    depth: usize,
}

impl Job {
    pub fn new(
        source_desc: impl Into<String>,
        command: impl Into<String>,
        operation: Operation,
        args: Vec<Url>,
    ) -> Result<Self, Error> {
        if let Some(arity) = operation.fixed_arity() {
            if args.len() != arity {
                return Err(Error::Invariant(format!(
                    "{operation:?} expects {arity} argument(s), got {}",
                    args.len()
                )));
            }
        } else if matches!(operation, Operation::ShellExec) && args.is_empty() {
            return Err(Error::Invariant("ShellExec requires at least one argument".into()));
        }
        Ok(Self {
            source_desc: source_desc.into(),
            command: command.into(),
            operation,
            args,
            storage_class: None,
            on_success: None,
            on_failure: None,
            notifier: None,
            depth: 0,
        })
    }

    pub fn with_storage_class(mut self, class: Option<StorageClass>) -> Self {
        self.storage_class = class;
        self
    }

    pub fn with_continuations(
        mut self,
        on_success: Option<Job>,
        on_failure: Option<Job>,
    ) -> Result<Self, Error> {
        let child_depth = self.depth + 1;
        if child_depth > MAX_CONTINUATION_DEPTH {
            return Err(Error::Invariant(format!(
                "continuation chain exceeds max depth {MAX_CONTINUATION_DEPTH}"
            )));
        }
        self.on_success = on_success.map(|mut j| {
            j.depth = child_depth;
            Box::new(j)
        });
        self.on_failure = on_failure.map(|mut j| {
            j.depth = child_depth;
            Box::new(j)
        });
        Ok(self)
    }

    fn remote_key(url: &Url) -> Result<&RemotePath, Error> {
        url.key()
            .ok_or_else(|| Error::Invariant(format!("expected remote url, got {url}")))
    }

    fn local_path(url: &Url) -> Result<&camino::Utf8Path, Error> {
        url.as_local_path()
            .ok_or_else(|| Error::Invariant(format!("expected local path, got {url}")))
    }

    /// Executes this job's own operation (not its continuations). The worker pool evaluates
    /// `on_success`/`on_failure` and signals `notifier` after this returns.
    pub async fn execute(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        match self.operation {
            Operation::LocalDelete => self.local_delete().await,
            Operation::LocalMove => self.local_move().await,
            Operation::LocalCopy => self.local_copy().await,
            Operation::ShellExec => self.shell_exec(ctx).await,
            Operation::RemoteCopy => self.remote_copy(ctx).await,
            Operation::RemoteMove => self.remote_move(ctx).await,
            Operation::RemoteDelete => self.remote_delete(ctx).await,
            Operation::Download => self.download(ctx).await,
            Operation::Upload => self.upload(ctx).await,
            Operation::List => self.list(ctx).await,
            Operation::ListBuckets => self.list_buckets(ctx).await,
            Operation::BatchDownload => self.batch_download(ctx).await,
            Operation::BatchUpload => self.batch_upload(ctx).await,
            Operation::BatchDelete => crate::batch_delete::run(self, ctx).await,
            Operation::Abort => self.abort(ctx).await,
        }
    }

    async fn local_delete(&self) -> anyhow::Result<()> {
        let path = Self::local_path(&self.args[0])?;
        tokio::fs::remove_file(path).await?;
        log::info(&self.command, &self.source_desc, None);
        Ok(())
    }

    async fn local_move(&self) -> anyhow::Result<()> {
        let src = Self::local_path(&self.args[0])?;
        let dst = Self::local_path(&self.args[1])?;
        match tokio::fs::rename(src, dst).await {
            Ok(()) => {}
            // EXDEV: rename across filesystems isn't supported by the OS, fall back to copy+remove.
            Err(e) if e.raw_os_error() == Some(EXDEV) => {
                tokio::fs::copy(src, dst).await?;
                tokio::fs::remove_file(src).await?;
            }
            Err(e) => return Err(e.into()),
        }
        log::info(&self.command, &self.source_desc, Some(dst.as_str()));
        Ok(())
    }

    async fn local_copy(&self) -> anyhow::Result<()> {
        let src = Self::local_path(&self.args[0])?;
        let dst = Self::local_path(&self.args[1])?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src, dst).await?;
        log::info(&self.command, &self.source_desc, Some(dst.as_str()));
        Ok(())
    }

    async fn shell_exec(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let program = Self::local_path(&self.args[0])?;
        let rest: Vec<&str> = self.args[1..]
            .iter()
            .map(|u| Self::local_path(u).map(|p| p.as_str()))
            .collect::<Result<_, _>>()?;
        let mut child = tokio::process::Command::new(program.as_str()).args(rest).spawn()?;
        let status = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(Error::Cancelled.into());
            }
            status = child.wait() => status?,
        };
        if !status.success() {
            anyhow::bail!("command exited with {status}");
        }
        log::info(&self.command, &self.source_desc, None);
        Ok(())
    }

    async fn remote_copy(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let src = Self::remote_key(&self.args[0])?;
        let dst = Self::remote_key(&self.args[1])?;
        ctx.storage
            .copy(&ctx.cancel, src, dst, self.storage_class)
            .await?;
        log::info(&self.command, &self.source_desc, Some(&self.args[1].to_string()));
        Ok(())
    }

    async fn remote_move(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let src = Self::remote_key(&self.args[0])?;
        let dst = Self::remote_key(&self.args[1])?;
        ctx.storage
            .copy(&ctx.cancel, src, dst, self.storage_class)
            .await?;
        // No rollback if this delete fails: the copy has already landed and is surfaced as a
        // successful move from the user's point of view except for the trailing error.
        ctx.storage.delete(&ctx.cancel, src).await?;
        log::info(&self.command, &self.source_desc, Some(&self.args[1].to_string()));
        Ok(())
    }

    async fn remote_delete(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let key = Self::remote_key(&self.args[0])?;
        ctx.storage.delete(&ctx.cancel, key).await?;
        log::info(&self.command, &self.source_desc, None);
        Ok(())
    }

    async fn download(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let key = Self::remote_key(&self.args[0])?;
        let dst = Self::local_path(&self.args[1])?;
        ctx.storage.head(&ctx.cancel, key).await?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dst).await?;
        let result = ctx.storage.download(&ctx.cancel, key, &mut file, None).await;
        if let Err(e) = result {
            let _ = file.shutdown().await;
            let _ = tokio::fs::remove_file(dst).await;
            return Err(e.into());
        }
        log::info(&self.command, &self.source_desc, Some(dst.as_str()));
        Ok(())
    }

    async fn upload(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let src = Self::local_path(&self.args[0])?;
        let dst = Self::remote_key(&self.args[1])?;
        let meta = tokio::fs::metadata(src).await?;
        let mut file = tokio::fs::File::open(src).await?;
        ctx.storage
            .upload(&ctx.cancel, &mut file, meta.len(), dst, self.storage_class, None)
            .await?;
        log::info(&self.command, &self.source_desc, Some(&self.args[1].to_string()));
        Ok(())
    }

    async fn list(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let source = self.args[0].clone();
        if source.is_remote() {
            let prefix = source.key().cloned();
            let listing = ctx.storage.list(&ctx.cancel, prefix.as_ref(), false, None).await?;
            for entry in listing.entries {
                log::list_entry(&entry);
            }
            Ok(())
        } else {
            let root = Self::local_path(&source)?.to_path_buf();
            let mut entries = tokio::fs::read_dir(&root).await?;
            while let Some(entry) = entries.next_entry().await? {
                println!("{}", entry.path().display());
            }
            Ok(())
        }
    }

    async fn list_buckets(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let buckets = ctx.storage.list_buckets(&ctx.cancel).await?;
        for bucket in buckets {
            println!("{}", bucket.name);
        }
        Ok(())
    }

    async fn batch_download(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let source = self.args[0].clone();
        let dest_root = Self::local_path(&self.args[1])?.to_path_buf();
        let prefix = source.dir();
        let pattern = glob::Pattern::new(source.base()).ok();
        let command = self.command.clone();
        let listing_key = source.key().cloned();

        let storage = ctx.storage.clone();
        let cancel = ctx.cancel.clone();
        wild_operation(
            ctx,
            move |tx| async move {
                let listing = storage.list(&cancel, listing_key.as_ref(), true, None).await?;
                for entry in listing.entries {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if entry.kind == remote_storage::EntryKind::Dir {
                        continue;
                    }
                    if let Some(pattern) = &pattern {
                        let relative = entry
                            .key
                            .strip_prefix(&prefix.key().cloned().unwrap_or_else(RemotePath::empty))
                            .map(|p| p.as_str().to_string())
                            .unwrap_or_else(|_| entry.key.as_str().to_string());
                        if !pattern.matches(&relative) && !pattern.matches(entry.key.as_str()) {
                            continue;
                        }
                    }
                    let _ = tx.send(entry);
                }
                Ok(())
            },
            move |entry: remote_storage::ListingEntry| {
                if entry.storage_class.is_archival() {
                    log::warning(&command, &format!("skipping archival object {}", entry.key));
                    return None;
                }
                let bucket = source.bucket()?.to_string();
                let rel = entry
                    .key
                    .strip_prefix(&source.key().cloned().unwrap_or_else(RemotePath::empty))
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_else(|_| entry.key.as_str().to_string());
                let dest = dest_root.join(&rel);
                Job::new(
                    entry.key.to_string(),
                    command.clone(),
                    Operation::Download,
                    vec![
                        Url::Remote {
                            bucket,
                            key: entry.key.clone(),
                        },
                        Url::Local(dest),
                    ],
                )
                .ok()
            },
        )
        .await
    }

    async fn batch_upload(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let source = self.args[0].clone();
        let dest = self.args[1].clone();
        let storage_class = self.storage_class;
        let command = self.command.clone();
        let (root, pattern) = split_glob(Self::local_path(&source)?);

        let files = walk_matching(&root, pattern.as_deref())?;
        // A glob that matches nothing is a usage mistake; a plain recursive copy of an empty
        // directory is legitimate and falls through to the expander's zero-issued success.
        if files.is_empty() && pattern.is_some() {
            return Err(Error::NoMatch(source.to_string()).into());
        }

        wild_operation(
            ctx,
            move |tx| async move {
                for file in files {
                    let _ = tx.send(file);
                }
                Ok(())
            },
            move |file: (Utf8PathBuf, Utf8PathBuf)| {
                let (abs_path, rel_path) = file;
                let dst = dest.join(&rel_path);
                Job::new(abs_path.to_string(), command.clone(), Operation::Upload, vec![
                    Url::Local(abs_path),
                    dst,
                ])
                .ok()
                .map(|j| j.with_storage_class(storage_class))
            },
        )
        .await
    }

    async fn abort(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let code = match self.args.first() {
            None => -1,
            Some(url) => Self::local_path(url)
                .ok()
                .and_then(|p| p.as_str().parse::<i32>().ok())
                .unwrap_or(255),
        };
        (ctx.exit_fn)(code);
        Ok(())
    }
}

const EXDEV: i32 = 18;

/// Splits a local source argument into its non-glob root directory and an optional glob
/// pattern relative to that root, e.g. `/data/*.csv` -> (`/data`, Some("*.csv")).
fn split_glob(path: &camino::Utf8Path) -> (Utf8PathBuf, Option<String>) {
    if path.as_str().contains(['*', '?', '[']) {
        let root = path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
        let pattern = path.file_name().unwrap_or_default().to_string();
        (root, Some(pattern))
    } else {
        (path.to_path_buf(), None)
    }
}

/// Walks `root`, returning `(absolute_path, path_relative_to_root)` pairs for every regular
/// file, optionally filtered by a glob pattern matched against the file name.
fn walk_matching(
    root: &camino::Utf8Path,
    pattern: Option<&str>,
) -> anyhow::Result<Vec<(Utf8PathBuf, Utf8PathBuf)>> {
    let pattern = pattern.map(glob::Pattern::new).transpose()?;
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let abs = Utf8PathBuf::try_from(entry.path().to_path_buf())?;
        let rel = abs.strip_prefix(root).unwrap_or(&abs).to_path_buf();
        if let Some(pattern) = &pattern {
            if !pattern.matches(rel.file_name().unwrap_or(rel.as_str())) {
                continue;
            }
        }
        out.push((abs, rel));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_arity() {
        let err = Job::new("x", "rm", Operation::RemoteDelete, vec![]).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn continuation_depth_is_bounded() {
        let mut job = Job::new(
            "x",
            "mv",
            Operation::RemoteDelete,
            vec![Url::parse("s3://b/k").unwrap()],
        )
        .unwrap();
        for _ in 0..MAX_CONTINUATION_DEPTH {
            let child = Job::new(
                "x",
                "mv",
                Operation::RemoteDelete,
                vec![Url::parse("s3://b/k").unwrap()],
            )
            .unwrap();
            job = job.with_continuations(Some(child), None).unwrap();
            job = *job.on_success.take().unwrap();
        }
        let overflow = Job::new(
            "x",
            "mv",
            Operation::RemoteDelete,
            vec![Url::parse("s3://b/k").unwrap()],
        )
        .unwrap();
        assert!(job.with_continuations(Some(overflow), None).is_err());
    }

    #[test]
    fn split_glob_separates_root_and_pattern() {
        let (root, pattern) = split_glob(camino::Utf8Path::new("/data/sub/*.csv"));
        assert_eq!(root.as_str(), "/data/sub");
        assert_eq!(pattern.as_deref(), Some("*.csv"));

        let (root, pattern) = split_glob(camino::Utf8Path::new("/data/sub"));
        assert_eq!(root.as_str(), "/data/sub");
        assert_eq!(pattern, None);
    }
}
