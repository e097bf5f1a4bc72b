//! A set of generic storage abstractions for the CLI's job engine to use when listing,
//! copying, uploading, downloading and deleting objects against a remote, S3-like store.
//! No other crate is supposed to reach past [`RemoteStorage`] into a concrete backend.
//!
//! [`RemoteStorage`] is a CRUD-like generic trait with two concrete implementations:
//!   * [`local_fs`] treats a local directory tree as a remote store (used for tests and for
//!     exercising the job engine without network access)
//!   * [`s3_bucket`] talks to a real S3-compatible bucket via `aws-sdk-s3`
#![deny(unsafe_code)]

mod config;
mod error;
mod local_fs;
mod s3_bucket;
mod simulate_failures;

use std::{fmt::Debug, num::NonZeroU32, pin::Pin, sync::Arc, time::SystemTime};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

pub use config::S3Config;
pub use error::{is_cancellation_error, DownloadError, TimeoutOrCancel};
pub use local_fs::LocalFs;
pub use s3_bucket::S3Bucket;
pub use simulate_failures::UnreliableWrapper;

/// As defined in the S3 bulk-delete API.
pub const MAX_KEYS_PER_DELETE: usize = 1000;

/// Key of an object, relative to whatever bucket/prefix it lives under. Always a relative
/// UTF-8 path using `/` as the separator; never carries a scheme or bucket name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemotePath(Utf8PathBuf);

impl RemotePath {
    pub fn new(relative: &str) -> anyhow::Result<Self> {
        let path = Utf8Path::new(relative);
        anyhow::ensure!(path.is_relative(), "key {relative:?} is not relative");
        Ok(Self(path.to_path_buf()))
    }

    pub fn empty() -> Self {
        Self(Utf8PathBuf::new())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn object_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn join(&self, suffix: impl AsRef<Utf8Path>) -> Self {
        Self(self.0.join(suffix))
    }

    pub fn strip_prefix(&self, p: &RemotePath) -> Result<&Utf8Path, std::path::StripPrefixError> {
        self.0.strip_prefix(&p.0)
    }
}

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Coarse S3 storage class, collapsed down to the handful of tiers this crate cares about:
/// `Standard` is downloadable immediately, `Archival` requires an out-of-band restore first
/// (see `BatchDownload`'s skip-on-archival policy) and `Other` covers everything else (e.g.
/// reduced redundancy), which behaves like `Standard` for our purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageClass {
    Standard,
    Archival,
    Other,
}

impl StorageClass {
    pub fn is_archival(&self) -> bool {
        matches!(self, StorageClass::Archival)
    }
}

/// One entry produced by a [`RemoteStorage::list`] call.
#[derive(Debug, Clone)]
pub struct ListingEntry {
    pub key: RemotePath,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: SystemTime,
    pub storage_class: StorageClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    /// A common-prefix entry: a "directory" synthesized from the delimiter, not a real object.
    Dir,
}

pub struct Listing {
    pub entries: Vec<ListingEntry>,
}

#[derive(Debug, Clone)]
pub struct BucketInfo {
    pub name: String,
    pub created: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ObjectStat {
    pub size: u64,
    pub modified: SystemTime,
    pub storage_class: StorageClass,
}

/// Outcome of one key in a bulk-delete request.
#[derive(Debug)]
pub struct DeleteOutcome {
    pub key: RemotePath,
    pub err: Option<anyhow::Error>,
}

pub type DownloadStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Called with the number of bytes transferred in the most recent chunk of a download or
/// upload. The CLI binary does not wire this up to anything (progress bars are explicitly out
/// of scope) but the hook exists so tests and future callers can observe byte counts.
pub type ProgressFn = dyn Fn(u64) + Send + Sync;

/// Storage (potentially remote) API to manage objects under a single bucket. This trait tries
/// to stay unaware of any layered job-engine context, providing basic CRUD-like operations.
///
/// All calls take a [`CancellationToken`] and must race their I/O against it promptly. On
/// cancellation, the root cause of the returned error is [`TimeoutOrCancel`].
#[allow(async_fn_in_trait)]
pub trait RemoteStorage: Send + Sync + 'static {
    /// Name of the bucket this instance is bound to.
    fn bucket_name(&self) -> &str;

    /// List objects under `prefix`, matching AWS S3's `ListObjectsV2` semantics. When
    /// `recursive` is false, a `/`-delimiter is used and "directories" are folded into
    /// [`EntryKind::Dir`] entries rather than recursed into.
    async fn list(
        &self,
        cancel: &CancellationToken,
        prefix: Option<&RemotePath>,
        recursive: bool,
        max_keys: Option<NonZeroU32>,
    ) -> Result<Listing, DownloadError>;

    async fn head(&self, cancel: &CancellationToken, key: &RemotePath) -> Result<ObjectStat, DownloadError>;

    /// Streams the remote object's contents into `to`.
    async fn download(
        &self,
        cancel: &CancellationToken,
        key: &RemotePath,
        to: &mut (dyn AsyncWrite + Unpin + Send),
        progress: Option<&ProgressFn>,
    ) -> Result<(), DownloadError>;

    /// Streams `from`'s contents up as a new object. `size` is required up front because a PUT
    /// request needs a content length.
    async fn upload(
        &self,
        cancel: &CancellationToken,
        from: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
        to: &RemotePath,
        class: Option<StorageClass>,
        progress: Option<&ProgressFn>,
    ) -> anyhow::Result<()>;

    async fn delete(&self, cancel: &CancellationToken, key: &RemotePath) -> anyhow::Result<()>;

    /// Deletes a batch of already-collected keys (implementation-defined batch size, no more
    /// than [`MAX_KEYS_PER_DELETE`] per underlying request). Used by [`RemoteStore::delete_objects`]
    /// to drive its streaming fan-out.
    async fn delete_batch(&self, cancel: &CancellationToken, keys: &[RemotePath]) -> Vec<DeleteOutcome>;

    async fn copy(
        &self,
        cancel: &CancellationToken,
        from: &RemotePath,
        to: &RemotePath,
        class: Option<StorageClass>,
    ) -> anyhow::Result<()>;

    async fn list_buckets(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<BucketInfo>>;
}

/// Every storage backend currently supported. Serves as a simple way to pass a
/// [`RemoteStorage`] around without turning it into a trait object — `RemoteStorage` has
/// `async fn`s, which aren't `dyn`-safe, so static dispatch through this enum is the
/// alternative the teacher codebase itself uses for the same reason.
#[derive(Clone)]
pub enum RemoteStore {
    LocalFs(Arc<LocalFs>),
    S3(Arc<S3Bucket>),
    Unreliable(Arc<UnreliableWrapper>),
}

macro_rules! dispatch {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {
        match $self {
            RemoteStore::LocalFs(s) => s.$method($($arg),*).await,
            RemoteStore::S3(s) => s.$method($($arg),*).await,
            RemoteStore::Unreliable(s) => s.$method($($arg),*).await,
        }
    };
}

impl RemoteStore {
    pub fn bucket_name(&self) -> &str {
        match self {
            RemoteStore::LocalFs(s) => s.bucket_name(),
            RemoteStore::S3(s) => s.bucket_name(),
            RemoteStore::Unreliable(s) => s.bucket_name(),
        }
    }

    pub async fn list(
        &self,
        cancel: &CancellationToken,
        prefix: Option<&RemotePath>,
        recursive: bool,
        max_keys: Option<NonZeroU32>,
    ) -> Result<Listing, DownloadError> {
        dispatch!(self, list(cancel, prefix, recursive, max_keys))
    }

    pub async fn head(&self, cancel: &CancellationToken, key: &RemotePath) -> Result<ObjectStat, DownloadError> {
        dispatch!(self, head(cancel, key))
    }

    pub async fn download(
        &self,
        cancel: &CancellationToken,
        key: &RemotePath,
        to: &mut (dyn AsyncWrite + Unpin + Send),
        progress: Option<&ProgressFn>,
    ) -> Result<(), DownloadError> {
        dispatch!(self, download(cancel, key, to, progress))
    }

    pub async fn upload(
        &self,
        cancel: &CancellationToken,
        from: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
        to: &RemotePath,
        class: Option<StorageClass>,
        progress: Option<&ProgressFn>,
    ) -> anyhow::Result<()> {
        dispatch!(self, upload(cancel, from, size, to, class, progress))
    }

    pub async fn delete(&self, cancel: &CancellationToken, key: &RemotePath) -> anyhow::Result<()> {
        dispatch!(self, delete(cancel, key))
    }

    pub async fn copy(
        &self,
        cancel: &CancellationToken,
        from: &RemotePath,
        to: &RemotePath,
        class: Option<StorageClass>,
    ) -> anyhow::Result<()> {
        dispatch!(self, copy(cancel, from, to, class))
    }

    pub async fn list_buckets(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<BucketInfo>> {
        dispatch!(self, list_buckets(cancel))
    }

    /// Deletes `keys` as they arrive on `input`, batching internally up to
    /// [`MAX_KEYS_PER_DELETE`] per request, yielding one [`DeleteOutcome`] per key as each
    /// batch resolves. The returned stream closes only once `input` has closed and every
    /// batch has resolved.
    pub fn delete_objects<S>(
        &self,
        cancel: CancellationToken,
        input: S,
    ) -> impl Stream<Item = DeleteOutcome> + Send
    where
        S: Stream<Item = RemotePath> + Send + 'static,
    {
        let store = self.clone();
        async_stream::stream! {
            futures::pin_mut!(input);
            let mut batch = Vec::with_capacity(MAX_KEYS_PER_DELETE);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = input.next() => item,
                };
                match next {
                    Some(key) => {
                        batch.push(key);
                        if batch.len() == MAX_KEYS_PER_DELETE {
                            for outcome in store.delete_batch_dyn(&cancel, std::mem::take(&mut batch)).await {
                                yield outcome;
                            }
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            for outcome in store.delete_batch_dyn(&cancel, std::mem::take(&mut batch)).await {
                                yield outcome;
                            }
                        }
                        break;
                    }
                }
            }
        }
    }

    async fn delete_batch_dyn(&self, cancel: &CancellationToken, keys: Vec<RemotePath>) -> Vec<DeleteOutcome> {
        dispatch!(self, delete_batch(cancel, &keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_rejects_absolute() {
        let err = RemotePath::new("/a/b").expect_err("absolute paths are rejected");
        assert!(err.to_string().contains("not relative"));
    }

    #[test]
    fn remote_path_object_name() {
        let p = RemotePath::new("a/b/c").unwrap();
        assert_eq!(p.object_name(), Some("c"));
    }

    #[test]
    fn storage_class_archival_detection() {
        assert!(StorageClass::Archival.is_archival());
        assert!(!StorageClass::Standard.is_archival());
        assert!(!StorageClass::Other.is_archival());
    }
}
