use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::{
    BucketInfo, DeleteOutcome, DownloadError, Listing, ObjectStat, ProgressFn, RemotePath,
    RemoteStore, RemoteStorage, StorageClass,
};

/// Wraps a [`RemoteStore`] and deterministically fails the first `fail_first` calls to each
/// method, then delegates. Exists purely for tests exercising the job engine's retry and
/// cancellation paths without needing a flaky real backend.
pub struct UnreliableWrapper {
    inner: RemoteStore,
    fail_first: u64,
    attempts: AtomicU64,
}

impl UnreliableWrapper {
    pub fn new(inner: RemoteStore, fail_first: u64) -> Self {
        Self {
            inner,
            fail_first,
            attempts: AtomicU64::new(0),
        }
    }

    fn should_fail(&self) -> bool {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        n < self.fail_first
    }
}

impl RemoteStorage for UnreliableWrapper {
    fn bucket_name(&self) -> &str {
        self.inner.bucket_name()
    }

    async fn list(
        &self,
        cancel: &CancellationToken,
        prefix: Option<&RemotePath>,
        recursive: bool,
        max_keys: Option<NonZeroU32>,
    ) -> Result<Listing, DownloadError> {
        if self.should_fail() {
            return Err(DownloadError::Other(anyhow::anyhow!("simulated list failure")));
        }
        self.inner.list(cancel, prefix, recursive, max_keys).await
    }

    async fn head(&self, cancel: &CancellationToken, key: &RemotePath) -> Result<ObjectStat, DownloadError> {
        if self.should_fail() {
            return Err(DownloadError::Other(anyhow::anyhow!("simulated head failure")));
        }
        self.inner.head(cancel, key).await
    }

    async fn download(
        &self,
        cancel: &CancellationToken,
        key: &RemotePath,
        to: &mut (dyn AsyncWrite + Unpin + Send),
        progress: Option<&ProgressFn>,
    ) -> Result<(), DownloadError> {
        if self.should_fail() {
            return Err(DownloadError::Other(anyhow::anyhow!("simulated download failure")));
        }
        self.inner.download(cancel, key, to, progress).await
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        from: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
        to: &RemotePath,
        class: Option<StorageClass>,
        progress: Option<&ProgressFn>,
    ) -> anyhow::Result<()> {
        if self.should_fail() {
            anyhow::bail!("simulated upload failure");
        }
        self.inner.upload(cancel, from, size, to, class, progress).await
    }

    async fn delete(&self, cancel: &CancellationToken, key: &RemotePath) -> anyhow::Result<()> {
        if self.should_fail() {
            anyhow::bail!("simulated delete failure");
        }
        self.inner.delete(cancel, key).await
    }

    async fn delete_batch(&self, cancel: &CancellationToken, keys: &[RemotePath]) -> Vec<DeleteOutcome> {
        if self.should_fail() {
            return keys
                .iter()
                .map(|k| DeleteOutcome {
                    key: k.clone(),
                    err: Some(anyhow::anyhow!("simulated delete_batch failure")),
                })
                .collect();
        }
        self.inner.delete_batch(cancel, keys).await
    }

    async fn copy(
        &self,
        cancel: &CancellationToken,
        from: &RemotePath,
        to: &RemotePath,
        class: Option<StorageClass>,
    ) -> anyhow::Result<()> {
        if self.should_fail() {
            anyhow::bail!("simulated copy failure");
        }
        self.inner.copy(cancel, from, to, class).await
    }

    async fn list_buckets(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<BucketInfo>> {
        if self.should_fail() {
            anyhow::bail!("simulated list_buckets failure");
        }
        self.inner.list_buckets(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalFs;
    use camino_tempfile::Utf8TempDir;
    use std::sync::Arc;

    async fn fixture() -> (Utf8TempDir, RemoteStore) {
        let dir = camino_tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("b")).await.unwrap();
        let store = LocalFs::new(dir.path().to_path_buf(), "b".to_string()).unwrap();
        (dir, RemoteStore::LocalFs(Arc::new(store)))
    }

    #[tokio::test]
    async fn fails_exactly_fail_first_times() {
        let (_dir, inner) = fixture().await;
        let wrapper = UnreliableWrapper::new(inner, 2);
        let cancel = CancellationToken::new();

        assert!(wrapper.list_buckets(&cancel).await.is_err());
        assert!(wrapper.list_buckets(&cancel).await.is_err());
        assert!(wrapper.list_buckets(&cancel).await.is_ok());
    }
}
