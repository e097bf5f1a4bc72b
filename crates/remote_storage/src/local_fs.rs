use std::num::NonZeroU32;
use std::time::SystemTime;

use camino::Utf8PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    BucketInfo, DeleteOutcome, DownloadError, EntryKind, Listing, ListingEntry, ObjectStat,
    ProgressFn, RemotePath, RemoteStorage, StorageClass, TimeoutOrCancel,
};

/// Treats a local directory tree as a remote store: each immediate child directory of `root`
/// is a "bucket", and the bucket's objects are the files below it. Used for tests and for
/// exercising the job engine without network access.
pub struct LocalFs {
    root: Utf8PathBuf,
    bucket: String,
}

impl LocalFs {
    pub fn new(root: Utf8PathBuf, bucket: String) -> anyhow::Result<Self> {
        anyhow::ensure!(root.is_absolute(), "LocalFs root must be absolute: {root}");
        Ok(Self { root, bucket })
    }

    fn bucket_root(&self) -> Utf8PathBuf {
        self.root.join(&self.bucket)
    }

    fn full_path(&self, key: &RemotePath) -> Utf8PathBuf {
        self.bucket_root().join(key.as_str())
    }

    async fn guard(cancel: &CancellationToken) -> Result<(), TimeoutOrCancel> {
        if cancel.is_cancelled() {
            Err(TimeoutOrCancel)
        } else {
            Ok(())
        }
    }
}

fn io_to_download_err(err: std::io::Error) -> DownloadError {
    if err.kind() == std::io::ErrorKind::NotFound {
        DownloadError::NotFound
    } else {
        DownloadError::Other(err.into())
    }
}

impl RemoteStorage for LocalFs {
    fn bucket_name(&self) -> &str {
        &self.bucket
    }

    async fn list(
        &self,
        cancel: &CancellationToken,
        prefix: Option<&RemotePath>,
        recursive: bool,
        max_keys: Option<NonZeroU32>,
    ) -> Result<Listing, DownloadError> {
        Self::guard(cancel).await.map_err(|_| DownloadError::Cancelled)?;

        let bucket_root = self.bucket_root();
        let scan_root = match prefix {
            Some(p) => bucket_root.join(p.as_str()),
            None => bucket_root.clone(),
        };

        let mut entries = Vec::new();
        let mut dirs = vec![scan_root.clone()];
        while let Some(dir) = dirs.pop() {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let mut rd = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_to_download_err(e)),
            };
            while let Some(child) = rd.next_entry().await.map_err(io_to_download_err)? {
                let path = Utf8PathBuf::try_from(child.path())
                    .map_err(|e| DownloadError::Other(anyhow::anyhow!(e)))?;
                let meta = child.metadata().await.map_err(io_to_download_err)?;
                let key = RemotePath::new(
                    path.strip_prefix(&bucket_root)
                        .unwrap_or(&path)
                        .as_str(),
                )
                .map_err(DownloadError::Other)?;

                if meta.is_dir() {
                    if recursive {
                        dirs.push(path);
                    } else {
                        entries.push(ListingEntry {
                            key,
                            kind: EntryKind::Dir,
                            size: 0,
                            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                            storage_class: StorageClass::Standard,
                        });
                    }
                } else {
                    entries.push(ListingEntry {
                        key,
                        kind: EntryKind::File,
                        size: meta.len(),
                        modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                        storage_class: StorageClass::Standard,
                    });
                }
                if let Some(limit) = max_keys {
                    if entries.len() >= limit.get() as usize {
                        return Ok(Listing { entries });
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(Listing { entries })
    }

    async fn head(&self, cancel: &CancellationToken, key: &RemotePath) -> Result<ObjectStat, DownloadError> {
        Self::guard(cancel).await.map_err(|_| DownloadError::Cancelled)?;
        let meta = tokio::fs::metadata(self.full_path(key))
            .await
            .map_err(io_to_download_err)?;
        Ok(ObjectStat {
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            storage_class: StorageClass::Standard,
        })
    }

    async fn download(
        &self,
        cancel: &CancellationToken,
        key: &RemotePath,
        to: &mut (dyn AsyncWrite + Unpin + Send),
        progress: Option<&ProgressFn>,
    ) -> Result<(), DownloadError> {
        let mut file = tokio::fs::File::open(self.full_path(key))
            .await
            .map_err(io_to_download_err)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                n = file.read(&mut buf) => n.map_err(io_to_download_err)?,
            };
            if n == 0 {
                break;
            }
            to.write_all(&buf[..n]).await.map_err(io_to_download_err)?;
            if let Some(p) = progress {
                p(n as u64);
            }
        }
        Ok(())
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        from: &mut (dyn AsyncRead + Unpin + Send),
        _size: u64,
        to: &RemotePath,
        _class: Option<StorageClass>,
        progress: Option<&ProgressFn>,
    ) -> anyhow::Result<()> {
        let dest = self.full_path(to);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = dest.with_extension("tmp-upload");
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    anyhow::bail!(TimeoutOrCancel);
                }
                n = from.read(&mut buf) => n?,
            };
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            if let Some(p) = progress {
                p(n as u64);
            }
        }
        tokio::fs::rename(&tmp, &dest).await?;
        Ok(())
    }

    async fn delete(&self, cancel: &CancellationToken, key: &RemotePath) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            anyhow::bail!(TimeoutOrCancel);
        }
        tokio::fs::remove_file(self.full_path(key)).await?;
        Ok(())
    }

    async fn delete_batch(&self, cancel: &CancellationToken, keys: &[RemotePath]) -> Vec<DeleteOutcome> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let err = self.delete(cancel, key).await.err();
            out.push(DeleteOutcome { key: key.clone(), err });
        }
        out
    }

    async fn copy(
        &self,
        cancel: &CancellationToken,
        from: &RemotePath,
        to: &RemotePath,
        _class: Option<StorageClass>,
    ) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            anyhow::bail!(TimeoutOrCancel);
        }
        let dest = self.full_path(to);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(self.full_path(from), dest).await?;
        Ok(())
    }

    async fn list_buckets(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<BucketInfo>> {
        if cancel.is_cancelled() {
            anyhow::bail!(TimeoutOrCancel);
        }
        let mut out = Vec::new();
        let mut rd = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = rd.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                let meta = entry.metadata().await?;
                out.push(BucketInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    created: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    async fn fixture() -> (Utf8TempDir, LocalFs) {
        let dir = camino_tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("mybucket")).await.unwrap();
        let store = LocalFs::new(dir.path().to_path_buf(), "mybucket".to_string()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn upload_then_download_roundtrips() {
        let (_dir, store) = fixture().await;
        let cancel = CancellationToken::new();
        let key = RemotePath::new("a/b.txt").unwrap();
        let mut data: &[u8] = b"hello world";
        store
            .upload(&cancel, &mut data, 11, &key, None, None)
            .await
            .unwrap();

        let mut out = Vec::new();
        store.download(&cancel, &key, &mut out, None).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn list_is_recursive_and_sorted() {
        let (_dir, store) = fixture().await;
        let cancel = CancellationToken::new();
        for name in ["b/one.txt", "a/two.txt", "a/three.txt"] {
            let key = RemotePath::new(name).unwrap();
            let mut data: &[u8] = b"x";
            store.upload(&cancel, &mut data, 1, &key, None, None).await.unwrap();
        }
        let listing = store.list(&cancel, None, true, None).await.unwrap();
        let keys: Vec<_> = listing.entries.iter().map(|e| e.key.as_str().to_string()).collect();
        assert_eq!(keys, vec!["a/three.txt", "a/two.txt", "b/one.txt"]);
    }

    #[tokio::test]
    async fn head_missing_is_not_found() {
        let (_dir, store) = fixture().await;
        let cancel = CancellationToken::new();
        let err = store
            .head(&cancel, &RemotePath::new("nope").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotFound));
    }

    #[tokio::test]
    async fn delete_batch_reports_per_key_outcome() {
        let (_dir, store) = fixture().await;
        let cancel = CancellationToken::new();
        let present = RemotePath::new("present.txt").unwrap();
        let mut data: &[u8] = b"x";
        store.upload(&cancel, &mut data, 1, &present, None, None).await.unwrap();
        let missing = RemotePath::new("missing.txt").unwrap();

        let outcomes = store.delete_batch(&cancel, &[present, missing]).await;
        assert!(outcomes[0].err.is_none());
        assert!(outcomes[1].err.is_some());
    }
}
