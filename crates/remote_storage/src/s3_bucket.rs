use std::num::NonZeroU32;
use std::time::SystemTime;

use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectStorageClass;
use aws_sdk_s3::Client;
use futures::TryStreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    BucketInfo, DeleteOutcome, DownloadError, EntryKind, Listing, ListingEntry, ObjectStat,
    ProgressFn, RemotePath, RemoteStorage, S3Config, StorageClass, TimeoutOrCancel,
    MAX_KEYS_PER_DELETE,
};

pub struct S3Bucket {
    client: Client,
    bucket: String,
}

impl S3Bucket {
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::v2024_03_28())
            .region(Region::new(config.bucket_region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = loader.load().await;
        Ok(Self {
            client: Client::new(&sdk_config),
            bucket: config.bucket_name.clone(),
        })
    }
}

fn storage_class_of(class: Option<&ObjectStorageClass>) -> StorageClass {
    match class {
        Some(ObjectStorageClass::Glacier) | Some(ObjectStorageClass::DeepArchive) => {
            StorageClass::Archival
        }
        Some(ObjectStorageClass::Standard) | None => StorageClass::Standard,
        Some(_) => StorageClass::Other,
    }
}

fn sdk_err_to_download(err: impl std::error::Error + Send + Sync + 'static) -> DownloadError {
    DownloadError::Other(anyhow::Error::new(err))
}

impl RemoteStorage for S3Bucket {
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
        let mut entries = Vec::new();
        let mut continuation_token = None;

        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(prefix.map(|p| p.as_str().to_string()))
                .set_continuation_token(continuation_token.clone());
            if !recursive {
                request = request.delimiter("/");
            }
            if let Some(limit) = max_keys {
                request = request.max_keys(limit.get() as i32);
            }

            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                resp = request.send() => resp.map_err(sdk_err_to_download)?,
            };

            for common_prefix in page.common_prefixes() {
                if let Some(prefix) = common_prefix.prefix() {
                    entries.push(ListingEntry {
                        key: RemotePath::new(prefix).map_err(DownloadError::Other)?,
                        kind: EntryKind::Dir,
                        size: 0,
                        modified: SystemTime::UNIX_EPOCH,
                        storage_class: StorageClass::Standard,
                    });
                }
            }
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                entries.push(ListingEntry {
                    key: RemotePath::new(key).map_err(DownloadError::Other)?,
                    kind: EntryKind::File,
                    size: object.size().unwrap_or(0) as u64,
                    modified: object
                        .last_modified()
                        .and_then(|t| SystemTime::try_from(*t).ok())
                        .unwrap_or(SystemTime::UNIX_EPOCH),
                    storage_class: storage_class_of(object.storage_class()),
                });
            }

            if let Some(limit) = max_keys {
                if entries.len() >= limit.get() as usize {
                    entries.truncate(limit.get() as usize);
                    break;
                }
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(Listing { entries })
    }

    async fn head(&self, cancel: &CancellationToken, key: &RemotePath) -> Result<ObjectStat, DownloadError> {
        let request = self.client.head_object().bucket(&self.bucket).key(key.as_str());
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            resp = request.send() => resp,
        };
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) if e.as_service_error().is_some_and(|e| e.is_not_found()) => {
                return Err(DownloadError::NotFound)
            }
            Err(e) => return Err(sdk_err_to_download(e)),
        };
        Ok(ObjectStat {
            size: resp.content_length().unwrap_or(0) as u64,
            modified: resp
                .last_modified()
                .and_then(|t| SystemTime::try_from(*t).ok())
                .unwrap_or(SystemTime::UNIX_EPOCH),
            storage_class: storage_class_of(resp.storage_class()),
        })
    }

    async fn download(
        &self,
        cancel: &CancellationToken,
        key: &RemotePath,
        to: &mut (dyn AsyncWrite + Unpin + Send),
        progress: Option<&ProgressFn>,
    ) -> Result<(), DownloadError> {
        let request = self.client.get_object().bucket(&self.bucket).key(key.as_str());
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            resp = request.send() => resp.map_err(sdk_err_to_download)?,
        };

        let mut body = resp.body;
        let mut total = 0u64;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(key = key.as_str(), "download cancelled after {total} bytes");
                    return Err(DownloadError::Cancelled);
                }
                chunk = body.try_next() => chunk.map_err(|e| DownloadError::Other(e.into()))?,
            };
            let Some(bytes) = chunk else { break };
            total += bytes.len() as u64;
            to.write_all(&bytes)
                .await
                .map_err(|e| DownloadError::Other(e.into()))?;
            if let Some(p) = progress {
                p(bytes.len() as u64);
            }
        }
        debug!(key = key.as_str(), total, "downloaded object");
        Ok(())
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
        let mut buf = Vec::with_capacity(size as usize);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => anyhow::bail!(TimeoutOrCancel),
            read = from.read_to_end(&mut buf) => { read?; }
        }
        if let Some(p) = progress {
            p(buf.len() as u64);
        }

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(to.as_str())
            .body(ByteStream::from(buf));
        if let Some(StorageClass::Archival) = class {
            request = request.storage_class(aws_sdk_s3::types::StorageClass::Glacier);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => anyhow::bail!(TimeoutOrCancel),
            resp = request.send() => { resp?; }
        }
        Ok(())
    }

    async fn delete(&self, cancel: &CancellationToken, key: &RemotePath) -> anyhow::Result<()> {
        let request = self.client.delete_object().bucket(&self.bucket).key(key.as_str());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => anyhow::bail!(TimeoutOrCancel),
            resp = request.send() => { resp?; }
        }
        Ok(())
    }

    async fn delete_batch(&self, cancel: &CancellationToken, keys: &[RemotePath]) -> Vec<DeleteOutcome> {
        debug_assert!(keys.len() <= MAX_KEYS_PER_DELETE);
        if keys.is_empty() {
            return Vec::new();
        }

        let ids = keys
            .iter()
            .map(|k| {
                aws_sdk_s3::types::ObjectIdentifier::builder()
                    .key(k.as_str())
                    .build()
                    .expect("key is always set")
            })
            .collect();
        let delete = match aws_sdk_s3::types::Delete::builder().set_objects(Some(ids)).build() {
            Ok(d) => d,
            Err(e) => {
                return keys
                    .iter()
                    .map(|k| DeleteOutcome {
                        key: k.clone(),
                        err: Some(anyhow::anyhow!("{e}")),
                    })
                    .collect();
            }
        };

        let request = self.client.delete_objects().bucket(&self.bucket).delete(delete);
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return keys
                    .iter()
                    .map(|k| DeleteOutcome { key: k.clone(), err: Some(anyhow::anyhow!(TimeoutOrCancel)) })
                    .collect();
            }
            resp = request.send() => resp,
        };

        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                let msg = e.to_string();
                return keys
                    .iter()
                    .map(|k| DeleteOutcome {
                        key: k.clone(),
                        err: Some(anyhow::anyhow!("{msg}")),
                    })
                    .collect();
            }
        };

        let mut failed = std::collections::HashMap::new();
        for err in resp.errors() {
            if let Some(key) = err.key() {
                let msg = err.message().unwrap_or("unknown error").to_string();
                warn!(bucket = %self.bucket, key, %msg, "delete_objects reported per-key error");
                failed.insert(key.to_string(), msg);
            }
        }

        keys.iter()
            .map(|k| DeleteOutcome {
                key: k.clone(),
                err: failed.get(k.as_str()).map(|msg| anyhow::anyhow!("{msg}")),
            })
            .collect()
    }

    async fn copy(
        &self,
        cancel: &CancellationToken,
        from: &RemotePath,
        to: &RemotePath,
        class: Option<StorageClass>,
    ) -> anyhow::Result<()> {
        let source = format!("{}/{}", self.bucket, from.as_str());
        let mut request = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(source)
            .key(to.as_str());
        if let Some(StorageClass::Archival) = class {
            request = request.storage_class(aws_sdk_s3::types::StorageClass::Glacier);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => anyhow::bail!(TimeoutOrCancel),
            resp = request.send() => { resp?; }
        }
        Ok(())
    }

    async fn list_buckets(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<BucketInfo>> {
        let request = self.client.list_buckets();
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => anyhow::bail!(TimeoutOrCancel),
            resp = request.send() => resp?,
        };
        Ok(resp
            .buckets()
            .iter()
            .filter_map(|b| {
                Some(BucketInfo {
                    name: b.name()?.to_string(),
                    created: b
                        .creation_date()
                        .and_then(|t| SystemTime::try_from(*t).ok())
                        .unwrap_or(SystemTime::UNIX_EPOCH),
                })
            })
            .collect())
    }
}
