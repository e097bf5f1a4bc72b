//! Parsed representation of a command argument: either a local filesystem path or a remote
//! `scheme://bucket/key` reference, possibly carrying wildcard metacharacters.

use camino::{Utf8Path, Utf8PathBuf};
use remote_storage::RemotePath;

const WILDCARD_CHARS: [char; 3] = ['*', '?', '['];
const REMOTE_SCHEME: &str = "s3://";

#[derive(Debug, thiserror::Error)]
#[error("invalid url {0:?}: {1}")]
pub struct ParseError(String, &'static str);

/// Either a local filesystem path or a `bucket`/`key` pair on the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Url {
    Local(Utf8PathBuf),
    Remote { bucket: String, key: RemotePath },
}

impl Url {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        if let Some(rest) = raw.strip_prefix(REMOTE_SCHEME) {
            let mut parts = rest.splitn(2, '/');
            let bucket = parts.next().filter(|b| !b.is_empty()).ok_or(ParseError(
                raw.to_string(),
                "missing bucket name",
            ))?;
            let key_str = parts.next().unwrap_or("");
            let key = RemotePath::new(key_str)
                .map_err(|_| ParseError(raw.to_string(), "key is not a relative path"))?;
            Ok(Url::Remote {
                bucket: bucket.to_string(),
                key,
            })
        } else {
            Ok(Url::Local(Utf8PathBuf::from(raw)))
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Url::Remote { .. })
    }

    /// True iff the key (for a remote URL) or the path (for a local one) contains any of
    /// `* ? [`. Detection is purely syntactic: it does not check whether the pattern actually
    /// matches anything.
    pub fn has_wildcard(&self) -> bool {
        let s = match self {
            Url::Remote { key, .. } => key.as_str(),
            Url::Local(p) => p.as_str(),
        };
        s.contains(WILDCARD_CHARS)
    }

    /// Appends `suffix` to the path or key, mirroring how a destination prefix is extended with
    /// a source's relative path during a batch upload/download.
    pub fn join(&self, suffix: impl AsRef<Utf8Path>) -> Self {
        match self {
            Url::Local(p) => Url::Local(p.join(suffix)),
            Url::Remote { bucket, key } => Url::Remote {
                bucket: bucket.clone(),
                key: key.join(suffix),
            },
        }
    }

    /// Last `/`-delimited segment.
    pub fn base(&self) -> &str {
        match self {
            Url::Local(p) => p.file_name().unwrap_or(p.as_str()),
            Url::Remote { key, .. } => key.object_name().unwrap_or(key.as_str()),
        }
    }

    /// Drops the last segment, returning the parent directory/prefix.
    pub fn dir(&self) -> Self {
        match self {
            Url::Local(p) => Url::Local(p.parent().map(|p| p.to_path_buf()).unwrap_or_default()),
            Url::Remote { bucket, key } => {
                let parent = Utf8Path::new(key.as_str())
                    .parent()
                    .map(|p| p.as_str())
                    .unwrap_or("");
                Url::Remote {
                    bucket: bucket.clone(),
                    key: RemotePath::new(parent).unwrap_or_else(|_| RemotePath::empty()),
                }
            }
        }
    }

    pub fn bucket(&self) -> Option<&str> {
        match self {
            Url::Remote { bucket, .. } => Some(bucket),
            Url::Local(_) => None,
        }
    }

    pub fn key(&self) -> Option<&RemotePath> {
        match self {
            Url::Remote { key, .. } => Some(key),
            Url::Local(_) => None,
        }
    }

    pub fn as_local_path(&self) -> Option<&Utf8Path> {
        match self {
            Url::Local(p) => Some(p),
            Url::Remote { .. } => None,
        }
    }
}

impl std::fmt::Display for Url {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Url::Local(p) => write!(f, "{p}"),
            Url::Remote { bucket, key } => write!(f, "{REMOTE_SCHEME}{bucket}/{key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_url() {
        let url = Url::parse("s3://my-bucket/a/b.txt").unwrap();
        assert_eq!(
            url,
            Url::Remote {
                bucket: "my-bucket".to_string(),
                key: RemotePath::new("a/b.txt").unwrap(),
            }
        );
        assert!(url.is_remote());
    }

    #[test]
    fn parses_remote_url_with_empty_key() {
        let url = Url::parse("s3://my-bucket").unwrap();
        assert_eq!(url.key().unwrap().as_str(), "");
    }

    #[test]
    fn parses_local_path() {
        let url = Url::parse("/tmp/foo").unwrap();
        assert!(!url.is_remote());
        assert_eq!(url.as_local_path().unwrap().as_str(), "/tmp/foo");
    }

    #[test]
    fn rejects_missing_bucket() {
        assert!(Url::parse("s3:///key").is_err());
    }

    #[test]
    fn detects_wildcard_in_key_only() {
        assert!(Url::parse("s3://b/prefix/*").unwrap().has_wildcard());
        assert!(!Url::parse("s3://b/prefix/file").unwrap().has_wildcard());
        assert!(Url::parse("/tmp/*.txt").unwrap().has_wildcard());
    }

    #[test]
    fn base_and_dir() {
        let url = Url::parse("s3://b/a/b/c.txt").unwrap();
        assert_eq!(url.base(), "c.txt");
        assert_eq!(url.dir(), Url::parse("s3://b/a/b").unwrap());
    }

    #[test]
    fn join_appends_suffix() {
        let dst = Url::parse("s3://b/dst/").unwrap();
        let joined = dst.join("sub/file.txt");
        assert_eq!(joined.to_string(), "s3://b/dst/sub/file.txt");
    }

    #[test]
    fn display_round_trips_remote() {
        let raw = "s3://bucket/key/path";
        assert_eq!(Url::parse(raw).unwrap().to_string(), raw);
    }
}
