/// Configuration needed to talk to a single S3(-compatible) bucket. Credentials are never
/// part of this struct: they flow through `aws-config`'s default provider chain (environment,
/// shared config file, IMDS, ...).
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket_name: String,
    pub bucket_region: String,
    /// Override for S3-compatible stores that aren't AWS (e.g. MinIO for local testing).
    pub endpoint: Option<String>,
}
