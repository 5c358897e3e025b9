//! Blob storage backends.
//!
//! The pipeline reads stored file blobs through the [`BlobStore`] trait:
//! open-for-read as a stream of bounded byte blocks, addressed by the
//! document's stored file key. Keys are path-like, so callers can inspect
//! the extension on the key itself.
//!
//! Two backends are provided: a filesystem store (keys resolve under a
//! root directory) and an S3 store using the S3 REST API with AWS
//! Signature V4 authentication. Signing uses only pure-Rust crypto
//! (`hmac`, `sha2`); custom endpoints are supported for S3-compatible
//! services (MinIO, LocalStack) via path-style addressing.
//!
//! # Environment Variables (S3)
//!
//! - `AWS_ACCESS_KEY_ID` — required
//! - `AWS_SECRET_ACCESS_KEY` — required
//! - `AWS_SESSION_TOKEN` — optional (temporary credentials / IAM roles)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

/// Fixed block size for streamed blob reads.
pub const READ_BLOCK_BYTES: usize = 1024 * 1024;

/// Stream of bounded byte blocks.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Read access to stored file blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Human-readable backend location for logs.
    fn describe(&self) -> String;

    /// Open the blob identified by `key` as a stream of byte blocks.
    async fn fetch(&self, key: &str) -> Result<ByteStream>;
}

/// Build the backend selected by the configuration.
pub fn from_config(storage: &StorageConfig) -> Result<Box<dyn BlobStore>> {
    match storage.backend.as_str() {
        "filesystem" => {
            let root = storage
                .root
                .clone()
                .context("storage.root is not set")?;
            Ok(Box::new(FsBlobStore::new(root)))
        }
        "s3" => {
            let bucket = storage
                .bucket
                .clone()
                .context("storage.bucket is not set")?;
            Ok(Box::new(S3BlobStore::new(
                bucket,
                storage.region.clone(),
                storage.prefix.clone(),
                storage.endpoint_url.clone(),
            )))
        }
        other => bail!("Unknown storage backend: '{}'", other),
    }
}

// ============ Filesystem backend ============

/// Blob store over a local directory; keys are relative paths.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Stage a local file under a key. Used by the upload command and the
    /// test harness; the pipeline itself only reads.
    pub async fn put(&self, key: &str, src: &Path) -> Result<()> {
        let dest = self.root.join(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src, &dest)
            .await
            .with_context(|| format!("failed to stage {} as {}", src.display(), dest.display()))?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn describe(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }

    async fn fetch(&self, key: &str) -> Result<ByteStream> {
        let path = self.root.join(key);
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("failed to open blob {}", path.display()))?;

        let stream = futures_util::stream::try_unfold(file, |mut file| async move {
            let mut block = vec![0u8; READ_BLOCK_BYTES];
            let n = file
                .read(&mut block)
                .await
                .context("failed to read blob block")?;
            if n == 0 {
                Ok(None)
            } else {
                block.truncate(n);
                Ok(Some((block, file)))
            }
        });
        Ok(stream.boxed())
    }
}

// ============ S3 backend ============

/// S3 GetObject client with AWS SigV4 request signing.
pub struct S3BlobStore {
    bucket: String,
    region: String,
    prefix: String,
    endpoint_url: Option<String>,
    client: reqwest::Client,
}

impl S3BlobStore {
    pub fn new(
        bucket: String,
        region: String,
        prefix: String,
        endpoint_url: Option<String>,
    ) -> Self {
        Self {
            bucket,
            region,
            prefix,
            endpoint_url,
            client: reqwest::Client::new(),
        }
    }

    fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!(
                "{}/{}",
                self.prefix.trim_end_matches('/'),
                key.trim_start_matches('/')
            )
        }
    }

    /// Resolve request URL, host header, and canonical URI for an object.
    ///
    /// The default endpoint uses virtual-hosted addressing
    /// (`<bucket>.s3.<region>.amazonaws.com/<key>`); custom endpoints use
    /// path-style (`endpoint/<bucket>/<key>`), which is what MinIO and
    /// LocalStack expect.
    fn addressing(&self, object_key: &str) -> Result<(String, String, String)> {
        let encoded_key = uri_encode_path(object_key);
        match &self.endpoint_url {
            Some(endpoint) => {
                let base = endpoint.trim_end_matches('/');
                let parsed = reqwest::Url::parse(base)
                    .with_context(|| format!("invalid storage.endpoint_url: {}", base))?;
                let mut host = parsed
                    .host_str()
                    .context("storage.endpoint_url has no host")?
                    .to_string();
                if let Some(port) = parsed.port() {
                    host = format!("{}:{}", host, port);
                }
                let canonical_uri = format!("/{}/{}", self.bucket, encoded_key);
                Ok((format!("{}{}", base, canonical_uri), host, canonical_uri))
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", self.bucket, self.region);
                let canonical_uri = format!("/{}", encoded_key);
                Ok((format!("https://{}{}", host, canonical_uri), host, canonical_uri))
            }
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    async fn fetch(&self, key: &str) -> Result<ByteStream> {
        let creds = AwsCredentials::from_env()?;
        let object_key = self.object_key(key);
        let (url, host, canonical_uri) = self.addressing(&object_key)?;

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(b"");

        let mut headers = vec![
            ("host".to_string(), host),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "GET\n{}\n\n{}\n{}\n{}",
            canonical_uri, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut request = self
            .client
            .get(&url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = creds.session_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request.send().await.map_err(|e| {
            anyhow::anyhow!("Failed to get s3://{}/{}: {}", self.bucket, object_key, e)
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!(
                "S3 GetObject failed (HTTP {}) for key '{}': {}",
                status,
                object_key,
                body.chars().take(500).collect::<String>()
            );
        }

        let stream = response
            .bytes_stream()
            .map(|block| block.map(|b| b.to_vec()).map_err(anyhow::Error::from));
        Ok(stream.boxed())
    }
}

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ AWS SigV4 helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a date, region, and service.
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode each path segment per RFC 3986, preserving separators.
fn uri_encode_path(path: &str) -> String {
    path.split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/")
}

fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}
