//! S3-compatible, Aliyun OSS and Tencent COS object stores via OpenDAL.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use opendal::{services, ErrorKind as DalErrorKind, Operator};
use tokio_util::io::StreamReader;
use tracing::debug;

use super::policy::{CosConfig, OssConfig, S3Config};
use super::{clean_key, ensure_complete, read_full, ByteStream, PutReader, StorageBackend};
use super::COPY_BUF_SIZE;
use crate::{HoardError, Result};

/// Presigned URLs stay valid for one hour.
const PRESIGN_TTL: Duration = Duration::from_secs(60 * 60);

/// Multipart chunk size handed to OpenDAL writers.
const WRITE_CHUNK: usize = 8 * 1024 * 1024;

/// Object store backend.
#[derive(Clone)]
pub struct ObjectStoreBackend {
    op: Operator,
    kind: &'static str,
}

impl std::fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("kind", &self.kind)
            .finish()
    }
}

fn config_error(e: opendal::Error) -> HoardError {
    HoardError::InvalidPolicyConfig(e.to_string())
}

impl ObjectStoreBackend {
    /// Wrap an already-built operator.
    pub fn from_operator(op: Operator, kind: &'static str) -> Self {
        Self { op, kind }
    }

    /// Build an S3-compatible backend.
    pub fn s3(config: &S3Config) -> Result<Self> {
        let region = if config.region.is_empty() {
            "us-east-1"
        } else {
            config.region.as_str()
        };
        let builder = services::S3::default()
            .root("/")
            .endpoint(&config.endpoint)
            .bucket(&config.bucket)
            .region(region)
            .access_key_id(&config.access_key)
            .secret_access_key(&config.secret_key);

        let op = Operator::new(builder).map_err(config_error)?.finish();
        Ok(Self::from_operator(op, "s3"))
    }

    /// Build an Aliyun OSS backend.
    pub fn oss(config: &OssConfig) -> Result<Self> {
        let builder = services::Oss::default()
            .root("/")
            .endpoint(&config.endpoint)
            .bucket(&config.bucket)
            .access_key_id(&config.access_key)
            .access_key_secret(&config.secret_key);

        let op = Operator::new(builder).map_err(config_error)?.finish();
        Ok(Self::from_operator(op, "oss"))
    }

    /// Build a Tencent COS backend from a bucket URL such as
    /// `https://examplebucket-1250000000.cos.ap-guangzhou.myqcloud.com`.
    pub fn cos(config: &CosConfig) -> Result<Self> {
        let (bucket, endpoint) = split_cos_bucket_url(&config.bucket_url)?;
        let builder = services::Cos::default()
            .root("/")
            .endpoint(&endpoint)
            .bucket(&bucket)
            .secret_id(&config.secret_id)
            .secret_key(&config.secret_key);

        let op = Operator::new(builder).map_err(config_error)?.finish();
        Ok(Self::from_operator(op, "cos"))
    }
}

/// Split a virtual-hosted COS bucket URL into bucket name and service endpoint.
pub(crate) fn split_cos_bucket_url(bucket_url: &str) -> Result<(String, String)> {
    let url = url::Url::parse(bucket_url)
        .map_err(|e| HoardError::InvalidPolicyConfig(format!("bucketUrl: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| HoardError::InvalidPolicyConfig("bucketUrl has no host".to_string()))?;

    match host.split_once('.') {
        Some((bucket, rest)) if !bucket.is_empty() && !rest.is_empty() => {
            Ok((bucket.to_string(), format!("{}://{rest}", url.scheme())))
        }
        _ => Err(HoardError::InvalidPolicyConfig(format!(
            "bucketUrl is not a virtual-hosted bucket URL: {bucket_url}"
        ))),
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn put(&self, path: &str, reader: PutReader<'_>, size: u64) -> Result<()> {
        let key = clean_key(path)?;
        let write_err = |e: opendal::Error| HoardError::BackendWrite(format!("{key}: {e}"));

        let mut writer = self
            .op
            .writer_with(&key)
            .chunk(WRITE_CHUNK)
            .await
            .map_err(write_err)?;

        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut received: u64 = 0;
        loop {
            let n = match read_full(reader, &mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(HoardError::BackendWrite(format!("{key}: {e}")));
                }
            };
            if n == 0 {
                break;
            }
            received += n as u64;
            if let Err(e) = writer.write(buf[..n].to_vec()).await {
                let _ = writer.abort().await;
                return Err(write_err(e));
            }
        }

        if let Err(e) = ensure_complete(&key, received, size) {
            let _ = writer.abort().await;
            return Err(e);
        }

        writer.close().await.map_err(write_err)?;
        debug!(kind = self.kind, key = %key, bytes = received, "stored object");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<ByteStream> {
        let key = clean_key(path)?;
        let read_err = |e: opendal::Error| match e.kind() {
            DalErrorKind::NotFound => HoardError::NotFound(format!("object {key}")),
            DalErrorKind::PermissionDenied => HoardError::BackendAuth(format!("{key}: {e}")),
            _ => HoardError::BackendRead(format!("{key}: {e}")),
        };

        // Stat first so a missing object is reported before any stream is handed out.
        self.op.stat(&key).await.map_err(read_err)?;

        let reader = self.op.reader(&key).await.map_err(read_err)?;
        let stream = reader.into_bytes_stream(..).await.map_err(read_err)?;
        let stream = stream.map_err(std::io::Error::other);

        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let key = clean_key(path)?;
        self.op
            .delete(&key)
            .await
            .map_err(|e| HoardError::BackendWrite(format!("delete {key}: {e}")))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = clean_key(path)?;
        match self.op.stat(&key).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == DalErrorKind::NotFound => Ok(false),
            Err(e) => Err(HoardError::BackendRead(format!("{key}: {e}"))),
        }
    }

    async fn get_url(&self, path: &str) -> Result<Option<String>> {
        let key = clean_key(path)?;
        let request = self
            .op
            .presign_read(&key, PRESIGN_TTL)
            .await
            .map_err(|e| HoardError::BackendRead(format!("presign {key}: {e}")))?;
        Ok(Some(request.uri().to_string()))
    }
}
