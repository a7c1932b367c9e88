//! OneDrive storage backend over Microsoft Graph.
//!
//! Small objects go up in one `PUT .../content`. Larger objects use an upload
//! session and are sent in fixed chunks with a running byte offset. Any
//! request answered with `401` refreshes the access token once and is retried
//! once.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use super::policy::OneDriveConfig;
use super::{clean_key, ensure_complete, read_full, ByteStream, PutReader, StorageBackend};
use crate::{HoardError, Result};

/// Objects smaller than this are uploaded in a single request.
pub const SIMPLE_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;

/// Upload session chunk size: 16 x the 320 KiB Graph granularity.
pub const CHUNK_SIZE: usize = 16 * 320 * 1024;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSession {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    #[serde(rename = "@microsoft.graph.downloadUrl", default)]
    download_url: Option<String>,
}

#[derive(Debug)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: String,
}

/// OneDrive backend.
pub struct OneDriveBackend {
    config: OneDriveConfig,
    http: Client,
    tokens: Mutex<TokenState>,
}

impl std::fmt::Debug for OneDriveBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneDriveBackend")
            .field("graph_base", &self.config.graph_base)
            .field("root_path", &self.config.root_path)
            .finish()
    }
}

impl OneDriveBackend {
    /// Create a backend. The access token is fetched on first use.
    pub fn new(config: OneDriveConfig, http: Client) -> Self {
        let tokens = Mutex::new(TokenState {
            access_token: None,
            refresh_token: config.refresh_token.clone(),
        });
        Self {
            config,
            http,
            tokens,
        }
    }

    /// Graph item URL for a storage key: `{base}/me/drive/root:/{root}/{key}`.
    pub fn item_url(&self, path: &str) -> Result<String> {
        let key = clean_key(path)?;
        let segments = self
            .config
            .root_path
            .split('/')
            .chain(key.split('/'))
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!(
            "{}/me/drive/root:/{}",
            self.config.graph_base.trim_end_matches('/'),
            segments
        ))
    }

    /// Exchange the refresh token for a new access token.
    async fn refresh(&self, fail: fn(String) -> HoardError) -> Result<String> {
        let mut tokens = self.tokens.lock().await;
        let refresh_token = tokens.refresh_token.clone();

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| fail(format!("token request: {e}")))?;

        if !response.status().is_success() {
            return Err(HoardError::BackendAuth(format!(
                "token refresh failed: {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| HoardError::BackendAuth(format!("token response: {e}")))?;
        if token.access_token.is_empty() {
            return Err(HoardError::BackendAuth(
                "token refresh returned no access token".to_string(),
            ));
        }

        if let Some(rotated) = token.refresh_token.filter(|t| !t.is_empty()) {
            tokens.refresh_token = rotated;
        }
        tokens.access_token = Some(token.access_token.clone());
        info!("onedrive access token refreshed");
        Ok(token.access_token)
    }

    async fn access_token(&self, fail: fn(String) -> HoardError) -> Result<String> {
        let cached = self.tokens.lock().await.access_token.clone();
        match cached {
            Some(token) => Ok(token),
            None => self.refresh(fail).await,
        }
    }

    /// Send a request built by `build`; on `401` refresh once and retry once.
    async fn send<F>(&self, fail: fn(String) -> HoardError, build: F) -> Result<Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.access_token(fail).await?;
        let response = build(&token)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("onedrive returned 401, refreshing token");
        let token = self.refresh(fail).await?;
        let response = build(&token)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(HoardError::BackendAuth(
                "onedrive rejected the refreshed token".to_string(),
            ));
        }
        Ok(response)
    }

    async fn simple_upload(&self, path: &str, reader: PutReader<'_>, size: u64) -> Result<()> {
        let mut body = Vec::with_capacity(size as usize);
        reader
            .read_to_end(&mut body)
            .await
            .map_err(|e| HoardError::BackendWrite(format!("{path}: {e}")))?;
        ensure_complete(path, body.len() as u64, size)?;

        let url = format!("{}:/content", self.item_url(path)?);
        let body = Bytes::from(body);
        let response = self
            .send(HoardError::BackendWrite, |token| {
                self.http
                    .put(&url)
                    .bearer_auth(token)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(body.clone())
            })
            .await?;

        if !response.status().is_success() {
            return Err(HoardError::BackendWrite(format!(
                "{path}: upload failed: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn chunked_upload(&self, path: &str, reader: PutReader<'_>, size: u64) -> Result<()> {
        let session_url = format!("{}:/createUploadSession", self.item_url(path)?);
        let response = self
            .send(HoardError::BackendWrite, |token| {
                self.http.post(&session_url).bearer_auth(token).json(
                    &serde_json::json!({
                        "item": { "@microsoft.graph.conflictBehavior": "replace" }
                    }),
                )
            })
            .await?;
        if !response.status().is_success() {
            return Err(HoardError::BackendWrite(format!(
                "{path}: create upload session failed: {}",
                response.status()
            )));
        }
        let session: UploadSession = response
            .json()
            .await
            .map_err(|e| HoardError::BackendWrite(format!("{path}: upload session: {e}")))?;

        let result = self
            .send_chunks(path, &session.upload_url, reader, size)
            .await;
        if result.is_err() {
            // Best effort: drop the half-filled session
            if let Err(e) = self.http.delete(&session.upload_url).send().await {
                warn!("onedrive: cancel upload session for {}: {}", path, e);
            }
        }
        result
    }

    async fn send_chunks(
        &self,
        path: &str,
        upload_url: &str,
        reader: PutReader<'_>,
        size: u64,
    ) -> Result<()> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut offset: u64 = 0;

        loop {
            let n = read_full(reader, &mut buf)
                .await
                .map_err(|e| HoardError::BackendWrite(format!("{path}: {e}")))?;
            if n == 0 {
                break;
            }
            let end = offset + n as u64 - 1;
            if end >= size {
                return Err(HoardError::BackendWrite(format!(
                    "{path}: stream is longer than the declared {size} bytes"
                )));
            }

            let chunk = Bytes::copy_from_slice(&buf[..n]);
            let range = format!("bytes {offset}-{end}/{size}");
            let response = self
                .send(HoardError::BackendWrite, |_token| {
                    // Upload URLs are pre-authorized
                    self.http
                        .put(upload_url)
                        .header(header::CONTENT_RANGE, range.as_str())
                        .body(chunk.clone())
                })
                .await?;

            let status = response.status();
            if status != StatusCode::OK
                && status != StatusCode::CREATED
                && status != StatusCode::ACCEPTED
            {
                return Err(HoardError::BackendWrite(format!(
                    "{path}: chunk {range} failed: {status}"
                )));
            }
            debug!(path, range = %range, "onedrive chunk uploaded");
            offset = end + 1;
        }

        ensure_complete(path, offset, size)
    }
}

#[async_trait]
impl StorageBackend for OneDriveBackend {
    fn kind(&self) -> &'static str {
        "onedrive"
    }

    async fn put(&self, path: &str, reader: PutReader<'_>, size: u64) -> Result<()> {
        if size < SIMPLE_UPLOAD_LIMIT {
            self.simple_upload(path, reader, size).await
        } else {
            self.chunked_upload(path, reader, size).await
        }
    }

    async fn get(&self, path: &str) -> Result<ByteStream> {
        let url = format!("{}:/content", self.item_url(path)?);
        let response = self
            .send(HoardError::BackendRead, |token| {
                self.http.get(&url).bearer_auth(token)
            })
            .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(HoardError::NotFound(format!("object {path}"))),
            status => {
                return Err(HoardError::BackendRead(format!(
                    "{path}: download failed: {status}"
                )))
            }
        }

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let url = self.item_url(path)?;
        let response = self
            .send(HoardError::BackendWrite, |token| {
                self.http.delete(&url).bearer_auth(token)
            })
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => Err(HoardError::NotFound(format!("object {path}"))),
            status => Err(HoardError::BackendWrite(format!(
                "{path}: delete failed: {status}"
            ))),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let url = self.item_url(path)?;
        let response = self
            .send(HoardError::BackendRead, |token| {
                self.http.get(&url).bearer_auth(token)
            })
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(HoardError::BackendRead(format!(
                "{path}: exists check failed: {status}"
            ))),
        }
    }

    async fn get_url(&self, path: &str) -> Result<Option<String>> {
        let url = self.item_url(path)?;
        let response = self
            .send(HoardError::BackendRead, |token| {
                self.http.get(&url).bearer_auth(token)
            })
            .await?;

        if !response.status().is_success() {
            return Err(HoardError::BackendRead(format!(
                "{path}: item lookup failed: {}",
                response.status()
            )));
        }

        let item: DriveItem = response
            .json()
            .await
            .map_err(|e| HoardError::BackendRead(format!("{path}: {e}")))?;
        Ok(item.download_url.filter(|u| !u.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(root_path: &str) -> OneDriveBackend {
        OneDriveBackend::new(
            OneDriveConfig {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                refresh_token: "refresh".to_string(),
                root_path: root_path.to_string(),
                graph_base: "http://graph.test/v1.0/".to_string(),
                token_url: "http://graph.test/token".to_string(),
            },
            Client::new(),
        )
    }

    #[test]
    fn test_chunk_size_is_graph_multiple() {
        assert_eq!(CHUNK_SIZE % (320 * 1024), 0);
        assert_eq!(CHUNK_SIZE, 5 * 1024 * 1024);
        assert!((CHUNK_SIZE as u64) > SIMPLE_UPLOAD_LIMIT);
    }

    #[test]
    fn test_item_url() {
        assert_eq!(
            backend("/netdisk/").item_url("uploads/1/a b.txt").unwrap(),
            "http://graph.test/v1.0/me/drive/root:/netdisk/uploads/1/a%20b.txt"
        );
        assert_eq!(
            backend("").item_url("uploads/1/a.txt").unwrap(),
            "http://graph.test/v1.0/me/drive/root:/uploads/1/a.txt"
        );
        assert!(backend("").item_url("../a.txt").is_err());
    }
}
