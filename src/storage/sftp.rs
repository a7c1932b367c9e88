//! SFTP storage backend over russh.
//!
//! Every operation opens its own SSH session and closes it afterwards. A read
//! stream returned by `get` owns its session until it is dropped.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;
use russh_sftp::client::fs::File;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tracing::debug;

use super::policy::SftpConfig;
use super::{clean_key, ensure_complete, join_root, ByteStream, PutReader, StorageBackend};
use crate::{HoardError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// SSH client handler. Host keys are accepted without verification.
struct SshClient;

impl client::Handler for SshClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An open SSH connection with its SFTP subsystem.
struct Connection {
    handle: Handle<SshClient>,
    sftp: SftpSession,
}

impl Connection {
    async fn close(self) {
        if let Err(e) = self.sftp.close().await {
            debug!("sftp close: {}", e);
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("ssh disconnect: {}", e);
        }
    }
}

/// SFTP backend.
#[derive(Debug, Clone)]
pub struct SftpBackend {
    config: SftpConfig,
}

impl SftpBackend {
    /// Create a backend for the given server.
    pub fn new(config: SftpConfig) -> Self {
        Self { config }
    }

    /// Absolute remote path for a storage key.
    pub fn remote_path(&self, path: &str) -> Result<String> {
        let key = clean_key(path)?;
        Ok(join_root(&self.config.root, &key))
    }

    async fn connect(&self, fail: fn(String) -> HoardError) -> Result<Connection> {
        let addr = (self.config.host.as_str(), self.config.port);
        let config = Arc::new(client::Config::default());

        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(config, addr, SshClient),
        )
        .await
        .map_err(|_| fail(format!("ssh connect to {} timed out", self.config.host)))?
        .map_err(|e| fail(format!("ssh connect to {}: {e}", self.config.host)))?;

        let auth = handle
            .authenticate_password(self.config.user.clone(), self.config.password.clone())
            .await
            .map_err(|e| fail(format!("ssh auth: {e}")))?;
        if !auth.success() {
            return Err(HoardError::BackendAuth(format!(
                "ssh password rejected for {}@{}",
                self.config.user, self.config.host
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| fail(format!("ssh channel: {e}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| fail(format!("sftp subsystem: {e}")))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| fail(format!("sftp session: {e}")))?;

        Ok(Connection { handle, sftp })
    }
}

/// Create every missing directory on the way to `dir`.
async fn mkdir_all(sftp: &SftpSession, dir: &str) -> Result<()> {
    let absolute = dir.starts_with('/');
    let mut current = String::new();
    for segment in dir.split('/').filter(|s| !s.is_empty()) {
        if !current.is_empty() || absolute {
            current.push('/');
        }
        current.push_str(segment);

        let exists = sftp
            .try_exists(current.clone())
            .await
            .map_err(|e| HoardError::BackendWrite(format!("stat {current}: {e}")))?;
        if !exists {
            if let Err(e) = sftp.create_dir(current.clone()).await {
                // Lost a race with another writer
                let now_exists = sftp.try_exists(current.clone()).await.unwrap_or(false);
                if !now_exists {
                    return Err(HoardError::BackendWrite(format!("mkdir {current}: {e}")));
                }
            }
        }
    }
    Ok(())
}

fn parent_dir(path: &str) -> Option<&str> {
    path.rfind('/')
        .map(|i| &path[..i])
        .filter(|parent| !parent.is_empty())
}

#[async_trait]
impl StorageBackend for SftpBackend {
    fn kind(&self) -> &'static str {
        "sftp"
    }

    async fn put(&self, path: &str, reader: PutReader<'_>, size: u64) -> Result<()> {
        let remote = self.remote_path(path)?;
        let conn = self.connect(HoardError::BackendWrite).await?;

        let result = async {
            if let Some(dir) = parent_dir(&remote) {
                mkdir_all(&conn.sftp, dir).await?;
            }

            let mut file = conn
                .sftp
                .create(remote.clone())
                .await
                .map_err(|e| HoardError::BackendWrite(format!("create {remote}: {e}")))?;
            let written = tokio::io::copy(reader, &mut file)
                .await
                .map_err(|e| HoardError::BackendWrite(format!("write {remote}: {e}")))?;
            file.shutdown()
                .await
                .map_err(|e| HoardError::BackendWrite(format!("close {remote}: {e}")))?;

            if let Err(e) = ensure_complete(&remote, written, size) {
                let _ = conn.sftp.remove_file(remote.clone()).await;
                return Err(e);
            }
            Ok(())
        }
        .await;

        conn.close().await;
        result
    }

    async fn get(&self, path: &str) -> Result<ByteStream> {
        let remote = self.remote_path(path)?;
        let conn = self.connect(HoardError::BackendRead).await?;

        let exists = conn
            .sftp
            .try_exists(remote.clone())
            .await
            .map_err(|e| HoardError::BackendRead(format!("stat {remote}: {e}")));
        match exists {
            Ok(true) => {}
            Ok(false) => {
                conn.close().await;
                return Err(HoardError::NotFound(format!("object {path}")));
            }
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        }

        let opened = conn.sftp.open(remote.clone()).await;
        match opened {
            Ok(file) => Ok(Box::new(SftpReader {
                file: Box::pin(file),
                _sftp: Box::new(conn.sftp),
                _handle: Box::new(conn.handle),
            })),
            Err(e) => {
                conn.close().await;
                Err(HoardError::BackendRead(format!("open {remote}: {e}")))
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let remote = self.remote_path(path)?;
        let conn = self.connect(HoardError::BackendWrite).await?;

        let result = conn
            .sftp
            .remove_file(remote.clone())
            .await
            .map_err(|e| HoardError::BackendWrite(format!("remove {remote}: {e}")));

        conn.close().await;
        result
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let remote = self.remote_path(path)?;
        let conn = self.connect(HoardError::BackendRead).await?;

        let result = conn
            .sftp
            .try_exists(remote.clone())
            .await
            .map_err(|e| HoardError::BackendRead(format!("stat {remote}: {e}")));

        conn.close().await;
        result
    }

    async fn get_url(&self, _path: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Remote file stream that keeps its SSH session alive until dropped.
struct SftpReader {
    file: Pin<Box<File>>,
    _sftp: Box<SftpSession>,
    _handle: Box<Handle<SshClient>>,
}

impl AsyncRead for SftpReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.file.as_mut().poll_read(cx, buf)
    }
}
