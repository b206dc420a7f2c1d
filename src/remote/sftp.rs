//! SSH/SFTP 远程传输

use super::{
    Connector, RemoteAuth, RemoteConfig, RemoteDirEntry, RemoteKind, RemoteStat, RemoteTransport,
};
use crate::error::RemoteError;
use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, AuthResult, Handle};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg, PublicKey};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// SSH 客户端回调
pub struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // 与原有工具行为一致：自动接受未知主机密钥
    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// 建立 SSH 连接并打开 SFTP 子系统
pub struct SftpConnector {
    config: RemoteConfig,
    connect_timeout: Duration,
    ssh_config: Arc<client::Config>,
}

impl SftpConnector {
    pub fn new(config: RemoteConfig, connect_timeout: Duration) -> Self {
        let ssh_config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        Self {
            config,
            connect_timeout,
            ssh_config: Arc::new(ssh_config),
        }
    }

    async fn connect_inner(&self) -> Result<SftpTransport, RemoteError> {
        let addr = (self.config.host.as_str(), self.config.port);
        let mut handle = client::connect(self.ssh_config.clone(), addr, ClientHandler)
            .await
            .map_err(|e| RemoteError::ConnectionLost(format!("{}: {}", self.config.key(), e)))?;

        let auth = match &self.config.auth {
            RemoteAuth::Password { password } => handle
                .authenticate_password(self.config.username.clone(), password.clone())
                .await
                .map_err(ssh_error)?,
            RemoteAuth::Key { path, passphrase } => {
                let key = load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                    RemoteError::AuthFailed(format!("无法加载私钥 {}: {}", path.display(), e))
                })?;
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(ssh_error)?
                    .flatten();
                handle
                    .authenticate_publickey(
                        self.config.username.clone(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(ssh_error)?
            }
        };
        if !matches!(auth, AuthResult::Success) {
            return Err(RemoteError::AuthFailed(self.config.key()));
        }

        let channel = handle.channel_open_session().await.map_err(ssh_error)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(ssh_error)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| map_sftp_error("sftp", e))?;

        Ok(SftpTransport {
            sftp,
            _handle: handle,
        })
    }
}

#[async_trait]
impl Connector for SftpConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteTransport>, RemoteError> {
        debug!("SSH 连接: {}", self.config.key());
        match tokio::time::timeout(self.connect_timeout, self.connect_inner()).await {
            Ok(Ok(transport)) => Ok(Arc::new(transport)),
            Ok(Err(e)) => {
                warn!("SSH 连接失败: {} ({})", self.config.key(), e);
                Err(e)
            }
            Err(_) => Err(RemoteError::Timeout(format!(
                "连接 {} 超过 {}s",
                self.config.key(),
                self.connect_timeout.as_secs()
            ))),
        }
    }

    fn describe(&self) -> String {
        self.config.key()
    }
}

fn ssh_error(e: russh::Error) -> RemoteError {
    RemoteError::ConnectionLost(e.to_string())
}

fn map_sftp_error(path: &str, e: SftpError) -> RemoteError {
    match e {
        SftpError::Status(status) => {
            let message = format!("{}: {}", path, status.error_message);
            match status.status_code {
                StatusCode::NoSuchFile => RemoteError::NotFound(message),
                StatusCode::PermissionDenied => RemoteError::PermissionDenied(message),
                StatusCode::NoConnection | StatusCode::ConnectionLost => {
                    RemoteError::ConnectionLost(message)
                }
                _ => RemoteError::Failure(message),
            }
        }
        SftpError::Timeout => RemoteError::Timeout(path.to_string()),
        SftpError::IO(msg) => RemoteError::ConnectionLost(format!("{}: {}", path, msg)),
        other => RemoteError::Failure(format!("{}: {}", path, other)),
    }
}

fn io_error(path: &str, e: std::io::Error) -> RemoteError {
    match e.kind() {
        std::io::ErrorKind::NotFound => RemoteError::NotFound(path.to_string()),
        std::io::ErrorKind::PermissionDenied => RemoteError::PermissionDenied(path.to_string()),
        _ => RemoteError::ConnectionLost(format!("{}: {}", path, e)),
    }
}

fn to_stat(attrs: &FileAttributes) -> RemoteStat {
    let kind = if attrs.is_symlink() {
        RemoteKind::Symlink
    } else if attrs.is_dir() {
        RemoteKind::Directory
    } else if attrs.is_regular() {
        RemoteKind::File
    } else {
        RemoteKind::Other
    };
    RemoteStat {
        kind,
        size: attrs.size.unwrap_or(0),
        mtime: attrs.mtime.map(i64::from).unwrap_or(0),
    }
}

/// 一条 SSH 连接上的 SFTP 会话
pub struct SftpTransport {
    sftp: SftpSession,
    // 连接句柄随会话一起存活
    _handle: Handle<ClientHandler>,
}

#[async_trait]
impl RemoteTransport for SftpTransport {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, RemoteError> {
        let entries = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| map_sftp_error(path, e))?;
        Ok(entries
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| RemoteDirEntry {
                name: entry.file_name(),
                stat: to_stat(&entry.metadata()),
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<RemoteStat, RemoteError> {
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| map_sftp_error(path, e))?;
        Ok(to_stat(&attrs))
    }

    async fn lstat(&self, path: &str) -> Result<RemoteStat, RemoteError> {
        let attrs = self
            .sftp
            .symlink_metadata(path)
            .await
            .map_err(|e| map_sftp_error(path, e))?;
        Ok(to_stat(&attrs))
    }

    async fn real_path(&self, path: &str) -> Result<String, RemoteError> {
        self.sftp
            .canonicalize(path)
            .await
            .map_err(|e| map_sftp_error(path, e))
    }

    async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, RemoteError> {
        let mut file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| map_sftp_error(path, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| io_error(path, e))?;
        }
        let mut data = Vec::with_capacity(len);
        file.take(len as u64)
            .read_to_end(&mut data)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn write_chunk(&self, path: &str, offset: u64, data: Bytes) -> Result<(), RemoteError> {
        let flags = if offset == 0 {
            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE
        } else {
            OpenFlags::WRITE
        };
        let mut file = self
            .sftp
            .open_with_flags(path, flags)
            .await
            .map_err(|e| map_sftp_error(path, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| io_error(path, e))?;
        }
        file.write_all(&data).await.map_err(|e| io_error(path, e))?;
        file.shutdown().await.map_err(|e| io_error(path, e))?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| map_sftp_error(from, e))
    }

    async fn set_mtime(&self, path: &str, mtime: i64) -> Result<(), RemoteError> {
        let secs = u32::try_from(mtime.max(0)).unwrap_or(u32::MAX);
        let attrs = FileAttributes {
            atime: Some(secs),
            mtime: Some(secs),
            ..FileAttributes::empty()
        };
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(|e| map_sftp_error(path, e))
    }

    async fn create_dir(&self, path: &str) -> Result<(), RemoteError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| map_sftp_error(path, e))
    }

    async fn remove_file(&self, path: &str) -> Result<(), RemoteError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| map_sftp_error(path, e))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), RemoteError> {
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| map_sftp_error(path, e))
    }
}
