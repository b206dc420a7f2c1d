//! 远程主机访问
//!
//! `RemoteTransport` 是一条物理连接上的原语，`RemoteSession` 在其上做连接池、
//! 超时和断线重连。

pub mod session;
pub mod sftp;

#[cfg(test)]
pub(crate) mod mock;

use crate::error::RemoteError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub use session::{RemoteReader, RemoteSession, SessionConfig};
pub use sftp::SftpConnector;

/// 默认 SSH 端口
pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// 认证方式
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RemoteAuth {
    Password {
        password: String,
    },
    Key {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

// 不在日志里输出密码
impl std::fmt::Debug for RemoteAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteAuth::Password { .. } => write!(f, "Password(***)"),
            RemoteAuth::Key { path, .. } => write!(f, "Key({})", path.display()),
        }
    }
}

/// 远程连接参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth: RemoteAuth,
}

impl RemoteConfig {
    /// 连接池键，形如 `user@host:port`
    pub fn key(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// 远程对象类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// 远程对象元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStat {
    pub kind: RemoteKind,
    pub size: u64,
    /// Unix 秒
    pub mtime: i64,
}

impl RemoteStat {
    pub fn is_dir(&self) -> bool {
        self.kind == RemoteKind::Directory
    }
}

/// 目录列表中的一项，元数据不跟随符号链接
#[derive(Debug, Clone)]
pub struct RemoteDirEntry {
    pub name: String,
    pub stat: RemoteStat,
}

/// 单条物理连接上的远程文件原语
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// 列出目录，不含 `.` 和 `..`
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, RemoteError>;

    /// 获取元数据，跟随符号链接
    async fn stat(&self, path: &str) -> Result<RemoteStat, RemoteError>;

    /// 获取元数据，不跟随符号链接
    async fn lstat(&self, path: &str) -> Result<RemoteStat, RemoteError>;

    /// 解析为规范绝对路径
    async fn real_path(&self, path: &str) -> Result<String, RemoteError>;

    /// 从 `offset` 起最多读取 `len` 字节，到达末尾时返回的数据不足 `len`
    async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, RemoteError>;

    /// 在 `offset` 处写入；`offset` 为 0 时创建或截断文件
    async fn write_chunk(&self, path: &str, offset: u64, data: Bytes) -> Result<(), RemoteError>;

    /// 重命名；目标已存在时是否覆盖取决于服务端
    async fn rename(&self, from: &str, to: &str) -> Result<(), RemoteError>;

    async fn set_mtime(&self, path: &str, mtime: i64) -> Result<(), RemoteError>;

    async fn create_dir(&self, path: &str) -> Result<(), RemoteError>;

    async fn remove_file(&self, path: &str) -> Result<(), RemoteError>;

    /// 删除空目录
    async fn remove_dir(&self, path: &str) -> Result<(), RemoteError>;
}

/// 建立新的物理连接
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RemoteTransport>, RemoteError>;

    /// 用于日志的目标描述
    fn describe(&self) -> String;
}

/// 拼接 POSIX 远程路径
pub fn join_remote(base: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return relative.to_string();
    }
    if base.ends_with('/') {
        format!("{}{}", base, relative)
    } else {
        format!("{}/{}", base, relative)
    }
}

/// POSIX 远程路径的父目录
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}
