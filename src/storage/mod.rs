pub mod local;
pub mod remote;

use crate::error::SyncItemError;
use crate::remote::RemoteSession;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;

pub use local::LocalStorage;
pub use remote::RemoteStorage;

/// 文件元数据（用于快速检查）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    pub modified_time: i64,
    pub is_dir: bool,
}

/// 文件内容的分块流
pub type ByteStream = BoxStream<'static, Result<Bytes, SyncItemError>>;

/// 同步一侧的文件访问接口，路径均为相对根目录的 `/` 分隔路径
#[async_trait]
pub trait Storage: Send + Sync {
    /// 获取文件元数据，不存在时返回 None
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>, SyncItemError>;

    /// 读取整个文件
    async fn read(&self, path: &str) -> Result<Bytes, SyncItemError>;

    /// 写入整个文件，自动创建父目录
    async fn write(&self, path: &str, data: Bytes) -> Result<(), SyncItemError>;

    /// 分块读取文件；来源不存在时返回 SourceMissing
    async fn read_stream(&self, path: &str) -> Result<ByteStream, SyncItemError> {
        let data = self.read(path).await?;
        Ok(stream::once(async move { Ok(data) }).boxed())
    }

    /// 分块写入文件，返回写入的字节数
    ///
    /// 默认实现先在内存中拼接再整体写入，大文件应由实现覆盖。
    async fn write_stream(&self, path: &str, mut data: ByteStream) -> Result<u64, SyncItemError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = data.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        let written = buffer.len() as u64;
        self.write(path, buffer.freeze()).await?;
        Ok(written)
    }

    /// 设置修改时间（Unix 秒）
    async fn set_modified(&self, path: &str, mtime: i64) -> Result<(), SyncItemError>;

    /// 创建目录（含父目录），已存在时成功
    async fn create_dir(&self, path: &str) -> Result<(), SyncItemError>;

    /// 删除文件或空目录，目标不存在时成功
    async fn delete(&self, path: &str) -> Result<(), SyncItemError>;

    /// 计算内容签名，逐块哈希
    async fn signature(&self, path: &str) -> Result<String, SyncItemError> {
        let mut data = self.read_stream(path).await?;
        let mut hasher = blake3::Hasher::new();
        while let Some(chunk) = data.next().await {
            hasher.update(&chunk?);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 参与比较的一侧
#[derive(Clone)]
pub enum Location {
    Local(PathBuf),
    Remote {
        session: Arc<RemoteSession>,
        root: String,
    },
}

impl Location {
    pub fn storage(&self) -> Arc<dyn Storage> {
        match self {
            Location::Local(root) => Arc::new(LocalStorage::new(root.clone())),
            Location::Remote { session, root } => {
                Arc::new(RemoteStorage::new(session.clone(), root.clone()))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Location::Local(root) => format!("local:{}", root.display()),
            Location::Remote { session, root } => format!("sftp://{}{}", session.describe(), root),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Remote { .. })
    }
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}
