use super::{Connector, RemoteDirEntry, RemoteKind, RemoteStat, RemoteTransport};
use crate::error::RemoteError;
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 远程读写的默认块大小
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// 按块顺序读取一个远程文件，每块是一次独立的远程调用
pub struct RemoteReader {
    session: Arc<RemoteSession>,
    path: String,
    offset: u64,
    chunk_size: usize,
    done: bool,
}

impl RemoteReader {
    /// 下一块数据，读完返回 None
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, RemoteError> {
        if self.done {
            return Ok(None);
        }
        let chunk = self
            .session
            .read_chunk(&self.path, self.offset, self.chunk_size)
            .await?;
        if chunk.len() < self.chunk_size {
            self.done = true;
        }
        if chunk.is_empty() {
            return Ok(None);
        }
        self.offset += chunk.len() as u64;
        Ok(Some(chunk))
    }
}

/// 会话配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 物理连接数
    pub pool_size: usize,
    /// 单次远程调用超时
    pub op_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            op_timeout: Duration::from_secs(60),
        }
    }
}

/// 连接池状态
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub connected: usize,
}

/// 远程会话
///
/// 内部持有 `pool_size` 条按需建立的物理连接，调用按轮询分配到连接上，
/// 每条连接同一时刻只服务一个请求。连接断开时自动重连一次；超时的连接
/// 会被丢弃，下次使用时重建。
pub struct RemoteSession {
    connector: Arc<dyn Connector>,
    slots: Vec<Mutex<Option<Arc<dyn RemoteTransport>>>>,
    next: AtomicUsize,
    config: SessionConfig,
}

impl RemoteSession {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        let pool_size = config.pool_size.max(1);
        let slots = (0..pool_size).map(|_| Mutex::new(None)).collect();
        Self {
            connector,
            slots,
            next: AtomicUsize::new(0),
            config,
        }
    }

    /// 目标描述，如 `user@host:22`
    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    /// 立即建立第一条连接，认证失败会在这里暴露
    pub async fn connect(&self) -> Result<(), RemoteError> {
        let mut slot = self.slots[0].lock().await;
        if slot.is_none() {
            *slot = Some(self.open_transport().await?);
        }
        Ok(())
    }

    async fn open_transport(&self) -> Result<Arc<dyn RemoteTransport>, RemoteError> {
        debug!("建立远程连接: {}", self.connector.describe());
        let transport = self.connector.connect().await?;
        info!("远程连接已建立: {}", self.connector.describe());
        Ok(transport)
    }

    /// 在池中的一条连接上执行一次远程调用
    async fn run<T, F, Fut>(&self, op: &str, path: &str, call: F) -> Result<T, RemoteError>
    where
        T: Send,
        F: Fn(Arc<dyn RemoteTransport>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, RemoteError>> + Send,
    {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut slot = self.slots[idx].lock().await;
        let mut reconnected = false;

        loop {
            let transport = match slot.as_ref() {
                Some(t) => t.clone(),
                None => {
                    let t = self.open_transport().await?;
                    *slot = Some(t.clone());
                    t
                }
            };

            match tokio::time::timeout(self.config.op_timeout, call(transport)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(RemoteError::ConnectionLost(msg))) => {
                    *slot = None;
                    if reconnected {
                        warn!("重连后连接再次断开: {} {} ({})", op, path, msg);
                        return Err(RemoteError::ConnectionLost(msg));
                    }
                    warn!("远程连接断开，尝试重连: {} {} ({})", op, path, msg);
                    reconnected = true;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    // 超时的连接状态未知，丢弃
                    *slot = None;
                    warn!(
                        "远程调用超时 ({}s): {} {}",
                        self.config.op_timeout.as_secs(),
                        op,
                        path
                    );
                    return Err(RemoteError::Timeout(format!("{} {}", op, path)));
                }
            }
        }
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<RemoteDirEntry>, RemoteError> {
        self.run("list", path, |t| async move { t.read_dir(path).await })
            .await
    }

    /// 获取元数据，跟随符号链接
    pub async fn stat(&self, path: &str) -> Result<RemoteStat, RemoteError> {
        self.run("stat", path, |t| async move { t.stat(path).await })
            .await
    }

    pub async fn real_path(&self, path: &str) -> Result<String, RemoteError> {
        self.run("realpath", path, |t| async move { t.real_path(path).await })
            .await
    }

    /// 获取元数据，不跟随符号链接
    pub async fn lstat(&self, path: &str) -> Result<RemoteStat, RemoteError> {
        self.run("lstat", path, |t| async move { t.lstat(path).await })
            .await
    }

    pub async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, RemoteError> {
        self.run("read", path, |t| async move { t.read_chunk(path, offset, len).await })
            .await
    }

    /// 按块读取文件，不整体读入内存
    pub fn open_for_read(self: &Arc<Self>, path: &str, chunk_size: usize) -> RemoteReader {
        RemoteReader {
            session: self.clone(),
            path: path.to_string(),
            offset: 0,
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }

    pub async fn write_chunk(&self, path: &str, offset: u64, data: Bytes) -> Result<(), RemoteError> {
        self.run("write", path, |t| {
            let data = data.clone();
            async move { t.write_chunk(path, offset, data).await }
        })
        .await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.run("rename", from, |t| async move { t.rename(from, to).await })
            .await
    }

    pub async fn set_modified(&self, path: &str, mtime: i64) -> Result<(), RemoteError> {
        self.run("setstat", path, |t| async move { t.set_mtime(path, mtime).await })
            .await
    }

    pub async fn create_dir(&self, path: &str) -> Result<(), RemoteError> {
        self.run("mkdir", path, |t| async move { t.create_dir(path).await })
            .await
    }

    /// 删除文件、符号链接或空目录；符号链接只删除链接本身
    pub async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        let is_dir = self.lstat(path).await?.kind == RemoteKind::Directory;
        if is_dir {
            self.run("rmdir", path, |t| async move { t.remove_dir(path).await })
                .await
        } else {
            self.run("remove", path, |t| async move { t.remove_file(path).await })
                .await
        }
    }

    pub async fn pool_status(&self) -> PoolStatus {
        let mut connected = 0;
        for slot in &self.slots {
            if slot.lock().await.is_some() {
                connected += 1;
            }
        }
        PoolStatus {
            size: self.slots.len(),
            connected,
        }
    }

    /// 关闭所有连接
    pub async fn close(&self) {
        for slot in &self.slots {
            slot.lock().await.take();
        }
        info!("远程会话已关闭: {}", self.connector.describe());
    }
}
