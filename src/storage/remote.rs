use super::{ByteStream, FileMeta, Storage};
use crate::core::entry::normalize_relative;
use crate::error::{RemoteError, SyncItemError};
use crate::remote::session::DEFAULT_CHUNK_SIZE;
use crate::remote::{join_remote, remote_parent, RemoteKind, RemoteSession};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// 通过 RemoteSession 访问远程目录树
pub struct RemoteStorage {
    session: Arc<RemoteSession>,
    root: String,
    name: String,
    chunk_size: usize,
}

impl RemoteStorage {
    pub fn new(session: Arc<RemoteSession>, root: String) -> Self {
        let name = format!("sftp://{}{}", session.describe(), root);
        Self {
            session,
            root,
            name,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// 每次远程读写的块大小
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn resolve_path(&self, path: &str) -> Result<String, SyncItemError> {
        let relative =
            normalize_relative(path).ok_or_else(|| SyncItemError::InvalidPath(path.to_string()))?;
        Ok(join_remote(&self.root, &relative))
    }

    /// 同目录下的临时文件 `.name.treesync.tmp`
    fn temp_path(full_path: &str) -> String {
        let (parent, file_name) = match full_path.rfind('/') {
            Some(idx) => (&full_path[..=idx], &full_path[idx + 1..]),
            None => ("", full_path),
        };
        format!("{}.{}.treesync.tmp", parent, file_name)
    }

    /// 逐级创建目录，直到扫描根
    async fn ensure_dir(&self, full_path: &str) -> Result<(), SyncItemError> {
        let mut missing = Vec::new();
        let mut current = full_path.to_string();

        loop {
            match self.session.stat(&current).await {
                Ok(stat) if stat.is_dir() => break,
                Ok(_) => return Err(RemoteError::Failure(format!("不是目录: {}", current)).into()),
                Err(RemoteError::NotFound(_)) => {
                    missing.push(current.clone());
                    match remote_parent(&current) {
                        Some(parent) if current != self.root => current = parent.to_string(),
                        _ => break,
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        for dir in missing.into_iter().rev() {
            debug!("创建远程目录: {}", dir);
            if let Err(e) = self.session.create_dir(&dir).await {
                // 可能被并发任务抢先创建
                match self.session.stat(&dir).await {
                    Ok(stat) if stat.is_dir() => {}
                    _ => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// 把数据流按块写入临时文件，返回写入的字节数
    async fn upload(&self, temp: &str, mut data: ByteStream) -> Result<u64, SyncItemError> {
        let mut buffer = BytesMut::new();
        let mut offset = 0u64;
        while let Some(chunk) = data.next().await {
            buffer.extend_from_slice(&chunk?);
            while buffer.len() >= self.chunk_size {
                let part = buffer.split_to(self.chunk_size).freeze();
                let len = part.len() as u64;
                self.session.write_chunk(temp, offset, part).await?;
                offset += len;
            }
        }
        // 空文件也要创建
        if !buffer.is_empty() || offset == 0 {
            let part = buffer.freeze();
            let len = part.len() as u64;
            self.session.write_chunk(temp, offset, part).await?;
            offset += len;
        }
        Ok(offset)
    }

    /// 用临时文件替换目标
    ///
    /// SFTP v3 的 rename 不覆盖已有文件，此时先删除目标再重命名；两步之间
    /// 目标短暂缺失，但内容完整保留在临时文件中。
    async fn replace(&self, temp: &str, full_path: &str) -> Result<(), SyncItemError> {
        let err = match self.session.rename(temp, full_path).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        match self.session.lstat(full_path).await {
            Ok(stat) if stat.kind != RemoteKind::Directory => {}
            _ => {
                self.discard(temp).await;
                return Err(err.into());
            }
        }

        debug!("目标已存在，删除后重命名: {}", full_path);
        if let Err(e) = self.session.delete(full_path).await {
            self.discard(temp).await;
            return Err(e.into());
        }
        if let Err(e) = self.session.rename(temp, full_path).await {
            warn!("重命名失败，内容保留在临时文件 {}: {}", temp, e);
            return Err(e.into());
        }
        Ok(())
    }

    /// 尽力删除临时文件
    async fn discard(&self, temp: &str) {
        match self.session.delete(temp).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => {}
            Err(e) => warn!("无法删除临时文件 {}: {}", temp, e),
        }
    }
}

#[async_trait]
impl Storage for RemoteStorage {
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>, SyncItemError> {
        let full_path = self.resolve_path(path)?;
        match self.session.stat(&full_path).await {
            Ok(stat) => Ok(Some(FileMeta {
                size: if stat.is_dir() { 0 } else { stat.size },
                modified_time: stat.mtime,
                is_dir: stat.is_dir(),
            })),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> Result<Bytes, SyncItemError> {
        let mut data = self.read_stream(path).await?;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = data.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), SyncItemError> {
        self.write_stream(path, stream::once(async move { Ok(data) }).boxed())
            .await?;
        Ok(())
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream, SyncItemError> {
        let full_path = self.resolve_path(path)?;
        let reader = self.session.open_for_read(&full_path, self.chunk_size);
        let missing = path.to_string();

        Ok(stream::try_unfold(reader, move |mut reader| {
            let missing = missing.clone();
            async move {
                match reader.next_chunk().await {
                    Ok(Some(chunk)) => Ok(Some((chunk, reader))),
                    Ok(None) => Ok(None),
                    Err(RemoteError::NotFound(_)) => Err(SyncItemError::SourceMissing(missing)),
                    Err(e) => Err(e.into()),
                }
            }
        })
        .boxed())
    }

    /// 先写同目录下的临时文件，完成后重命名覆盖目标，失败时目标保持原样
    async fn write_stream(&self, path: &str, data: ByteStream) -> Result<u64, SyncItemError> {
        let full_path = self.resolve_path(path)?;
        if let Some(parent) = remote_parent(&full_path) {
            self.ensure_dir(parent).await?;
        }

        let temp = Self::temp_path(&full_path);
        let written = match self.upload(&temp, data).await {
            Ok(written) => written,
            Err(e) => {
                self.discard(&temp).await;
                return Err(e);
            }
        };
        self.replace(&temp, &full_path).await?;
        Ok(written)
    }

    async fn set_modified(&self, path: &str, mtime: i64) -> Result<(), SyncItemError> {
        let full_path = self.resolve_path(path)?;
        self.session.set_modified(&full_path, mtime).await?;
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<(), SyncItemError> {
        let full_path = self.resolve_path(path)?;
        self.ensure_dir(&full_path).await
    }

    async fn delete(&self, path: &str) -> Result<(), SyncItemError> {
        let full_path = self.resolve_path(path)?;
        // 不跟随链接：指向目录的符号链接按文件删除
        match self.session.lstat(&full_path).await {
            Ok(stat) if stat.kind == RemoteKind::Directory => {
                let children = self.session.list_directory(&full_path).await?;
                if !children.is_empty() {
                    return Err(SyncItemError::DirectoryNotEmpty(path.to_string()));
                }
            }
            Ok(_) => {}
            Err(RemoteError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        match self.session.delete(&full_path).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
