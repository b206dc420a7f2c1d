use super::{ByteStream, FileMeta, Storage};
use crate::core::entry::normalize_relative;
use crate::error::SyncItemError;
use async_trait::async_trait;
use bytes::Bytes;
use filetime::FileTime;
use futures::{stream, StreamExt};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// 读写时的块大小
const CHUNK_SIZE: usize = 64 * 1024;

pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        let name = format!("local:{}", base_path.display());
        Self { base_path, name }
    }

    fn resolve_path(&self, path: &str) -> Result<PathBuf, SyncItemError> {
        let relative =
            normalize_relative(path).ok_or_else(|| SyncItemError::InvalidPath(path.to_string()))?;
        Ok(relative
            .split('/')
            .fold(self.base_path.clone(), |acc, part| acc.join(part)))
    }

    /// 修改操作使用的路径：根目录以下的中间目录不能是符号链接
    ///
    /// 最后一段可以是链接，删除时只删除链接本身，写入时替换链接。
    async fn resolve_for_update(&self, path: &str) -> Result<PathBuf, SyncItemError> {
        let full_path = self.resolve_path(path)?;
        let parents = full_path
            .strip_prefix(&self.base_path)
            .ok()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let mut current = self.base_path.clone();
        for segment in parents.components() {
            current.push(segment);
            match fs::symlink_metadata(&current).await {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(SyncItemError::SymlinkInPath(path.to_string()));
                }
                Ok(_) => {}
                // 其余部分尚未创建
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(full_path)
    }

    fn temp_path(full_path: &Path) -> PathBuf {
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        full_path.with_file_name(format!(".{}.treesync.tmp", file_name))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>, SyncItemError> {
        let full_path = self.resolve_path(path)?;

        match fs::metadata(&full_path).await {
            Ok(metadata) => {
                let modified = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);

                Ok(Some(FileMeta {
                    size: if metadata.is_dir() { 0 } else { metadata.len() },
                    modified_time: modified,
                    is_dir: metadata.is_dir(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> Result<Bytes, SyncItemError> {
        let full_path = self.resolve_path(path)?;
        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SyncItemError::SourceMissing(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), SyncItemError> {
        self.write_stream(path, stream::once(async move { Ok(data) }).boxed())
            .await?;
        Ok(())
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream, SyncItemError> {
        let full_path = self.resolve_path(path)?;
        let file = match fs::File::open(&full_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncItemError::SourceMissing(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(ReaderStream::with_capacity(file, CHUNK_SIZE)
            .map(|chunk| chunk.map_err(SyncItemError::from))
            .boxed())
    }

    async fn write_stream(&self, path: &str, mut data: ByteStream) -> Result<u64, SyncItemError> {
        let full_path = self.resolve_for_update(path).await?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 使用临时文件写入，然后原子重命名
        let temp_path = Self::temp_path(&full_path);
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            let mut written = 0u64;
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok::<u64, SyncItemError>(written)
        }
        .await;

        match written {
            Ok(written) => {
                fs::rename(&temp_path, &full_path).await?;
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    async fn set_modified(&self, path: &str, mtime: i64) -> Result<(), SyncItemError> {
        let full_path = self.resolve_for_update(path).await?;
        let time = FileTime::from_unix_time(mtime, 0);
        tokio::task::spawn_blocking(move || filetime::set_file_mtime(&full_path, time))
            .await
            .map_err(|e| SyncItemError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<(), SyncItemError> {
        let full_path = self.resolve_for_update(path).await?;
        fs::create_dir_all(&full_path).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), SyncItemError> {
        let full_path = self.resolve_for_update(path).await?;

        let metadata = match fs::symlink_metadata(&full_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            // 只删除空目录，子项需要先作为单独的删除动作完成
            let mut children = fs::read_dir(&full_path).await?;
            if children.next_entry().await?.is_some() {
                return Err(SyncItemError::DirectoryNotEmpty(path.to_string()));
            }
            fs::remove_dir(&full_path).await?;
        } else {
            fs::remove_file(&full_path).await?;
        }

        Ok(())
    }

    async fn signature(&self, path: &str) -> Result<String, SyncItemError> {
        let full_path = self.resolve_path(path)?;
        let missing = path.to_string();

        // 流式哈希，大文件不整体读入内存
        tokio::task::spawn_blocking(move || -> Result<String, SyncItemError> {
            let mut file = match std::fs::File::open(&full_path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(SyncItemError::SourceMissing(missing))
                }
                Err(e) => return Err(e.into()),
            };
            let mut hasher = blake3::Hasher::new();
            let mut buffer = vec![0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hasher.finalize().to_hex().to_string())
        })
        .await
        .map_err(|e| SyncItemError::Io(std::io::Error::other(e)))?
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signature::calculate_hash;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_creates_parents_and_sets_mtime() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());

        storage
            .write("a/b/c.txt", Bytes::from_static(b"content"))
            .await
            .unwrap();
        storage.set_modified("a/b/c.txt", 1_600_000_000).await.unwrap();

        let meta = storage.stat("a/b/c.txt").await.unwrap().unwrap();
        assert_eq!(meta.size, 7);
        assert_eq!(meta.modified_time, 1_600_000_000);
        assert!(!dir.path().join("a/b/.c.txt.treesync.tmp").exists());
        assert!(storage.stat("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_only_empty_dirs() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.write("d/f", Bytes::from_static(b"x")).await.unwrap();

        let err = storage.delete("d").await.unwrap_err();
        assert!(matches!(err, SyncItemError::DirectoryNotEmpty(_)));

        storage.delete("d/f").await.unwrap();
        storage.delete("d").await.unwrap();
        assert!(!dir.path().join("d").exists());
        // 已不存在
        storage.delete("d").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_parent_segments() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        let err = storage.read("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, SyncItemError::InvalidPath(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_refuses_updates_through_symlinked_dirs() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("precious"), b"keep").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let storage = LocalStorage::new(dir.path());

        for err in [
            storage.delete("link/precious").await.unwrap_err(),
            storage
                .write("link/precious", Bytes::from_static(b"x"))
                .await
                .unwrap_err(),
            storage.set_modified("link/precious", 1).await.unwrap_err(),
            storage.create_dir("link/sub").await.unwrap_err(),
        ] {
            assert!(matches!(err, SyncItemError::SymlinkInPath(_)), "{:?}", err);
        }
        assert_eq!(std::fs::read(outside.path().join("precious")).unwrap(), b"keep");
        assert!(!outside.path().join("sub").exists());

        // 读取可以经过链接；删除链接本身只移除链接
        assert_eq!(
            storage.read("link/precious").await.unwrap(),
            Bytes::from_static(b"keep")
        );
        storage.delete("link").await.unwrap();
        assert!(!dir.path().join("link").exists());
        assert!(outside.path().join("precious").exists());
    }

    #[tokio::test]
    async fn test_stream_copy_between_storages() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = LocalStorage::new(src_dir.path());
        let target = LocalStorage::new(dst_dir.path());
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 241) as u8).collect();
        std::fs::write(src_dir.path().join("big.bin"), &data).unwrap();

        let stream = source.read_stream("big.bin").await.unwrap();
        let written = target.write_stream("out/big.bin", stream).await.unwrap();

        assert_eq!(written, data.len() as u64);
        assert_eq!(std::fs::read(dst_dir.path().join("out/big.bin")).unwrap(), data);
        assert!(matches!(
            source.read_stream("missing").await.err().unwrap(),
            SyncItemError::SourceMissing(_)
        ));
    }

    #[tokio::test]
    async fn test_streaming_signature_matches_buffered() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        storage.write("big.bin", Bytes::from(data.clone())).await.unwrap();

        assert_eq!(storage.signature("big.bin").await.unwrap(), calculate_hash(&data));
        assert!(matches!(
            storage.signature("missing").await.unwrap_err(),
            SyncItemError::SourceMissing(_)
        ));
    }
}
