//! 内存中的远程文件系统，供测试使用

use super::{Connector, RemoteDirEntry, RemoteKind, RemoteStat, RemoteTransport};
use crate::error::RemoteError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Node {
    File { data: Bytes, mtime: i64 },
    Dir { mtime: i64 },
    Symlink { target: String },
}

/// 所有连接共享的文件系统状态
#[derive(Default)]
pub struct MockFs {
    nodes: Mutex<BTreeMap<String, Node>>,
    /// 接下来多少次调用返回 ConnectionLost
    drop_next: AtomicUsize,
    /// 针对特定路径注入的错误
    path_errors: Mutex<HashMap<String, RemoteError>>,
    /// 特定路径在成功若干次调用后失败一次
    delayed_errors: Mutex<HashMap<String, (usize, RemoteError)>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl MockFs {
    pub fn new() -> Arc<Self> {
        let fs = Self::default();
        if let Ok(mut nodes) = fs.nodes.lock() {
            nodes.insert("/".to_string(), Node::Dir { mtime: 0 });
        }
        Arc::new(fs)
    }

    pub fn add_dir(&self, path: &str) {
        self.nodes
            .lock()
            .unwrap()
            .insert(path.to_string(), Node::Dir { mtime: 1_000 });
    }

    pub fn add_file(&self, path: &str, data: &[u8], mtime: i64) {
        self.nodes.lock().unwrap().insert(
            path.to_string(),
            Node::File {
                data: Bytes::copy_from_slice(data),
                mtime,
            },
        );
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        self.nodes.lock().unwrap().insert(
            path.to_string(),
            Node::Symlink {
                target: target.to_string(),
            },
        );
    }

    pub fn file_data(&self, path: &str) -> Option<Bytes> {
        match self.nodes.lock().unwrap().get(path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn mtime(&self, path: &str) -> Option<i64> {
        match self.nodes.lock().unwrap().get(path) {
            Some(Node::File { mtime, .. }) | Some(Node::Dir { mtime }) => Some(*mtime),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(path)
    }

    pub fn drop_next_calls(&self, n: usize) {
        self.drop_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_path(&self, path: &str, err: RemoteError) {
        self.path_errors
            .lock()
            .unwrap()
            .insert(path.to_string(), err);
    }

    /// 路径上的前 `ok_calls` 次调用成功，下一次返回 `err`，之后恢复正常
    pub fn fail_path_once_after(&self, path: &str, ok_calls: usize, err: RemoteError) {
        self.delayed_errors
            .lock()
            .unwrap()
            .insert(path.to_string(), (ok_calls, err));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, path: &str) -> Result<InFlight<'_>, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(self);

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let dropped = self
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            return Err(RemoteError::ConnectionLost("mock 连接断开".into()));
        }
        if let Some(err) = self.path_errors.lock().unwrap().get(path) {
            return Err(err.clone());
        }
        let mut delayed = self.delayed_errors.lock().unwrap();
        let fire = match delayed.get_mut(path) {
            Some((remaining, _)) if *remaining > 0 => {
                *remaining -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if fire {
            if let Some((_, err)) = delayed.remove(path) {
                return Err(err);
            }
        }
        drop(delayed);
        Ok(guard)
    }

    /// 逐段解析符号链接，得到规范路径
    fn resolve(&self, path: &str, depth: usize) -> Result<String, RemoteError> {
        if depth > 40 {
            return Err(RemoteError::Failure(format!("符号链接层数过多: {}", path)));
        }
        let nodes = self.nodes.lock().unwrap();
        let mut current = String::from("/");
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for (idx, segment) in segments.iter().enumerate() {
            let candidate = super::join_remote(&current, segment);
            match nodes.get(&candidate) {
                Some(Node::Symlink { target }) => {
                    let target = target.clone();
                    drop(nodes);
                    let resolved = self.resolve(&target, depth + 1)?;
                    let rest = segments[idx + 1..].join("/");
                    return self.resolve(&super::join_remote(&resolved, &rest), depth + 1);
                }
                Some(_) => current = candidate,
                None => return Err(RemoteError::NotFound(path.to_string())),
            }
        }
        Ok(current)
    }

    fn stat_node(node: &Node) -> RemoteStat {
        match node {
            Node::File { data, mtime } => RemoteStat {
                kind: RemoteKind::File,
                size: data.len() as u64,
                mtime: *mtime,
            },
            Node::Dir { mtime } => RemoteStat {
                kind: RemoteKind::Directory,
                size: 0,
                mtime: *mtime,
            },
            Node::Symlink { .. } => RemoteStat {
                kind: RemoteKind::Symlink,
                size: 0,
                mtime: 0,
            },
        }
    }
}

struct InFlight<'a>(&'a MockFs);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockTransport {
    fs: Arc<MockFs>,
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, RemoteError> {
        let _guard = self.fs.enter(path).await?;
        let dir = self.fs.resolve(path, 0)?;
        let nodes = self.fs.nodes.lock().unwrap();
        match nodes.get(&dir) {
            Some(Node::Dir { .. }) => {}
            _ => return Err(RemoteError::Failure(format!("不是目录: {}", path))),
        }
        Ok(nodes
            .iter()
            .filter(|(key, _)| key.as_str() != dir && super::remote_parent(key) == Some(dir.as_str()))
            .map(|(key, node)| RemoteDirEntry {
                name: key.rsplit('/').next().unwrap_or_default().to_string(),
                stat: MockFs::stat_node(node),
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<RemoteStat, RemoteError> {
        let _guard = self.fs.enter(path).await?;
        let resolved = self.fs.resolve(path, 0)?;
        let nodes = self.fs.nodes.lock().unwrap();
        nodes
            .get(&resolved)
            .map(MockFs::stat_node)
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))
    }

    async fn lstat(&self, path: &str) -> Result<RemoteStat, RemoteError> {
        let _guard = self.fs.enter(path).await?;
        let nodes = self.fs.nodes.lock().unwrap();
        nodes
            .get(path)
            .map(MockFs::stat_node)
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))
    }

    async fn real_path(&self, path: &str) -> Result<String, RemoteError> {
        let _guard = self.fs.enter(path).await?;
        self.fs.resolve(path, 0)
    }

    async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, RemoteError> {
        let _guard = self.fs.enter(path).await?;
        let resolved = self.fs.resolve(path, 0)?;
        let data = self
            .fs
            .file_data(&resolved)
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn write_chunk(&self, path: &str, offset: u64, data: Bytes) -> Result<(), RemoteError> {
        let _guard = self.fs.enter(path).await?;
        let parent = super::remote_parent(path).unwrap_or("/");
        if !self.fs.exists(parent) {
            return Err(RemoteError::NotFound(parent.to_string()));
        }
        let mut nodes = self.fs.nodes.lock().unwrap();
        let mut content = match nodes.get(path) {
            _ if offset == 0 => Vec::new(),
            Some(Node::File { data, .. }) => data.to_vec(),
            _ => return Err(RemoteError::NotFound(path.to_string())),
        };
        let offset = offset as usize;
        let end = offset + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(&data);
        nodes.insert(
            path.to_string(),
            Node::File {
                data: Bytes::from(content),
                mtime: 1_000,
            },
        );
        Ok(())
    }

    /// 与 SFTP v3 一致：目标已存在时失败
    async fn rename(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let _guard = self.fs.enter(from).await?;
        let mut nodes = self.fs.nodes.lock().unwrap();
        if nodes.contains_key(to) {
            return Err(RemoteError::Failure(format!("目标已存在: {}", to)));
        }
        let node = nodes
            .remove(from)
            .ok_or_else(|| RemoteError::NotFound(from.to_string()))?;
        nodes.insert(to.to_string(), node);
        Ok(())
    }

    async fn set_mtime(&self, path: &str, mtime: i64) -> Result<(), RemoteError> {
        let _guard = self.fs.enter(path).await?;
        let mut nodes = self.fs.nodes.lock().unwrap();
        match nodes.get_mut(path) {
            Some(Node::File { mtime: m, .. }) | Some(Node::Dir { mtime: m }) => {
                *m = mtime;
                Ok(())
            }
            _ => Err(RemoteError::NotFound(path.to_string())),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<(), RemoteError> {
        let _guard = self.fs.enter(path).await?;
        let mut nodes = self.fs.nodes.lock().unwrap();
        if nodes.contains_key(path) {
            return Err(RemoteError::Failure(format!("已存在: {}", path)));
        }
        nodes.insert(path.to_string(), Node::Dir { mtime: 1_000 });
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), RemoteError> {
        let _guard = self.fs.enter(path).await?;
        let mut nodes = self.fs.nodes.lock().unwrap();
        match nodes.get(path) {
            Some(Node::File { .. }) | Some(Node::Symlink { .. }) => {
                nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(RemoteError::Failure(format!("是目录: {}", path))),
            None => Err(RemoteError::NotFound(path.to_string())),
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<(), RemoteError> {
        let _guard = self.fs.enter(path).await?;
        let mut nodes = self.fs.nodes.lock().unwrap();
        if !matches!(nodes.get(path), Some(Node::Dir { .. })) {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        let has_children = nodes
            .keys()
            .any(|key| super::remote_parent(key) == Some(path) && key != path);
        if has_children {
            return Err(RemoteError::Failure(format!("目录非空: {}", path)));
        }
        nodes.remove(path);
        Ok(())
    }
}

pub struct MockConnector {
    pub fs: Arc<MockFs>,
    pub fail_auth: AtomicBool,
    pub connects: AtomicUsize,
}

impl MockConnector {
    pub fn new(fs: Arc<MockFs>) -> Arc<Self> {
        Arc::new(Self {
            fs,
            fail_auth: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteTransport>, RemoteError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_auth.load(Ordering::SeqCst) {
            return Err(RemoteError::AuthFailed("mock 拒绝认证".into()));
        }
        Ok(Arc::new(MockTransport {
            fs: self.fs.clone(),
        }))
    }

    fn describe(&self) -> String {
        "mock@memory:22".to_string()
    }
}
