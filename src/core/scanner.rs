use super::entry::{normalize_relative, Entry, ScanResult};
use super::filter::FilterEngine;
use crate::error::{EntryError, EntryErrorKind, RemoteError, ScanError};
use crate::remote::{join_remote, RemoteKind, RemoteSession, RemoteStat};
use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 默认远程列目录并发数
pub const DEFAULT_SCAN_WORKERS: usize = 8;

fn system_time_secs(time: std::io::Result<std::time::SystemTime>) -> i64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// 本地目录扫描器
pub struct LocalScanner;

impl LocalScanner {
    /// 扫描本地目录，遍历在阻塞线程池中进行
    pub async fn scan(
        root: &Path,
        filter: &FilterEngine,
        cancel: &CancellationToken,
    ) -> Result<ScanResult, ScanError> {
        let root = root.to_path_buf();
        let filter = filter.clone();
        let cancel = cancel.clone();

        // 使用 spawn_blocking 避免阻塞 async runtime
        tokio::task::spawn_blocking(move || Self::scan_blocking(&root, &filter, &cancel))
            .await
            .map_err(|e| ScanError::Task(e.to_string()))?
    }

    pub fn scan_blocking(
        root: &Path,
        filter: &FilterEngine,
        cancel: &CancellationToken,
    ) -> Result<ScanResult, ScanError> {
        let root_display = root.display().to_string();
        let metadata =
            std::fs::metadata(root).map_err(|e| ScanError::from_io_root(&root_display, &e))?;
        if !metadata.is_dir() {
            return Err(ScanError::NotADirectory(root_display));
        }

        info!("开始扫描本地目录: {}", root_display);

        let mut entries = HashMap::new();
        let mut skipped = Vec::new();
        let mut cancelled = false;
        let excluded = Cell::new(0usize);

        // 跟随符号链接；walkdir 会检测指回祖先目录的链接并以错误返回
        let walker = WalkDir::new(root)
            .follow_links(true)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                let is_dir = entry.file_type().is_dir();
                if filter.excludes_child(&name, is_dir) {
                    debug!("排除: {}", entry.path().display());
                    excluded.set(excluded.get() + 1);
                    return false;
                }
                true
            });

        for item in walker {
            if cancel.is_cancelled() {
                info!("本地扫描已取消: {}", root_display);
                cancelled = true;
                break;
            }

            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(|p| relative_display(root, p))
                        .unwrap_or_else(|| root_display.clone());
                    let kind = if err.loop_ancestor().is_some() {
                        EntryErrorKind::SymlinkCycle
                    } else {
                        match err.io_error().map(|e| e.kind()) {
                            Some(std::io::ErrorKind::PermissionDenied) => {
                                EntryErrorKind::PermissionDenied
                            }
                            Some(std::io::ErrorKind::NotFound) => EntryErrorKind::BrokenLink,
                            _ => EntryErrorKind::Unreadable,
                        }
                    };
                    warn!("跳过条目 {}: {}", path, err);
                    skipped.push(EntryError::new(path, kind, err.to_string()));
                    continue;
                }
            };

            let raw_relative = relative_display(root, entry.path());
            let Some(relative) = normalize_relative(&raw_relative) else {
                skipped.push(EntryError::new(
                    raw_relative,
                    EntryErrorKind::InvalidPath,
                    "无法规范化的相对路径",
                ));
                continue;
            };

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    warn!("无法读取元数据 {}: {}", relative, err);
                    skipped.push(EntryError::new(
                        relative,
                        EntryErrorKind::Unreadable,
                        err.to_string(),
                    ));
                    continue;
                }
            };

            let modified = system_time_secs(metadata.modified());
            let mut record = if metadata.is_dir() {
                Entry::directory(relative.clone(), modified)
            } else if metadata.is_file() {
                Entry::file(relative.clone(), metadata.len(), modified)
            } else {
                debug!("跳过特殊文件: {}", relative);
                continue;
            };
            if entry.path_is_symlink() {
                record = record.symlinked();
            }
            entries.insert(relative, record);
        }

        let result = ScanResult::new(entries, skipped, excluded.get(), cancelled);
        info!(
            "本地扫描完成: {} 个文件, {} 个目录, {} 个被排除, {} 个跳过",
            result.file_count(),
            result.dir_count(),
            result.excluded(),
            result.skipped().len()
        );
        Ok(result)
    }
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(PathBuf::from)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .replace('\\', "/")
}

/// 待列出的远程目录
struct DirJob {
    relative: String,
    remote_path: String,
    /// 从根到本目录（含）的规范路径，用于检测符号链接循环
    ancestors: Arc<Vec<String>>,
}

/// 列目录结果中的一个子项，符号链接已解析
struct Child {
    name: String,
    resolved: Result<RemoteStat, RemoteError>,
    /// 目录的规范路径
    real_path: Option<String>,
    is_link: bool,
}

enum JobOutcome {
    Listed { job: DirJob, children: Vec<Child> },
    Failed { job: DirJob, error: RemoteError },
}

/// 远程目录扫描器
///
/// 协调者维护待处理计数并单线程合并结果；固定数量的工作任务从共享队列取目录、
/// 通过 RemoteSession 列出内容，再经 channel 汇总回协调者。
pub struct RemoteScanner {
    workers: usize,
}

impl Default for RemoteScanner {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_WORKERS)
    }
}

impl RemoteScanner {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub async fn scan(
        &self,
        session: Arc<RemoteSession>,
        root: &str,
        filter: &FilterEngine,
        cancel: &CancellationToken,
    ) -> Result<ScanResult, ScanError> {
        let root_stat = session
            .stat(root)
            .await
            .map_err(|e| ScanError::from_remote_root(root, e))?;
        if !root_stat.is_dir() {
            return Err(ScanError::NotADirectory(root.to_string()));
        }
        let root_real = session
            .real_path(root)
            .await
            .map_err(|e| ScanError::from_remote_root(root, e))?;

        info!(
            "开始扫描远程目录: {}:{} ({} 个并发)",
            session.describe(),
            root,
            self.workers
        );

        let (job_tx, job_rx) = mpsc::unbounded_channel::<DirJob>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<JobOutcome>();

        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let session = session.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                loop {
                    let job = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        job = async { job_rx.lock().await.recv().await } => job,
                    };
                    let Some(job) = job else { break };
                    // 队列中剩余的目录在取消后不再列出
                    if cancel.is_cancelled() {
                        break;
                    }
                    let outcome = list_job(&session, job).await;
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut entries: HashMap<String, Entry> = HashMap::new();
        let mut skipped = Vec::new();
        let mut excluded = 0usize;
        let mut cancelled = false;
        let mut fatal = None;

        let root_job = DirJob {
            relative: String::new(),
            remote_path: root.to_string(),
            ancestors: Arc::new(vec![root_real]),
        };
        let mut pending = 0usize;
        if job_tx.send(root_job).is_ok() {
            pending += 1;
        }

        while pending > 0 {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("远程扫描已取消: {}", root);
                    cancelled = true;
                    break;
                }
                outcome = result_rx.recv() => outcome,
            };
            let Some(outcome) = outcome else {
                break;
            };
            pending -= 1;

            let (job, children) = match outcome {
                JobOutcome::Listed { job, children } => (job, children),
                JobOutcome::Failed { job, error } => {
                    if error.is_fatal() {
                        fatal = Some(error);
                        break;
                    }
                    let path = if job.relative.is_empty() {
                        ".".to_string()
                    } else {
                        job.relative.clone()
                    };
                    warn!("无法列出远程目录 {}: {}", path, error);
                    skipped.push(EntryError::from_remote(path, error));
                    continue;
                }
            };

            for child in children {
                let raw = if job.relative.is_empty() {
                    child.name.clone()
                } else {
                    format!("{}/{}", job.relative, child.name)
                };
                let Some(relative) = normalize_relative(&raw) else {
                    skipped.push(EntryError::new(
                        raw,
                        EntryErrorKind::InvalidPath,
                        "无法规范化的相对路径",
                    ));
                    continue;
                };

                let stat = match child.resolved {
                    Ok(stat) => stat,
                    Err(error) => {
                        if error.is_fatal() {
                            fatal = Some(error);
                            break;
                        }
                        let entry_error = match error {
                            RemoteError::NotFound(msg) => {
                                EntryError::new(relative, EntryErrorKind::BrokenLink, msg)
                            }
                            other => EntryError::from_remote(relative, other),
                        };
                        warn!("跳过远程条目: {}", entry_error);
                        skipped.push(entry_error);
                        continue;
                    }
                };

                let is_dir = stat.kind == RemoteKind::Directory;
                if filter.excludes_child(&child.name, is_dir) {
                    debug!("排除: {}", relative);
                    excluded += 1;
                    continue;
                }

                match stat.kind {
                    RemoteKind::Directory => {
                        let real = child
                            .real_path
                            .unwrap_or_else(|| join_remote(&job.remote_path, &child.name));
                        if job.ancestors.contains(&real) {
                            warn!("检测到符号链接循环，跳过: {} -> {}", relative, real);
                            skipped.push(EntryError::new(
                                relative,
                                EntryErrorKind::SymlinkCycle,
                                real,
                            ));
                            continue;
                        }

                        let mut record = Entry::directory(relative.clone(), stat.mtime);
                        if child.is_link {
                            record = record.symlinked();
                        }
                        entries.insert(relative.clone(), record);

                        let mut ancestors = job.ancestors.as_ref().clone();
                        ancestors.push(real);
                        let next = DirJob {
                            relative,
                            remote_path: join_remote(&job.remote_path, &child.name),
                            ancestors: Arc::new(ancestors),
                        };
                        if job_tx.send(next).is_ok() {
                            pending += 1;
                        }
                    }
                    RemoteKind::File => {
                        let mut record = Entry::file(relative.clone(), stat.size, stat.mtime);
                        if child.is_link {
                            record = record.symlinked();
                        }
                        entries.insert(relative, record);
                    }
                    RemoteKind::Symlink | RemoteKind::Other => {
                        debug!("跳过特殊文件: {}", relative);
                    }
                }
            }

            if fatal.is_some() {
                break;
            }
        }

        drop(job_tx);
        if let Some(error) = fatal {
            workers.abort_all();
            warn!("远程扫描失败: {}", error);
            return Err(ScanError::Remote(error));
        }
        while workers.join_next().await.is_some() {}

        let result = ScanResult::new(entries, skipped, excluded, cancelled);
        info!(
            "远程扫描完成: {} 个文件, {} 个目录, {} 个被排除, {} 个跳过",
            result.file_count(),
            result.dir_count(),
            result.excluded(),
            result.skipped().len()
        );
        Ok(result)
    }
}

/// 工作任务：列出一个目录，并解析其中的符号链接
async fn list_job(session: &RemoteSession, job: DirJob) -> JobOutcome {
    let listing = match session.list_directory(&job.remote_path).await {
        Ok(listing) => listing,
        Err(error) => return JobOutcome::Failed { job, error },
    };

    let parent_real = job.ancestors.last().cloned().unwrap_or_default();
    let mut children = Vec::with_capacity(listing.len());
    for item in listing {
        let child_path = join_remote(&job.remote_path, &item.name);
        let child = match item.stat.kind {
            RemoteKind::Symlink => match session.stat(&child_path).await {
                Ok(stat) if stat.is_dir() => match session.real_path(&child_path).await {
                    Ok(real) => Child {
                        name: item.name,
                        resolved: Ok(stat),
                        real_path: Some(real),
                        is_link: true,
                    },
                    Err(e) => Child {
                        name: item.name,
                        resolved: Err(e),
                        real_path: None,
                        is_link: true,
                    },
                },
                resolved => Child {
                    name: item.name,
                    resolved,
                    real_path: None,
                    is_link: true,
                },
            },
            RemoteKind::Directory => Child {
                real_path: Some(join_remote(&parent_real, &item.name)),
                name: item.name,
                resolved: Ok(item.stat),
                is_link: false,
            },
            _ => Child {
                name: item.name,
                resolved: Ok(item.stat),
                real_path: None,
                is_link: false,
            },
        };
        children.push(child);
    }

    JobOutcome::Listed { job, children }
}
