use super::entry::path_depth;
use crate::error::SyncItemError;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 取消后未执行的动作的跳过原因
pub const CANCELLED_REASON: &str = "已取消";

/// 默认并发传输数
pub const DEFAULT_MAX_PARALLELISM: usize = 4;

/// 比较的一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operation {
    Copy,
    Delete,
}

/// 同步动作
///
/// Copy 时 `source_side` 是复制来源；Delete 时 `source_side` 是被删除的一侧。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncAction {
    pub source_side: Side,
    pub relative_path: String,
    pub operation: Operation,
}

impl SyncAction {
    pub fn copy(from: Side, relative_path: impl Into<String>) -> Self {
        Self {
            source_side: from,
            relative_path: relative_path.into(),
            operation: Operation::Copy,
        }
    }

    pub fn delete(on: Side, relative_path: impl Into<String>) -> Self {
        Self {
            source_side: on,
            relative_path: relative_path.into(),
            operation: Operation::Delete,
        }
    }

    /// 被修改的一侧
    pub fn target_side(&self) -> Side {
        match self.operation {
            Operation::Copy => self.source_side.opposite(),
            Operation::Delete => self.source_side,
        }
    }

    pub fn depth(&self) -> usize {
        path_depth(&self.relative_path)
    }
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.operation {
            Operation::Copy => write!(
                f,
                "复制 {:?}->{:?} {}",
                self.source_side,
                self.source_side.opposite(),
                self.relative_path
            ),
            Operation::Delete => write!(f, "删除 {:?}:{}", self.source_side, self.relative_path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Success,
    Failed(String),
    Skipped(String),
}

/// 单个动作的执行结果
#[derive(Debug, Clone, Serialize)]
pub struct PerItemResult {
    pub action: SyncAction,
    pub outcome: Outcome,
    /// 实际传输的字节数
    pub bytes: u64,
}

/// 同步执行器
///
/// 删除按深度从深到浅、复制从浅到深分层执行，同一层内并发，层与层之间等待。
/// 单个动作失败不影响其他动作。
pub struct SyncExecutor {
    storage_a: Arc<dyn Storage>,
    storage_b: Arc<dyn Storage>,
    cancel: CancellationToken,
}

impl SyncExecutor {
    pub fn new(storage_a: Arc<dyn Storage>, storage_b: Arc<dyn Storage>) -> Self {
        Self {
            storage_a,
            storage_b,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 取消执行：已开始的动作会完成，未开始的动作以 Skipped 上报
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 启动执行，返回按完成顺序产出结果的流
    pub fn execute(
        &self,
        actions: Vec<SyncAction>,
        max_parallelism: usize,
    ) -> ReceiverStream<PerItemResult> {
        let (tx, rx) = mpsc::channel(256);
        let driver = Driver {
            storage_a: self.storage_a.clone(),
            storage_b: self.storage_b.clone(),
            cancel: self.cancel.clone(),
            semaphore: Arc::new(Semaphore::new(max_parallelism.max(1))),
            tx,
        };
        tokio::spawn(driver.run(actions));
        ReceiverStream::new(rx)
    }
}

struct Driver {
    storage_a: Arc<dyn Storage>,
    storage_b: Arc<dyn Storage>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    tx: mpsc::Sender<PerItemResult>,
}

impl Driver {
    async fn run(self, actions: Vec<SyncAction>) {
        let total = actions.len();
        let mut deletes: BTreeMap<usize, Vec<SyncAction>> = BTreeMap::new();
        let mut copies: BTreeMap<usize, Vec<SyncAction>> = BTreeMap::new();
        for action in actions {
            let groups = match action.operation {
                Operation::Delete => &mut deletes,
                Operation::Copy => &mut copies,
            };
            groups.entry(action.depth()).or_default().push(action);
        }

        info!(
            "开始执行同步: {} 个动作 ({} 层删除, {} 层复制)",
            total,
            deletes.len(),
            copies.len()
        );

        // 删除自底向上，复制自顶向下
        let groups: Vec<Vec<SyncAction>> = deletes
            .into_values()
            .rev()
            .chain(copies.into_values())
            .collect();

        for group in groups {
            self.run_group(group).await;
        }

        info!("同步执行结束: {} 个动作", total);
    }

    async fn run_group(&self, group: Vec<SyncAction>) {
        let mut tasks = JoinSet::new();
        // 任务异常退出时据此补发失败结果
        let mut running: HashMap<tokio::task::Id, SyncAction> = HashMap::new();
        let mut pending = group.into_iter();

        while let Some(action) = pending.next() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = self.semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                self.skip(action).await;
                for rest in pending.by_ref() {
                    self.skip(rest).await;
                }
                break;
            };

            let source_a = self.storage_a.clone();
            let source_b = self.storage_b.clone();
            let tx = self.tx.clone();
            let tracked = action.clone();
            let handle = tasks.spawn(async move {
                let (source, target) = match action.source_side {
                    Side::A => (source_a, source_b),
                    Side::B => (source_b, source_a),
                };
                let result = perform(&action, source.as_ref(), target.as_ref()).await;
                drop(permit);

                let item = match result {
                    Ok(bytes) => {
                        debug!("完成: {}", action);
                        PerItemResult {
                            action,
                            outcome: Outcome::Success,
                            bytes,
                        }
                    }
                    Err(e) => {
                        warn!("失败: {} ({})", action, e);
                        PerItemResult {
                            action,
                            outcome: Outcome::Failed(e.to_string()),
                            bytes: 0,
                        }
                    }
                };
                // 接收方已关闭时结果直接丢弃
                let _ = tx.send(item).await;
            });
            running.insert(handle.id(), tracked);
        }

        // 层间屏障
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, ())) => {
                    running.remove(&id);
                }
                Err(e) => {
                    warn!("同步任务异常退出: {}", e);
                    if let Some(action) = running.remove(&e.id()) {
                        let _ = self
                            .tx
                            .send(PerItemResult {
                                action,
                                outcome: Outcome::Failed(format!("任务异常退出: {}", e)),
                                bytes: 0,
                            })
                            .await;
                    }
                }
            }
        }
    }

    async fn skip(&self, action: SyncAction) {
        let _ = self
            .tx
            .send(PerItemResult {
                action,
                outcome: Outcome::Skipped(CANCELLED_REASON.to_string()),
                bytes: 0,
            })
            .await;
    }
}

/// 执行单个动作，返回传输的字节数
///
/// Copy 时 `source` 是来源、`target` 是目标；Delete 时删除 `source` 上的路径。
async fn perform(
    action: &SyncAction,
    source: &dyn Storage,
    target: &dyn Storage,
) -> Result<u64, SyncItemError> {
    let path = action.relative_path.as_str();
    match action.operation {
        Operation::Delete => {
            source.delete(path).await?;
            Ok(0)
        }
        Operation::Copy => {
            let meta = source
                .stat(path)
                .await?
                .ok_or_else(|| SyncItemError::SourceMissing(path.to_string()))?;
            if meta.is_dir {
                target.create_dir(path).await?;
                return Ok(0);
            }

            let data = source.read_stream(path).await?;
            let bytes = target.write_stream(path, data).await?;
            if let Err(e) = target.set_modified(path, meta.modified_time).await {
                warn!("无法保留修改时间 {}: {}", path, e);
            }
            Ok(bytes)
        }
    }
}

/// 一次同步执行的汇总
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub copied: usize,
    pub deleted: usize,
    pub failed: usize,
    pub skipped: usize,
    pub bytes_transferred: u64,
    pub cancelled: bool,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub async fn collect<S>(stream: S) -> Self
    where
        S: Stream<Item = PerItemResult> + Unpin,
    {
        Self::collect_with(stream, |_| {}).await
    }

    /// 汇总结果流，每个结果到达时回调一次（用于进度显示）
    pub async fn collect_with<S, F>(mut stream: S, mut on_item: F) -> Self
    where
        S: Stream<Item = PerItemResult> + Unpin,
        F: FnMut(&PerItemResult),
    {
        let mut report = SyncReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            copied: 0,
            deleted: 0,
            failed: 0,
            skipped: 0,
            bytes_transferred: 0,
            cancelled: false,
            errors: Vec::new(),
        };

        while let Some(item) = stream.next().await {
            on_item(&item);
            match &item.outcome {
                Outcome::Success => {
                    match item.action.operation {
                        Operation::Copy => report.copied += 1,
                        Operation::Delete => report.deleted += 1,
                    }
                    report.bytes_transferred += item.bytes;
                }
                Outcome::Failed(reason) => {
                    report.failed += 1;
                    report
                        .errors
                        .push(format!("{}: {}", item.action.relative_path, reason));
                }
                Outcome::Skipped(reason) => {
                    report.skipped += 1;
                    if reason == CANCELLED_REASON {
                        report.cancelled = true;
                    }
                }
            }
        }

        report.finished_at = Utc::now();
        info!(
            "同步汇总: 复制 {}, 删除 {}, 失败 {}, 跳过 {}, {} 字节",
            report.copied, report.deleted, report.failed, report.skipped, report.bytes_transferred
        );
        report
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}
