use super::comparator::{CompareConfig, Comparison, FileComparator};
use super::entry::ScanResult;
use super::filter::FilterEngine;
use super::scanner::{LocalScanner, RemoteScanner};
use super::signature::{compute_signatures, signature_candidates};
use super::transfer::{PerItemResult, SyncAction, SyncExecutor};
use crate::config::EngineConfig;
use crate::error::ScanError;
use crate::storage::Location;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 一次比较的完整结果
#[derive(Debug)]
pub struct CompareOutcome {
    pub scan_a: ScanResult,
    pub scan_b: ScanResult,
    pub comparison: Comparison,
}

impl CompareOutcome {
    /// 任一侧扫描因取消而不完整
    pub fn is_partial(&self) -> bool {
        self.scan_a.is_cancelled() || self.scan_b.is_cancelled()
    }
}

/// 扫描 -> 签名 -> 比较 -> 执行 的编排
pub struct SyncEngine {
    config: EngineConfig,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 取消当前的扫描、签名和同步
    pub fn cancel(&self) {
        info!("收到取消请求");
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 取消令牌，供外部（如 Ctrl-C 处理）使用
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 扫描一侧
    pub async fn scan(
        &self,
        location: &Location,
        filter: &FilterEngine,
    ) -> Result<ScanResult, ScanError> {
        match location {
            Location::Local(root) => LocalScanner::scan(root, filter, &self.cancel).await,
            Location::Remote { session, root } => {
                RemoteScanner::new(self.config.scan_workers)
                    .scan(session.clone(), root, filter, &self.cancel)
                    .await
            }
        }
    }

    /// 比较两侧
    ///
    /// 两侧并发扫描，任一侧根级失败即返回错误；启用校验时对大小相同的文件
    /// 补充内容签名后再比较。
    pub async fn compare(
        &self,
        a: &Location,
        b: &Location,
        filter: &FilterEngine,
    ) -> Result<CompareOutcome, ScanError> {
        info!("开始比较: {} <-> {}", a.describe(), b.describe());

        let (mut scan_a, mut scan_b) = tokio::try_join!(self.scan(a, filter), self.scan(b, filter))?;

        if self.config.use_checksum && !self.cancel.is_cancelled() {
            let candidates = signature_candidates(&scan_a, &scan_b);
            if !candidates.is_empty() {
                let workers = self.config.signature_workers;
                let (sigs_a, sigs_b) = tokio::join!(
                    compute_signatures(a.storage(), candidates.clone(), workers, &self.cancel),
                    compute_signatures(b.storage(), candidates, workers, &self.cancel),
                );
                scan_a = scan_a.with_signatures(sigs_a);
                scan_b = scan_b.with_signatures(sigs_b);
            }
        }

        let comparator = FileComparator::with_config(CompareConfig {
            time_tolerance_seconds: self.config.mtime_tolerance_secs,
        });
        let comparison = comparator.compare(&scan_a, &scan_b);

        Ok(CompareOutcome {
            scan_a,
            scan_b,
            comparison,
        })
    }

    /// 执行同步动作
    pub fn execute(
        &self,
        a: &Location,
        b: &Location,
        actions: Vec<SyncAction>,
    ) -> ReceiverStream<PerItemResult> {
        let parallelism = self.config.parallel_transfers();
        info!(
            "执行同步: {} 个动作, 并发 {} ({} <-> {})",
            actions.len(),
            parallelism,
            a.describe(),
            b.describe()
        );
        SyncExecutor::new(a.storage(), b.storage())
            .with_cancel(self.cancel.child_token())
            .execute(actions, parallelism)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::comparator::ComparisonStatus;
    use crate::core::transfer::{Side, SyncReport};
    use std::fs;
    use tempfile::TempDir;

    fn locations() -> (TempDir, TempDir, Location, Location) {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let la = Location::Local(a.path().to_path_buf());
        let lb = Location::Local(b.path().to_path_buf());
        (a, b, la, lb)
    }

    #[tokio::test]
    async fn test_same_size_files_differ_by_content() {
        let (a, b, la, lb) = locations();
        fs::write(a.path().join("identical.txt"), b"x").unwrap();
        fs::write(b.path().join("identical.txt"), b"x").unwrap();
        fs::write(a.path().join("different.txt"), b"A content").unwrap();
        fs::write(b.path().join("different.txt"), b"B content").unwrap();

        let engine = SyncEngine::new(EngineConfig::default());
        let outcome = engine
            .compare(&la, &lb, &FilterEngine::default())
            .await
            .unwrap();

        let comparison = &outcome.comparison;
        assert_eq!(comparison.status("identical.txt"), Some(ComparisonStatus::Identical));
        assert_eq!(comparison.status("different.txt"), Some(ComparisonStatus::Different));
        assert_eq!(comparison.stats.identical, 1);
        assert!(outcome.scan_a.get("different.txt").unwrap().signature().is_some());
        assert!(!outcome.is_partial());
    }

    #[tokio::test]
    async fn test_only_in_a_conflict_and_filter() {
        let (a, b, la, lb) = locations();
        fs::write(a.path().join("only_in_a.txt"), b"a").unwrap();
        fs::create_dir(a.path().join("conflict")).unwrap();
        fs::write(b.path().join("conflict"), b"file").unwrap();
        fs::create_dir(a.path().join("__pycache__")).unwrap();
        fs::write(a.path().join("__pycache__/cache.pyc"), b"c").unwrap();

        let engine = SyncEngine::new(EngineConfig::default());
        let filter = FilterEngine::new(["__pycache__"]);
        let outcome = engine.compare(&la, &lb, &filter).await.unwrap();

        let comparison = &outcome.comparison;
        assert_eq!(comparison.status("only_in_a.txt"), Some(ComparisonStatus::OnlyInA));
        assert_eq!(comparison.status("conflict"), Some(ComparisonStatus::TypeConflict));
        assert_eq!(comparison.status("__pycache__"), None);
        assert_eq!(comparison.status("__pycache__/cache.pyc"), None);
    }

    #[tokio::test]
    async fn test_root_error_aborts_compare() {
        let (a, _b, la, _lb) = locations();
        let missing = Location::Local(a.path().join("missing"));
        let engine = SyncEngine::new(EngineConfig::default());
        let err = engine
            .compare(&la, &missing, &FilterEngine::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_execute_then_compare_is_identical() {
        let (a, b, la, lb) = locations();
        fs::create_dir_all(a.path().join("dir/sub")).unwrap();
        fs::write(a.path().join("dir/sub/file.txt"), b"payload").unwrap();
        fs::write(a.path().join("top.txt"), b"top").unwrap();

        let engine = SyncEngine::new(EngineConfig::default());
        let actions = vec![
            SyncAction::copy(Side::A, "dir"),
            SyncAction::copy(Side::A, "dir/sub"),
            SyncAction::copy(Side::A, "dir/sub/file.txt"),
            SyncAction::copy(Side::A, "top.txt"),
        ];
        let report = SyncReport::collect(engine.execute(&la, &lb, actions)).await;
        assert_eq!(report.copied, 4);
        assert_eq!(report.bytes_transferred, 10);

        let outcome = engine
            .compare(&la, &lb, &FilterEngine::default())
            .await
            .unwrap();
        assert_eq!(outcome.comparison.root_status(), ComparisonStatus::Identical);
        assert_eq!(
            fs::read_to_string(b.path().join("dir/sub/file.txt")).unwrap(),
            "payload"
        );
    }
}
