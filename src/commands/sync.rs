use super::{close_location, open_location, LocationSpec};
use crate::core::entry::normalize_relative;
use crate::core::{
    CompareOutcome, ComparisonStatus, FilterEngine, Operation, Outcome, PerItemResult, ScanResult,
    Side, SyncAction, SyncEngine, SyncReport,
};
use anyhow::{bail, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// 同步方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    pub fn source(self) -> Side {
        match self {
            Direction::AToB => Side::A,
            Direction::BToA => Side::B,
        }
    }

    fn only_in(side: Side) -> ComparisonStatus {
        match side {
            Side::A => ComparisonStatus::OnlyInA,
            Side::B => ComparisonStatus::OnlyInB,
        }
    }
}

fn is_under(path: &str, dir: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// 经由符号链接到达的目录
fn symlinked_dirs(scan: &ScanResult) -> Vec<&str> {
    scan.entries()
        .values()
        .filter(|e| e.is_symlink && e.is_dir())
        .map(|e| e.relative_path.as_str())
        .collect()
}

/// 规划时不能安全修改的范围
struct PlanGuard<'a> {
    /// 任一侧扫描跳过的路径；None 表示根目录本身没有列出
    skipped: Option<Vec<String>>,
    /// 目标侧的符号链接目录，其下的路径在扫描根之外
    target_links: Vec<&'a str>,
}

impl<'a> PlanGuard<'a> {
    fn new(outcome: &'a CompareOutcome, target: Side) -> Self {
        let mut skipped = Some(Vec::new());
        for error in outcome.scan_a.skipped().iter().chain(outcome.scan_b.skipped()) {
            match normalize_relative(&error.path) {
                Some(path) => {
                    if let Some(list) = skipped.as_mut() {
                        list.push(path);
                    }
                }
                None => skipped = None,
            }
        }
        let target_scan = match target {
            Side::A => &outcome.scan_a,
            Side::B => &outcome.scan_b,
        };
        Self {
            skipped,
            target_links: symlinked_dirs(target_scan),
        }
    }

    /// 路径位于跳过的路径上或其下；删除时还包括跳过路径的祖先目录
    fn near_skipped(&self, path: &str, with_ancestors: bool) -> bool {
        match &self.skipped {
            None => true,
            Some(list) => list.iter().any(|s| {
                s == path || is_under(path, s) || (with_ancestors && is_under(s, path))
            }),
        }
    }

    fn through_link(&self, path: &str) -> bool {
        self.target_links.iter().any(|link| is_under(path, link))
    }

    fn blocks_copy(&self, path: &str) -> bool {
        self.near_skipped(path, false) || self.through_link(path)
    }

    fn blocks_delete(&self, path: &str) -> bool {
        self.near_skipped(path, true) || self.through_link(path)
    }
}

/// 同步计划
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub actions: Vec<SyncAction>,
    /// 因扫描不完整或位于符号链接目录下而未处理的路径
    pub withheld: Vec<String>,
}

/// 由比较结果生成单向同步动作
///
/// - 仅存在于来源侧、内容不同：从来源复制
/// - 类型冲突：先删除目标侧，再从来源复制；目标侧冲突目录下的内容一并删除
/// - 仅存在于目标侧：`delete_extra` 时删除
///
/// 任一侧扫描跳过的路径（连同其下内容）不生成复制或删除，跳过路径的祖先目录
/// 不删除；目标侧符号链接目录下的内容不修改，删除时只删除链接本身。
pub fn plan_actions(outcome: &CompareOutcome, direction: Direction, delete_extra: bool) -> SyncPlan {
    let source = direction.source();
    let target = source.opposite();
    let only_source = Direction::only_in(source);
    let only_target = Direction::only_in(target);
    let guard = PlanGuard::new(outcome, target);
    let statuses = &outcome.comparison.statuses;

    let conflicts: Vec<&str> = statuses
        .iter()
        .filter(|(p, s)| **s == ComparisonStatus::TypeConflict && !guard.blocks_delete(p))
        .map(|(p, _)| p.as_str())
        .collect();

    let mut plan = SyncPlan::default();
    for (path, status) in statuses {
        match *status {
            ComparisonStatus::Different => {
                if guard.blocks_copy(path) {
                    plan.withheld.push(path.clone());
                } else {
                    plan.actions.push(SyncAction::copy(source, path.clone()));
                }
            }
            ComparisonStatus::TypeConflict => {
                // 删除和复制要么都做，要么都不做
                if guard.blocks_delete(path) || guard.blocks_copy(path) {
                    plan.withheld.push(path.clone());
                } else {
                    plan.actions.push(SyncAction::delete(target, path.clone()));
                    plan.actions.push(SyncAction::copy(source, path.clone()));
                }
            }
            s if s == only_source => {
                if guard.blocks_copy(path) {
                    plan.withheld.push(path.clone());
                } else {
                    plan.actions.push(SyncAction::copy(source, path.clone()));
                }
            }
            s if s == only_target => {
                let in_conflict = conflicts.iter().any(|dir| is_under(path, dir));
                if !(delete_extra || in_conflict) {
                    continue;
                }
                if guard.blocks_delete(path) {
                    plan.withheld.push(path.clone());
                } else {
                    plan.actions.push(SyncAction::delete(target, path.clone()));
                }
            }
            _ => {}
        }
    }

    if !plan.withheld.is_empty() {
        warn!("{} 个路径因扫描不完整或经过符号链接未处理", plan.withheld.len());
    }
    plan
}

/// 删除一侧的某个路径；目录按子项逐个删除
///
/// 符号链接目录只删除链接本身，不进入其中。
pub fn plan_delete(scan: &ScanResult, side: Side, relative_path: &str) -> Result<Vec<SyncAction>> {
    let Some(entry) = scan.get(relative_path) else {
        bail!("路径不在扫描结果中: {}", relative_path);
    };
    let links = symlinked_dirs(scan);
    if let Some(link) = links.iter().find(|link| is_under(relative_path, link)) {
        bail!("路径位于符号链接目录 {} 之下: {}", link, relative_path);
    }

    let mut paths: BTreeSet<&str> = BTreeSet::new();
    paths.insert(entry.relative_path.as_str());
    if entry.is_dir() && !entry.is_symlink {
        paths.extend(scan.paths().map(String::as_str).filter(|p| {
            is_under(p, relative_path) && !links.iter().any(|link| is_under(p, link))
        }));
    }
    Ok(paths
        .into_iter()
        .map(|p| SyncAction::delete(side, p))
        .collect())
}

/// 打印一条进度
pub fn progress_line(item: &PerItemResult) -> String {
    let op = match item.action.operation {
        Operation::Copy => format!(
            "{:?}->{:?}",
            item.action.source_side,
            item.action.source_side.opposite()
        ),
        Operation::Delete => format!("删除@{:?}", item.action.source_side),
    };
    match &item.outcome {
        Outcome::Success => format!("[成功] {} {} ({} 字节)", op, item.action.relative_path, item.bytes),
        Outcome::Failed(reason) => format!("[失败] {} {}: {}", op, item.action.relative_path, reason),
        Outcome::Skipped(reason) => format!("[跳过] {} {}: {}", op, item.action.relative_path, reason),
    }
}

/// `sync` 子命令的参数
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub direction: Direction,
    pub delete_extra: bool,
    pub dry_run: bool,
}

/// 同步命令的结果
#[derive(Debug)]
pub struct SyncRun {
    pub outcome: CompareOutcome,
    pub actions: Vec<SyncAction>,
    /// 未处理的路径，见 [`SyncPlan::withheld`]
    pub withheld: Vec<String>,
    /// dry-run 时为 None
    pub report: Option<SyncReport>,
}

/// 比较两侧、规划并执行单向同步
pub async fn run_sync(
    engine: &SyncEngine,
    a: &LocationSpec,
    b: &LocationSpec,
    filter: &FilterEngine,
    options: &SyncOptions,
    mut on_item: impl FnMut(&PerItemResult),
) -> Result<SyncRun> {
    let loc_a = open_location(a, engine.config()).await?;
    let loc_b = open_location(b, engine.config()).await?;

    let result = async {
        let outcome = engine.compare(&loc_a, &loc_b, filter).await?;
        if outcome.is_partial() {
            bail!("扫描已取消，不执行同步");
        }

        let SyncPlan { actions, withheld } =
            plan_actions(&outcome, options.direction, options.delete_extra);
        info!(
            "同步计划: {:?}, {} 个动作{}",
            options.direction,
            actions.len(),
            if options.dry_run { " (dry-run)" } else { "" }
        );

        let report = if options.dry_run || actions.is_empty() {
            None
        } else {
            let stream = engine.execute(&loc_a, &loc_b, actions.clone());
            Some(SyncReport::collect_with(stream, &mut on_item).await)
        };
        if let Some(report) = &report {
            if report.failed > 0 {
                warn!("同步完成，但有 {} 个动作失败", report.failed);
            }
        }

        Ok(SyncRun {
            outcome,
            actions,
            withheld,
            report,
        })
    }
    .await;

    close_location(&loc_a).await;
    close_location(&loc_b).await;
    result
}

/// 删除一侧的单个路径（目录连同其内容）
pub async fn run_delete(
    engine: &SyncEngine,
    spec: &LocationSpec,
    relative_path: &str,
    mut on_item: impl FnMut(&PerItemResult),
) -> Result<SyncReport> {
    let location = open_location(spec, engine.config()).await?;

    let result = async {
        let scan = engine.scan(&location, &FilterEngine::default()).await?;
        let actions = plan_delete(&scan, Side::A, relative_path)?;
        info!("删除 {}: {} 个动作", relative_path, actions.len());
        // 两侧指向同一位置，删除只作用于 A
        let stream = engine.execute(&location, &location, actions);
        Ok(SyncReport::collect_with(stream, &mut on_item).await)
    }
    .await;

    close_location(&location).await;
    result
}
