use super::{close_location, open_location, LocationSpec};
use crate::config::EngineConfig;
use crate::core::{CompareOutcome, CompareStats, ComparisonStatus, FilterEngine, SyncEngine};
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// `compare --json` 的输出
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareReport<'a> {
    pub root_status: ComparisonStatus,
    pub statuses: &'a BTreeMap<String, ComparisonStatus>,
    pub stats: &'a CompareStats,
    pub skipped_a: Vec<String>,
    pub skipped_b: Vec<String>,
    pub partial: bool,
}

impl<'a> CompareReport<'a> {
    pub fn new(outcome: &'a CompareOutcome) -> Self {
        Self {
            root_status: outcome.comparison.root_status(),
            statuses: &outcome.comparison.statuses,
            stats: &outcome.comparison.stats,
            skipped_a: outcome.scan_a.skipped().iter().map(|e| e.to_string()).collect(),
            skipped_b: outcome.scan_b.skipped().iter().map(|e| e.to_string()).collect(),
            partial: outcome.is_partial(),
        }
    }
}

/// 合并命令行规则和配置中的默认规则
pub fn build_filter(cli_rules: &[String], config: &EngineConfig) -> FilterEngine {
    FilterEngine::new(cli_rules.iter().chain(config.filter_rules.iter()))
}

/// 打开两侧、比较，完成后关闭远程会话
pub async fn run_compare(
    engine: &SyncEngine,
    a: &LocationSpec,
    b: &LocationSpec,
    filter: &FilterEngine,
) -> Result<CompareOutcome> {
    let loc_a = open_location(a, engine.config()).await?;
    let loc_b = open_location(b, engine.config()).await?;

    let outcome = engine.compare(&loc_a, &loc_b, filter).await;

    close_location(&loc_a).await;
    close_location(&loc_b).await;
    Ok(outcome?)
}

pub fn status_label(status: ComparisonStatus) -> &'static str {
    match status {
        ComparisonStatus::Identical => "相同",
        ComparisonStatus::Different => "不同",
        ComparisonStatus::OnlyInA => "仅A",
        ComparisonStatus::OnlyInB => "仅B",
        ComparisonStatus::ContainsDifferences => "含差异",
        ComparisonStatus::TypeConflict => "类型冲突",
    }
}

/// 文本输出：列出所有非相同路径，最后给出统计
pub fn render_text(outcome: &CompareOutcome, show_identical: bool) -> String {
    let mut out = String::new();
    for (path, status) in &outcome.comparison.statuses {
        if *status == ComparisonStatus::Identical && !show_identical {
            continue;
        }
        let suffix = match (outcome.scan_a.get(path), outcome.scan_b.get(path)) {
            (Some(e), _) | (None, Some(e)) if e.is_dir() => "/",
            _ => "",
        };
        let _ = writeln!(out, "[{}] {}{}", status_label(*status), path, suffix);
    }

    for error in outcome.scan_a.skipped() {
        let _ = writeln!(out, "[跳过A] {}", error);
    }
    for error in outcome.scan_b.skipped() {
        let _ = writeln!(out, "[跳过B] {}", error);
    }

    let stats = &outcome.comparison.stats;
    let _ = writeln!(
        out,
        "根目录: {} | 相同 {}, 不同 {}, 仅A {}, 仅B {}, 类型冲突 {}, 仅A目录 {}, 仅B目录 {}, 跳过 {}/{}",
        status_label(outcome.comparison.root_status()),
        stats.identical,
        stats.different,
        stats.only_in_a,
        stats.only_in_b,
        stats.type_conflicts,
        stats.dirs_only_in_a,
        stats.dirs_only_in_b,
        stats.skipped_a,
        stats.skipped_b
    );
    if outcome.is_partial() {
        let _ = writeln!(out, "扫描已取消，结果不完整");
    }
    out
}

pub fn render_json(outcome: &CompareOutcome) -> Result<String> {
    Ok(serde_json::to_string_pretty(&CompareReport::new(outcome))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_compare_renders_text_and_json() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::create_dir(a.path().join("docs")).unwrap();
        fs::write(a.path().join("docs/new.md"), b"# new").unwrap();
        fs::create_dir(b.path().join("docs")).unwrap();
        fs::write(a.path().join("same.txt"), b"s").unwrap();
        fs::write(b.path().join("same.txt"), b"s").unwrap();
        fs::write(a.path().join("skip.log"), b"log").unwrap();

        let engine = SyncEngine::new(EngineConfig::default());
        let filter = build_filter(&["*.log".to_string()], engine.config());
        let outcome = run_compare(
            &engine,
            &LocationSpec::local(a.path().to_string_lossy()),
            &LocationSpec::local(b.path().to_string_lossy()),
            &filter,
        )
        .await
        .unwrap();

        let text = render_text(&outcome, false);
        assert!(text.contains("[仅A] docs/new.md"));
        assert!(text.contains("[含差异] docs/"));
        assert!(!text.contains("same.txt"));
        assert!(!text.contains("skip.log"));

        let json: serde_json::Value = serde_json::from_str(&render_json(&outcome).unwrap()).unwrap();
        assert_eq!(json["rootStatus"], "ContainsDifferences");
        assert_eq!(json["statuses"]["docs/new.md"], "OnlyInA");
        assert_eq!(json["stats"]["onlyInA"], 1);
        assert_eq!(json["partial"], false);
    }
}
