use super::entry::{parent_of, Entry, ScanResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

/// 单个路径的比较状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonStatus {
    Identical,
    Different,
    OnlyInA,
    OnlyInB,
    /// 目录本身两侧都有，但其下存在差异
    ContainsDifferences,
    /// 一侧是文件，另一侧是目录
    TypeConflict,
}

impl ComparisonStatus {
    /// 交换 A/B 两侧后的状态
    pub fn swapped(self) -> Self {
        match self {
            ComparisonStatus::OnlyInA => ComparisonStatus::OnlyInB,
            ComparisonStatus::OnlyInB => ComparisonStatus::OnlyInA,
            other => other,
        }
    }
}

/// 比较配置
#[derive(Debug, Clone)]
pub struct CompareConfig {
    /// 时间容差（秒），只在两侧都没有内容签名时使用
    pub time_tolerance_seconds: i64,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            time_tolerance_seconds: 2,
        }
    }
}

/// 统计信息，文件和类型冲突各计一次，目录不计入文件统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareStats {
    pub identical: usize,
    pub different: usize,
    pub only_in_a: usize,
    pub only_in_b: usize,
    pub type_conflicts: usize,
    /// 仅存在于一侧的目录
    pub dirs_only_in_a: usize,
    pub dirs_only_in_b: usize,
    /// 两侧扫描中被跳过的条目数
    pub skipped_a: usize,
    pub skipped_b: usize,
}

impl CompareStats {
    pub fn total_files(&self) -> usize {
        self.identical + self.different + self.only_in_a + self.only_in_b
    }

    pub fn has_differences(&self) -> bool {
        self.different
            + self.only_in_a
            + self.only_in_b
            + self.type_conflicts
            + self.dirs_only_in_a
            + self.dirs_only_in_b
            > 0
    }
}

/// 一次比较的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Comparison {
    pub statuses: BTreeMap<String, ComparisonStatus>,
    pub stats: CompareStats,
}

impl Comparison {
    pub fn status(&self, relative_path: &str) -> Option<ComparisonStatus> {
        self.statuses.get(relative_path).copied()
    }

    /// 扫描根目录的状态（根目录本身不在状态表中）
    pub fn root_status(&self) -> ComparisonStatus {
        if self
            .statuses
            .values()
            .any(|s| *s != ComparisonStatus::Identical)
        {
            ComparisonStatus::ContainsDifferences
        } else {
            ComparisonStatus::Identical
        }
    }
}

/// 文件比较器
pub struct FileComparator {
    config: CompareConfig,
}

impl Default for FileComparator {
    fn default() -> Self {
        Self::with_config(CompareConfig::default())
    }
}

impl FileComparator {
    pub fn with_config(config: CompareConfig) -> Self {
        Self { config }
    }

    /// 比较两个文件
    ///
    /// 大小不同直接判定不同；两侧都有签名时以签名为准；否则比较修改时间。
    pub fn files_identical(&self, a: &Entry, b: &Entry) -> bool {
        if a.size() != b.size() {
            return false;
        }

        if let (Some(sig_a), Some(sig_b)) = (a.signature(), b.signature()) {
            return sig_a == sig_b;
        }

        let time_diff = (a.modified_time - b.modified_time).abs();
        time_diff <= self.config.time_tolerance_seconds
    }

    /// 比较两棵树
    pub fn compare(&self, a: &ScanResult, b: &ScanResult) -> Comparison {
        let keys: BTreeSet<&String> = a.paths().chain(b.paths()).collect();
        let mut statuses = BTreeMap::new();
        let mut stats = CompareStats {
            skipped_a: a.skipped().len(),
            skipped_b: b.skipped().len(),
            ..Default::default()
        };
        let mut both_dirs = Vec::new();

        for key in keys {
            let status = match (a.get(key), b.get(key)) {
                (Some(entry), None) => {
                    if entry.is_dir() {
                        stats.dirs_only_in_a += 1;
                    } else {
                        stats.only_in_a += 1;
                    }
                    ComparisonStatus::OnlyInA
                }
                (None, Some(entry)) => {
                    if entry.is_dir() {
                        stats.dirs_only_in_b += 1;
                    } else {
                        stats.only_in_b += 1;
                    }
                    ComparisonStatus::OnlyInB
                }
                (Some(ea), Some(eb)) if ea.is_dir() != eb.is_dir() => {
                    stats.type_conflicts += 1;
                    ComparisonStatus::TypeConflict
                }
                (Some(ea), Some(_)) if ea.is_dir() => {
                    // 目录状态稍后由子项决定
                    both_dirs.push(key.clone());
                    continue;
                }
                (Some(ea), Some(eb)) => {
                    if self.files_identical(ea, eb) {
                        stats.identical += 1;
                        ComparisonStatus::Identical
                    } else {
                        debug!("文件不同: {}", key);
                        stats.different += 1;
                        ComparisonStatus::Different
                    }
                }
                (None, None) => continue,
            };
            statuses.insert(key.clone(), status);
        }

        // 任何非 Identical 的路径都会把所有祖先目录标记为有差异
        let mut dirty: HashSet<&str> = HashSet::new();
        for (path, _) in statuses
            .iter()
            .filter(|(_, s)| **s != ComparisonStatus::Identical)
        {
            let mut current = parent_of(path);
            while let Some(parent) = current {
                if !dirty.insert(parent) {
                    break;
                }
                current = parent_of(parent);
            }
        }

        let dir_statuses: Vec<(String, ComparisonStatus)> = both_dirs
            .into_iter()
            .map(|dir| {
                let status = if dirty.contains(dir.as_str()) {
                    ComparisonStatus::ContainsDifferences
                } else {
                    ComparisonStatus::Identical
                };
                (dir, status)
            })
            .collect();
        statuses.extend(dir_statuses);

        info!(
            "比较完成: 相同 {}, 不同 {}, 仅A {}, 仅B {}, 类型冲突 {}",
            stats.identical, stats.different, stats.only_in_a, stats.only_in_b, stats.type_conflicts
        );

        Comparison { statuses, stats }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scan(entries: Vec<Entry>) -> ScanResult {
        let map: HashMap<String, Entry> = entries
            .into_iter()
            .map(|e| (e.relative_path.clone(), e))
            .collect();
        ScanResult::new(map, vec![], 0, false)
    }

    fn signed(path: &str, content: &[u8], mtime: i64) -> Entry {
        let mut entry = Entry::file(path, content.len() as u64, mtime);
        if let crate::core::entry::EntryKind::File {
            content_signature, ..
        } = &mut entry.kind
        {
            *content_signature = Some(crate::core::signature::calculate_hash(content));
        }
        entry
    }

    #[test]
    fn test_identical_file() {
        let a = scan(vec![Entry::file("identical.txt", 1, 100)]);
        let b = scan(vec![Entry::file("identical.txt", 1, 100)]);
        let result = FileComparator::default().compare(&a, &b);

        assert_eq!(result.status("identical.txt"), Some(ComparisonStatus::Identical));
        assert_eq!(result.stats.identical, 1);
        assert_eq!(result.root_status(), ComparisonStatus::Identical);
    }

    #[test]
    fn test_same_size_different_content() {
        // 修改时间相同，但签名不同
        let a = scan(vec![signed("different.txt", b"A content", 100)]);
        let b = scan(vec![signed("different.txt", b"B content", 100)]);
        let result = FileComparator::default().compare(&a, &b);

        assert_eq!(result.status("different.txt"), Some(ComparisonStatus::Different));
        assert_eq!(result.stats.different, 1);
    }

    #[test]
    fn test_signature_overrides_mtime() {
        let a = scan(vec![signed("f", b"same", 100)]);
        let b = scan(vec![signed("f", b"same", 9_999)]);
        let result = FileComparator::default().compare(&a, &b);
        assert_eq!(result.status("f"), Some(ComparisonStatus::Identical));
    }

    #[test]
    fn test_mtime_tolerance() {
        let a = scan(vec![Entry::file("near", 3, 100), Entry::file("far", 3, 100)]);
        let b = scan(vec![Entry::file("near", 3, 102), Entry::file("far", 3, 103)]);
        let result = FileComparator::default().compare(&a, &b);
        assert_eq!(result.status("near"), Some(ComparisonStatus::Identical));
        assert_eq!(result.status("far"), Some(ComparisonStatus::Different));

        let strict = FileComparator::with_config(CompareConfig {
            time_tolerance_seconds: 0,
        });
        assert_eq!(
            strict.compare(&a, &b).status("near"),
            Some(ComparisonStatus::Different)
        );
    }

    #[test]
    fn test_only_in_a_and_root() {
        let a = scan(vec![Entry::file("only_in_a.txt", 1, 0)]);
        let b = scan(vec![]);
        let result = FileComparator::default().compare(&a, &b);

        assert_eq!(result.status("only_in_a.txt"), Some(ComparisonStatus::OnlyInA));
        assert_eq!(result.stats.only_in_a, 1);
        assert_eq!(result.statuses.len(), 1);
        assert_eq!(result.root_status(), ComparisonStatus::ContainsDifferences);
    }

    #[test]
    fn test_type_conflict() {
        let a = scan(vec![
            Entry::directory("conflict", 0),
            Entry::file("conflict/inner.txt", 1, 0),
        ]);
        let b = scan(vec![Entry::file("conflict", 5, 0)]);
        let result = FileComparator::default().compare(&a, &b);

        assert_eq!(result.status("conflict"), Some(ComparisonStatus::TypeConflict));
        assert_eq!(result.status("conflict/inner.txt"), Some(ComparisonStatus::OnlyInA));
        assert_eq!(result.stats.type_conflicts, 1);
        assert_eq!(result.stats.only_in_a, 1);
    }

    #[test]
    fn test_directory_propagation() {
        let tree = |leaf_size: u64| {
            scan(vec![
                Entry::directory("top", 0),
                Entry::directory("top/mid", 0),
                Entry::directory("top/mid/leaf", 0),
                Entry::file("top/mid/leaf/file", leaf_size, 0),
                Entry::directory("clean", 0),
                Entry::file("clean/file", 1, 0),
            ])
        };
        let result = FileComparator::default().compare(&tree(1), &tree(2));

        assert_eq!(result.status("top/mid/leaf/file"), Some(ComparisonStatus::Different));
        for dir in ["top", "top/mid", "top/mid/leaf"] {
            assert_eq!(result.status(dir), Some(ComparisonStatus::ContainsDifferences));
        }
        assert_eq!(result.status("clean"), Some(ComparisonStatus::Identical));
        // 目录不计入文件统计
        assert_eq!(result.stats.total_files(), 2);
    }

    #[test]
    fn test_exclusive_descendant_marks_ancestors() {
        let a = scan(vec![
            Entry::directory("d", 0),
            Entry::directory("d/new", 0),
        ]);
        let b = scan(vec![Entry::directory("d", 0)]);
        let result = FileComparator::default().compare(&a, &b);

        assert_eq!(result.status("d/new"), Some(ComparisonStatus::OnlyInA));
        assert_eq!(result.status("d"), Some(ComparisonStatus::ContainsDifferences));
        assert_eq!(result.stats.dirs_only_in_a, 1);
        assert_eq!(result.stats.only_in_a, 0);
    }

    #[test]
    fn test_swap_symmetry_and_idempotence() {
        let a = scan(vec![
            Entry::directory("d", 0),
            Entry::file("d/x", 1, 0),
            Entry::file("d/y", 2, 0),
            Entry::file("c", 1, 0),
            Entry::file("same", 1, 0),
        ]);
        let b = scan(vec![
            Entry::directory("d", 0),
            Entry::file("d/y", 3, 0),
            Entry::file("z", 1, 0),
            Entry::directory("c", 0),
            Entry::file("same", 1, 0),
        ]);
        let comparator = FileComparator::default();
        let ab = comparator.compare(&a, &b);
        let ba = comparator.compare(&b, &a);

        assert_eq!(ab.statuses.len(), ba.statuses.len());
        for (path, status) in &ab.statuses {
            assert_eq!(ba.status(path), Some(status.swapped()), "{}", path);
        }
        assert_eq!(ab.stats.only_in_a, ba.stats.only_in_b);
        assert_eq!(ab.stats.only_in_b, ba.stats.only_in_a);

        assert_eq!(comparator.compare(&a, &b), ab);
    }
}
