//! 扫描条目与扫描结果

use crate::error::EntryError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 条目类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntryKind {
    File {
        size: u64,
        /// 内容签名，按需计算
        #[serde(skip_serializing_if = "Option::is_none")]
        content_signature: Option<String>,
    },
    Directory,
}

/// 一个文件系统对象
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// 相对扫描根目录的路径，统一使用 `/`
    pub relative_path: String,
    /// 修改时间（Unix 秒），尽力而为
    pub modified_time: i64,
    #[serde(flatten)]
    pub kind: EntryKind,
    /// 扫描时经由符号链接到达（链接本身），删除时只删除链接
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_symlink: bool,
}

impl Entry {
    pub fn file(relative_path: impl Into<String>, size: u64, modified_time: i64) -> Self {
        Self {
            relative_path: relative_path.into(),
            modified_time,
            kind: EntryKind::File {
                size,
                content_signature: None,
            },
            is_symlink: false,
        }
    }

    pub fn directory(relative_path: impl Into<String>, modified_time: i64) -> Self {
        Self {
            relative_path: relative_path.into(),
            modified_time,
            kind: EntryKind::Directory,
            is_symlink: false,
        }
    }

    /// 标记为符号链接
    pub fn symlinked(mut self) -> Self {
        self.is_symlink = true;
        self
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    /// 文件大小，目录为 0
    pub fn size(&self) -> u64 {
        match self.kind {
            EntryKind::File { size, .. } => size,
            EntryKind::Directory => 0,
        }
    }

    pub fn signature(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::File {
                content_signature, ..
            } => content_signature.as_deref(),
            EntryKind::Directory => None,
        }
    }

    /// 路径深度，顶层条目为 1
    pub fn depth(&self) -> usize {
        path_depth(&self.relative_path)
    }
}

/// 规范化相对路径：统一分隔符，去掉空段和 `.`，拒绝 `..`
pub fn normalize_relative(raw: &str) -> Option<String> {
    let unified = raw.replace('\\', "/");
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

pub fn path_depth(relative_path: &str) -> usize {
    relative_path.split('/').filter(|s| !s.is_empty()).count()
}

/// 父目录的相对路径，顶层条目返回 None
pub fn parent_of(relative_path: &str) -> Option<&str> {
    relative_path.rfind('/').map(|idx| &relative_path[..idx])
}

/// 一次扫描的结果，返回后不可修改
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    entries: HashMap<String, Entry>,
    skipped: Vec<EntryError>,
    excluded: usize,
    cancelled: bool,
}

impl ScanResult {
    pub(crate) fn new(
        entries: HashMap<String, Entry>,
        skipped: Vec<EntryError>,
        excluded: usize,
        cancelled: bool,
    ) -> Self {
        Self {
            entries,
            skipped,
            excluded,
            cancelled,
        }
    }

    pub fn get(&self, relative_path: &str) -> Option<&Entry> {
        self.entries.get(relative_path)
    }

    pub fn contains(&self, relative_path: &str) -> bool {
        self.entries.contains_key(relative_path)
    }

    pub fn entries(&self) -> &HashMap<String, Entry> {
        &self.entries
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 被跳过（无法读取、循环链接、远程失败）的条目
    pub fn skipped(&self) -> &[EntryError] {
        &self.skipped
    }

    /// 被过滤规则排除的条目数（被剪枝目录只计一次）
    pub fn excluded(&self) -> usize {
        self.excluded
    }

    /// 扫描是否因取消而提前结束（结果不完整）
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn file_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_file()).count()
    }

    pub fn dir_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_dir()).count()
    }

    /// 附加内容签名，返回新的扫描结果；未知路径和目录被忽略
    pub fn with_signatures(mut self, signatures: HashMap<String, String>) -> Self {
        for (path, sig) in signatures {
            if let Some(Entry {
                kind: EntryKind::File {
                    content_signature, ..
                },
                ..
            }) = self.entries.get_mut(&path)
            {
                *content_signature = Some(sig);
            }
        }
        self
    }
}
