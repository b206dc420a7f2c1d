//! 排除规则

use regex::Regex;
use tracing::warn;

/// 规则类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// 按 glob 匹配路径最后一段，文件和目录都适用
    NameGlob,
    /// 以 `/` 结尾，只匹配目录（连同其下所有内容）
    DirOnly,
}

/// 单条排除规则
#[derive(Debug, Clone)]
pub struct FilterRule {
    pattern: String,
    kind: FilterKind,
    matcher: Regex,
}

impl FilterRule {
    /// 解析规则字符串，空白规则返回 None
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let (stem, kind) = if trimmed.ends_with('/') || trimmed.ends_with('\\') {
            (
                trimmed.trim_end_matches(['/', '\\']),
                FilterKind::DirOnly,
            )
        } else {
            (trimmed, FilterKind::NameGlob)
        };
        if stem.is_empty() {
            return None;
        }

        let regex_src = format!("^{}$", glob_to_regex(stem));
        match Regex::new(&regex_src) {
            Ok(matcher) => Some(Self {
                pattern: trimmed.to_string(),
                kind,
                matcher,
            }),
            Err(e) => {
                // 字符类内容非法时退化为字面匹配
                warn!("排除规则无法编译，按字面匹配: {} ({})", trimmed, e);
                let literal = format!("^{}$", regex::escape(stem));
                Regex::new(&literal).ok().map(|matcher| Self {
                    pattern: trimmed.to_string(),
                    kind,
                    matcher,
                })
            }
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    fn matches_segment(&self, segment: &str, is_dir: bool) -> bool {
        match self.kind {
            FilterKind::NameGlob => self.matcher.is_match(segment),
            FilterKind::DirOnly => is_dir && self.matcher.is_match(segment),
        }
    }
}

/// shell 风格 glob 转正则：`*`、`?`、`[...]`，`[!...]` 表示取反
fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::with_capacity(glob.len() * 2);
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                // `]` 紧跟在 `[` 或 `[!` 之后时视为普通字符
                let mut j = i + 1;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }

                if j >= chars.len() {
                    out.push_str(r"\[");
                } else {
                    out.push('[');
                    out.push_str(&class_body(&chars[i + 1..j]));
                    out.push(']');
                    i = j;
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    out
}

/// 字符类内容转正则：除区间的 `-` 外逐字转义
///
/// regex 的字符类里 `[`、`&&`、`--`、`~~` 都有特殊含义，glob 中只当普通字符。
fn class_body(body: &[char]) -> String {
    let mut out = String::with_capacity(body.len() * 2);
    let mut rest = body;
    if let Some(('!', tail)) = rest.split_first() {
        out.push('^');
        rest = tail;
    }

    let mut i = 0;
    while i < rest.len() {
        let c = rest[i];
        let is_range = c == '-' && i > 0 && i + 1 < rest.len();
        if is_range {
            out.push('-');
        } else {
            out.push_str(&regex::escape(&c.to_string()));
        }
        i += 1;
    }
    out
}

/// 排除规则集合，所有规则取逻辑或
#[derive(Debug, Clone, Default)]
pub struct FilterEngine {
    rules: Vec<FilterRule>,
}

impl FilterEngine {
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            rules: rules
                .into_iter()
                .filter_map(|r| FilterRule::parse(r.as_ref()))
                .collect(),
        }
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 路径是否应被排除
    ///
    /// 中间段一定是目录，两类规则都参与匹配；最后一段按 `is_dir` 决定
    /// 目录规则是否适用。被排除目录下的任何路径也视为被排除。
    pub fn matches(&self, relative_path: &str, is_dir: bool) -> bool {
        if self.rules.is_empty() {
            return false;
        }

        let segments: Vec<&str> = relative_path.split('/').filter(|s| !s.is_empty()).collect();
        let last = segments.len().saturating_sub(1);

        segments.iter().enumerate().any(|(idx, segment)| {
            let segment_is_dir = idx < last || is_dir;
            self.rules
                .iter()
                .any(|rule| rule.matches_segment(segment, segment_is_dir))
        })
    }

    /// 扫描时对单个子项的判断：父目录已经通过检查，只看最后一段
    pub fn excludes_child(&self, name: &str, is_dir: bool) -> bool {
        self.rules.iter().any(|rule| rule.matches_segment(name, is_dir))
    }
}
