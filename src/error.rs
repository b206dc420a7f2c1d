//! 错误类型
//!
//! 按影响范围分为四类：扫描根级错误、单条目错误、远程错误、单个同步动作错误。

use std::fmt;
use thiserror::Error;

/// 远程会话错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// 认证失败，对整个会话致命
    #[error("认证失败: {0}")]
    AuthFailed(String),
    /// 连接断开，会话会自动重连一次后再上报
    #[error("连接已断开: {0}")]
    ConnectionLost(String),
    #[error("远程路径不存在: {0}")]
    NotFound(String),
    #[error("远程权限不足: {0}")]
    PermissionDenied(String),
    #[error("远程调用超时: {0}")]
    Timeout(String),
    /// 服务端拒绝了请求（如目录非空），连接本身仍可用
    #[error("远程操作失败: {0}")]
    Failure(String),
}

impl RemoteError {
    /// 是否对整个会话致命
    pub fn is_fatal(&self) -> bool {
        matches!(self, RemoteError::AuthFailed(_))
    }
}

/// 扫描根级错误，直接终止一次扫描
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("扫描根目录不存在: {0}")]
    NotFound(String),
    #[error("无权访问扫描根目录: {0}")]
    PermissionDenied(String),
    #[error("扫描根路径不是目录: {0}")]
    NotADirectory(String),
    #[error("远程扫描失败: {0}")]
    Remote(RemoteError),
    #[error("扫描任务异常退出: {0}")]
    Task(String),
}

impl ScanError {
    /// 把根路径上的远程错误映射为根级扫描错误
    pub fn from_remote_root(root: &str, err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound(_) => ScanError::NotFound(root.to_string()),
            RemoteError::PermissionDenied(_) => ScanError::PermissionDenied(root.to_string()),
            other => ScanError::Remote(other),
        }
    }

    pub fn from_io_root(root: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ScanError::NotFound(root.to_string()),
            std::io::ErrorKind::PermissionDenied => ScanError::PermissionDenied(root.to_string()),
            _ => ScanError::Task(format!("{}: {}", root, err)),
        }
    }
}

/// 单条目错误的类别
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryErrorKind {
    /// 无法读取（元数据或目录内容）
    Unreadable,
    PermissionDenied,
    /// 符号链接会回到祖先目录
    SymlinkCycle,
    /// 符号链接目标不存在
    BrokenLink,
    /// 相对路径不合法（包含 `..` 等）
    InvalidPath,
    /// 远程调用失败（超时、断线等）
    Remote(RemoteError),
}

impl fmt::Display for EntryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryErrorKind::Unreadable => write!(f, "无法读取"),
            EntryErrorKind::PermissionDenied => write!(f, "权限不足"),
            EntryErrorKind::SymlinkCycle => write!(f, "符号链接循环"),
            EntryErrorKind::BrokenLink => write!(f, "符号链接已失效"),
            EntryErrorKind::InvalidPath => write!(f, "非法路径"),
            EntryErrorKind::Remote(e) => write!(f, "{}", e),
        }
    }
}

/// 单条目错误：被记录并跳过，不会终止扫描
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}: {kind} ({message})")]
pub struct EntryError {
    pub path: String,
    pub kind: EntryErrorKind,
    pub message: String,
}

impl EntryError {
    pub fn new(path: impl Into<String>, kind: EntryErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn from_remote(path: impl Into<String>, err: RemoteError) -> Self {
        let message = err.to_string();
        let kind = match err {
            RemoteError::PermissionDenied(_) => EntryErrorKind::PermissionDenied,
            RemoteError::NotFound(_) => EntryErrorKind::Unreadable,
            other => EntryErrorKind::Remote(other),
        };
        Self::new(path, kind, message)
    }
}

/// 单个同步动作的错误，记录到结果流中，批次继续执行
#[derive(Error, Debug)]
pub enum SyncItemError {
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Remote(#[from] RemoteError),
    #[error("源路径不存在: {0}")]
    SourceMissing(String),
    #[error("目录非空，需先删除其子项: {0}")]
    DirectoryNotEmpty(String),
    #[error("非法路径: {0}")]
    InvalidPath(String),
    /// 路径的中间目录是符号链接，修改会落到扫描根之外
    #[error("路径经过符号链接，拒绝修改: {0}")]
    SymlinkInPath(String),
}
