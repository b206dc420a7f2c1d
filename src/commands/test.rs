use super::open_session;
use crate::config::EngineConfig;
use crate::error::RemoteError;
use crate::remote::RemoteConfig;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct TestConnectionResult {
    pub success: bool,
    pub message: String,
    pub details: Option<String>,
}

impl TestConnectionResult {
    fn failed(message: &str, details: String) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            details: Some(details),
        }
    }
}

pub fn test_local_connection(path: &str) -> TestConnectionResult {
    let std_path = Path::new(path);

    if !std_path.exists() {
        return TestConnectionResult::failed("路径不存在", format!("路径 '{}' 不存在", path));
    }

    if !std_path.is_dir() {
        return TestConnectionResult::failed("路径不是文件夹", format!("'{}' 不是一个文件夹", path));
    }

    let metadata = match std::fs::metadata(std_path) {
        Ok(m) => m,
        Err(e) => return TestConnectionResult::failed("无法访问路径", e.to_string()),
    };

    let readonly = metadata.permissions().readonly();

    TestConnectionResult {
        success: true,
        message: "连接成功".to_string(),
        details: Some(if readonly { "只读访问" } else { "读写访问" }.to_string()),
    }
}

/// 建立单连接会话，解析并检查远程根目录
pub async fn test_remote_connection(
    remote: &RemoteConfig,
    root: &str,
    config: &EngineConfig,
) -> TestConnectionResult {
    let session = match open_session(remote, config, 1).await {
        Ok(session) => session,
        Err(e) => {
            let message = match e.downcast_ref::<RemoteError>() {
                Some(RemoteError::AuthFailed(_)) => "认证失败",
                Some(RemoteError::Timeout(_)) => "连接超时",
                _ => "连接失败",
            };
            return TestConnectionResult::failed(message, format!("{:#}", e));
        }
    };

    let result = match session.real_path(root).await {
        Ok(resolved) => match session.stat(&resolved).await {
            Ok(stat) if stat.is_dir() => TestConnectionResult {
                success: true,
                message: "连接成功".to_string(),
                details: Some(format!("{}:{}", remote.key(), resolved)),
            },
            Ok(_) => TestConnectionResult::failed("路径不是文件夹", format!("'{}' 不是一个文件夹", resolved)),
            Err(e) => TestConnectionResult::failed("无法访问路径", e.to_string()),
        },
        Err(RemoteError::NotFound(_)) => {
            TestConnectionResult::failed("路径不存在", format!("路径 '{}' 不存在", root))
        }
        Err(e) => TestConnectionResult::failed("无法访问路径", e.to_string()),
    };

    session.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_directory_ok() {
        let dir = TempDir::new().unwrap();
        let result = test_local_connection(&dir.path().to_string_lossy());
        assert!(result.success);
        assert_eq!(result.details.as_deref(), Some("读写访问"));
    }

    #[test]
    fn test_local_missing_and_file() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let result = test_local_connection(&missing.to_string_lossy());
        assert!(!result.success);
        assert_eq!(result.message, "路径不存在");

        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let result = test_local_connection(&file.to_string_lossy());
        assert!(!result.success);
        assert_eq!(result.message, "路径不是文件夹");
    }
}
