//! 命令行子命令的实现

pub mod compare;
pub mod sync;
pub mod test;

use crate::config::EngineConfig;
use crate::remote::{
    RemoteAuth, RemoteConfig, RemoteSession, SessionConfig, SftpConnector, DEFAULT_SSH_PORT,
};
use crate::storage::Location;
use anyhow::{anyhow, bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// 一侧的位置描述：本地路径，或远程主机上的路径
#[derive(Debug, Clone)]
pub struct LocationSpec {
    pub path: String,
    pub remote: Option<RemoteConfig>,
}

impl LocationSpec {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            remote: None,
        }
    }
}

/// 解析 `user@host[:port]`
pub fn parse_ssh_target(target: &str) -> Result<(String, String, u16)> {
    let (user, host_port) = target
        .split_once('@')
        .ok_or_else(|| anyhow!("远程地址格式应为 user@host[:port]: {}", target))?;
    if user.is_empty() {
        bail!("远程地址缺少用户名: {}", target);
    }

    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("无效端口: {}", port))?;
            (host, port)
        }
        _ => (host_port, DEFAULT_SSH_PORT),
    };
    if host.is_empty() {
        bail!("远程地址缺少主机名: {}", target);
    }

    Ok((user.to_string(), host.to_string(), port))
}

/// 根据命令行参数构造远程配置；未给出私钥时从环境变量读取密码
pub fn remote_config(
    target: &str,
    key: Option<PathBuf>,
    password_env: &[&str],
) -> Result<RemoteConfig> {
    let (username, host, port) = parse_ssh_target(target)?;
    let auth = match key {
        Some(path) => RemoteAuth::Key {
            path,
            passphrase: std::env::var("TREESYNC_KEY_PASSPHRASE").ok(),
        },
        None => {
            let password = password_env
                .iter()
                .find_map(|name| std::env::var(name).ok())
                .ok_or_else(|| {
                    anyhow!(
                        "未指定私钥，且环境变量 {} 中没有密码",
                        password_env.join(" / ")
                    )
                })?;
            RemoteAuth::Password { password }
        }
    };
    Ok(RemoteConfig {
        host,
        port,
        username,
        auth,
    })
}

/// 打开一侧：远程时建立会话并立即认证
pub async fn open_location(spec: &LocationSpec, config: &EngineConfig) -> Result<Location> {
    match &spec.remote {
        None => Ok(Location::Local(PathBuf::from(&spec.path))),
        Some(remote) => {
            let session = open_session(remote, config, config.remote_pool_size).await?;
            Ok(Location::Remote {
                session,
                root: spec.path.clone(),
            })
        }
    }
}

pub(crate) async fn open_session(
    remote: &RemoteConfig,
    config: &EngineConfig,
    pool_size: usize,
) -> Result<Arc<RemoteSession>> {
    let connector = SftpConnector::new(remote.clone(), config.connect_timeout());
    let session = RemoteSession::new(
        Arc::new(connector),
        SessionConfig {
            pool_size,
            op_timeout: config.remote_timeout(),
        },
    );
    session
        .connect()
        .await
        .with_context(|| format!("无法连接 {}", remote.key()))?;
    info!("远程会话就绪: {} (连接池 {})", remote.key(), pool_size);
    Ok(Arc::new(session))
}

/// 关闭远程会话（本地位置无操作）
pub async fn close_location(location: &Location) {
    if let Location::Remote { session, .. } = location {
        session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ssh_target() {
        let (user, host, port) = parse_ssh_target("alice@example.org").unwrap();
        assert_eq!((user.as_str(), host.as_str(), port), ("alice", "example.org", 22));

        let (_, host, port) = parse_ssh_target("bob@10.0.0.2:2222").unwrap();
        assert_eq!((host.as_str(), port), ("10.0.0.2", 2222));

        assert!(parse_ssh_target("example.org").is_err());
        assert!(parse_ssh_target("@host").is_err());
        assert!(parse_ssh_target("u@host:notaport").is_err());
    }

    #[test]
    fn test_remote_config_with_key() {
        let config = remote_config("carol@h:23", Some(PathBuf::from("/k/id_ed25519")), &[]).unwrap();
        assert_eq!(config.key(), "carol@h:23");
        assert!(matches!(config.auth, RemoteAuth::Key { .. }));
    }

    #[test]
    fn test_remote_config_requires_password_source() {
        let err = remote_config("dave@h", None, &["TREESYNC_TEST_UNSET_PASSWORD"]).unwrap_err();
        assert!(err.to_string().contains("TREESYNC_TEST_UNSET_PASSWORD"));
    }
}
