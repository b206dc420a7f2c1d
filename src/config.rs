//! 应用配置模块
//!
//! 所有配置保存在 `<config_dir>/config.json` 中，按节（`engine`、`log`）读写。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";

/// 并发传输数上限
pub const MAX_PARALLEL_TRANSFERS: usize = 128;

/// 应用配置目录，`config.json` 中的 `data_path` 可重定向到其他已存在目录
pub fn app_config_dir() -> PathBuf {
    let default_config_dir = crate::dirs::config_dir()
        .map(|p| p.join("treesync"))
        .unwrap_or_else(|| PathBuf::from(".treesync"));

    fs::read_to_string(default_config_dir.join(CONFIG_FILE))
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|config| config.get("data_path")?.as_str().map(PathBuf::from))
        .filter(|p| p.is_dir())
        .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
        .unwrap_or(default_config_dir)
}

/// 读取配置文件中的一节，文件缺失或内容损坏时返回 None
pub(crate) fn load_section<T: DeserializeOwned>(config_dir: &Path, section: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    serde_json::from_value(config.get(section)?.clone()).ok()
}

/// 写入配置文件中的一节，保留其他节
pub(crate) fn save_section<T: Serialize>(
    config_dir: &Path,
    section: &str,
    value: &T,
) -> io::Result<()> {
    let config_file = config_dir.join(CONFIG_FILE);

    // 读取现有配置
    let mut config: serde_json::Value = match fs::read_to_string(&config_file) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({})),
        Err(e) if e.kind() == io::ErrorKind::NotFound => serde_json::json!({}),
        Err(e) => return Err(e),
    };
    if !config.is_object() {
        config = serde_json::json!({});
    }

    config[section] = serde_json::to_value(value).map_err(io::Error::other)?;

    fs::create_dir_all(config_dir)?;
    let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
    fs::write(&config_file, content)
}

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// 远程扫描并发列目录数
    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,
    /// 并发传输数
    #[serde(default = "default_max_parallel_transfers")]
    pub max_parallel_transfers: usize,
    /// 修改时间容差（秒）
    #[serde(default = "default_mtime_tolerance")]
    pub mtime_tolerance_secs: i64,
    /// 是否对大小相同的文件计算内容签名
    #[serde(default = "default_use_checksum")]
    pub use_checksum: bool,
    /// 签名计算并发数
    #[serde(default = "default_signature_workers")]
    pub signature_workers: usize,
    /// 单次远程调用超时（秒）
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_secs: u64,
    /// SSH 连接及认证超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// 每个远程会话的物理连接数
    #[serde(default = "default_remote_pool_size")]
    pub remote_pool_size: usize,
    /// 默认排除规则
    #[serde(default)]
    pub filter_rules: Vec<String>,
}

fn default_scan_workers() -> usize {
    8
}

fn default_max_parallel_transfers() -> usize {
    4
}

fn default_mtime_tolerance() -> i64 {
    2
}

fn default_use_checksum() -> bool {
    true
}

fn default_signature_workers() -> usize {
    4
}

fn default_remote_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_remote_pool_size() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_workers: default_scan_workers(),
            max_parallel_transfers: default_max_parallel_transfers(),
            mtime_tolerance_secs: default_mtime_tolerance(),
            use_checksum: default_use_checksum(),
            signature_workers: default_signature_workers(),
            remote_timeout_secs: default_remote_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            remote_pool_size: default_remote_pool_size(),
            filter_rules: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// 从配置文件加载引擎配置，失败时使用默认值
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "engine").unwrap_or_default()
    }

    /// 保存引擎配置
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "engine", self)
    }

    /// 实际使用的并发传输数（1..=128）
    pub fn parallel_transfers(&self) -> usize {
        self.max_parallel_transfers.clamp(1, MAX_PARALLEL_TRANSFERS)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}
