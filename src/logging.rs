//! 日志模块 - 提供文件日志和大小管理功能

use crate::config::{app_config_dir, load_section, save_section};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "log").unwrap_or_default()
    }

    /// 保存日志配置
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "log", self)
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

type SharedWriter = Arc<Mutex<Option<BufWriter<File>>>>;

// 写日志时出错无处上报，锁中毒时沿用内部数据
fn lock(writer: &SharedWriter) -> MutexGuard<'_, Option<BufWriter<File>>> {
    writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 带大小限制的日志写入器，超过上限时 app.log 轮转为 app.log.old
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: SharedWriter,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join("app.log");
        let max_size = (max_size_mb as u64) * 1024 * 1024;

        let writer = open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

fn open_file(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
    // 检查现有文件大小，如果超过限制则轮转
    if exceeds(file_path, max_size) {
        rotate_log(file_path)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)?;

    Ok(BufWriter::new(file))
}

fn exceeds(file_path: &Path, max_size: u64) -> bool {
    fs::metadata(file_path)
        .map(|m| m.len() > max_size)
        .unwrap_or(false)
}

/// 轮转日志文件
fn rotate_log(file_path: &Path) -> io::Result<()> {
    let backup_path = file_path.with_extension("log.old");

    if backup_path.exists() {
        fs::remove_file(&backup_path)?;
    }
    fs::rename(file_path, &backup_path)
}

/// 关闭当前文件、轮转并重新打开
fn rotate_locked(guard: &mut Option<BufWriter<File>>, file_path: &Path, max_size: u64) {
    if let Some(mut w) = guard.take() {
        let _ = w.flush();
    }
    let _ = rotate_log(file_path);
    if let Ok(new_writer) = open_file(file_path, max_size) {
        *guard = Some(new_writer);
    }
}

/// 日志写入器包装
pub struct LogWriter {
    inner: SharedWriter,
    file_path: PathBuf,
    max_size: u64,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = lock(&self.inner);

        let Some(writer) = guard.as_mut() else {
            return Err(io::Error::other("日志文件不可用"));
        };
        let written = writer.write(buf)?;
        writer.flush()?;

        if exceeds(&self.file_path, self.max_size) {
            rotate_locked(&mut guard, &self.file_path, self.max_size);
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        if exceeds(&self.file_path, self.max_size) {
            rotate_locked(&mut lock(&self.writer), &self.file_path, self.max_size);
        }

        LogWriter {
            inner: self.writer.clone(),
            file_path: self.file_path.clone(),
            max_size: self.max_size,
        }
    }
}

/// 获取日志目录路径（跟随数据存储位置）
pub fn get_log_dir() -> PathBuf {
    app_config_dir().join("logs")
}
