use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use treesync_lib::commands::compare::{build_filter, render_json, render_text, run_compare};
use treesync_lib::commands::sync::{progress_line, run_delete, run_sync, Direction, SyncOptions};
use treesync_lib::commands::test::{test_local_connection, test_remote_connection};
use treesync_lib::commands::{remote_config, LocationSpec};
use treesync_lib::config::app_config_dir;
use treesync_lib::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use treesync_lib::{EngineConfig, SyncEngine};

#[derive(Parser)]
#[command(name = "treesync")]
#[command(about = "比较并同步两棵目录树（本地或 SFTP）")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// 同时输出日志到控制台
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 比较两侧目录树
    Compare {
        #[command(flatten)]
        pair: PairArgs,
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
        /// 文本输出中包含相同的路径
        #[arg(long)]
        all: bool,
    },
    /// 单向同步两侧目录树
    Sync {
        #[command(flatten)]
        pair: PairArgs,
        #[arg(short, long, value_enum)]
        direction: Direction,
        /// 删除目标侧多余的条目
        #[arg(long)]
        delete: bool,
        /// 只打印计划，不执行
        #[arg(long)]
        dry_run: bool,
        /// 并发传输数
        #[arg(short, long)]
        jobs: Option<usize>,
    },
    /// 删除一侧的某个路径（目录连同其内容）
    Delete {
        root: String,
        path: String,
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// 测试本地路径或远程连接
    TestConnection {
        root: String,
        #[command(flatten)]
        remote: RemoteArgs,
    },
}

#[derive(Args)]
struct PairArgs {
    /// A 侧根目录
    a: String,
    /// B 侧根目录
    b: String,
    /// A 侧远程地址 user@host[:port]
    #[arg(long)]
    ssh_a: Option<String>,
    /// A 侧私钥
    #[arg(long)]
    key_a: Option<PathBuf>,
    /// B 侧远程地址 user@host[:port]
    #[arg(long)]
    ssh_b: Option<String>,
    /// B 侧私钥
    #[arg(long)]
    key_b: Option<PathBuf>,
    /// 排除规则，可重复；以 / 结尾只匹配目录
    #[arg(short, long)]
    exclude: Vec<String>,
    /// 不计算内容签名，只比较大小和修改时间
    #[arg(long)]
    no_checksum: bool,
    /// 修改时间容差（秒）
    #[arg(long)]
    tolerance: Option<i64>,
}

#[derive(Args)]
struct RemoteArgs {
    /// 远程地址 user@host[:port]
    #[arg(long)]
    ssh: Option<String>,
    /// 私钥
    #[arg(long)]
    key: Option<PathBuf>,
}

impl PairArgs {
    fn specs(&self) -> Result<(LocationSpec, LocationSpec)> {
        let a = side_spec(
            &self.a,
            self.ssh_a.as_deref(),
            self.key_a.clone(),
            &["TREESYNC_PASSWORD_A", "TREESYNC_PASSWORD"],
        )?;
        let b = side_spec(
            &self.b,
            self.ssh_b.as_deref(),
            self.key_b.clone(),
            &["TREESYNC_PASSWORD_B", "TREESYNC_PASSWORD"],
        )?;
        Ok((a, b))
    }

    fn apply(&self, config: &mut EngineConfig) {
        if self.no_checksum {
            config.use_checksum = false;
        }
        if let Some(tolerance) = self.tolerance {
            config.mtime_tolerance_secs = tolerance.max(0);
        }
    }
}

impl RemoteArgs {
    fn spec(&self, root: &str) -> Result<LocationSpec> {
        side_spec(root, self.ssh.as_deref(), self.key.clone(), &["TREESYNC_PASSWORD"])
    }
}

fn side_spec(
    path: &str,
    ssh: Option<&str>,
    key: Option<PathBuf>,
    password_env: &[&str],
) -> Result<LocationSpec> {
    let remote = ssh
        .map(|target| remote_config(target, key, password_env))
        .transpose()?;
    Ok(LocationSpec {
        path: path.to_string(),
        remote,
    })
}

/// 初始化日志系统
fn init_logging(verbose: bool) {
    let config = LogConfig::load(&app_config_dir());
    if !config.enabled && !verbose {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let mut env_filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(config.tracing_level().into());
    for directive in ["russh=warn", "russh_sftp=warn"] {
        if let Ok(d) = directive.parse() {
            env_filter = env_filter.add_directive(d);
        }
    }

    // 文件日志层 - 始终输出到文件
    let log_dir = get_log_dir();
    let file_layer = SizeRotatingWriter::new(&log_dir, config.max_size_mb)
        .ok()
        .filter(|_| config.enabled)
        .map(|writer| {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
        });

    // debug 构建或 --verbose 时同时输出到 stderr
    let console_layer = (cfg!(debug_assertions) || verbose || file_layer.is_none()).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn run(cli: Cli) -> Result<bool> {
    let mut config = EngineConfig::load(&app_config_dir());

    match cli.command {
        Command::Compare { pair, json, all } => {
            pair.apply(&mut config);
            let (a, b) = pair.specs()?;
            let filter = build_filter(&pair.exclude, &config);
            let engine = spawn_cancel_handler(SyncEngine::new(config));

            let outcome = run_compare(&engine, &a, &b, &filter).await?;
            if json {
                println!("{}", render_json(&outcome)?);
            } else {
                print!("{}", render_text(&outcome, all));
            }
            Ok(!outcome.is_partial())
        }
        Command::Sync {
            pair,
            direction,
            delete,
            dry_run,
            jobs,
        } => {
            pair.apply(&mut config);
            if let Some(jobs) = jobs {
                config.max_parallel_transfers = jobs;
            }
            let (a, b) = pair.specs()?;
            let filter = build_filter(&pair.exclude, &config);
            let engine = spawn_cancel_handler(SyncEngine::new(config));
            let options = SyncOptions {
                direction,
                delete_extra: delete,
                dry_run,
            };

            let run = run_sync(&engine, &a, &b, &filter, &options, |item| {
                println!("{}", progress_line(item));
            })
            .await?;

            // 扫描不完整或位于符号链接目录下的路径没有处理
            for path in &run.withheld {
                println!("[未处理] {}", path);
            }
            let complete = run.withheld.is_empty();

            match run.report {
                None => {
                    for action in &run.actions {
                        println!("{}", action);
                    }
                    println!("共 {} 个动作", run.actions.len());
                    Ok(complete)
                }
                Some(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    Ok(report.is_success() && complete)
                }
            }
        }
        Command::Delete { root, path, remote } => {
            let spec = remote.spec(&root)?;
            let engine = spawn_cancel_handler(SyncEngine::new(config));
            let report = run_delete(&engine, &spec, &path, |item| {
                println!("{}", progress_line(item));
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.is_success())
        }
        Command::TestConnection { root, remote } => {
            let spec = remote.spec(&root)?;
            let result = match &spec.remote {
                None => test_local_connection(&root),
                Some(remote) => test_remote_connection(remote, &root, &config).await,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(result.success)
        }
    }
}

/// Ctrl-C 时取消引擎：已开始的传输会完成，其余跳过
fn spawn_cancel_handler(engine: SyncEngine) -> SyncEngine {
    let token = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消...");
            token.cancel();
        }
    });
    engine
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    info!("treesync {}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("错误: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
