//! Chips Runtime 命令行入口
//!
//! # 命令概览
//!
//! - `run` - 安装模块包目录中的模块包，解析并启动，直到收到 Ctrl+C
//! - `list` - 安装并解析模块包，打印状态与解析失败原因
//! - `check-config` - 验证配置文件
//! - `version` - 显示版本信息
//!
//! # 使用示例
//!
//! ```bash
//! chips-runtime -c runtime.yaml run
//! chips-runtime list --bundle-dir ./bundles --json
//! chips-runtime check-config -c runtime.yaml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use chips_runtime::{
    BundleState, DirectoryStore, Framework, Logger, LoggerConfig, RuntimeConfig,
};

/// Chips Runtime - 薯片动态模块运行时
#[derive(Parser)]
#[command(name = "chips-runtime")]
#[command(version, about = "薯片生态的动态模块运行时", long_about = None)]
#[command(author = "Chips Team")]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "runtime.yaml", global = true)]
    config: PathBuf,

    /// 日志级别，覆盖配置文件 (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 追加的模块包目录
    #[arg(short, long = "bundle-dir", global = true)]
    bundle_dirs: Vec<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动运行时
    ///
    /// 安装模块包目录中的全部模块包，解析并启动自动启动列表中的模块包。
    /// 按 Ctrl+C 按逆序停止模块包并退出。
    Run,

    /// 列出模块包
    List {
        /// 以 JSON 格式输出
        #[arg(long)]
        json: bool,
    },

    /// 验证配置文件
    CheckConfig {
        /// 配置文件路径（不指定则使用全局 -c 选项）
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// 查看版本信息
    Version,
}

/// 加载配置，文件不存在时使用默认配置
async fn load_config(cli: &Cli) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
    let mut config = if cli.config.exists() {
        RuntimeConfig::from_file(&cli.config).await?
    } else {
        RuntimeConfig::default()
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.bundles.bundle_dirs.extend(cli.bundle_dirs.iter().cloned());
    Ok(config)
}

fn build_framework(config: RuntimeConfig) -> Result<Framework, Box<dyn std::error::Error>> {
    Ok(Framework::builder(config)
        .store(Arc::new(DirectoryStore::new()))
        .build()?)
}

async fn run(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let framework = build_framework(config)?;
    let installed = framework.initialize().await?;

    let active = framework
        .bundles()
        .await
        .iter()
        .filter(|info| info.state == BundleState::Active)
        .count();
    info!(installed = installed.len(), active, "运行时已启动");
    println!();
    println!("薯片模块运行时已启动 (版本 {})", chips_runtime::VERSION);
    println!("  已安装模块包: {}", installed.len());
    println!("  ACTIVE 模块包: {}", active);
    println!("  按 Ctrl+C 关闭");
    println!();

    signal::ctrl_c().await?;
    info!("收到关闭信号");
    framework.shutdown().await?;
    Ok(())
}

async fn list(config: RuntimeConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let framework = build_framework(config)?;
    framework.initialize().await?;
    let bundles = framework.bundles().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&bundles)?);
        return Ok(());
    }

    println!("{:<5} {:<12} {:<32} {:<10} 位置", "ID", "状态", "符号名", "版本");
    println!("──────────────────────────────────────────────────────────────────────");
    for info in &bundles {
        println!(
            "{:<5} {:<12} {:<32} {:<10} {}",
            info.id.to_string(),
            info.state.to_string(),
            info.symbolic_name,
            info.version,
            info.location
        );
        if let Some(failure) = &info.failure {
            println!("      └─ 解析失败: {}", failure);
        }
    }
    Ok(())
}

async fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("检查配置文件: {}", path.display());
    println!();

    let config = if path.exists() {
        match RuntimeConfig::from_file(path).await {
            Ok(config) => {
                println!("✅ 配置文件有效");
                config
            }
            Err(e) => {
                println!("❌ 配置文件无效: {}", e);
                return Err(Box::new(e));
            }
        }
    } else {
        println!("⚠️  配置文件不存在，将使用默认配置");
        RuntimeConfig::default()
    };

    println!();
    println!("  [生命周期]");
    println!("    状态变更等待:   {} ms", config.lifecycle.state_change_timeout_ms);
    println!("    卸载等待:       {} ms", config.lifecycle.uninstall_timeout_ms);
    println!("    激活超时:       {} ms", config.lifecycle.activation_timeout_ms);
    println!("    工作线程数:     {}", config.lifecycle.worker_count);
    println!("  [解析器]");
    println!("    执行环境:       {:?}", config.resolver.execution_environments);
    println!("    系统包数量:     {}", config.resolver.system_packages.len());
    println!("  [模块包]");
    println!("    模块包目录:     {:?}", config.bundles.bundle_dirs);
    println!("    自动启动:       {:?}", config.bundles.auto_start);
    println!("  [日志]");
    println!("    日志级别:       {}", config.logging.level);
    println!("    文件输出:       {}", if config.logging.file_output { "是" } else { "否" });
    println!("    轮转策略:       {}", config.logging.rotation);
    Ok(())
}

fn print_version() {
    println!("Chips Runtime {}", chips_runtime::VERSION);
    println!("  目标平台: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            print_version();
            return Ok(());
        }
        Some(Commands::CheckConfig { config }) => {
            let path = config.clone().unwrap_or_else(|| cli.config.clone());
            return check_config(&path).await;
        }
        _ => {}
    }

    let config = load_config(&cli).await?;
    let _guard = Logger::try_init(LoggerConfig::from_log_config(&config.logging));
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "配置文件不存在，使用默认配置");
    }

    match cli.command {
        Some(Commands::List { json }) => list(config, json).await,
        _ => run(config).await,
    }
}
