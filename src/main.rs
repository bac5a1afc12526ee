use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use obshell_core::{constants::AGENT_VERSION, exit_code, logging::init_logging, AppConfig};
use tracing::{error, info, warn};

mod app;
mod cli;
mod shutdown;

use app::{Application, StartupError};
use cli::{ClientCommand, ConfigCommand, Console};
use shutdown::{wait_for_shutdown_signal, ShutdownManager};

#[derive(Parser, Debug)]
#[command(name = "obshell")]
#[command(version = AGENT_VERSION)]
#[command(about = "数据库集群管理代理")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// 日志级别, 默认取配置文件
    #[arg(short, long, global = true, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// 日志格式, 默认取配置文件
    #[arg(long, global = true, value_parser = ["json", "pretty"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 启动代理
    Server,
    #[command(flatten)]
    Client(ClientCommand),
    /// 代理级配置覆盖
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    std::process::exit(run(args).await);
}

async fn run(args: Cli) -> i32 {
    let config = match AppConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置失败: {e:#}");
            return exit_code::CONFIG_ERROR;
        }
    };

    // 命令行子命令默认只输出告警
    let default_level = if matches!(args.command, Commands::Server) {
        config.observability.log_level.as_str()
    } else {
        "warn"
    };
    let log_level = args.log_level.as_deref().unwrap_or(default_level);
    let log_format = args
        .log_format
        .as_deref()
        .unwrap_or(config.observability.log_format.as_str());
    if let Err(e) = init_logging(log_level, log_format) {
        eprintln!("{e:#}");
        return exit_code::CONFIG_ERROR;
    }

    let result = match args.command {
        Commands::Server => return run_server(config).await,
        Commands::Config { action } => cli::config(&config, action).await,
        Commands::Client(command) => match Console::new(&config) {
            Ok(console) => console.run(command).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("错误: {e:#}");
            exit_code::UNKNOWN
        }
    }
}

async fn run_server(config: AppConfig) -> i32 {
    info!("启动代理 {} (版本 {})", config.agent.address(), config.agent.version);

    let app = match Application::new(config).await {
        Ok(app) => Arc::new(app),
        Err(e) => return fail(&e),
    };

    let shutdown_manager = ShutdownManager::new();
    let mut app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        finished = &mut app_handle => {
            return match finished {
                Ok(Ok(())) => exit_code::SUCCESS,
                Ok(Err(e)) => fail(&e),
                Err(e) => {
                    error!("代理任务异常退出: {}", e);
                    exit_code::UNKNOWN
                }
            };
        }
    }

    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("代理已优雅关闭");
            exit_code::SUCCESS
        }
        Ok(Ok(Err(e))) => fail(&e),
        Ok(Err(e)) => {
            error!("代理关闭时发生错误: {}", e);
            exit_code::UNKNOWN
        }
        Err(_) => {
            warn!("代理关闭超时，强制退出");
            exit_code::UNKNOWN
        }
    }
}

/// 记录失败原因并选择退出码
fn fail(e: &anyhow::Error) -> i32 {
    let code = e
        .downcast_ref::<StartupError>()
        .map_or(exit_code::UNKNOWN, |s| s.code);
    error!("代理退出 ({}): {:#}", exit_code::describe(code), e);
    code
}
