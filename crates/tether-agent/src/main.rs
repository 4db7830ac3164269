//! tether binary entry point.

use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info, warn};

use tether_core::config::{self, Store};
use tether_core::constants::DEFAULT_WEB_PORT;
use tether_core::{init_logging, LogBuffer};

use tether_agent::cancel::CancelToken;
use tether_agent::cli::{Cli, Command};
use tether_agent::supervisor::Supervisor;
use tether_agent::web;

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let log_buffer = LogBuffer::standard();
    if let Err(e) = init_logging(2 + cli.verbose, Some(log_buffer.clone())) {
        eprintln!("初始化日志失败: {e}");
        std::process::exit(1);
    }

    info!("[系统] tether v{} 启动", env!("CARGO_PKG_VERSION"));

    let root = CancelToken::new();
    spawn_signal_handler(root.clone());

    match cli.command {
        Some(Command::Start { ref config, port }) => {
            start_mode(config.clone(), port, log_buffer, root).await;
        }
        None => legacy_mode(&cli, root).await,
    }

    info!("[系统] 已关闭");
}

/// Management mode: config file + panel + supervised connection.
async fn start_mode(
    config_path: Option<std::path::PathBuf>,
    web_port: Option<u16>,
    log_buffer: Arc<LogBuffer>,
    root: CancelToken,
) {
    let path = match config_path {
        Some(path) => path,
        None => match config::default_config_path() {
            Ok(path) => path,
            Err(e) => {
                error!("[系统] {e}");
                std::process::exit(1);
            }
        },
    };

    let store = match Store::open(path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("[系统] 加载配置失败: {e}");
            std::process::exit(1);
        }
    };
    if let Some(path) = store.path() {
        info!("[系统] 配置文件: {}", path.display());
    }

    let cfg = store.get();

    // Panel port: command line > config file > default
    let port = web_port
        .filter(|p| *p > 0)
        .or(Some(cfg.web.port).filter(|p| *p > 0))
        .unwrap_or(DEFAULT_WEB_PORT);

    let supervisor = Supervisor::new(store.clone());

    {
        let store = store.clone();
        let supervisor = supervisor.clone();
        let root = root.clone();
        tokio::spawn(async move {
            if let Err(e) = web::serve(port, store, supervisor, log_buffer, root.clone()).await {
                warn!("[Web] 服务异常: {e}");
                root.cancel();
            }
        });
    }

    if cfg.is_configured() {
        info!(
            "[系统] 启动连接: {} → {}",
            describe_roles(&cfg),
            cfg.agent.address
        );
        supervisor.start().await;
    } else {
        info!("[系统] 未配置连接信息，请在 Web 面板中完成配置");
    }

    root.cancelled().await;
    supervisor.stop().await;
}

/// Legacy direct mode: flags only, no config file, no panel.
async fn legacy_mode(cli: &Cli, root: CancelToken) {
    let cfg = match cli.legacy_config() {
        Ok(cfg) => cfg,
        Err(message) => {
            eprintln!("错误: {message}");
            eprintln!();
            eprintln!("用法:");
            eprintln!("  tether start              启动 Web 管理面板（推荐）");
            eprintln!("  tether --hub <地址>       直连模式（高级）");
            std::process::exit(1);
        }
    };

    info!(
        "[系统] 直连模式: {}, hub={}",
        describe_roles(&cfg),
        cfg.agent.address
    );

    let store = Arc::new(Store::in_memory(cfg));
    let supervisor = Supervisor::new(store);
    supervisor.start().await;

    root.cancelled().await;
    supervisor.stop().await;
}

fn describe_roles(cfg: &config::Config) -> String {
    let mut roles = Vec::new();
    if !cfg.computer.id.is_empty() {
        roles.push(format!("computer={}", cfg.computer.id));
    }
    if !cfg.browser.id.is_empty() {
        roles.push(format!("browser={} (port {})", cfg.browser.id, cfg.browser.port));
    }
    roles.join(", ")
}

/// SIGINT/SIGTERM cancel the root scope for a clean shutdown.
fn spawn_signal_handler(root: CancelToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!("[系统] 注册 SIGTERM 处理失败: {e}");
                    let _ = ctrl_c.await;
                    info!("[系统] 收到退出信号，正在关闭...");
                    root.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("[系统] 收到退出信号，正在关闭...");
        root.cancel();
    });
}
