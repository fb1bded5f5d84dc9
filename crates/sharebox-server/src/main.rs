//! Sharebox Server
//!
//! 文件共享服务器进程：
//! - 接受客户端的命令、心跳、通知三条连接
//! - 把服务器事件日志打印到标准输出
//! - Ctrl+C 时断开所有客户端并退出

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use sharebox_core::{Server, ServerSettings};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sharebox-server", version, about = "局域网文件共享服务器")]
struct Args {
    /// 配置文件路径 (默认: ~/.config/sharebox/server.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 监听端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 监听地址
    #[arg(short, long)]
    bind: Option<String>,

    /// 文件存储目录
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// 心跳间隔 (毫秒)
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// 把最终生效的设置写回配置文件
    #[arg(long)]
    save_config: bool,
}

impl Args {
    fn settings(&self) -> ServerSettings {
        let mut settings = match &self.config {
            Some(path) => ServerSettings::load_from(path),
            None => ServerSettings::load(),
        };

        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(bind) = &self.bind {
            settings.bind_address.clone_from(bind);
        }
        if let Some(storage) = &self.storage {
            settings.storage_dir.clone_from(storage);
        }
        if let Some(ms) = self.heartbeat_ms {
            settings.heartbeat_interval_ms = ms;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（sharebox-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sharebox_core=info")),
        )
        .try_init();

    let args = Args::parse();
    let settings = args.settings();

    if args.save_config {
        match &args.config {
            Some(path) => settings.save_to(path)?,
            None => settings.save()?,
        }
    }

    tracing::info!("Sharebox server starting...");

    let mut server = Server::new(settings).await?;

    // 事件日志直接打印，与 tracing 输出分开
    if let Some(mut log_rx) = server.take_log_receiver() {
        tokio::spawn(async move {
            while let Some(entry) = log_rx.recv().await {
                println!("{entry}");
            }
        });
    }

    server.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    server.shutdown().await;

    Ok(())
}
