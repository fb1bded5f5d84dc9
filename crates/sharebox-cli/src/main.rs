//! Sharebox CLI
//!
//! 命令行客户端，直接连接 sharebox-server

mod client;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sharebox_core::{ClientSession, ClientSettings, SessionEvent};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sharebox", version, about = "局域网文件共享客户端")]
struct Cli {
    /// 服务器地址 host:port
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// 客户端名称 (默认: 主机名)
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// 配置文件路径 (默认: ~/.config/sharebox/client.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 列出服务器上的文件
    List {
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 上传文件
    Upload {
        /// 要上传的文件路径
        file: PathBuf,
    },
    /// 下载文件
    Download {
        /// 文件键 (可选，不指定则交互式选择)
        #[arg(short, long)]
        key: Option<String>,
        /// 保存路径或目录 (默认: 下载目录)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 删除自己上传的文件
    Delete {
        /// 文件键 (可选，不指定则交互式选择)
        #[arg(short, long)]
        key: Option<String>,
    },
    /// 保持连接并打印下载通知
    Watch,
}

impl Cli {
    fn settings(&self) -> ClientSettings {
        let mut settings = match &self.config {
            Some(path) => ClientSettings::load_from(path),
            None => ClientSettings::load(),
        };
        if let Some(server) = &self.server {
            settings.server.clone_from(server);
        }
        if let Some(name) = &self.name {
            settings.client_name.clone_from(name);
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let settings = cli.settings();
    let mut session = client::connect(&settings).await?;

    let result = run(&cli.command, &settings, &mut session).await;
    session.disconnect().await;
    result
}

async fn run(
    command: &Commands,
    settings: &ClientSettings,
    session: &mut ClientSession,
) -> Result<()> {
    match command {
        Commands::List { json } => {
            let files = session.list().await?;
            if *json {
                let records: Vec<client::FileRecord<'_>> = files.iter().map(Into::into).collect();
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if files.is_empty() {
                println!("   没有可用的文件");
            } else {
                for file in &files {
                    println!("   {}", file);
                }
            }
        }
        Commands::Upload { file } => {
            println!("📤 上传文件: {}", file.display());
            let response = session.upload(file).await?;
            println!("✅ {}", response);
        }
        Commands::Download { key, output } => {
            let downloaded = session
                .download_selected(|files| {
                    let file = client::pick(files, key.as_deref(), "下载")?;
                    let dest = client::destination(
                        output.as_deref(),
                        &settings.download_dir,
                        &file,
                    );
                    Some((file, dest))
                })
                .await?;

            match downloaded {
                Some(d) => println!(
                    "📥 {} ({} 字节) 已保存到 {}",
                    d.file.file_key,
                    d.size,
                    d.path.display()
                ),
                None => println!("   未下载任何文件"),
            }
        }
        Commands::Delete { key } => {
            let deleted = session
                .delete_selected(|files| client::pick(files, key.as_deref(), "删除"))
                .await?;

            match deleted {
                Some((_, response)) => println!("✅ {}", response),
                None => println!("   未删除任何文件"),
            }
        }
        Commands::Watch => {
            let Some(mut events) = session.take_events() else {
                return Ok(());
            };
            println!("👀 以 {} 身份等待通知 (Ctrl+C 退出)", session.name());

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Some(SessionEvent::Notice(notice)) => println!("🔔 {}", notice),
                        Some(SessionEvent::ConnectionLost(reason)) => {
                            eprintln!("❌ 与服务器的连接已断开: {}", reason);
                            break;
                        }
                        None => break,
                    },
                }
            }
        }
    }

    Ok(())
}
