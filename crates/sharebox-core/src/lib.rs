//! Sharebox Core Library
//!
//! 局域网文件共享的核心实现：一个中心服务器，多个具名客户端。
//! 每个客户端与服务器之间有三条 TCP 连接：命令、心跳、通知。
//!
//! # 模块
//!
//! - **server**: 客户端注册表、存储索引、命令处理、心跳监视、下载通知
//! - **client**: 客户端会话与后台监听
//! - **transfer**: 帧化消息通道与命令文本协议
//! - **config**: 服务器/客户端配置
//! - **logging**: 面向展示层的事件日志
//!
//! # 使用示例
//!
//! ```ignore
//! use sharebox_core::{ClientSession, ClientSettings, Server, ServerSettings};
//!
//! let mut server = Server::new(ServerSettings::load()).await?;
//! server.start().await?;
//!
//! let mut client = ClientSession::connect(&ClientSettings::load()).await?;
//! client.upload(Path::new("report.txt")).await?;
//! for file in client.list().await? {
//!     println!("{file}");
//! }
//! client.disconnect().await;
//! ```

pub mod client;
pub mod config;
pub mod logging;
pub mod server;
pub mod transfer;

pub use client::{ClientError, ClientSession, DownloadedFile, SessionEvent};
pub use config::{ClientSettings, ServerSettings};
pub use logging::{LogEntry, LogLevel, LogSink};
pub use server::{ClientRegistry, Server, StorageError, StorageIndex};
pub use transfer::{Command, MessageChannel, RemoteFile};
