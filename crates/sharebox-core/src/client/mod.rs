//! 文件共享客户端
//!
//! - **session**: 连接、注册与命令操作
//! - **listener**: 心跳和通知通道的后台读取

pub mod listener;
pub mod session;

pub use listener::SessionEvent;
pub use session::{ClientError, ClientSession, DownloadedFile};
