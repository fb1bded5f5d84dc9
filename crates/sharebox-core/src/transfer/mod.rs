//! 传输层
//!
//! 包含:
//! - 帧化消息通道 (长度前缀)
//! - 命令通道文本协议

pub mod channel;
pub mod protocol;

pub use channel::{ChannelError, MessageChannel, ReceiveError};
pub use protocol::{Command, ParseError, RemoteFile};
