//! 日志模块
//!
//! 服务器和客户端共用的日志级别和条目定义，以及面向展示层的日志流 [`LogSink`]。
//!
//! 诊断信息走 `log` facade；`LogSink` 输出的是给用户看的有序日志行
//! （例如 `"alice connected."`），由展示层订阅并渲染。

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// 日志级别
///
/// 实现了 `PartialOrd` 以便过滤。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
}

impl LogLevel {
    /// 获取对应的 Emoji 图标
    pub fn icon(&self) -> &'static str {
        match self {
            LogLevel::Error => "❌",
            LogLevel::Warn => "⚠️",
            LogLevel::Info => "ℹ️",
        }
    }

    /// 获取显示名称
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 日志条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.level.icon(), self.message)
    }
}

/// 展示层日志流
///
/// 发送端使用 `try_send`，队列满或无人订阅时直接丢弃，永远不会阻塞调用方。
/// 每条日志同时以 debug 级别镜像到 `log` facade。
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    tx: Option<mpsc::Sender<LogEntry>>,
}

impl LogSink {
    /// 创建带接收端的日志流
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LogEntry>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// 不转发到任何订阅者的日志流
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);
        log::debug!(target: "sharebox_core::events", "[{}] {}", entry.level, entry.message);

        if let Some(tx) = &self.tx {
            let _ = tx.try_send(entry);
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (sink, mut rx) = LogSink::channel(8);
        sink.info("alice connected.");
        sink.warn("bob is already in use. The new client was not accepted.");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.level, LogLevel::Info);
        assert_eq!(first.message, "alice connected.");
        assert_eq!(rx.recv().await.unwrap().level, LogLevel::Warn);
    }

    #[test]
    fn test_full_sink_never_blocks() {
        let (sink, _rx) = LogSink::channel(1);
        sink.info("one");
        // 队列已满，第二条被丢弃
        sink.info("two");
        LogSink::disabled().error("nobody listens");
    }
}
