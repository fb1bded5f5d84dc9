//! 客户端注册表与通道集合
//!
//! 每个会话由唯一的客户端名称标识，持有三条通道：
//! - 命令通道：由命令处理任务独占读写，这里只保存它的取消令牌
//! - 心跳通道：由心跳监视器写入
//! - 通知通道：由通知路由写入
//!
//! 注册表的锁只在修改/查询映射时持有，绝不跨网络读写。

use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::logging::LogSink;
use crate::transfer::protocol::{HEARTBEAT, is_valid_client_name};
use crate::transfer::{ChannelError, MessageChannel};

/// 注册错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("name already in use: {0}")]
    NameInUse(String),

    #[error("invalid client name: {0:?}")]
    InvalidName(String),
}

/// 一个会话的三条通道
///
/// 关闭只会发生一次，之后的关闭请求是空操作。
#[derive(Debug)]
pub struct ChannelSet {
    command: CancellationToken,
    liveness: Mutex<Option<MessageChannel>>,
    notification: Mutex<Option<MessageChannel>>,
    closed: AtomicBool,
}

impl ChannelSet {
    pub fn new(liveness: MessageChannel, notification: MessageChannel) -> Self {
        Self {
            command: CancellationToken::new(),
            liveness: Mutex::new(Some(liveness)),
            notification: Mutex::new(Some(notification)),
            closed: AtomicBool::new(false),
        }
    }

    /// 命令通道的取消令牌，触发后命令处理任务释放命令连接
    pub fn command_token(&self) -> CancellationToken {
        self.command.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 在心跳通道上发送一次探测
    pub async fn send_probe(&self) -> Result<(), ChannelError> {
        Self::send_on(&self.liveness, HEARTBEAT).await
    }

    /// 在通知通道上发送一条消息
    pub async fn send_notification(&self, text: &str) -> Result<(), ChannelError> {
        Self::send_on(&self.notification, text).await
    }

    async fn send_on(slot: &Mutex<Option<MessageChannel>>, text: &str) -> Result<(), ChannelError> {
        let mut guard = slot.lock().await;
        match guard.as_mut() {
            Some(channel) => channel.send_text(text).await,
            None => Err(ChannelError::Closed),
        }
    }

    /// 关闭全部三条通道
    ///
    /// 返回本次调用是否真正执行了关闭。
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.command.cancel();
        let liveness = self.liveness.lock().await.take();
        let notification = self.notification.lock().await.take();
        drop(liveness);
        drop(notification);
        true
    }
}

/// 已注册的客户端会话
#[derive(Debug)]
pub struct Session {
    name: String,
    channels: ChannelSet,
}

impl Session {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    pub fn is_connected(&self) -> bool {
        !self.channels.is_closed()
    }
}

/// 客户端注册表：名称 → 会话
#[derive(Debug)]
pub struct ClientRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    log: LogSink,
}

impl ClientRegistry {
    pub fn new(log: LogSink) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            log,
        }
    }

    /// 以 `name` 注册新会话
    ///
    /// 名称已被占用时拒绝，注册表不变；被拒绝的通道随之释放。
    pub async fn register(
        &self,
        name: &str,
        liveness: MessageChannel,
        notification: MessageChannel,
    ) -> Result<Arc<Session>, RegistryError> {
        if !is_valid_client_name(name) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }

        let session = {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(name) {
                return Err(RegistryError::NameInUse(name.to_string()));
            }

            let session = Arc::new(Session {
                name: name.to_string(),
                channels: ChannelSet::new(liveness, notification),
            });
            sessions.insert(name.to_string(), session.clone());
            session
        };

        self.log.info(format!("{name} connected."));
        Ok(session)
    }

    /// 注销会话并关闭它的全部通道
    ///
    /// 只有当注册表中该名称仍指向这个会话时才移除映射，
    /// 因此迟到的注销不会影响之后以同名注册的新会话。可重复调用。
    pub async fn unregister(&self, session: &Arc<Session>) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(session.name()) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    sessions.remove(session.name());
                    true
                }
                _ => false,
            }
        };

        let closed = session.channels.close().await;

        if removed {
            self.log
                .info(format!("{} has been disconnected.", session.name()));
        } else if closed {
            debug!("Closed channels of unregistered session {}", session.name());
        }

        closed
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.sessions.lock().await.contains_key(name)
    }

    /// 当前所有会话的快照
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().await.values().cloned().collect()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogEntry;
    use crate::transfer::channel::tests::channel_pair;
    use tokio::sync::mpsc;

    /// 服务端一侧的两条通道，以及客户端一侧对应的两端
    async fn server_channels() -> (MessageChannel, MessageChannel, MessageChannel, MessageChannel) {
        let (client_live, server_live) = channel_pair().await;
        let (client_notify, server_notify) = channel_pair().await;
        (server_live, server_notify, client_live, client_notify)
    }

    fn drain(rx: &mut mpsc::Receiver<LogEntry>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            lines.push(entry.message);
        }
        lines
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let (log, mut rx) = LogSink::channel(16);
        let registry = ClientRegistry::new(log);

        let (live, notify, _c1, _c2) = server_channels().await;
        let first = registry.register("alice", live, notify).await.unwrap();

        let (live, notify, _c3, _c4) = server_channels().await;
        let err = registry.register("alice", live, notify).await.unwrap_err();
        assert_eq!(err, RegistryError::NameInUse("alice".to_string()));

        assert_eq!(registry.len().await, 1);
        let current = registry.get("alice").await.unwrap();
        assert!(Arc::ptr_eq(&current, &first));
        assert_eq!(drain(&mut rx), vec!["alice connected."]);
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let registry = ClientRegistry::new(LogSink::disabled());
        for name in ["", "two words", "../evil", "a/b", ".hidden"] {
            let (live, notify, _c1, _c2) = server_channels().await;
            assert!(
                matches!(
                    registry.register(name, live, notify).await,
                    Err(RegistryError::InvalidName(_))
                ),
                "{name:?} should be rejected"
            );
        }
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let (log, mut rx) = LogSink::channel(16);
        let registry = ClientRegistry::new(log);
        let (live, notify, mut client_live, mut client_notify) = server_channels().await;
        let session = registry.register("bob", live, notify).await.unwrap();
        let token = session.channels().command_token();

        assert!(registry.unregister(&session).await);
        assert!(!registry.unregister(&session).await);

        assert!(!registry.contains("bob").await);
        assert!(!session.is_connected());
        assert!(token.is_cancelled());
        assert!(session.channels().send_probe().await.is_err());

        // 客户端一侧看到连接关闭
        assert!(client_live.recv_text().await.unwrap().is_none());
        assert!(client_notify.recv_text().await.unwrap().is_none());

        assert_eq!(
            drain(&mut rx),
            vec!["bob connected.", "bob has been disconnected."]
        );
    }

    #[tokio::test]
    async fn test_concurrent_unregister_tears_down_once() {
        let registry = Arc::new(ClientRegistry::new(LogSink::disabled()));
        let (live, notify, _c1, _c2) = server_channels().await;
        let session = registry.register("carol", live, notify).await.unwrap();

        let (a, b) = tokio::join!(registry.unregister(&session), registry.unregister(&session));
        assert!(a ^ b);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_new_session() {
        let registry = ClientRegistry::new(LogSink::disabled());
        let (live, notify, _c1, _c2) = server_channels().await;
        let old = registry.register("dave", live, notify).await.unwrap();
        registry.unregister(&old).await;

        let (live, notify, _c3, _c4) = server_channels().await;
        let new = registry.register("dave", live, notify).await.unwrap();

        assert!(!registry.unregister(&old).await);
        assert!(registry.contains("dave").await);
        assert!(new.is_connected());
    }

    #[tokio::test]
    async fn test_probe_reaches_client() {
        let registry = ClientRegistry::new(LogSink::disabled());
        let (live, notify, mut client_live, mut client_notify) = server_channels().await;
        let session = registry.register("erin", live, notify).await.unwrap();

        session.channels().send_probe().await.unwrap();
        session.channels().send_notification("hello").await.unwrap();

        assert_eq!(client_live.expect_text().await.unwrap(), HEARTBEAT);
        assert_eq!(client_notify.expect_text().await.unwrap(), "hello");
    }
}
