//! 心跳监视器
//!
//! 按固定间隔向每个会话的心跳通道发送探测。发送失败即认为对端已死，
//! 立即注销该会话（与命令处理任务的终止路径相同，注销本身是幂等的）。

use futures_util::future::join_all;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::server::registry::ClientRegistry;

pub struct LivenessMonitor {
    registry: Arc<ClientRegistry>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<ClientRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Liveness monitor running every {:?}", self.interval);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.probe_all().await;
                }
            }
        }

        debug!("Liveness monitor stopped");
    }

    /// 对所有会话并发发送一轮探测
    ///
    /// 返回本轮被注销的会话名称。
    pub async fn probe_all(&self) -> Vec<String> {
        let sessions = self.registry.sessions().await;

        let results = join_all(sessions.into_iter().map(|session| async move {
            let result = session.channels().send_probe().await;
            (session, result)
        }))
        .await;

        let mut dropped = Vec::new();
        for (session, result) in results {
            if let Err(e) = result {
                warn!("Heartbeat to {} failed: {}", session.name(), e);
                if self.registry.unregister(&session).await {
                    dropped.push(session.name().to_string());
                }
            }
        }

        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogSink;
    use crate::transfer::channel::tests::channel_pair;
    use crate::transfer::protocol::HEARTBEAT;

    #[tokio::test]
    async fn test_healthy_session_survives() {
        let registry = Arc::new(ClientRegistry::new(LogSink::disabled()));
        let (mut client_live, live) = channel_pair().await;
        let (_client_notify, notify) = channel_pair().await;
        registry.register("alice", live, notify).await.unwrap();

        let monitor = LivenessMonitor::new(registry.clone(), Duration::from_millis(10));
        assert!(monitor.probe_all().await.is_empty());
        assert_eq!(client_live.expect_text().await.unwrap(), HEARTBEAT);
        assert!(registry.contains("alice").await);
    }

    #[tokio::test]
    async fn test_dead_peer_is_removed() {
        let registry = Arc::new(ClientRegistry::new(LogSink::disabled()));
        let (client_live, live) = channel_pair().await;
        let (_client_notify, notify) = channel_pair().await;
        let session = registry.register("bob", live, notify).await.unwrap();
        drop(client_live);

        let monitor = LivenessMonitor::new(registry.clone(), Duration::from_millis(10));
        let mut dropped = Vec::new();
        for _ in 0..50 {
            dropped = monitor.probe_all().await;
            if !dropped.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(dropped, vec!["bob".to_string()]);
        assert!(!registry.contains("bob").await);
        assert!(session.channels().command_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let registry = Arc::new(ClientRegistry::new(LogSink::disabled()));
        let shutdown = CancellationToken::new();
        let handle =
            LivenessMonitor::new(registry, Duration::from_millis(10)).spawn(shutdown.clone());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
