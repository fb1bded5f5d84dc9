//! 通知路由
//!
//! 单向、即发即忘：文件被其他客户端下载后，向所有者的通知通道写一条消息。
//! 没有确认和重试，写入失败只记录日志，绝不影响已经发给下载方的响应。

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::logging::LogSink;
use crate::server::registry::ClientRegistry;
use crate::transfer::protocol::download_notice;

/// 投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    OwnerOffline,
    Failed,
}

#[derive(Debug, Clone)]
pub struct NotificationRouter {
    registry: Arc<ClientRegistry>,
    log: LogSink,
}

impl NotificationRouter {
    pub fn new(registry: Arc<ClientRegistry>, log: LogSink) -> Self {
        Self { registry, log }
    }

    /// 在后台投递下载通知
    ///
    /// 所有者就是下载者本人时不发送，返回 `None`。
    pub fn route_download(
        &self,
        owner: &str,
        file_key: &str,
        downloader: &str,
    ) -> Option<JoinHandle<Delivery>> {
        if owner == downloader {
            return None;
        }

        let router = self.clone();
        let owner = owner.to_string();
        let file_key = file_key.to_string();
        let downloader = downloader.to_string();

        Some(tokio::spawn(async move {
            router.deliver(&owner, &file_key, &downloader).await
        }))
    }

    pub async fn deliver(&self, owner: &str, file_key: &str, downloader: &str) -> Delivery {
        let Some(session) = self.registry.get(owner).await else {
            self.log.info(format!(
                "Owner {owner} is not connected. Cannot send notification."
            ));
            return Delivery::OwnerOffline;
        };

        let notice = download_notice(file_key, downloader);
        match session.channels().send_notification(&notice).await {
            Ok(()) => {
                self.log.info(format!(
                    "Notified {owner} about the download of their file '{file_key}' by {downloader}."
                ));
                Delivery::Sent
            }
            Err(e) => {
                self.log
                    .warn(format!("Failed to notify {owner} about '{file_key}': {e}"));
                Delivery::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::channel::tests::channel_pair;

    #[tokio::test]
    async fn test_owner_receives_notice() {
        let registry = Arc::new(ClientRegistry::new(LogSink::disabled()));
        let (_client_live, live) = channel_pair().await;
        let (mut client_notify, notify) = channel_pair().await;
        registry.register("bob", live, notify).await.unwrap();

        let router = NotificationRouter::new(registry, LogSink::disabled());
        let delivery = router
            .route_download("bob", "bob_report.txt", "alice")
            .unwrap()
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::Sent);
        assert_eq!(
            client_notify.expect_text().await.unwrap(),
            "NOTICE: Your file 'bob_report.txt' has been downloaded by alice."
        );
    }

    #[tokio::test]
    async fn test_offline_owner_is_skipped() {
        let (log, mut rx) = LogSink::channel(4);
        let registry = Arc::new(ClientRegistry::new(LogSink::disabled()));
        let router = NotificationRouter::new(registry, log);

        let delivery = router.deliver("carol", "carol_a.txt", "alice").await;
        assert_eq!(delivery, Delivery::OwnerOffline);
        assert_eq!(
            rx.recv().await.unwrap().message,
            "Owner carol is not connected. Cannot send notification."
        );
    }

    #[tokio::test]
    async fn test_self_download_is_silent() {
        let registry = Arc::new(ClientRegistry::new(LogSink::disabled()));
        let router = NotificationRouter::new(registry, LogSink::disabled());
        assert!(router.route_download("bob", "bob_a.txt", "bob").is_none());
    }
}
