//! 客户端后台监听
//!
//! 心跳通道和通知通道各由一个任务读取，结果推入会话持有的有界事件队列。
//! 关闭会话时触发取消令牌，挂起的读取随之结束。

use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::transfer::MessageChannel;

/// 后台事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// 服务器推送的通知，原样转发
    Notice(String),
    /// 心跳中断，会话已在本地关闭
    ConnectionLost(String),
}

/// 启动心跳监听
///
/// 只关心探测是否按时到达，不解析内容。读取失败、对端关闭或超过
/// `timeout` 没有探测到达，都会关闭会话并发出 [`SessionEvent::ConnectionLost`]。
pub(crate) fn spawn_liveness_listener(
    mut channel: MessageChannel,
    timeout: Duration,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return,
                next = tokio::time::timeout(timeout, channel.recv_frame()) => next,
            };

            match next {
                Ok(Ok(Some(_))) => {}
                Ok(Ok(None)) => break "server closed the connection".to_string(),
                Ok(Err(e)) => break e.to_string(),
                Err(_) => break format!("no heartbeat for {timeout:?}"),
            }
        };

        warn!("Connection to server has been lost: {}", reason);
        cancel.cancel();
        let _ = events.try_send(SessionEvent::ConnectionLost(reason));
    })
}

/// 启动通知监听
pub(crate) fn spawn_notification_listener(
    mut channel: MessageChannel,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return,
                next = channel.recv_text() => next,
            };

            let notice = match next {
                Ok(Some(notice)) => notice,
                Ok(None) => {
                    debug!("Notification channel closed");
                    return;
                }
                Err(e) => {
                    debug!("Notification channel failed: {}", e);
                    return;
                }
            };

            info!("{}", notice);
            tokio::select! {
                () = cancel.cancelled() => return,
                sent = events.send(SessionEvent::Notice(notice)) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::channel::tests::channel_pair;
    use crate::transfer::protocol::HEARTBEAT;

    #[tokio::test]
    async fn test_notices_are_forwarded_verbatim() {
        let (client, mut server) = channel_pair().await;
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = spawn_notification_listener(client, tx, cancel.clone());

        server.send_text("NOTICE: hello").await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Notice("NOTICE: hello".to_string()))
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_close_means_connection_lost() {
        let (client, mut server) = channel_pair().await;
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle =
            spawn_liveness_listener(client, Duration::from_secs(5), tx, cancel.clone());

        server.send_text(HEARTBEAT).await.unwrap();
        server.close().await;

        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::ConnectionLost(_))
        ));
        handle.await.unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_silence_means_connection_lost() {
        let (client, _server) = channel_pair().await;
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        spawn_liveness_listener(client, Duration::from_millis(50), tx, cancel.clone());

        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::ConnectionLost(_))
        ));
        assert!(cancel.is_cancelled());
    }
}
