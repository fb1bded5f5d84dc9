//! 连接配对
//!
//! 每条新连接的首条消息决定它的身份：`CHANNEL <ROLE> <name>` 是心跳或通知连接，
//! 其余都是命令连接，内容就是客户端名称。辅助连接按名称暂存，命令连接读到名称后
//! 认领同名的两条辅助连接。一条连接出错或迟迟不发首条消息，只影响它自己。

use log::{debug, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};

use crate::transfer::MessageChannel;
use crate::transfer::protocol::ChannelRole;

type Offer = (ChannelRole, MessageChannel);

/// 同一名称可暂存的辅助连接数，同一角色后到的覆盖先到的
const OFFER_SLOTS: usize = 4;

/// 配对错误
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("another connection is already claiming the channels of {0}")]
    Busy(String),

    #[error("liveness and notification channels of {0} did not arrive within {1:?}")]
    Timeout(String, Duration),
}

struct Pending {
    tx: mpsc::Sender<Offer>,
    rx: Option<mpsc::Receiver<Offer>>,
    created: Instant,
}

impl Pending {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(OFFER_SLOTS);
        Self {
            tx,
            rx: Some(rx),
            created: Instant::now(),
        }
    }
}

/// 等待认领的辅助连接
///
/// 没有被认领的连接超过 `ttl` 后丢弃。
pub struct ChannelPairing {
    pending: Mutex<HashMap<String, Pending>>,
    ttl: Duration,
}

impl std::fmt::Debug for ChannelPairing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPairing")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ChannelPairing {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// 暂存 `name` 的一条辅助连接
    pub async fn offer(&self, name: &str, role: ChannelRole, channel: MessageChannel) {
        let mut pending = self.pending.lock().await;
        expire(&mut pending, self.ttl);

        let entry = pending.entry(name.to_string()).or_insert_with(Pending::new);
        if entry.tx.try_send((role, channel)).is_err() {
            warn!("Dropping extra {:?} channel offered for {}", role, name);
        }
    }

    /// 认领 `name` 的心跳和通知连接，最多等待 `ttl`
    pub async fn claim(&self, name: &str) -> Result<(MessageChannel, MessageChannel), PairingError> {
        let mut rx = {
            let mut pending = self.pending.lock().await;
            expire(&mut pending, self.ttl);

            let entry = pending.entry(name.to_string()).or_insert_with(Pending::new);
            entry
                .rx
                .take()
                .ok_or_else(|| PairingError::Busy(name.to_string()))?
        };

        let collected = tokio::time::timeout(self.ttl, async {
            let mut liveness = None;
            let mut notification = None;
            while liveness.is_none() || notification.is_none() {
                match rx.recv().await {
                    Some((ChannelRole::Liveness, channel)) => liveness = Some(channel),
                    Some((ChannelRole::Notification, channel)) => notification = Some(channel),
                    None => break,
                }
            }
            liveness.zip(notification)
        })
        .await;

        // 认领期间其他认领者只会得到 Busy，所以这里移除的一定是自己的条目
        self.pending.lock().await.remove(name);

        match collected {
            Ok(Some(pair)) => Ok(pair),
            _ => Err(PairingError::Timeout(name.to_string(), self.ttl)),
        }
    }

    #[cfg(test)]
    async fn waiting(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn expire(pending: &mut HashMap<String, Pending>, ttl: Duration) {
    pending.retain(|name, p| {
        let keep = p.rx.is_none() || p.created.elapsed() < ttl;
        if !keep {
            debug!("Discarding unclaimed channels of {}", name);
        }
        keep
    });
}
