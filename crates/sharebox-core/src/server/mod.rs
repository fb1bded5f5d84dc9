//! 文件共享服务器
//!
//! - **registry**: 客户端注册表与每个会话的三条通道
//! - **storage**: 文件键 → 所有者的存储索引
//! - **processor**: 每个会话的命令处理任务
//! - **liveness**: 定时心跳探测
//! - **notify**: 下载通知路由
//! - **pairing**: 按名称把心跳、通知连接与命令连接配对
//!
//! 每个客户端依次建立三条连接：命令、心跳、通知。每条连接由独立的任务读取首条消息，
//! 辅助连接交给 [`ChannelPairing`] 暂存，命令连接交给命令处理任务。

pub mod liveness;
pub mod notify;
pub mod pairing;
pub mod processor;
pub mod registry;
pub mod storage;

pub use liveness::LivenessMonitor;
pub use notify::{Delivery, NotificationRouter};
pub use pairing::{ChannelPairing, PairingError};
pub use processor::SessionPhase;
pub use registry::{ChannelSet, ClientRegistry, RegistryError, Session};
pub use storage::{StorageError, StorageIndex};

use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerSettings;
use crate::logging::{LogEntry, LogSink};
use crate::transfer::MessageChannel;
use crate::transfer::protocol;

/// 所有会话任务共享的服务器状态
pub(crate) struct ServerContext {
    pub(crate) settings: ServerSettings,
    pub(crate) registry: Arc<ClientRegistry>,
    pub(crate) storage: Arc<StorageIndex>,
    pub(crate) router: NotificationRouter,
    pub(crate) pairing: ChannelPairing,
    pub(crate) log: LogSink,
    pub(crate) shutdown: CancellationToken,
}

impl ServerContext {
    fn channel(&self, stream: TcpStream) -> MessageChannel {
        MessageChannel::new(
            stream,
            self.settings.max_frame_bytes,
            self.settings.io_timeout(),
        )
    }
}

/// 文件共享服务器
pub struct Server {
    context: Arc<ServerContext>,
    log_rx: Option<mpsc::Receiver<LogEntry>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// 打开存储目录并创建服务器（尚未监听）
    pub async fn new(settings: ServerSettings) -> Result<Self, StorageError> {
        let (log, log_rx) = LogSink::channel(settings.log_capacity);

        let storage = Arc::new(StorageIndex::open(settings.storage_dir.clone()).await?);
        log.info(format!(
            "Storage folder set to: {}",
            storage.root().display()
        ));

        let registry = Arc::new(ClientRegistry::new(log.clone()));
        let router = NotificationRouter::new(registry.clone(), log.clone());
        let pairing = ChannelPairing::new(settings.io_timeout());

        Ok(Self {
            context: Arc::new(ServerContext {
                settings,
                registry,
                storage,
                router,
                pairing,
                log,
                shutdown: CancellationToken::new(),
            }),
            log_rx: Some(log_rx),
            tasks: Vec::new(),
        })
    }

    /// 获取日志流接收端（只能取一次）
    pub fn take_log_receiver(&mut self) -> Option<mpsc::Receiver<LogEntry>> {
        self.log_rx.take()
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.context.registry.clone()
    }

    /// 开始监听并启动心跳监视器
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let settings = &self.context.settings;
        let listener =
            TcpListener::bind((settings.bind_address.as_str(), settings.port)).await?;
        let addr = listener.local_addr()?;

        self.context
            .log
            .info(format!("Server started on port {}", addr.port()));
        info!("Server listening on {}", addr);

        let monitor = LivenessMonitor::new(
            self.context.registry.clone(),
            settings.heartbeat_interval(),
        );
        self.tasks.push(monitor.spawn(self.context.shutdown.clone()));

        let context = self.context.clone();
        self.tasks.push(tokio::spawn(accept_loop(listener, context)));

        Ok(addr)
    }

    /// 停止监听并断开所有会话
    pub async fn shutdown(&mut self) {
        self.context.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Server task failed: {}", e);
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.context.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>) {
    loop {
        let accepted = tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!("Connection opened from {}", addr);
                tokio::spawn(handle_connection(ctx.clone(), stream));
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    for session in ctx.registry.sessions().await {
        ctx.registry.unregister(&session).await;
    }
    debug!("Accept loop stopped");
}

/// 读取首条消息，决定连接是辅助连接还是命令连接
async fn handle_connection(ctx: Arc<ServerContext>, stream: TcpStream) {
    let mut channel = ctx.channel(stream);

    let first = tokio::select! {
        () = ctx.shutdown.cancelled() => return,
        first = channel.expect_text() => first,
    };

    let first = match first {
        Ok(text) => text,
        Err(e) => {
            debug!("Dropping connection from {:?}: {}", channel.peer_addr(), e);
            return;
        }
    };

    if let Some((role, name)) = protocol::parse_channel_hello(&first) {
        ctx.pairing.offer(name, role, channel).await;
        return;
    }

    processor::run_session(ctx, channel, first).await;
}
