//! 客户端会话（协议部分）
//!
//! 按固定顺序（命令、心跳、通知）建立三条连接，心跳和通知连接先发送 `CHANNEL` 首条消息
//! 表明身份，然后在命令通道上发送名称完成注册，
//! 之后提供 list / upload / download / delete 操作。心跳和通知通道由后台任务读取，
//! 事件通过 [`ClientSession::take_events`] 交给展示层。

use log::{debug, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::listener::{self, SessionEvent};
use crate::config::ClientSettings;
use crate::transfer::protocol::{self, ChannelRole, Command, RemoteFile};
use crate::transfer::{ChannelError, MessageChannel, ReceiveError};

/// 客户端错误
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Channel(#[from] ChannelError),

    /// 服务器拒绝注册，内容为服务器的原始响应
    #[error("{0}")]
    Rejected(String),

    #[error("not connected to a server")]
    NotConnected,

    /// 服务器返回了失败响应
    #[error("{0}")]
    Server(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("not a file path: {0:?}")]
    InvalidPath(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// 该错误之后命令通道是否已不可信
    fn breaks_session(&self) -> bool {
        matches!(
            self,
            ClientError::Channel(_) | ClientError::UnexpectedResponse(_)
        )
    }
}

/// 下载完成的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub file: RemoteFile,
    pub path: PathBuf,
    pub size: u64,
}

/// 客户端会话
pub struct ClientSession {
    name: String,
    server: String,
    command: Option<MessageChannel>,
    cancel: CancellationToken,
    events: Option<mpsc::Receiver<SessionEvent>>,
    listeners: Vec<JoinHandle<()>>,
    chunk_size: usize,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// 连接服务器并以 `settings.client_name` 注册
    ///
    /// 服务器响应中含有 `ERROR` 时关闭全部连接并返回 [`ClientError::Rejected`]。
    pub async fn connect(settings: &ClientSettings) -> Result<Self, ClientError> {
        let timeout = settings.io_timeout();
        let max_frame = settings.max_frame_bytes;

        let name = &settings.client_name;
        let mut command = MessageChannel::connect(&settings.server, max_frame, timeout).await?;
        let mut liveness = MessageChannel::connect(&settings.server, max_frame, timeout).await?;
        liveness
            .send_text(&protocol::channel_hello(ChannelRole::Liveness, name))
            .await?;
        let mut notification =
            MessageChannel::connect(&settings.server, max_frame, timeout).await?;
        notification
            .send_text(&protocol::channel_hello(ChannelRole::Notification, name))
            .await?;

        command.send_text(name).await?;
        let response = command.expect_text().await?;

        if response.contains("ERROR") {
            warn!("Registration refused: {}", response);
            command.close().await;
            liveness.close().await;
            notification.close().await;
            return Err(ClientError::Rejected(response));
        }

        info!("{}", response);

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(settings.event_capacity.max(1));
        let listeners = vec![
            listener::spawn_liveness_listener(
                liveness,
                settings.liveness_timeout(),
                tx.clone(),
                cancel.clone(),
            ),
            listener::spawn_notification_listener(notification, tx, cancel.clone()),
        ];

        info!("Connected to {} as {}", settings.server, settings.client_name);

        Ok(Self {
            name: settings.client_name.clone(),
            server: settings.server.clone(),
            command: Some(command),
            cancel,
            events: Some(rx),
            listeners,
            chunk_size: settings.effective_chunk_size(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_connected(&self) -> bool {
        self.command.is_some() && !self.cancel.is_cancelled()
    }

    /// 获取后台事件接收端（只能取一次）
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    /// 列出服务器上的所有文件
    pub async fn list(&mut self) -> Result<Vec<RemoteFile>, ClientError> {
        let result = match self.request(&Command::List).await {
            Ok(response) if protocol::is_error_response(&response) => {
                Err(ClientError::Server(response))
            }
            other => other,
        };
        let response = self.settle(result)?;
        Ok(protocol::parse_file_list(&response))
    }

    /// 上传本地文件，返回服务器的响应
    ///
    /// 文件名中的空格会被替换为 `_`。
    pub async fn upload(&mut self, path: &Path) -> Result<String, ClientError> {
        let result = self.upload_inner(path).await;
        self.settle(result)
    }

    async fn upload_inner(&mut self, path: &Path) -> Result<String, ClientError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().replace(' ', "_"))
            .ok_or_else(|| ClientError::InvalidPath(path.to_path_buf()))?;

        let mut file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let chunk_size = self.chunk_size;

        let channel = self.channel()?;
        channel
            .send_text(&Command::Upload { filename, size }.to_string())
            .await?;
        channel.send_stream(&mut file, size, chunk_size).await?;

        let response = channel.expect_text().await?;
        if protocol::is_error_response(&response) {
            return Err(ClientError::Server(response));
        }
        Ok(response)
    }

    /// 下载指定文件到 `dest`，返回字节数
    ///
    /// 服务器同意发送之后才会创建 `dest`；传输失败时删除写了一半的文件，
    /// 在此之前的失败不会动 `dest`。
    pub async fn download_remote(
        &mut self,
        file: &RemoteFile,
        dest: &Path,
    ) -> Result<u64, ClientError> {
        let result = self.download_inner(file, dest).await;
        self.settle(result)
    }

    async fn download_inner(&mut self, file: &RemoteFile, dest: &Path) -> Result<u64, ClientError> {
        let command = Command::Download {
            owner: file.owner.clone(),
            file_key: file.file_key.clone(),
        };
        let response = self.request(&command).await?;
        if protocol::is_error_response(&response) {
            return Err(ClientError::Server(response));
        }
        let size = protocol::parse_download_ready(&response)
            .ok_or(ClientError::UnexpectedResponse(response))?;

        let created = async {
            if let Some(parent) = dest.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).await?;
                }
            }
            File::create(dest).await
        }
        .await;

        let channel = self.channel()?;
        let mut out = match created {
            Ok(out) => out,
            Err(e) => {
                // 仍需读完服务器发来的数据
                match channel.recv_stream(&mut tokio::io::sink(), size).await {
                    Ok(()) | Err(ReceiveError::Sink(_)) => {}
                    Err(ReceiveError::Channel(ce)) => return Err(ce.into()),
                }
                return Err(e.into());
            }
        };

        let received = channel.recv_stream(&mut out, size).await;
        drop(out);

        match received {
            Ok(()) => {
                debug!("Downloaded {} ({} bytes) to {:?}", file.file_key, size, dest);
                Ok(size)
            }
            Err(e) => {
                let _ = fs::remove_file(dest).await;
                Err(match e {
                    ReceiveError::Sink(e) => e.into(),
                    ReceiveError::Channel(e) => e.into(),
                })
            }
        }
    }

    /// 先请求文件列表，由调用方选出文件和保存位置，再下载
    ///
    /// 列表为空或调用方放弃选择时返回 `Ok(None)`。
    pub async fn download_selected<F>(
        &mut self,
        select: F,
    ) -> Result<Option<DownloadedFile>, ClientError>
    where
        F: FnOnce(&[RemoteFile]) -> Option<(RemoteFile, PathBuf)>,
    {
        let files = self.list().await?;
        if files.is_empty() {
            return Ok(None);
        }

        let Some((file, path)) = select(&files) else {
            return Ok(None);
        };

        let size = self.download_remote(&file, &path).await?;
        Ok(Some(DownloadedFile { file, path, size }))
    }

    /// 删除指定文件，返回服务器的响应
    pub async fn delete_remote(&mut self, file: &RemoteFile) -> Result<String, ClientError> {
        let command = Command::Delete {
            owner: file.owner.clone(),
            file_key: file.file_key.clone(),
        };
        let result = match self.request(&command).await {
            Ok(response) if protocol::is_error_response(&response) => {
                Err(ClientError::Server(response))
            }
            other => other,
        };
        self.settle(result)
    }

    /// 先请求文件列表，由调用方选出文件，再删除
    pub async fn delete_selected<F>(
        &mut self,
        select: F,
    ) -> Result<Option<(RemoteFile, String)>, ClientError>
    where
        F: FnOnce(&[RemoteFile]) -> Option<RemoteFile>,
    {
        let files = self.list().await?;
        if files.is_empty() {
            return Ok(None);
        }

        let Some(file) = select(&files) else {
            return Ok(None);
        };

        let response = self.delete_remote(&file).await?;
        Ok(Some((file, response)))
    }

    /// 断开连接
    ///
    /// 尽力发送 `EXIT`，然后关闭全部通道。重复调用是空操作。
    pub async fn disconnect(&mut self) {
        if let Some(mut channel) = self.command.take() {
            if !self.cancel.is_cancelled() {
                let _ = channel.send_text(&Command::Exit.to_string()).await;
            }
            channel.close().await;
            info!("Disconnected from {}", self.server);
        }

        self.cancel.cancel();
        for handle in self.listeners.drain(..) {
            let _ = handle.await;
        }
    }

    fn channel(&mut self) -> Result<&mut MessageChannel, ClientError> {
        if self.cancel.is_cancelled() {
            self.command = None;
        }
        self.command.as_mut().ok_or(ClientError::NotConnected)
    }

    async fn request(&mut self, command: &Command) -> Result<String, ClientError> {
        let channel = self.channel()?;
        channel.send_text(&command.to_string()).await?;
        Ok(channel.expect_text().await?)
    }

    /// 命令通道出错后无法再与服务器保持同步，关闭本地会话
    fn settle<T>(&mut self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(e) = &result {
            if e.breaks_session() {
                warn!("Closing session after error: {}", e);
                self.command = None;
                self.cancel.cancel();
            }
        }
        result
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
