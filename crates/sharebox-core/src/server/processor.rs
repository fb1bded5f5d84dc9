//! 命令处理
//!
//! 每个会话一个任务，状态机 `AwaitingName → Active → Terminated`：
//! 先读取客户端名称并注册，之后在命令通道上逐条读取命令、分发、写回响应。
//! 对端关闭、`EXIT`、传输错误或心跳失败都会进入 `Terminated`，随后注销会话。

use log::{debug, warn};
use std::sync::Arc;

use crate::server::ServerContext;
use crate::server::pairing::PairingError;
use crate::server::registry::{RegistryError, Session};
use crate::server::storage::validate_file_name;
use crate::transfer::protocol::{
    self, Command, DELETE_DENIED, DELETE_FAILED, DELETE_OK, DOWNLOAD_FAILED, INVALID_NAME,
    LIST_FAILED, NAME_IN_USE, UNKNOWN_COMMAND, UPLOAD_FAILED, UPLOAD_OK, WELCOME,
};
use crate::transfer::{ChannelError, MessageChannel, ReceiveError};

/// 会话所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingName,
    Active,
    Terminated,
}

enum Flow {
    Continue,
    Exit,
}

/// 处理一个新接入的客户端，直到会话结束
///
/// `name` 是命令连接上已经读到的首条消息。
pub(crate) async fn run_session(ctx: Arc<ServerContext>, command: MessageChannel, name: String) {
    let mut processor = CommandProcessor {
        ctx: ctx.clone(),
        channel: command,
        phase: SessionPhase::AwaitingName,
    };

    let Some(session) = processor.accept_name(name.trim()).await else {
        return;
    };

    processor.serve(&session).await;
    ctx.registry.unregister(&session).await;
}

struct CommandProcessor {
    ctx: Arc<ServerContext>,
    channel: MessageChannel,
    phase: SessionPhase,
}

impl CommandProcessor {
    fn transition(&mut self, next: SessionPhase) {
        debug!(
            "Session {:?}: {:?} -> {:?}",
            self.channel.peer_addr(),
            self.phase,
            next
        );
        self.phase = next;
    }

    async fn reject(&mut self, name: &str, err: &RegistryError) {
        let response = match err {
            RegistryError::NameInUse(_) => {
                self.ctx.log.warn(format!(
                    "{name} is already in use. The new client was not accepted."
                ));
                NAME_IN_USE
            }
            RegistryError::InvalidName(_) => {
                self.ctx
                    .log
                    .warn(format!("Rejected invalid client name {name:?}."));
                INVALID_NAME
            }
        };
        let _ = self.channel.send_text(response).await;
        self.transition(SessionPhase::Terminated);
    }

    async fn accept_name(&mut self, name: &str) -> Option<Arc<Session>> {
        if !protocol::is_valid_client_name(name) {
            self.reject(name, &RegistryError::InvalidName(name.to_string()))
                .await;
            return None;
        }

        let (liveness, notification) = match self.ctx.pairing.claim(name).await {
            Ok(pair) => pair,
            Err(PairingError::Busy(_)) => {
                self.reject(name, &RegistryError::NameInUse(name.to_string()))
                    .await;
                return None;
            }
            Err(e @ PairingError::Timeout(..)) => {
                self.ctx.log.warn(format!(
                    "{name} did not open its liveness and notification channels in time."
                ));
                debug!("{}", e);
                self.transition(SessionPhase::Terminated);
                return None;
            }
        };

        let session = match self.ctx.registry.register(name, liveness, notification).await {
            Ok(session) => session,
            Err(err) => {
                self.reject(name, &err).await;
                return None;
            }
        };

        // 关闭过程中注册进来的会话不会再被清理，直接撤销
        if self.ctx.shutdown.is_cancelled() {
            self.ctx.registry.unregister(&session).await;
            self.transition(SessionPhase::Terminated);
            return None;
        }

        if let Err(e) = self.channel.send_text(WELCOME).await {
            warn!("Failed to welcome {}: {}", name, e);
            self.ctx.registry.unregister(&session).await;
            self.transition(SessionPhase::Terminated);
            return None;
        }

        self.transition(SessionPhase::Active);
        Some(session)
    }

    async fn serve(&mut self, session: &Session) {
        let token = session.channels().command_token();
        let client = session.name();

        loop {
            let received = tokio::select! {
                biased;
                () = token.cancelled() => break,
                received = self.channel.recv_text() => received,
            };

            let text = match received {
                Ok(Some(text)) => text,
                Ok(None) => {
                    debug!("{} closed the command channel", client);
                    break;
                }
                Err(ChannelError::InvalidUtf8) => {
                    warn!("{} sent a non-text command frame", client);
                    if self.channel.send_text(UNKNOWN_COMMAND).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    debug!("Command channel of {} failed: {}", client, e);
                    break;
                }
            };

            let flow = tokio::select! {
                biased;
                () = token.cancelled() => break,
                flow = self.dispatch(client, &text) => flow,
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => break,
                Err(e) => {
                    warn!("Session {} ended: {}", client, e);
                    break;
                }
            }
        }

        self.transition(SessionPhase::Terminated);
    }

    async fn dispatch(&mut self, client: &str, text: &str) -> Result<Flow, ChannelError> {
        let command = match text.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                self.ctx
                    .log
                    .warn(format!("Malformed command from {client}: {e}"));
                self.channel.send_text(e.failure_response()).await?;
                return Ok(Flow::Continue);
            }
        };

        debug!("{} -> {}", client, command);

        match command {
            Command::List => self.handle_list().await?,
            Command::Upload { filename, size } => {
                self.handle_upload(client, &filename, size).await?;
            }
            Command::Download { owner, file_key } => {
                self.handle_download(client, &owner, &file_key).await?;
            }
            Command::Delete { owner, file_key } => {
                self.handle_delete(client, &owner, &file_key).await?;
            }
            Command::Exit => return Ok(Flow::Exit),
        }

        Ok(Flow::Continue)
    }

    async fn handle_list(&mut self) -> Result<(), ChannelError> {
        let entries = self.ctx.storage.list().await;
        let text = protocol::format_file_list(
            entries
                .iter()
                .map(|(key, owner)| (key.as_str(), owner.as_str())),
        );

        if text.len() > self.ctx.settings.max_frame_bytes {
            self.ctx.log.error(format!(
                "File list of {} entries does not fit in one message.",
                entries.len()
            ));
            return self.channel.send_text(LIST_FAILED).await;
        }
        self.channel.send_text(&text).await
    }

    async fn handle_upload(
        &mut self,
        client: &str,
        filename: &str,
        size: u64,
    ) -> Result<(), ChannelError> {
        if let Err(e) = validate_file_name(filename) {
            self.ctx.log.error(format!("Error during upload: {e}"));
            self.discard_incoming(size).await?;
            return self.channel.send_text(UPLOAD_FAILED).await;
        }

        let mut pending = match self.ctx.storage.begin_upload().await {
            Ok(pending) => pending,
            Err(e) => {
                self.ctx.log.error(format!("Error during upload: {e}"));
                self.discard_incoming(size).await?;
                return self.channel.send_text(UPLOAD_FAILED).await;
            }
        };

        match self.channel.recv_stream(pending.file_mut(), size).await {
            Ok(()) => {}
            Err(ReceiveError::Sink(e)) => {
                pending.discard().await;
                self.ctx.log.error(format!("Error during upload: {e}"));
                return self.channel.send_text(UPLOAD_FAILED).await;
            }
            Err(ReceiveError::Channel(e)) => {
                pending.discard().await;
                self.ctx.log.error(format!("Error during upload: {e}"));
                return Err(e);
            }
        }

        match self.ctx.storage.commit_upload(pending, client, filename).await {
            Ok((_, true)) => {
                self.ctx.log.info(format!(
                    "Upload successful, {client} overwrote {filename}."
                ));
                self.channel
                    .send_text(&protocol::upload_overwritten(filename))
                    .await
            }
            Ok((_, false)) => {
                self.ctx.log.info(format!("{client} uploaded {filename}."));
                self.channel.send_text(UPLOAD_OK).await
            }
            Err(e) => {
                self.ctx.log.error(format!("Error during upload: {e}"));
                self.channel.send_text(UPLOAD_FAILED).await
            }
        }
    }

    /// 读完并丢弃对端已经声明的数据，保持命令通道同步
    async fn discard_incoming(&mut self, size: u64) -> Result<(), ChannelError> {
        match self.channel.recv_stream(&mut tokio::io::sink(), size).await {
            Ok(()) | Err(ReceiveError::Sink(_)) => Ok(()),
            Err(ReceiveError::Channel(e)) => Err(e),
        }
    }

    async fn handle_download(
        &mut self,
        client: &str,
        claimed_owner: &str,
        file_key: &str,
    ) -> Result<(), ChannelError> {
        let stored = match self.ctx.storage.open_file(file_key).await {
            Ok(stored) => stored,
            Err(e) => {
                self.ctx.log.error(format!("Error during download: {e}"));
                return self.channel.send_text(DOWNLOAD_FAILED).await;
            }
        };

        if stored.owner != claimed_owner {
            debug!(
                "{} named {} as owner of {}, index says {}",
                client, claimed_owner, file_key, stored.owner
            );
        }

        self.channel
            .send_text(&protocol::download_ready(stored.size))
            .await?;

        let mut file = stored.file;
        let chunk_size = self.ctx.settings.effective_chunk_size();
        if let Err(e) = self
            .channel
            .send_stream(&mut file, stored.size, chunk_size)
            .await
        {
            self.ctx.log.error(format!("Error during download: {e}"));
            return Err(e);
        }

        self.ctx
            .log
            .info(format!("File {file_key} sent to {client}."));
        let _ = self
            .ctx
            .router
            .route_download(&stored.owner, file_key, client);
        Ok(())
    }

    async fn handle_delete(
        &mut self,
        client: &str,
        claimed_owner: &str,
        file_key: &str,
    ) -> Result<(), ChannelError> {
        if claimed_owner != client {
            return self.channel.send_text(DELETE_DENIED).await;
        }

        match self.ctx.storage.owner_of(file_key).await {
            None => {
                self.ctx
                    .log
                    .error(format!("Error during deletion: file not found: {file_key}"));
                self.channel.send_text(DELETE_FAILED).await
            }
            Some(owner) if owner != client => {
                warn!("{} tried to delete {} owned by {}", client, file_key, owner);
                self.channel.send_text(DELETE_DENIED).await
            }
            Some(_) => match self.ctx.storage.remove(file_key).await {
                Ok(()) => {
                    self.ctx.log.info(format!("{client} deleted {file_key}."));
                    self.channel.send_text(DELETE_OK).await
                }
                Err(e) => {
                    self.ctx.log.error(format!("Error during deletion: {e}"));
                    self.channel.send_text(DELETE_FAILED).await
                }
            },
        }
    }
}
