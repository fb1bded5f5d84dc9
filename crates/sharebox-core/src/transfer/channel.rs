//! 帧化消息通道
//!
//! 每个逻辑通道（命令 / 心跳 / 通知）都是一条独立的 TCP 连接，使用 4 字节
//! 大端长度前缀分帧（[`LengthDelimitedCodec`]），一个帧就是一条完整的逻辑消息，
//! 不再依赖"一次读取等于一条消息"。
//!
//! 文件内容以若干数据帧发送，各帧长度之和严格等于事先声明的大小。

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// 通道错误
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("connection closed by peer")]
    Closed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// 接收文件时的错误
///
/// 区分传输层错误（通道已不可用）和本地写入错误（通道仍然同步）。
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("failed to write received data: {0}")]
    Sink(io::Error),
}

/// 帧化的 TCP 消息通道
pub struct MessageChannel {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    io_timeout: Duration,
    peer: Option<SocketAddr>,
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("peer", &self.peer)
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

impl MessageChannel {
    pub fn new(stream: TcpStream, max_frame_bytes: usize, io_timeout: Duration) -> Self {
        let peer = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_bytes)
            .new_codec();

        Self {
            framed: Framed::new(stream, codec),
            io_timeout,
            peer,
        }
    }

    /// 连接到指定地址
    pub async fn connect(
        addr: &str,
        max_frame_bytes: usize,
        io_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let stream = with_deadline(io_timeout, TcpStream::connect(addr)).await??;
        Ok(Self::new(stream, max_frame_bytes, io_timeout))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// 发送一条文本消息
    pub async fn send_text(&mut self, text: &str) -> Result<(), ChannelError> {
        self.send_frame(Bytes::copy_from_slice(text.as_bytes())).await
    }

    /// 发送一个原始帧
    pub async fn send_frame(&mut self, frame: Bytes) -> Result<(), ChannelError> {
        with_deadline(self.io_timeout, self.framed.send(frame)).await??;
        Ok(())
    }

    /// 等待下一帧（无超时）
    ///
    /// 对端正常关闭时返回 `Ok(None)`。
    pub async fn recv_frame(&mut self) -> Result<Option<BytesMut>, ChannelError> {
        match self.framed.next().await {
            Some(frame) => Ok(Some(frame?)),
            None => Ok(None),
        }
    }

    /// 等待下一条文本消息（无超时）
    pub async fn recv_text(&mut self) -> Result<Option<String>, ChannelError> {
        match self.recv_frame().await? {
            Some(frame) => decode_text(frame).map(Some),
            None => Ok(None),
        }
    }

    /// 在 `timeout` 内等待下一条文本消息，对端关闭视为错误
    pub async fn expect_text_within(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        match with_deadline(timeout, self.recv_frame()).await?? {
            Some(frame) => decode_text(frame),
            None => Err(ChannelError::Closed),
        }
    }

    /// 在 I/O 超时内等待下一条文本消息
    pub async fn expect_text(&mut self) -> Result<String, ChannelError> {
        self.expect_text_within(self.io_timeout).await
    }

    /// 从 `reader` 读取恰好 `size` 字节并分块发送
    pub async fn send_stream<R>(
        &mut self,
        reader: &mut R,
        size: u64,
        chunk_size: usize,
    ) -> Result<(), ChannelError>
    where
        R: AsyncRead + Unpin,
    {
        let chunk_size = chunk_size.max(1);
        let mut remaining = size;

        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(chunk_size, |r| r.min(chunk_size));
            let mut buf = vec![0u8; want];
            with_deadline(self.io_timeout, reader.read_exact(&mut buf)).await??;
            self.send_frame(Bytes::from(buf)).await?;
            remaining -= want as u64;
        }

        Ok(())
    }

    /// 接收恰好 `size` 字节的数据帧并写入 `writer`
    ///
    /// 本地写入失败后继续把剩余数据读完，保证通道与对端保持同步，
    /// 最后返回 [`ReceiveError::Sink`]。
    pub async fn recv_stream<W>(&mut self, writer: &mut W, size: u64) -> Result<(), ReceiveError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut remaining = size;
        let mut sink_error: Option<io::Error> = None;

        while remaining > 0 {
            let frame = match with_deadline(self.io_timeout, self.recv_frame()).await?? {
                Some(frame) => frame,
                None => return Err(ChannelError::Closed.into()),
            };

            let len = frame.len() as u64;
            if len > remaining {
                return Err(ChannelError::Protocol(format!(
                    "data frame of {len} bytes exceeds the {remaining} bytes still expected"
                ))
                .into());
            }
            remaining -= len;

            if sink_error.is_none() {
                if let Err(e) = writer.write_all(&frame).await {
                    sink_error = Some(e);
                }
            }
        }

        if sink_error.is_none() {
            if let Err(e) = writer.flush().await {
                sink_error = Some(e);
            }
        }

        match sink_error {
            Some(e) => Err(ReceiveError::Sink(e)),
            None => Ok(()),
        }
    }

    /// 关闭写方向并释放连接
    pub async fn close(self) {
        let mut stream = self.framed.into_inner();
        let _ = with_deadline(self.io_timeout, stream.shutdown()).await;
    }
}

fn decode_text(frame: BytesMut) -> Result<String, ChannelError> {
    String::from_utf8(frame.to_vec()).map_err(|_| ChannelError::InvalidUtf8)
}

async fn with_deadline<F: Future>(timeout: Duration, fut: F) -> Result<F::Output, ChannelError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ChannelError::Timeout(timeout))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// 建立一对相连的通道
    pub(crate) async fn channel_pair() -> (MessageChannel, MessageChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (client, accepted) = tokio::join!(
            MessageChannel::connect(&addr, 64 * 1024, TIMEOUT),
            listener.accept()
        );
        let (stream, _) = accepted.unwrap();
        (
            client.unwrap(),
            MessageChannel::new(stream, 64 * 1024, TIMEOUT),
        )
    }

    #[tokio::test]
    async fn test_messages_keep_boundaries() {
        let (mut a, mut b) = channel_pair().await;
        a.send_text("LIST").await.unwrap();
        a.send_text("UPLOAD a.txt 3").await.unwrap();

        assert_eq!(b.recv_text().await.unwrap().as_deref(), Some("LIST"));
        assert_eq!(b.expect_text().await.unwrap(), "UPLOAD a.txt 3");
    }

    #[tokio::test]
    async fn test_stream_spans_multiple_frames() {
        let (mut a, mut b) = channel_pair().await;
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let size = data.len() as u64;

        let sender = tokio::spawn(async move {
            let mut reader = std::io::Cursor::new(data);
            a.send_stream(&mut reader, size, 1024).await.unwrap();
            a
        });

        let mut received = Vec::new();
        b.recv_stream(&mut received, size).await.unwrap();
        let _a = sender.await.unwrap();

        assert_eq!(received.len(), 10_000);
        assert_eq!(received[9_999], (9_999 % 251) as u8);
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let (a, mut b) = channel_pair().await;
        a.close().await;
        assert!(b.recv_text().await.unwrap().is_none());
        assert!(matches!(b.expect_text().await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_data_frame_is_rejected() {
        let (mut a, mut b) = channel_pair().await;
        a.send_frame(Bytes::from_static(b"12345")).await.unwrap();

        let mut sink = Vec::new();
        let err = b.recv_stream(&mut sink, 3).await.unwrap_err();
        assert!(matches!(
            err,
            ReceiveError::Channel(ChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_expect_text_times_out() {
        let (_a, mut b) = channel_pair().await;
        let err = b
            .expect_text_within(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }
}
