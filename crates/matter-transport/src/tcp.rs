//! 面向连接的 TCP 传输：长度前缀分帧的可靠通道。
//!
//! # 分帧（What）
//! Matter over TCP 在字节流上以 4 字节小端长度前缀界定报文；连接建立
//! 即视为握手完成（无额外协商步骤），断开即通道关闭。
//!
//! # 实现策略（How）
//! - 读写半部各由 `tokio::sync::Mutex` 序列化，通道可在任务间共享；
//! - 监听侧接受连接后交给调用方注册的回调，再由上层挂接会话层。

use crate::channel::{Channel, ChannelInfo, ChannelKind, PeerAddress};
use crate::error::TransportError;
use async_trait::async_trait;
use matter_core::error::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// TCP 单报文上限（长度前缀防御值）。
pub const MAX_TCP_PAYLOAD: usize = 64 * 1024;

/// 已建立的 TCP 通道。
pub struct TcpChannel {
    info: ChannelInfo,
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
}

impl TcpChannel {
    fn from_stream(stream: TcpStream) -> Result<Arc<Self>> {
        let local = stream.local_addr().map_err(TransportError::from)?;
        let peer = stream.peer_addr().map_err(TransportError::from)?;
        let (reader, writer) = stream.into_split();
        Ok(Arc::new(Self {
            info: ChannelInfo {
                kind: ChannelKind::Tcp,
                local: PeerAddress::Tcp(local),
                remote: PeerAddress::Tcp(peer),
                reliable: true,
                max_payload: MAX_TCP_PAYLOAD,
            },
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
        }))
    }

    /// 主动建连（面向连接传输的“握手”即 TCP 三次握手本身）。
    pub async fn connect(remote: SocketAddr) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(remote)
            .await
            .map_err(TransportError::from)?;
        Self::from_stream(stream)
    }

    /// 读取下一条完整报文；对端关闭返回 `ChannelClosed`。
    pub async fn receive(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        let mut prefix = [0u8; 4];
        reader.read_exact(&mut prefix).await.map_err(|_| {
            TransportError::ChannelClosed {
                peer: self.info.remote.to_string(),
            }
        })?;
        let len = u32::from_le_bytes(prefix) as usize;
        if len > MAX_TCP_PAYLOAD {
            return Err(TransportError::PayloadTooLarge {
                len,
                limit: MAX_TCP_PAYLOAD,
            }
            .into());
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await.map_err(|_| {
            TransportError::ChannelClosed {
                peer: self.info.remote.to_string(),
            }
        })?;
        Ok(payload)
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn info(&self) -> &ChannelInfo {
        &self.info
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.info.max_payload {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                limit: self.info.max_payload,
            }
            .into());
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await
            .map_err(TransportError::from)?;
        writer.write_all(payload).await.map_err(TransportError::from)?;
        writer.flush().await.map_err(TransportError::from)?;
        Ok(())
    }
}

/// 入站连接回调。
pub type AcceptListener = Arc<dyn Fn(Arc<TcpChannel>) + Send + Sync>;

/// TCP 监听器：接受连接并交给回调。
pub struct TcpTransport {
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// 绑定并开始接受连接。
    pub async fn listen(bind: SocketAddr, on_accept: AcceptListener) -> Result<Arc<Self>> {
        let listener = TokioTcpListener::bind(bind)
            .await
            .map_err(TransportError::from)?;
        let local_addr = listener.local_addr().map_err(TransportError::from)?;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => match TcpChannel::from_stream(stream) {
                        Ok(channel) => on_accept(channel),
                        Err(err) => debug!(%peer, error = %err, "tcp accept setup failed"),
                    },
                    Err(err) => {
                        warn!(error = %err, "tcp accept loop terminated");
                        return;
                    }
                }
            }
        });
        Ok(Arc::new(Self { local_addr }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[tokio::test(flavor = "multi_thread")]
    async fn framed_roundtrip_over_accepted_connection() {
        let accepted: Arc<Mutex<Option<Arc<TcpChannel>>>> = Arc::new(Mutex::new(None));
        let notify = Arc::new(Notify::new());
        let transport = {
            let accepted = Arc::clone(&accepted);
            let notify = Arc::clone(&notify);
            TcpTransport::listen(
                "127.0.0.1:0".parse().expect("addr"),
                Arc::new(move |channel| {
                    *accepted.lock().expect("accepted") = Some(channel);
                    notify.notify_one();
                }),
            )
            .await
            .expect("listen")
        };

        let client = TcpChannel::connect(transport.local_addr())
            .await
            .expect("connect");
        notify.notified().await;
        let server = accepted.lock().expect("accepted").clone().expect("channel");

        client.send(b"over tcp").await.expect("send");
        assert_eq!(server.receive().await.expect("receive"), b"over tcp");

        // 反向也通，且大于单帧 MTU 的载荷被本端拒绝。
        server.send(b"reply").await.expect("reply");
        assert_eq!(client.receive().await.expect("receive"), b"reply");
        assert!(client.send(&vec![0u8; MAX_TCP_PAYLOAD + 1]).await.is_err());
    }
}
