//! 基于 Tokio `UdpSocket` 的无连接传输实现。
//!
//! # 实现策略（How）
//! - 绑定与收发直接委托给 Tokio；`socket2` 仅用于绑定前的套接字选项
//!   （复用地址、组播回环），保持与上层 MDNS 服务一致的配置入口；
//! - 入站报文由独立任务循环交付给注册的监听器；监听器替换采用
//!   `std::sync::RwLock`，收包路径只读。

use crate::channel::{
    Channel, ChannelInfo, ChannelKind, ConnectionlessTransport, DataListener, PeerAddress,
};
use crate::error::TransportError;
use crate::MAX_UDP_PAYLOAD;
use async_trait::async_trait;
use matter_core::error::Result;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// UDP 传输构建器。
///
/// # 契约说明（What）
/// - `bind` 地址端口为 0 时由内核分配（测试常用）；
/// - `build` 必须在 Tokio 运行时上下文中调用，内部会启动收包任务。
#[derive(Debug)]
pub struct UdpTransportBuilder {
    bind: SocketAddr,
    reuse_address: bool,
}

impl UdpTransportBuilder {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            reuse_address: false,
        }
    }

    /// 允许多进程复用端口（MDNS 的组播端口需要）。
    pub fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    pub async fn build(self) -> Result<Arc<UdpTransport>> {
        let socket = bind_socket(self.bind, self.reuse_address).map_err(TransportError::from)?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr().map_err(TransportError::from)?;

        let transport = Arc::new(UdpTransport {
            socket: Arc::clone(&socket),
            local_addr,
            listener: RwLock::new(None),
        });

        let weak = Arc::downgrade(&transport);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(error = %err, "udp receive loop terminated");
                        return;
                    }
                };
                let Some(transport) = weak.upgrade() else {
                    debug!("udp transport dropped, stopping receive loop");
                    return;
                };
                transport.dispatch(peer, buf[..len].to_vec());
            }
        });

        Ok(transport)
    }
}

fn bind_socket(bind: SocketAddr, reuse_address: bool) -> std::io::Result<UdpSocket> {
    let domain = if bind.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    if reuse_address {
        socket.set_reuse_address(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;
    UdpSocket::from_std(socket.into())
}

/// UDP 传输：拥有套接字生命周期，按需派生发送通道。
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    listener: RwLock<Option<DataListener>>,
}

impl UdpTransport {
    /// 绑定到任意本地端口的便捷入口。
    pub async fn bind(addr: SocketAddr) -> Result<Arc<UdpTransport>> {
        UdpTransportBuilder::new(addr).build().await
    }

    /// 本地绑定地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn dispatch(&self, peer: SocketAddr, payload: Vec<u8>) {
        let listener = self.listener.read().expect("listener lock").clone();
        match listener {
            Some(listener) => listener(PeerAddress::Udp(peer), payload),
            None => debug!(%peer, "udp datagram dropped, no listener registered"),
        }
    }
}

impl ConnectionlessTransport for UdpTransport {
    fn open_channel(&self, remote: PeerAddress) -> Result<Arc<dyn Channel>> {
        let remote_addr = remote.socket_addr().ok_or_else(|| {
            matter_core::MatterError::implementation(
                matter_core::error::codes::IO_FAILURE,
                format!("udp transport cannot reach {remote}"),
            )
        })?;
        Ok(Arc::new(UdpChannel {
            socket: Arc::clone(&self.socket),
            info: ChannelInfo {
                kind: ChannelKind::Udp,
                local: PeerAddress::Udp(self.local_addr),
                remote: PeerAddress::Udp(remote_addr),
                reliable: false,
                max_payload: MAX_UDP_PAYLOAD,
            },
            remote: remote_addr,
        }))
    }

    fn on_data(&self, listener: DataListener) {
        *self.listener.write().expect("listener lock") = Some(listener);
    }
}

struct UdpChannel {
    socket: Arc<UdpSocket>,
    info: ChannelInfo,
    remote: SocketAddr,
}

#[async_trait]
impl Channel for UdpChannel {
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
        self.socket
            .send_to(payload, self.remote)
            .await
            .map_err(TransportError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[tokio::test(flavor = "multi_thread")]
    async fn datagram_reaches_registered_listener() {
        let receiver = UdpTransport::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind receiver");
        let sender = UdpTransport::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind sender");

        let received = Arc::new(Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());
        {
            let received = Arc::clone(&received);
            let notify = Arc::clone(&notify);
            receiver.on_data(Arc::new(move |peer, payload| {
                received.lock().expect("lock").push((peer, payload));
                notify.notify_one();
            }));
        }

        let channel = sender
            .open_channel(PeerAddress::Udp(receiver.local_addr()))
            .expect("open channel");
        channel.send(b"hello matter").await.expect("send");

        notify.notified().await;
        let received = received.lock().expect("lock");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, b"hello matter");
        assert_eq!(
            received[0].0,
            PeerAddress::Udp(sender.local_addr()),
            "source address must match the sender socket"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_payload_is_rejected_locally() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let channel = transport
            .open_channel(PeerAddress::Udp(transport.local_addr()))
            .expect("open channel");
        let oversized = vec![0u8; MAX_UDP_PAYLOAD + 1];
        assert!(channel.send(&oversized).await.is_err());
    }
}
