#![doc = r#"
# matter-bdx

## 模块使命（Why）
- **可靠的大块搬运**：OTA 镜像远超单帧载荷，BDX 在一条可靠交换上做
  窗口化块传输，双方以计数器严格合拍；
- **两种驱动**：发送驱动（发送方推块）与接收驱动（接收方逐块索取），
  由响应方按偏好序在双方能力交集里选定。

## 分层（What）
- [`messages`]：Init/Accept/Block 家族与 `BdxStatusCode`；
- [`transfer`]：发起/响应两侧的状态机、scoped storage 的 designator
  解析、进度事件（`Querying → Downloading → WaitForApply → Applying →
  Done`）；
- [`ota`]：镜像容器（魔数、总长、TLV 头、SHA-256 摘要校验）。

## 端到端（How）
一次 OTA 下载：接收方 `ReceiveInit(ota/<image>)` → 响应方查 blob 并
`ReceiveAccept`（接收驱动）→ `BlockQuery/Block` 交替 → `BlockEof` →
`BlockAckEof`；重组字节与源 blob 位级一致，再经 [`ota::parse_image`]
校验摘要后进入应用阶段。
"#]

pub mod messages;
pub mod ota;
pub mod transfer;

pub use messages::{
    BdxStatusCode, Block, CounterOnly, DriveMode, TransferAccept, TransferInit, opcode,
};
pub use ota::{DIGEST_TYPE_SHA256, OTA_MAGIC, OtaImageHeader, parse_image, write_image};
pub use transfer::{
    BdxHandler, BdxProgress, DEFAULT_MAX_BLOCK_SIZE, IDLE_TIMEOUT, ProgressSink, TransferOptions,
    fetch_blob, offer_blob,
};

#[cfg(test)]
mod tests {
    use super::*;
    use matter_core::clock::SystemClock;
    use matter_core::storage::{MemoryStorage, StorageService};
    use matter_core::types::ProtocolId;
    use matter_session::{ExchangeManager, SessionManager};
    use matter_transport::{ConnectionlessTransport, PeerAddress, UdpTransport};
    use std::sync::Arc;

    async fn linked_managers() -> (
        Arc<ExchangeManager>,
        Arc<ExchangeManager>,
        Arc<UdpTransport>,
        Arc<UdpTransport>,
    ) {
        let server =
            ExchangeManager::new(Arc::new(SystemClock), Arc::new(SessionManager::new()));
        let client =
            ExchangeManager::new(Arc::new(SystemClock), Arc::new(SessionManager::new()));
        let server_transport = UdpTransport::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind server");
        let client_transport = UdpTransport::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind client");
        server.attach_transport(server_transport.clone() as Arc<dyn ConnectionlessTransport>);
        client.attach_transport(client_transport.clone() as Arc<dyn ConnectionlessTransport>);
        (server, client, server_transport, client_transport)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn receiver_drive_fetch_reassembles_bit_exact() {
        let (server, client, server_transport, client_transport) = linked_managers().await;

        let storage: Arc<dyn StorageService> = Arc::new(MemoryStorage::default());
        let handler = BdxHandler::new(storage);
        handler.install(&server);
        let payload: Vec<u8> = vec![0xab; 256];
        handler
            .store_blob("ota/firmware-15", payload.clone())
            .expect("store blob");

        let channel = client_transport
            .open_channel(PeerAddress::Udp(server_transport.local_addr()))
            .expect("open channel");
        let mut exchange = client.initiate_unsecured(channel, ProtocolId::BDX);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let options = TransferOptions {
            max_block_size: 32,
            progress: Some(Arc::new(move |progress| {
                sink_seen.lock().expect("seen").push(progress);
            })),
        };
        let fetched = fetch_blob(&mut exchange, "ota/firmware-15", &options)
            .await
            .expect("fetch");

        assert_eq!(fetched, payload, "reassembly must be bit exact");
        let seen = seen.lock().expect("seen");
        assert_eq!(seen.first(), Some(&BdxProgress::Querying));
        assert_eq!(seen.last(), Some(&BdxProgress::Done));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_designator_aborts_with_status() {
        let (server, client, server_transport, client_transport) = linked_managers().await;
        let handler = BdxHandler::new(Arc::new(MemoryStorage::default()));
        handler.install(&server);

        let channel = client_transport
            .open_channel(PeerAddress::Udp(server_transport.local_addr()))
            .expect("open channel");
        let mut exchange = client.initiate_unsecured(channel, ProtocolId::BDX);
        let err = fetch_blob(&mut exchange, "ota/missing", &TransferOptions::default())
            .await
            .expect_err("missing blob");
        assert!(err.to_string().contains("FileDesignatorUnknown"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offer_blob_lands_in_scoped_storage() {
        let (server, client, server_transport, client_transport) = linked_managers().await;
        let handler = BdxHandler::new(Arc::new(MemoryStorage::default()));
        handler.install(&server);

        let channel = client_transport
            .open_channel(PeerAddress::Udp(server_transport.local_addr()))
            .expect("open channel");
        let mut exchange = client.initiate_unsecured(channel, ProtocolId::BDX);
        let payload: Vec<u8> = (0..200u16).map(|v| v as u8).collect();
        offer_blob(
            &mut exchange,
            "logs/crash-0",
            &payload,
            &TransferOptions {
                max_block_size: 48,
                progress: None,
            },
        )
        .await
        .expect("offer");

        // 响应方落盘是异步任务的尾部动作，留一次让步窗口。
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(handler.load_blob("logs/crash-0"), Some(payload));
    }
}
