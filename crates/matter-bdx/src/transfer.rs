//! BDX 传输状态机：两种驱动方向下的发送端与接收端。
//!
//! # 不变量（What）
//! - 块计数器从 0 起连续递增（mod 2³²），接收端严格校验；
//! - 非末块必须非空，末块为 `BlockEof`；
//! - 接收驱动下第 N+1 块必须由匹配的 `BlockQuery` 先行索取；
//! - 任一方可发 `StatusReport` 终止，会话空闲超过 5 分钟作废。

use crate::messages::{
    BdxStatusCode, Block, CounterOnly, DriveMode, TransferAccept, TransferInit, opcode,
};
use matter_core::error::{MatterError, Result, codes};
use matter_core::storage::{StorageContext, StorageService};
use matter_core::types::ProtocolId;
use matter_session::{Exchange, InboundMessage, ProtocolHandler, StatusReport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 会话空闲超时。
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// 默认块大小上限。
pub const DEFAULT_MAX_BLOCK_SIZE: u16 = 1024;

/// 传输进度（OTA 事件面）。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BdxProgress {
    Querying,
    Downloading,
    WaitForApply,
    Applying,
    Done,
}

/// 进度事件消费者。
pub type ProgressSink = Arc<dyn Fn(BdxProgress) + Send + Sync>;

/// 发起方选项。
#[derive(Clone)]
pub struct TransferOptions {
    pub max_block_size: u16,
    pub progress: Option<ProgressSink>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            progress: None,
        }
    }
}

impl TransferOptions {
    fn emit(&self, progress: BdxProgress) {
        if let Some(sink) = &self.progress {
            sink(progress);
        }
    }
}

async fn send_error(exchange: &Exchange, code: BdxStatusCode) {
    let report = StatusReport {
        general_code: 1,
        protocol_id: u32::from(ProtocolId::BDX.raw()),
        protocol_code: code.raw(),
    };
    if let Err(err) = exchange.send(opcode::STATUS_REPORT, &report.encode()).await {
        debug!(error = %err, "bdx status report send failed");
    }
}

fn transfer_error(code: BdxStatusCode, context: &str) -> MatterError {
    let code_name = match code {
        BdxStatusCode::BadBlockCounter => codes::BDX_BAD_BLOCK_COUNTER,
        BdxStatusCode::TransferMethodNotSupported => codes::BDX_METHOD_NOT_SUPPORTED,
        _ => codes::IO_FAILURE,
    };
    MatterError::protocol(code_name, format!("bdx: {context}"))
}

fn peer_status(payload: &[u8]) -> MatterError {
    let detail = StatusReport::decode(payload)
        .ok()
        .and_then(|report| BdxStatusCode::from_raw(report.protocol_code))
        .map(|code| format!("{code:?}"))
        .unwrap_or_else(|| "unknown".to_owned());
    MatterError::io(
        codes::IO_FAILURE,
        format!("peer aborted bdx transfer ({detail})"),
    )
}

// ---- 发起方：取回 ----

/// 作为接收方发起传输（OTA 下载路径）。
pub async fn fetch_blob(
    exchange: &mut Exchange,
    designator: &str,
    options: &TransferOptions,
) -> Result<Vec<u8>> {
    options.emit(BdxProgress::Querying);
    let init = TransferInit::new(designator, options.max_block_size);
    exchange.send(opcode::RECEIVE_INIT, &init.encode()).await?;

    let message = exchange.next_message(IDLE_TIMEOUT).await?;
    let accept = match message.header.opcode {
        opcode::RECEIVE_ACCEPT => TransferAccept::decode(&message.payload)?,
        opcode::STATUS_REPORT => return Err(peer_status(&message.payload)),
        other => {
            send_error(exchange, BdxStatusCode::UnexpectedMessage).await;
            return Err(transfer_error(
                BdxStatusCode::UnexpectedMessage,
                &format!("unexpected opcode 0x{other:02x} instead of accept"),
            ));
        }
    };

    options.emit(BdxProgress::Downloading);
    let data = receive_blocks(exchange, accept.mode, accept.max_block_size).await?;
    options.emit(BdxProgress::Done);
    Ok(data)
}

/// 按协商模式收块直至 `BlockEof`，返回重组后的数据。
async fn receive_blocks(
    exchange: &mut Exchange,
    mode: DriveMode,
    max_block_size: u16,
) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut expected: u32 = 0;
    loop {
        if mode == DriveMode::ReceiverDrive {
            exchange
                .send(opcode::BLOCK_QUERY, &CounterOnly { counter: expected }.encode())
                .await?;
        }
        let message = exchange.next_message(IDLE_TIMEOUT).await?;
        match message.header.opcode {
            opcode::BLOCK | opcode::BLOCK_EOF => {
                let block = Block::decode(&message.payload)?;
                if block.counter != expected {
                    send_error(exchange, BdxStatusCode::BadBlockCounter).await;
                    return Err(transfer_error(
                        BdxStatusCode::BadBlockCounter,
                        &format!("expected block {expected}, got {}", block.counter),
                    ));
                }
                let is_final = message.header.opcode == opcode::BLOCK_EOF;
                if !is_final && block.data.is_empty() {
                    send_error(exchange, BdxStatusCode::UnexpectedMessage).await;
                    return Err(transfer_error(
                        BdxStatusCode::UnexpectedMessage,
                        "non-final block must be nonempty",
                    ));
                }
                if block.data.len() > usize::from(max_block_size) {
                    send_error(exchange, BdxStatusCode::LengthTooLarge).await;
                    return Err(transfer_error(
                        BdxStatusCode::LengthTooLarge,
                        "block exceeds negotiated size",
                    ));
                }
                data.extend_from_slice(&block.data);
                if is_final {
                    exchange
                        .send(
                            opcode::BLOCK_ACK_EOF,
                            &CounterOnly { counter: expected }.encode(),
                        )
                        .await?;
                    return Ok(data);
                }
                if mode == DriveMode::SenderDrive {
                    exchange
                        .send(opcode::BLOCK_ACK, &CounterOnly { counter: expected }.encode())
                        .await?;
                }
                expected = expected.wrapping_add(1);
            }
            opcode::STATUS_REPORT => return Err(peer_status(&message.payload)),
            other => {
                send_error(exchange, BdxStatusCode::UnexpectedMessage).await;
                return Err(transfer_error(
                    BdxStatusCode::UnexpectedMessage,
                    &format!("unexpected opcode 0x{other:02x} during download"),
                ));
            }
        }
    }
}

// ---- 发起方：推送 ----

/// 作为发送方发起传输（日志上传等路径）。
pub async fn offer_blob(
    exchange: &mut Exchange,
    designator: &str,
    data: &[u8],
    options: &TransferOptions,
) -> Result<()> {
    let init = TransferInit::new(designator, options.max_block_size);
    exchange.send(opcode::SEND_INIT, &init.encode()).await?;

    let message = exchange.next_message(IDLE_TIMEOUT).await?;
    let accept = match message.header.opcode {
        opcode::SEND_ACCEPT => TransferAccept::decode(&message.payload)?,
        opcode::STATUS_REPORT => return Err(peer_status(&message.payload)),
        other => {
            send_error(exchange, BdxStatusCode::UnexpectedMessage).await;
            return Err(transfer_error(
                BdxStatusCode::UnexpectedMessage,
                &format!("unexpected opcode 0x{other:02x} instead of accept"),
            ));
        }
    };
    send_blocks(exchange, accept.mode, accept.max_block_size, data).await
}

/// 按协商模式发块：非末块配 `Block`，末块配 `BlockEof`。
async fn send_blocks(
    exchange: &mut Exchange,
    mode: DriveMode,
    max_block_size: u16,
    data: &[u8],
) -> Result<()> {
    let block_size = usize::from(max_block_size.max(1));
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![&[]]
    } else {
        data.chunks(block_size).collect()
    };
    let last = chunks.len() - 1;

    for (index, chunk) in chunks.iter().enumerate() {
        let counter = index as u32;
        if mode == DriveMode::ReceiverDrive {
            // 接收驱动：等对应计数器的 BlockQuery。
            let message = exchange.next_message(IDLE_TIMEOUT).await?;
            match message.header.opcode {
                opcode::BLOCK_QUERY => {
                    let query = CounterOnly::decode(&message.payload)?;
                    if query.counter != counter {
                        send_error(exchange, BdxStatusCode::BadBlockCounter).await;
                        return Err(transfer_error(
                            BdxStatusCode::BadBlockCounter,
                            &format!("query for {} while serving {counter}", query.counter),
                        ));
                    }
                }
                opcode::STATUS_REPORT => return Err(peer_status(&message.payload)),
                other => {
                    send_error(exchange, BdxStatusCode::UnexpectedMessage).await;
                    return Err(transfer_error(
                        BdxStatusCode::UnexpectedMessage,
                        &format!("unexpected opcode 0x{other:02x} awaiting query"),
                    ));
                }
            }
        }

        let block_opcode = if index == last {
            opcode::BLOCK_EOF
        } else {
            opcode::BLOCK
        };
        exchange
            .send(
                block_opcode,
                &Block {
                    counter,
                    data: chunk.to_vec(),
                }
                .encode(),
            )
            .await?;

        if mode == DriveMode::SenderDrive || index == last {
            // 发送驱动逐块确认；两种模式末块都等 BlockAckEof。
            let expected_ack = if index == last {
                opcode::BLOCK_ACK_EOF
            } else {
                opcode::BLOCK_ACK
            };
            let message = exchange.next_message(IDLE_TIMEOUT).await?;
            if message.header.opcode == opcode::STATUS_REPORT {
                return Err(peer_status(&message.payload));
            }
            if message.header.opcode != expected_ack {
                return Err(transfer_error(
                    BdxStatusCode::UnexpectedMessage,
                    &format!("expected ack 0x{expected_ack:02x}"),
                ));
            }
            let ack = CounterOnly::decode(&message.payload)?;
            if ack.counter != counter {
                return Err(transfer_error(
                    BdxStatusCode::BadBlockCounter,
                    &format!("ack for {} while at {counter}", ack.counter),
                ));
            }
        }
    }
    Ok(())
}

// ---- 响应方 ----

/// 响应方：以 scoped storage 解析 file designator 并服务传输。
pub struct BdxHandler {
    storage: Arc<dyn StorageService>,
    /// 响应方的驱动模式偏好序。
    preference: Vec<DriveMode>,
    max_block_size: u16,
}

impl BdxHandler {
    pub fn new(storage: Arc<dyn StorageService>) -> Arc<Self> {
        Arc::new(Self {
            storage,
            preference: vec![DriveMode::ReceiverDrive, DriveMode::SenderDrive],
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
        })
    }

    /// 注册为 BDX 协议处理器。
    pub fn install(self: &Arc<Self>, manager: &Arc<matter_session::ExchangeManager>) {
        manager.register_handler(ProtocolId::BDX, Arc::clone(self) as Arc<dyn ProtocolHandler>);
    }

    /// `<scope>/<designator>` → 存储上下文与键。
    fn resolve(designator: &str) -> Option<(StorageContext, String)> {
        let (scope, rest) = designator.split_once('/')?;
        if scope.is_empty() || rest.is_empty() {
            return None;
        }
        Some((StorageContext::new("bdx").child(scope), rest.to_owned()))
    }

    /// 写入一个可供取回的 blob（测试与 OTA 供应端使用）。
    pub fn store_blob(&self, designator: &str, data: Vec<u8>) -> Result<()> {
        let (context, key) = Self::resolve(designator).ok_or_else(|| {
            MatterError::implementation(codes::IO_FAILURE, format!("bad designator `{designator}`"))
        })?;
        self.storage.write_blob(&context, &key, data);
        Ok(())
    }

    pub fn load_blob(&self, designator: &str) -> Option<Vec<u8>> {
        let (context, key) = Self::resolve(designator)?;
        self.storage.read_blob(&context, &key)
    }

    async fn respond(self: Arc<Self>, mut exchange: Exchange, first: InboundMessage) -> Result<()> {
        let init = TransferInit::decode(&first.payload)?;
        if init.supports_async && !init.supports_sender_drive && !init.supports_receiver_drive {
            send_error(&exchange, BdxStatusCode::TransferMethodNotSupported).await;
            return Err(transfer_error(
                BdxStatusCode::TransferMethodNotSupported,
                "async-only transfer offered",
            ));
        }
        let Some(mode) = init.negotiate(&self.preference) else {
            send_error(&exchange, BdxStatusCode::TransferMethodNotSupported).await;
            return Err(transfer_error(
                BdxStatusCode::TransferMethodNotSupported,
                "no common drive mode",
            ));
        };
        let block_size = init.max_block_size.min(self.max_block_size);

        match first.header.opcode {
            opcode::RECEIVE_INIT => {
                // 对端取回：本端作为发送方。
                let Some(data) = self.load_blob(&init.file_designator) else {
                    send_error(&exchange, BdxStatusCode::FileDesignatorUnknown).await;
                    return Err(transfer_error(
                        BdxStatusCode::FileDesignatorUnknown,
                        &init.file_designator,
                    ));
                };
                let accept = TransferAccept {
                    version: init.version,
                    mode,
                    max_block_size: block_size,
                    length: Some(data.len() as u64),
                };
                exchange.send(opcode::RECEIVE_ACCEPT, &accept.encode()).await?;
                send_blocks(&mut exchange, mode, block_size, &data).await
            }
            opcode::SEND_INIT => {
                // 对端推送：本端作为接收方并落盘。
                let accept = TransferAccept {
                    version: init.version,
                    mode,
                    max_block_size: block_size,
                    length: None,
                };
                exchange.send(opcode::SEND_ACCEPT, &accept.encode()).await?;
                let data = receive_blocks(&mut exchange, mode, block_size).await?;
                self.store_blob(&init.file_designator, data)
            }
            other => {
                send_error(&exchange, BdxStatusCode::UnexpectedMessage).await;
                Err(transfer_error(
                    BdxStatusCode::UnexpectedMessage,
                    &format!("unexpected first opcode 0x{other:02x}"),
                ))
            }
        }
    }
}

impl ProtocolHandler for BdxHandler {
    fn on_exchange(&self, exchange: Exchange, first: InboundMessage) {
        let handler = Arc::new(Self {
            storage: Arc::clone(&self.storage),
            preference: self.preference.clone(),
            max_block_size: self.max_block_size,
        });
        tokio::spawn(async move {
            if let Err(err) = handler.respond(exchange, first).await {
                warn!(error = %err, "bdx transfer failed");
            }
        });
    }
}
