//! 客户端交互操作：controller 侧的读/写/调用/订阅驱动。

use crate::messages::{
    AttributeReport, EventReport, InvokeRequest, InvokeResponse, ReadRequest, ReportData,
    StatusResponse, SubscribeRequest, SubscribeResponse, TimedRequest, WriteRequest,
    WriteResponse, opcode,
};
use matter_core::error::{MatterError, Result, codes};
use matter_core::status::Status;
use matter_core::types::ProtocolId;
use matter_session::{Exchange, ExchangeManager, SecureSession};
use std::sync::Arc;
use std::time::Duration;

const STEP_TIMEOUT: Duration = Duration::from_secs(30);

fn status_error(status: Status) -> MatterError {
    MatterError::protocol(
        codes::INTERACTION_INVALID_ACTION,
        format!("peer replied with status {status:?}"),
    )
}

/// 绑定到一条会话的交互客户端。
pub struct InteractionClient {
    manager: Arc<ExchangeManager>,
    session: Arc<SecureSession>,
}

impl InteractionClient {
    pub fn new(manager: Arc<ExchangeManager>, session: Arc<SecureSession>) -> Self {
        Self { manager, session }
    }

    pub fn session(&self) -> &Arc<SecureSession> {
        &self.session
    }

    fn exchange(&self) -> Exchange {
        self.manager
            .initiate(Arc::clone(&self.session), ProtocolId::INTERACTION_MODEL)
    }

    /// 读操作：聚合全部报告块。
    pub async fn read(
        &self,
        request: &ReadRequest,
    ) -> Result<(Vec<AttributeReport>, Vec<EventReport>)> {
        let mut exchange = self.exchange();
        exchange.send(opcode::READ_REQUEST, &request.to_tlv()).await?;
        collect_report(&mut exchange).await
    }

    /// 写操作；`timed` 给定时先行发送 TimedRequest。
    pub async fn write(
        &self,
        request: &WriteRequest,
        timed: Option<Duration>,
    ) -> Result<WriteResponse> {
        let mut exchange = self.exchange();
        if let Some(window) = timed {
            arm_timed(&mut exchange, window).await?;
        }
        exchange.send(opcode::WRITE_REQUEST, &request.to_tlv()).await?;
        let message = exchange.next_message(STEP_TIMEOUT).await?;
        match message.header.opcode {
            opcode::WRITE_RESPONSE => WriteResponse::from_tlv(&message.payload),
            opcode::STATUS_RESPONSE => {
                let status = StatusResponse::from_tlv(&message.payload)?;
                Err(status_error(status.status))
            }
            other => Err(unexpected(other)),
        }
    }

    /// 调用操作；`timed` 给定时先行发送 TimedRequest。
    pub async fn invoke(
        &self,
        request: &InvokeRequest,
        timed: Option<Duration>,
    ) -> Result<InvokeResponse> {
        let mut exchange = self.exchange();
        if let Some(window) = timed {
            arm_timed(&mut exchange, window).await?;
        }
        exchange.send(opcode::INVOKE_REQUEST, &request.to_tlv()).await?;
        let message = exchange.next_message(STEP_TIMEOUT).await?;
        match message.header.opcode {
            opcode::INVOKE_RESPONSE => InvokeResponse::from_tlv(&message.payload),
            opcode::STATUS_RESPONSE => {
                let status = StatusResponse::from_tlv(&message.payload)?;
                Err(status_error(status.status))
            }
            other => Err(unexpected(other)),
        }
    }

    /// 订阅：完成响应与基线报告后返回活动订阅。
    pub async fn subscribe(&self, request: &SubscribeRequest) -> Result<ClientSubscription> {
        let mut exchange = self.exchange();
        exchange
            .send(opcode::SUBSCRIBE_REQUEST, &request.to_tlv())
            .await?;
        let message = exchange.next_message(STEP_TIMEOUT).await?;
        let response = match message.header.opcode {
            opcode::SUBSCRIBE_RESPONSE => SubscribeResponse::from_tlv(&message.payload)?,
            opcode::STATUS_RESPONSE => {
                let status = StatusResponse::from_tlv(&message.payload)?;
                return Err(status_error(status.status));
            }
            other => return Err(unexpected(other)),
        };
        let (baseline, _) = collect_report(&mut exchange).await?;
        Ok(ClientSubscription {
            exchange,
            subscription_id: response.subscription_id,
            max_interval: Duration::from_secs(u64::from(response.max_interval_s)),
            baseline,
        })
    }
}

async fn arm_timed(exchange: &mut Exchange, window: Duration) -> Result<()> {
    exchange
        .send(
            opcode::TIMED_REQUEST,
            &TimedRequest {
                timeout_ms: window.as_millis().min(u128::from(u16::MAX)) as u16,
            }
            .to_tlv(),
        )
        .await?;
    let message = exchange.next_message(STEP_TIMEOUT).await?;
    if message.header.opcode != opcode::STATUS_RESPONSE {
        return Err(unexpected(message.header.opcode));
    }
    let status = StatusResponse::from_tlv(&message.payload)?;
    if !status.status.is_success() {
        return Err(status_error(status.status));
    }
    Ok(())
}

/// 聚合一个逻辑报告（跨块），逐块回确认。
async fn collect_report(
    exchange: &mut Exchange,
) -> Result<(Vec<AttributeReport>, Vec<EventReport>)> {
    collect_report_with_timeout(exchange, STEP_TIMEOUT).await
}

async fn collect_report_with_timeout(
    exchange: &mut Exchange,
    timeout: Duration,
) -> Result<(Vec<AttributeReport>, Vec<EventReport>)> {
    let mut attributes = Vec::new();
    let mut events = Vec::new();
    loop {
        let message = exchange.next_message(timeout).await?;
        if message.header.opcode != opcode::REPORT_DATA {
            return Err(unexpected(message.header.opcode));
        }
        let report = ReportData::from_tlv(&message.payload)?;
        attributes.extend(report.attribute_reports);
        events.extend(report.event_reports);
        if !report.suppress_response {
            exchange
                .send(
                    opcode::STATUS_RESPONSE,
                    &StatusResponse {
                        status: Status::Success,
                    }
                    .to_tlv(),
                )
                .await?;
        }
        if !report.more_chunked_messages {
            return Ok((attributes, events));
        }
    }
}

fn unexpected(opcode: u8) -> MatterError {
    MatterError::protocol(
        codes::EXCHANGE_UNEXPECTED_MESSAGE,
        format!("unexpected interaction opcode 0x{opcode:02x}"),
    )
}

/// 一条活动的客户端订阅。
pub struct ClientSubscription {
    exchange: Exchange,
    pub subscription_id: u32,
    pub max_interval: Duration,
    /// 订阅建立时的基线报告。
    pub baseline: Vec<AttributeReport>,
}

impl ClientSubscription {
    /// 等待下一个报告（变更或保活）。
    pub async fn next_report(&mut self, timeout: Duration) -> Result<Vec<AttributeReport>> {
        let (attributes, _) = collect_report_with_timeout(&mut self.exchange, timeout).await?;
        Ok(attributes)
    }

    /// 关闭订阅（撤销交换路由；服务端在下一次报告失败时回收）。
    pub fn close(self) {}
}
