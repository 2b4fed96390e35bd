//! 交互模型服务端引擎：五种操作在一条交换上的消息序列。
//!
//! # 分发（How）
//! 每条对端发起的 IM 交换进入 [`InteractionEngine::on_exchange`]，按首条
//! 消息 opcode 分流；`TimedRequest` 先行武装计时窗口后继续等待同交换上
//! 的写/调用。报告按载荷上限分块，非末块置 `more_chunked_messages` 并
//! 等待对端的 `StatusResponse` 确认。
//!
//! # 准入（What）
//! - PASE 会话是临时管理通道，CASE 会话按配网时授予的管理主体对待，
//!   主体特权由此折算；
//! - 原子属性的常规写一律 `InvalidInState`，仅当调用方持有覆盖该属性
//!   的原子写状态时改道进暂存表。

use crate::atomic::AtomicCoordinator;
use crate::messages::{
    AttributeData, AttributePath, AttributeReport, AttributeStatus, CommandData, EventReport,
    InvokeRequest, InvokeResponse, InvokeResponseItem, ReadRequest, ReportData, StatusResponse,
    SubscribeRequest, SubscribeResponse, TimedRequest, WriteRequest, WriteResponse, opcode,
};
use crate::paths::{event_path_matches, expand_attribute_paths};
use crate::subscriptions::{ServerSubscription, SubscriptionEngine, SubscriptionLimits};
use matter_core::clock::Clock;
use matter_core::error::{MatterError, Result, codes};
use matter_core::status::Status;
use matter_core::types::{AttributeId, FabricIndex, ProtocolId};
use matter_datamodel::supervisor::AccessSubject;
use matter_datamodel::{
    Behavior, CommandOutcome, Endpoint, EventLog, InteractionEvent, Privilege, Transaction,
};
use matter_session::{Exchange, ExchangeManager, InboundMessage, ProtocolHandler, SecureSession};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// 引擎配置。
#[derive(Clone, Copy, Debug)]
pub struct InteractionConfig {
    /// 单个报告帧的载荷预算（编码后字节）。
    pub max_report_payload: usize,
    pub limits: SubscriptionLimits,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            max_report_payload: 900,
            limits: SubscriptionLimits::default(),
        }
    }
}

const STEP_TIMEOUT: Duration = Duration::from_secs(30);
/// 计时窗口上限。
const MAX_TIMED_WINDOW: Duration = Duration::from_secs(60);

/// 交互模型引擎。
pub struct InteractionEngine {
    clock: Arc<dyn Clock>,
    root: Arc<Endpoint>,
    event_log: Arc<EventLog>,
    subscriptions: Arc<SubscriptionEngine>,
    atomic: Arc<AtomicCoordinator>,
    config: InteractionConfig,
    /// 已接线的 datasource 指针（结构变化重扫时去重）。
    wired: std::sync::Mutex<HashSet<usize>>,
}

impl InteractionEngine {
    pub fn new(
        clock: Arc<dyn Clock>,
        root: Arc<Endpoint>,
        event_log: Arc<EventLog>,
        config: InteractionConfig,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            subscriptions: SubscriptionEngine::new(Arc::clone(&clock), config.limits),
            atomic: AtomicCoordinator::new(Arc::clone(&clock)),
            clock,
            root,
            event_log,
            config,
            wired: std::sync::Mutex::new(HashSet::new()),
        });
        engine.wire_tree();
        {
            let weak = Arc::downgrade(&engine);
            engine.root.on_structure_changed(move || {
                if let Some(engine) = weak.upgrade() {
                    engine.wire_tree();
                }
            });
        }
        engine
    }

    /// 注册为交互模型协议处理器。
    pub fn install(self: &Arc<Self>, manager: &Arc<ExchangeManager>) {
        manager.register_handler(ProtocolId::INTERACTION_MODEL, Arc::clone(self) as Arc<dyn ProtocolHandler>);
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionEngine> {
        &self.subscriptions
    }

    pub fn atomic(&self) -> &Arc<AtomicCoordinator> {
        &self.atomic
    }

    /// 把端点树上的全部 datasource 接到订阅引擎（按指针去重，结构
    /// 变化重扫只接新增的 behavior）。
    fn wire_tree(self: &Arc<Self>) {
        for endpoint in self.root.walk() {
            for behavior in endpoint.behaviors() {
                let key = Arc::as_ptr(behavior.datasource()) as usize;
                if !self.wired.lock().expect("wired lock").insert(key) {
                    continue;
                }
                let omitted: HashSet<AttributeId> = behavior
                    .datasource()
                    .plan()
                    .attributes()
                    .filter(|attr| attr.schema.quality.changes_omitted)
                    .map(|attr| attr.schema.id)
                    .collect();
                let subscriptions = Arc::clone(&self.subscriptions);
                behavior.datasource().subscribe(move |notice| {
                    subscriptions.on_change(notice, &omitted);
                });
                behavior.attach_event_log(Arc::clone(&self.event_log));
            }
        }
    }

    fn subject_for(session: Option<&Arc<SecureSession>>) -> AccessSubject {
        match session {
            // PASE 为临时管理会话；CASE 按配网授予的管理主体折算。
            Some(session) => AccessSubject {
                privilege: Privilege::Administer,
                fabric_index: session.fabric_index,
            },
            // 未加密交换只出现在建立/测试通道，同样按临时管理对待。
            None => AccessSubject::administer(None),
        }
    }

    fn peer_key(session: Option<&Arc<SecureSession>>) -> u64 {
        session
            .map(|s| u64::from(s.local_id.raw()) | (u64::from(s.peer_node_id.raw() as u32) << 16))
            .unwrap_or(0)
    }
}

impl ProtocolHandler for InteractionEngine {
    fn on_exchange(&self, exchange: Exchange, first: InboundMessage) {
        let engine = Arc::new(EngineRef {
            clock: Arc::clone(&self.clock),
            root: Arc::clone(&self.root),
            event_log: Arc::clone(&self.event_log),
            subscriptions: Arc::clone(&self.subscriptions),
            atomic: Arc::clone(&self.atomic),
            config: self.config,
        });
        tokio::spawn(async move {
            if let Err(err) = engine.handle_exchange(exchange, first).await {
                debug!(error = %err, "interaction exchange ended with error");
            }
        });
    }
}

/// 单交换处理器持有的引擎视图（避免跨任务借用）。
struct EngineRef {
    clock: Arc<dyn Clock>,
    root: Arc<Endpoint>,
    event_log: Arc<EventLog>,
    subscriptions: Arc<SubscriptionEngine>,
    atomic: Arc<AtomicCoordinator>,
    config: InteractionConfig,
}

impl EngineRef {
    async fn handle_exchange(
        self: &Arc<Self>,
        mut exchange: Exchange,
        first: InboundMessage,
    ) -> Result<()> {
        let session = exchange.session();
        let subject = InteractionEngine::subject_for(session.as_ref());
        let peer_key = InteractionEngine::peer_key(session.as_ref());

        let mut timed_deadline: Option<Instant> = None;
        let mut message = first;
        loop {
            match message.header.opcode {
                opcode::TIMED_REQUEST => {
                    let request = TimedRequest::from_tlv(&message.payload)?;
                    let window =
                        Duration::from_millis(u64::from(request.timeout_ms)).min(MAX_TIMED_WINDOW);
                    timed_deadline = Some(self.clock.now() + window);
                    exchange
                        .send(
                            opcode::STATUS_RESPONSE,
                            &StatusResponse {
                                status: Status::Success,
                            }
                            .to_tlv(),
                        )
                        .await?;
                    message = exchange.next_message(window + STEP_TIMEOUT).await?;
                }
                opcode::READ_REQUEST => {
                    return self.handle_read(&mut exchange, &subject, &message.payload).await;
                }
                opcode::SUBSCRIBE_REQUEST => {
                    return self
                        .handle_subscribe(exchange, &subject, session, &message.payload)
                        .await;
                }
                opcode::WRITE_REQUEST => {
                    return self
                        .handle_write(&mut exchange, &subject, peer_key, timed_deadline, &message.payload)
                        .await;
                }
                opcode::INVOKE_REQUEST => {
                    return self
                        .handle_invoke(&mut exchange, &subject, peer_key, timed_deadline, &message.payload)
                        .await;
                }
                other => {
                    trace!(opcode = other, "unexpected interaction opcode");
                    exchange
                        .send(
                            opcode::STATUS_RESPONSE,
                            &StatusResponse {
                                status: Status::InvalidAction,
                            }
                            .to_tlv(),
                        )
                        .await?;
                    return Ok(());
                }
            }
        }
    }

    // ---- 读 ----

    async fn handle_read(
        self: &Arc<Self>,
        exchange: &mut Exchange,
        subject: &AccessSubject,
        payload: &[u8],
    ) -> Result<()> {
        let request = ReadRequest::from_tlv(payload)?;
        let (attribute_reports, event_reports) = self.collect_reports(&request, subject);
        self.send_chunked(exchange, None, attribute_reports, event_reports, false)
            .await
    }

    /// 按请求收集属性与事件报告（含数据版本过滤）。
    fn collect_reports(
        &self,
        request: &ReadRequest,
        subject: &AccessSubject,
    ) -> (Vec<AttributeReport>, Vec<EventReport>) {
        let (resolved, errors) =
            expand_attribute_paths(&self.root, &request.attribute_paths, subject);

        let mut attribute_reports: Vec<AttributeReport> = errors
            .into_iter()
            .map(|error| AttributeReport::Status {
                path: error.path,
                status: error.status,
            })
            .collect();

        for item in resolved {
            let datasource = item.behavior.datasource();
            let version = datasource.version();
            let filtered = request.data_version_filters.iter().any(|filter| {
                Some(filter.endpoint) == item.path.endpoint
                    && Some(filter.cluster) == item.path.cluster
                    && filter.version == version
            });
            if filtered {
                continue;
            }
            if let Some(value) = datasource.get(item.attribute) {
                attribute_reports.push(AttributeReport::Data {
                    path: item.path,
                    version,
                    value,
                });
            }
        }

        let mut event_reports = Vec::new();
        if !request.event_paths.is_empty() {
            let fabric_filter = if request.fabric_filtered {
                subject.fabric_index
            } else {
                None
            };
            let after = request.event_min.unwrap_or(matter_core::types::EventNumber(0));
            for record in self.event_log.events_after(after, fabric_filter) {
                let matched = request.event_paths.iter().any(|path| {
                    event_path_matches(path, record.endpoint, record.cluster, record.event_id)
                });
                if matched {
                    event_reports.push(EventReport {
                        path: crate::messages::EventPath {
                            endpoint: Some(record.endpoint),
                            cluster: Some(record.cluster),
                            event: Some(record.event_id),
                        },
                        number: record.number,
                        priority: match record.priority {
                            matter_core::types::EventPriority::Debug => 0,
                            matter_core::types::EventPriority::Info => 1,
                            matter_core::types::EventPriority::Critical => 2,
                        },
                        epoch_timestamp_ms: record.epoch_timestamp.as_millis() as u64,
                        payload: record.payload.clone(),
                    });
                }
            }
        }
        (attribute_reports, event_reports)
    }

    /// 分块发送报告流；非末块等待对端 `StatusResponse`。
    async fn send_chunked(
        &self,
        exchange: &mut Exchange,
        subscription_id: Option<u32>,
        attribute_reports: Vec<AttributeReport>,
        event_reports: Vec<EventReport>,
        suppress_response: bool,
    ) -> Result<()> {
        let mut chunks: Vec<ReportData> = Vec::new();
        let mut current = ReportData {
            subscription_id,
            suppress_response,
            ..ReportData::default()
        };

        for report in attribute_reports {
            current.attribute_reports.push(report);
            if current.to_tlv().len() > self.config.max_report_payload
                && current.attribute_reports.len() > 1
            {
                let overflow = current.attribute_reports.pop().expect("nonempty");
                chunks.push(std::mem::take(&mut current));
                current.subscription_id = subscription_id;
                current.suppress_response = suppress_response;
                current.attribute_reports.push(overflow);
            }
        }
        for report in event_reports {
            current.event_reports.push(report);
            if current.to_tlv().len() > self.config.max_report_payload
                && (current.event_reports.len() > 1 || !current.attribute_reports.is_empty())
            {
                let overflow = current.event_reports.pop().expect("nonempty");
                chunks.push(std::mem::take(&mut current));
                current.subscription_id = subscription_id;
                current.suppress_response = suppress_response;
                current.event_reports.push(overflow);
            }
        }
        chunks.push(current);

        let total = chunks.len();
        for (index, mut chunk) in chunks.into_iter().enumerate() {
            let last = index + 1 == total;
            chunk.more_chunked_messages = !last;
            exchange.send(opcode::REPORT_DATA, &chunk.to_tlv()).await?;
            if !last || (!chunk.suppress_response) {
                let ack = exchange.next_message(STEP_TIMEOUT).await?;
                if ack.header.opcode != opcode::STATUS_RESPONSE {
                    return Err(MatterError::protocol(
                        codes::EXCHANGE_UNEXPECTED_MESSAGE,
                        "report chunk not acknowledged with status response",
                    ));
                }
                let status = StatusResponse::from_tlv(&ack.payload)?;
                if !status.status.is_success() {
                    return Err(MatterError::protocol(
                        codes::INTERACTION_INVALID_ACTION,
                        format!("peer aborted report stream with {:?}", status.status),
                    ));
                }
            }
        }
        Ok(())
    }

    // ---- 写 ----

    async fn handle_write(
        self: &Arc<Self>,
        exchange: &mut Exchange,
        subject: &AccessSubject,
        peer_key: u64,
        timed_deadline: Option<Instant>,
        payload: &[u8],
    ) -> Result<()> {
        let request = WriteRequest::from_tlv(payload)?;

        if let Some(status) =
            self.timed_precondition(request.timed_request, timed_deadline, || {
                self.any_write_needs_timed(&request.writes)
            })
        {
            exchange
                .send(opcode::STATUS_RESPONSE, &StatusResponse { status }.to_tlv())
                .await?;
            return Ok(());
        }

        let mut touched: Vec<Arc<Behavior>> = Vec::new();
        let mut transaction = Transaction::new();
        let mut statuses = Vec::with_capacity(request.writes.len());

        for write in &request.writes {
            let status = self.stage_one_write(
                &mut transaction,
                &mut touched,
                subject,
                peer_key,
                write,
            );
            statuses.push(AttributeStatus {
                path: write.path,
                status,
            });
        }
        transaction.commit();
        for behavior in &touched {
            behavior.notify_interaction(InteractionEvent::End);
        }

        exchange
            .send(opcode::WRITE_RESPONSE, &WriteResponse { statuses }.to_tlv())
            .await
    }

    fn any_write_needs_timed(&self, writes: &[AttributeData]) -> bool {
        writes.iter().any(|write| {
            let (Some(endpoint), Some(cluster), Some(attribute)) =
                (write.path.endpoint, write.path.cluster, write.path.attribute)
            else {
                return false;
            };
            self.root
                .find(endpoint)
                .and_then(|e| e.behavior(cluster))
                .and_then(|b| b.datasource().plan().attribute(attribute).cloned())
                .map(|attr| attr.schema.quality.timed_write)
                .unwrap_or(false)
        })
    }

    fn stage_one_write(
        &self,
        transaction: &mut Transaction,
        touched: &mut Vec<Arc<Behavior>>,
        subject: &AccessSubject,
        peer_key: u64,
        write: &AttributeData,
    ) -> Status {
        let (Some(endpoint), Some(cluster), Some(attribute)) =
            (write.path.endpoint, write.path.cluster, write.path.attribute)
        else {
            return Status::UnsupportedWrite;
        };
        let Some(endpoint_ref) = self.root.find(endpoint) else {
            return Status::UnsupportedEndpoint;
        };
        let Some(behavior) = endpoint_ref.behavior(cluster) else {
            return Status::UnsupportedCluster;
        };
        let plan = Arc::clone(behavior.datasource().plan());
        let Some(compiled) = plan.attribute(attribute) else {
            return Status::UnsupportedAttribute;
        };
        if let Err(err) = plan.check_write(attribute, subject, subject.fabric_index) {
            return Status::from(&err);
        }

        if compiled.schema.quality.atomic {
            // 原子属性：仅原子写会话内的改道写合法。
            if self.atomic.covers(peer_key, endpoint, cluster, attribute) {
                return self.atomic.stage_write(peer_key, &behavior, attribute, &write.value);
            }
            return Status::InvalidInState;
        }

        if !touched.iter().any(|b| Arc::ptr_eq(b, &behavior)) {
            behavior.notify_interaction(InteractionEvent::Begin);
            touched.push(Arc::clone(&behavior));
        }
        match transaction.stage(behavior.datasource(), attribute, &write.value) {
            Ok(()) => Status::Success,
            Err(err) => Status::from(&err),
        }
    }

    fn timed_precondition(
        &self,
        flagged: bool,
        timed_deadline: Option<Instant>,
        needs_timed: impl FnOnce() -> bool,
    ) -> Option<Status> {
        let armed = timed_deadline.is_some_and(|deadline| self.clock.now() < deadline);
        if flagged && !armed {
            return Some(Status::TimedRequestMismatch);
        }
        if !armed && needs_timed() {
            return Some(Status::NeedsTimedInteraction);
        }
        None
    }

    // ---- 调用 ----

    async fn handle_invoke(
        self: &Arc<Self>,
        exchange: &mut Exchange,
        subject: &AccessSubject,
        peer_key: u64,
        timed_deadline: Option<Instant>,
        payload: &[u8],
    ) -> Result<()> {
        let request = InvokeRequest::from_tlv(payload)?;

        // 多命令调用要求 commandRef 唯一。
        if request.invokes.len() > 1 {
            let mut seen = HashSet::new();
            for invoke in &request.invokes {
                let Some(reference) = invoke.command_ref else {
                    return self.reply_status(exchange, Status::InvalidAction).await;
                };
                if !seen.insert(reference) {
                    return self.reply_status(exchange, Status::InvalidAction).await;
                }
            }
        }

        if let Some(status) =
            self.timed_precondition(request.timed_request, timed_deadline, || {
                self.any_invoke_needs_timed(&request.invokes)
            })
        {
            return self.reply_status(exchange, status).await;
        }

        let mut touched: Vec<Arc<Behavior>> = Vec::new();
        let mut responses = Vec::with_capacity(request.invokes.len());
        for invoke in &request.invokes {
            responses.push(self.invoke_one(&mut touched, subject, peer_key, invoke));
        }
        for behavior in &touched {
            behavior.notify_interaction(InteractionEvent::End);
        }

        exchange
            .send(
                opcode::INVOKE_RESPONSE,
                &InvokeResponse { responses }.to_tlv(),
            )
            .await
    }

    fn any_invoke_needs_timed(&self, invokes: &[CommandData]) -> bool {
        invokes.iter().any(|invoke| {
            self.root
                .find(invoke.path.endpoint)
                .and_then(|e| e.behavior(invoke.path.cluster))
                .and_then(|b| b.datasource().plan().schema.command(invoke.path.command).cloned())
                .map(|cmd| cmd.timed)
                .unwrap_or(false)
        })
    }

    fn invoke_one(
        &self,
        touched: &mut Vec<Arc<Behavior>>,
        subject: &AccessSubject,
        peer_key: u64,
        invoke: &CommandData,
    ) -> InvokeResponseItem {
        let status_item = |status: Status| InvokeResponseItem {
            path: invoke.path,
            status: Some(status),
            fields: None,
            command_ref: invoke.command_ref,
        };

        let Some(endpoint) = self.root.find(invoke.path.endpoint) else {
            return status_item(Status::UnsupportedEndpoint);
        };
        let Some(behavior) = endpoint.behavior(invoke.path.cluster) else {
            return status_item(Status::UnsupportedCluster);
        };
        if !touched.iter().any(|b| Arc::ptr_eq(b, &behavior)) {
            behavior.notify_interaction(InteractionEvent::Begin);
            touched.push(Arc::clone(&behavior));
        }

        match behavior.invoke(invoke.path.command, &invoke.fields, *subject, peer_key) {
            Ok(CommandOutcome::Status(status)) => status_item(status),
            Ok(CommandOutcome::Response { command, fields }) => InvokeResponseItem {
                path: crate::messages::CommandPath {
                    endpoint: invoke.path.endpoint,
                    cluster: invoke.path.cluster,
                    command,
                },
                status: None,
                fields: Some(fields),
                command_ref: invoke.command_ref,
            },
            Err(err) => status_item(Status::from(&err)),
        }
    }

    async fn reply_status(&self, exchange: &mut Exchange, status: Status) -> Result<()> {
        exchange
            .send(opcode::STATUS_RESPONSE, &StatusResponse { status }.to_tlv())
            .await
    }

    // ---- 订阅 ----

    async fn handle_subscribe(
        self: &Arc<Self>,
        mut exchange: Exchange,
        subject: &AccessSubject,
        session: Option<Arc<SecureSession>>,
        payload: &[u8],
    ) -> Result<()> {
        let request = SubscribeRequest::from_tlv(payload)?;
        let fabric: Option<FabricIndex> = subject.fabric_index;

        let subscription = match self.subscriptions.register(
            fabric,
            request.read.attribute_paths.clone(),
            request.read.event_paths.clone(),
            Duration::from_secs(u64::from(request.min_interval_s)),
            Duration::from_secs(u64::from(request.max_interval_s)),
            request.read.fabric_filtered,
        ) {
            Ok(subscription) => subscription,
            Err(err) => {
                let status = Status::from(&err);
                exchange
                    .send(opcode::STATUS_RESPONSE, &StatusResponse { status }.to_tlv())
                    .await?;
                return Err(err);
            }
        };

        // 会话关闭连带销毁订阅。
        if let Some(session) = &session {
            let subscriptions = Arc::clone(&self.subscriptions);
            let id = subscription.id;
            session.on_close(move || subscriptions.remove(id));
        }

        exchange
            .send(
                opcode::SUBSCRIBE_RESPONSE,
                &SubscribeResponse {
                    subscription_id: subscription.id,
                    max_interval_s: request.max_interval_s,
                }
                .to_tlv(),
            )
            .await?;

        // 基线全量报告。
        let (attribute_reports, event_reports) = self.collect_reports(&request.read, subject);
        if let Err(err) = self
            .send_chunked(
                &mut exchange,
                Some(subscription.id),
                attribute_reports,
                event_reports,
                false,
            )
            .await
        {
            self.subscriptions.remove(subscription.id);
            return Err(err);
        }

        self.run_subscription(exchange, subject, subscription).await
    }

    /// 订阅报告循环：min 节流、脏触发、max 保活。
    async fn run_subscription(
        self: &Arc<Self>,
        mut exchange: Exchange,
        subject: &AccessSubject,
        subscription: Arc<ServerSubscription>,
    ) -> Result<()> {
        loop {
            let cycle_start = self.clock.now();
            self.clock.sleep(subscription.min_interval).await;
            if subscription.is_closed() {
                return Ok(());
            }

            let deadline = cycle_start + subscription.max_interval;
            loop {
                if subscription.is_closed() {
                    return Ok(());
                }
                if subscription.has_dirty() {
                    break;
                }
                let remaining = deadline.saturating_duration_since(self.clock.now());
                if remaining.is_zero() {
                    break;
                }
                tokio::select! {
                    _ = subscription.wait_changed() => {}
                    _ = self.clock.sleep(remaining) => break,
                }
            }
            if subscription.is_closed() {
                return Ok(());
            }

            let dirty = subscription.take_dirty();
            let mut attribute_reports = Vec::with_capacity(dirty.len());
            for (endpoint, cluster, attribute) in dirty {
                let Some(behavior) = self
                    .root
                    .find(endpoint)
                    .and_then(|e| e.behavior(cluster))
                else {
                    continue;
                };
                if behavior
                    .datasource()
                    .plan()
                    .check_read(attribute, subject)
                    .is_err()
                {
                    continue;
                }
                if let Some(value) = behavior.datasource().get(attribute) {
                    attribute_reports.push(AttributeReport::Data {
                        path: AttributePath::concrete(endpoint, cluster, attribute),
                        version: behavior.datasource().version(),
                        value,
                    });
                }
            }

            // 空集合即保活报告。
            let result = self
                .send_chunked(
                    &mut exchange,
                    Some(subscription.id),
                    attribute_reports,
                    Vec::new(),
                    false,
                )
                .await;
            if let Err(err) = result {
                warn!(id = subscription.id, error = %err, "subscription report failed");
                self.subscriptions.remove(subscription.id);
                return Err(err);
            }
        }
    }
}
