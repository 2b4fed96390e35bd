//! Behavior 运行时：一个集群在一个端点上的组合体。
//!
//! # 组成（What）
//! - datasource（状态 + 持久化）与编译计划；
//! - 懒实例化的逐属性 `$Changing`/`$Changed` 可观察对象；
//! - 命令处理器表与异步构造生命周期
//!   （`initializing → active → crashed | destroyed`，观察者有序通知）；
//! - reactor 登记：对可观察对象的声明式反应，执行投递到运行时任务队列。
//!
//! # 上报抑制（How）
//! `changes_omitted` 属性的变化不触发 `$Changed`；`quieter` 属性的中间
//! 变化在事务提交粒度自然合并（监听器只看到提交，不看到逐笔写）。

use crate::events::EventLog;
use crate::schema::{EventSchema, Privilege};
use crate::supervisor::AccessSubject;
use crate::transaction::Datasource;
use matter_codec_tlv::TlvValue;
use matter_core::error::{MatterError, Result, codes};
use matter_core::status::Status;
use matter_core::types::{AttributeId, ClusterId, CommandId, EndpointNumber, EventId, EventNumber};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Behavior 的生命周期状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackingState {
    Initializing,
    Active,
    Crashed,
    Destroyed,
}

/// 简单的多播可观察对象，载荷为属性值。
#[derive(Default)]
pub struct Observable {
    listeners: Mutex<Vec<Box<dyn Fn(&TlvValue) + Send + Sync>>>,
}

impl Observable {
    pub fn subscribe(&self, listener: impl Fn(&TlvValue) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("observable lock")
            .push(Box::new(listener));
    }

    pub fn emit(&self, value: &TlvValue) {
        let listeners = self.listeners.lock().expect("observable lock");
        for listener in listeners.iter() {
            listener(value);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().expect("observable lock").len()
    }
}

/// 逐属性事件表：`$Changed`/`$Changing` 首次访问时创建。
#[derive(Default)]
pub struct BehaviorEvents {
    changed: Mutex<HashMap<u32, Arc<Observable>>>,
    changing: Mutex<HashMap<u32, Arc<Observable>>>,
}

impl BehaviorEvents {
    /// 属性的 `$Changed` 可观察对象（提交后触发）。
    pub fn changed(&self, id: AttributeId) -> Arc<Observable> {
        Arc::clone(
            self.changed
                .lock()
                .expect("events lock")
                .entry(id.raw())
                .or_default(),
        )
    }

    /// 属性的 `$Changing` 可观察对象（暂存校验阶段触发）。
    pub fn changing(&self, id: AttributeId) -> Arc<Observable> {
        Arc::clone(
            self.changing
                .lock()
                .expect("events lock")
                .entry(id.raw())
                .or_default(),
        )
    }

    fn existing_changed(&self, id: AttributeId) -> Option<Arc<Observable>> {
        self.changed
            .lock()
            .expect("events lock")
            .get(&id.raw())
            .cloned()
    }
}

/// 命令执行结果。
#[derive(Clone, Debug, PartialEq)]
pub enum CommandOutcome {
    Status(Status),
    Response {
        command: CommandId,
        fields: TlvValue,
    },
}

/// 命令执行上下文。
pub struct CommandContext {
    pub behavior: Arc<Behavior>,
    pub subject: AccessSubject,
    /// 调用方的稳定对端标识（会话粒度；原子写的所有权判定用）。
    pub peer_key: u64,
}

pub type CommandHandler =
    Arc<dyn Fn(&CommandContext, &TlvValue) -> Result<CommandOutcome> + Send + Sync>;

/// 交互生命周期事件（交互引擎在边界处通知）。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InteractionEvent {
    Begin,
    End,
}

type Initializer = Box<dyn Fn(&Arc<Behavior>) -> Result<()> + Send + Sync>;
type StateObserver = Box<dyn Fn(BackingState) + Send + Sync>;
type InteractionObserver = Box<dyn Fn(InteractionEvent) + Send + Sync>;

/// 一个集群在一个端点上的运行时。
pub struct Behavior {
    datasource: Arc<Datasource>,
    events: BehaviorEvents,
    state: Mutex<BackingState>,
    state_observers: Mutex<Vec<StateObserver>>,
    interaction_observers: Mutex<Vec<InteractionObserver>>,
    commands: Mutex<HashMap<u32, CommandHandler>>,
    initializer: Mutex<Option<Initializer>>,
    event_log: Mutex<Option<Arc<EventLog>>>,
    early: bool,
}

impl Behavior {
    /// 组装 behavior 并接通 datasource 的提交通知。
    pub fn new(datasource: Arc<Datasource>, early: bool) -> Arc<Self> {
        let behavior = Arc::new(Self {
            datasource: Arc::clone(&datasource),
            events: BehaviorEvents::default(),
            state: Mutex::new(BackingState::Initializing),
            state_observers: Mutex::new(Vec::new()),
            interaction_observers: Mutex::new(Vec::new()),
            commands: Mutex::new(HashMap::new()),
            initializer: Mutex::new(None),
            event_log: Mutex::new(None),
            early,
        });

        let weak: Weak<Behavior> = Arc::downgrade(&behavior);
        datasource.subscribe(move |notice| {
            let Some(behavior) = weak.upgrade() else {
                return;
            };
            for id in &notice.attributes {
                let Some(attribute) = behavior.datasource.plan().attribute(*id) else {
                    continue;
                };
                if attribute.schema.quality.changes_omitted {
                    continue;
                }
                if let Some(observable) = behavior.events.existing_changed(*id) {
                    if let Some(value) = behavior.datasource.get(*id) {
                        observable.emit(&value);
                    }
                }
            }
        });
        behavior
    }

    pub fn datasource(&self) -> &Arc<Datasource> {
        &self.datasource
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.datasource.cluster_id()
    }

    pub fn endpoint(&self) -> EndpointNumber {
        self.datasource.endpoint()
    }

    pub fn events(&self) -> &BehaviorEvents {
        &self.events
    }

    pub fn is_early(&self) -> bool {
        self.early
    }

    pub fn state(&self) -> BackingState {
        *self.state.lock().expect("state lock")
    }

    /// 注册生命周期观察者（按注册顺序通知）。
    pub fn on_state_change(&self, observer: impl Fn(BackingState) + Send + Sync + 'static) {
        self.state_observers
            .lock()
            .expect("observer lock")
            .push(Box::new(observer));
    }

    /// 注册交互生命周期观察者。
    pub fn on_interaction(&self, observer: impl Fn(InteractionEvent) + Send + Sync + 'static) {
        self.interaction_observers
            .lock()
            .expect("observer lock")
            .push(Box::new(observer));
    }

    /// 交互引擎的通知入口。
    pub fn notify_interaction(&self, event: InteractionEvent) {
        let observers = self.interaction_observers.lock().expect("observer lock");
        for observer in observers.iter() {
            observer(event);
        }
    }

    /// 设置异步构造逻辑（激活时执行）。
    pub fn set_initializer(
        &self,
        initializer: impl Fn(&Arc<Behavior>) -> Result<()> + Send + Sync + 'static,
    ) {
        *self.initializer.lock().expect("initializer lock") = Some(Box::new(initializer));
    }

    /// 注册命令处理器。
    pub fn set_command(&self, id: CommandId, handler: CommandHandler) {
        self.commands.lock().expect("command lock").insert(id.raw(), handler);
    }

    /// 挂接节点事件环。
    pub fn attach_event_log(&self, log: Arc<EventLog>) {
        *self.event_log.lock().expect("event log lock") = Some(log);
    }

    /// 依 schema 落一条事件到节点事件环。
    pub fn emit_event(
        &self,
        id: EventId,
        fabric_index: Option<matter_core::types::FabricIndex>,
        payload: TlvValue,
    ) -> Result<EventNumber> {
        let schema: EventSchema = self
            .datasource
            .plan()
            .schema
            .event(id)
            .cloned()
            .ok_or_else(|| {
                MatterError::data_model(
                    codes::PATH_NOT_FOUND,
                    format!("{} has no {id}", self.cluster_id()),
                )
            })?;
        let log = self
            .event_log
            .lock()
            .expect("event log lock")
            .clone()
            .ok_or_else(|| {
                MatterError::implementation(
                    codes::SERVICE_UNAVAILABLE,
                    "behavior has no event log attached",
                )
            })?;
        Ok(log.append(
            schema.priority,
            self.endpoint(),
            self.cluster_id(),
            id,
            if schema.fabric_scoped {
                fabric_index
            } else {
                None
            },
            payload,
        ))
    }

    /// 激活：执行构造逻辑并迁移状态。
    pub fn initialize(self: &Arc<Self>) -> Result<()> {
        let initializer = self.initializer.lock().expect("initializer lock").take();
        let result = match initializer {
            Some(init) => init(self),
            None => Ok(()),
        };
        match &result {
            Ok(()) => self.transition(BackingState::Active),
            Err(err) => {
                warn!(cluster = %self.cluster_id(), error = %err, "behavior crashed during init");
                self.transition(BackingState::Crashed);
            }
        }
        result
    }

    /// 销毁：端点移除路径调用。
    pub fn destroy(&self) {
        self.transition(BackingState::Destroyed);
    }

    fn transition(&self, next: BackingState) {
        {
            let mut state = self.state.lock().expect("state lock");
            if *state == next {
                return;
            }
            *state = next;
        }
        let observers = self.state_observers.lock().expect("observer lock");
        for observer in observers.iter() {
            observer(next);
        }
    }

    /// 执行一条命令。
    pub fn invoke(
        self: &Arc<Self>,
        id: CommandId,
        fields: &TlvValue,
        subject: AccessSubject,
        peer_key: u64,
    ) -> Result<CommandOutcome> {
        if self.state() != BackingState::Active {
            return Err(MatterError::data_model(
                codes::BEHAVIOR_INITIALIZATION,
                format!("{} not active", self.cluster_id()),
            ));
        }
        let schema = self
            .datasource
            .plan()
            .schema
            .command(id)
            .cloned()
            .ok_or_else(|| {
                MatterError::data_model(
                    codes::PATH_NOT_FOUND,
                    format!("{} has no {id}", self.cluster_id()),
                )
            })?;
        if subject.privilege < schema.invoke {
            return Err(MatterError::data_model(
                codes::ACCESS_DENIED,
                format!("insufficient privilege to invoke {id}"),
            ));
        }
        let handler = self
            .commands
            .lock()
            .expect("command lock")
            .get(&id.raw())
            .cloned();
        let Some(handler) = handler else {
            debug!(command = %id, "command declared but not implemented");
            return Ok(CommandOutcome::Status(Status::UnsupportedCommand));
        };
        let context = CommandContext {
            behavior: Arc::clone(self),
            subject,
            peer_key,
        };
        handler(&context, fields)
    }

    /// 声明式 reactor：属性变化时在运行时任务队列上执行反应。
    pub fn add_reactor(
        self: &Arc<Self>,
        attribute: AttributeId,
        reactor: impl Fn(TlvValue) + Send + Sync + 'static,
    ) {
        let reactor = Arc::new(reactor);
        self.events.changed(attribute).subscribe(move |value| {
            let reactor = Arc::clone(&reactor);
            let value = value.clone();
            tokio::spawn(async move {
                reactor(value);
            });
        });
    }

    /// 最低读特权（wildcard 读展开时的访问判定输入）。
    pub fn read_privilege_of(&self, id: AttributeId) -> Option<Privilege> {
        self.datasource
            .plan()
            .attribute(id)
            .map(|attr| attr.schema.access.read)
    }
}

impl std::fmt::Debug for Behavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Behavior")
            .field("cluster", &self.cluster_id())
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        AttributeAccess, AttributeSchema, ClusterSchema, CommandSchema, Conformance, Constraint,
        Quality, ValueKind,
    };
    use crate::supervisor::ClusterPlan;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn behavior() -> Arc<Behavior> {
        let schema = ClusterSchema {
            id: ClusterId(0x6),
            name: "OnOff",
            revision: 6,
            attributes: vec![
                AttributeSchema {
                    id: AttributeId(0),
                    name: "onOff",
                    kind: ValueKind::Bool,
                    conformance: Conformance::Mandatory,
                    quality: Quality::none(),
                    access: AttributeAccess::RO_VIEW,
                    constraint: Constraint::default(),
                    default: Some(TlvValue::Bool(false)),
                },
                AttributeSchema {
                    id: AttributeId(1),
                    name: "hiddenCounter",
                    kind: ValueKind::Unsigned { bits: 32 },
                    conformance: Conformance::Mandatory,
                    quality: Quality {
                        changes_omitted: true,
                        ..Quality::none()
                    },
                    access: AttributeAccess::RO_VIEW,
                    constraint: Constraint::default(),
                    default: Some(TlvValue::UnsignedInt(0)),
                },
            ],
            commands: vec![CommandSchema {
                id: CommandId(2),
                name: "Toggle",
                conformance: Conformance::Mandatory,
                invoke: Privilege::Operate,
                timed: false,
                response: None,
            }],
            events: Vec::new(),
        };
        let plan = Arc::new(ClusterPlan::compile(schema, 0));
        let datasource = Datasource::new(EndpointNumber(1), plan, None);
        Behavior::new(datasource, false)
    }

    #[test]
    fn changed_fires_after_commit_but_not_for_omitted() {
        let behavior = behavior();
        let hits = Arc::new(AtomicUsize::new(0));
        let listener_hits = Arc::clone(&hits);
        behavior
            .events()
            .changed(AttributeId(0))
            .subscribe(move |value| {
                assert_eq!(value, &TlvValue::Bool(true));
                listener_hits.fetch_add(1, Ordering::SeqCst);
            });
        let omitted_hits = Arc::new(AtomicUsize::new(0));
        let omitted_listener = Arc::clone(&omitted_hits);
        behavior
            .events()
            .changed(AttributeId(1))
            .subscribe(move |_| {
                omitted_listener.fetch_add(1, Ordering::SeqCst);
            });

        behavior
            .datasource()
            .write_one(AttributeId(0), TlvValue::Bool(true))
            .expect("write onOff");
        behavior
            .datasource()
            .write_one(AttributeId(1), TlvValue::UnsignedInt(5))
            .expect("write hidden");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            omitted_hits.load(Ordering::SeqCst),
            0,
            "changes_omitted must never reach $Changed"
        );
    }

    #[test]
    fn lifecycle_observers_see_transitions_in_order() {
        let behavior = behavior();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        behavior.on_state_change(move |state| sink.lock().expect("sink").push(state));

        behavior.initialize().expect("init");
        behavior.destroy();

        assert_eq!(
            *seen.lock().expect("seen"),
            vec![BackingState::Active, BackingState::Destroyed]
        );
    }

    #[test]
    fn crashing_initializer_quarantines_behavior() {
        let behavior = behavior();
        behavior.set_initializer(|_| {
            Err(MatterError::implementation(
                codes::BEHAVIOR_INITIALIZATION,
                "hardware missing",
            ))
        });
        assert!(behavior.initialize().is_err());
        assert_eq!(behavior.state(), BackingState::Crashed);
    }

    #[test]
    fn invoke_respects_privilege_and_dispatches() {
        let behavior = behavior();
        behavior.initialize().expect("init");
        behavior.set_command(
            CommandId(2),
            Arc::new(|ctx, _fields| {
                let current = ctx
                    .behavior
                    .datasource()
                    .get(AttributeId(0))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                ctx.behavior
                    .datasource()
                    .write_one(AttributeId(0), TlvValue::Bool(!current))?;
                Ok(CommandOutcome::Status(Status::Success))
            }),
        );

        let viewer = AccessSubject {
            privilege: Privilege::View,
            fabric_index: None,
        };
        assert!(
            behavior
                .invoke(CommandId(2), &TlvValue::Structure(vec![]), viewer, 1)
                .is_err()
        );

        let operator = AccessSubject {
            privilege: Privilege::Operate,
            fabric_index: None,
        };
        let outcome = behavior
            .invoke(CommandId(2), &TlvValue::Structure(vec![]), operator, 1)
            .expect("invoke");
        assert_eq!(outcome, CommandOutcome::Status(Status::Success));
        assert_eq!(
            behavior.datasource().get(AttributeId(0)),
            Some(TlvValue::Bool(true))
        );
    }
}
