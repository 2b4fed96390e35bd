//! 原子写协调器：多属性“全有或全无”提交。
//!
//! # 协议（What）
//! 集群命令 `AtomicRequest(requestType ∈ {Begin, Commit, Rollback},
//! attributeRequests, timeout?)`：
//! - **Begin**：逐属性校验（必须带 `atomic` 质量、未被其它对端占用），
//!   成功则快照当前值、登记声明集并武装 ≤ 9 s 的对端计时器；
//! - **写入（期间）**：写被改道进暂存表（键 `(对端, 端点, 集群, 属性)`），
//!   暂存前触发 `$Changing` 供集群级校验，后写覆盖先写，仅属主可写；
//! - **Commit**：回放暂存值为一个事务提交，整体状态取逐属性结果的
//!   最严格者；无论成败状态总被关闭；
//! - **Rollback / 超时 / fabric 移除**：丢弃暂存，关闭状态。

use matter_codec_tlv::{Tag, TlvValue};
use matter_core::clock::Clock;
use matter_core::error::Result;
use matter_core::status::Status;
use matter_core::types::{AttributeId, ClusterId, EndpointNumber};
use matter_datamodel::{Behavior, CommandOutcome, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// 单次原子写会话的计时上限。
pub const MAX_ATOMIC_TIMEOUT: Duration = Duration::from_secs(9);

/// `AtomicRequest.requestType` 的取值。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AtomicRequestType {
    Begin,
    Commit,
    Rollback,
}

impl AtomicRequestType {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(AtomicRequestType::Begin),
            1 => Some(AtomicRequestType::Commit),
            2 => Some(AtomicRequestType::Rollback),
            _ => None,
        }
    }
}

struct AtomicState {
    owner: u64,
    attributes: Vec<AttributeId>,
    staged: HashMap<u32, TlvValue>,
    deadline: Instant,
}

/// 协调器：每 `(端点, 集群)` 至多一个未决状态。
pub struct AtomicCoordinator {
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<(u16, u32), AtomicState>>,
}

impl AtomicCoordinator {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            states: Mutex::new(HashMap::new()),
        })
    }

    fn key(behavior: &Behavior) -> (u16, u32) {
        (behavior.endpoint().raw(), behavior.cluster_id().raw())
    }

    /// 回收过期状态；返回键位当前是否有存活状态。
    fn sweep(&self, states: &mut HashMap<(u16, u32), AtomicState>, key: (u16, u32)) -> bool {
        if let Some(state) = states.get(&key) {
            if self.clock.now() >= state.deadline {
                debug!(endpoint = key.0, cluster = key.1, "atomic write state expired");
                states.remove(&key);
                return false;
            }
            return true;
        }
        false
    }

    /// Begin：返回逐属性状态与整体状态。
    pub fn begin(
        &self,
        peer: u64,
        behavior: &Arc<Behavior>,
        attributes: &[AttributeId],
        timeout: Duration,
    ) -> (Status, Vec<(AttributeId, Status)>) {
        let key = Self::key(behavior);
        let mut states = self.states.lock().expect("atomic lock");
        let live = self.sweep(&mut states, key);

        if live {
            let owner = states.get(&key).map(|state| state.owner);
            if owner != Some(peer) {
                // 已被其它对端占用：逐属性回 Busy。
                let statuses = attributes.iter().map(|id| (*id, Status::Busy)).collect();
                return (Status::Failure, statuses);
            }
            // 同一对端重复 Begin 视为状态错误。
            return (
                Status::InvalidInState,
                attributes.iter().map(|id| (*id, Status::InvalidInState)).collect(),
            );
        }

        let mut statuses = Vec::with_capacity(attributes.len());
        let mut ok = true;
        for id in attributes {
            let status = match behavior.datasource().plan().attribute(*id) {
                Some(attr) if attr.schema.quality.atomic => Status::Success,
                Some(_) => Status::InvalidCommand,
                None => Status::UnsupportedAttribute,
            };
            if !status.is_success() {
                ok = false;
            }
            statuses.push((*id, status));
        }
        if !ok {
            return (Status::Failure, statuses);
        }

        states.insert(
            key,
            AtomicState {
                owner: peer,
                attributes: attributes.to_vec(),
                staged: HashMap::new(),
                deadline: self.clock.now() + timeout.min(MAX_ATOMIC_TIMEOUT),
            },
        );
        (Status::Success, statuses)
    }

    /// 该对端是否有覆盖某属性的存活状态。
    pub fn covers(
        &self,
        peer: u64,
        endpoint: EndpointNumber,
        cluster: ClusterId,
        attribute: AttributeId,
    ) -> bool {
        let key = (endpoint.raw(), cluster.raw());
        let mut states = self.states.lock().expect("atomic lock");
        if !self.sweep(&mut states, key) {
            return false;
        }
        states
            .get(&key)
            .is_some_and(|state| state.owner == peer && state.attributes.contains(&attribute))
    }

    /// 把一笔写入改道进暂存表。
    pub fn stage_write(
        &self,
        peer: u64,
        behavior: &Arc<Behavior>,
        attribute: AttributeId,
        value: &TlvValue,
    ) -> Status {
        let key = Self::key(behavior);
        let mut states = self.states.lock().expect("atomic lock");
        if !self.sweep(&mut states, key) {
            return Status::InvalidInState;
        }
        let Some(state) = states.get_mut(&key) else {
            return Status::InvalidInState;
        };
        if state.owner != peer {
            return Status::Busy;
        }
        if !state.attributes.contains(&attribute) {
            return Status::InvalidInState;
        }
        if let Err(err) = behavior.datasource().plan().validate(attribute, value) {
            return Status::from(&err);
        }
        // 集群级校验钩子：暂存前触发。
        behavior.events().changing(attribute).emit(value);
        state.staged.insert(attribute.raw(), value.clone());
        Status::Success
    }

    /// Commit：回放暂存值为单个事务。
    pub fn commit(
        &self,
        peer: u64,
        behavior: &Arc<Behavior>,
    ) -> (Status, Vec<(AttributeId, Status)>) {
        let state = {
            let key = Self::key(behavior);
            let mut states = self.states.lock().expect("atomic lock");
            if !self.sweep(&mut states, key) {
                return (Status::InvalidInState, Vec::new());
            }
            match states.get(&key).map(|state| state.owner) {
                Some(owner) if owner == peer => states.remove(&key).expect("state present"),
                Some(_) => return (Status::Busy, Vec::new()),
                None => return (Status::InvalidInState, Vec::new()),
            }
        };

        let mut transaction = Transaction::new();
        let mut statuses = Vec::new();
        let mut overall = Status::Success;
        for id in &state.attributes {
            let Some(value) = state.staged.get(&id.raw()) else {
                continue;
            };
            behavior.events().changing(*id).emit(value);
            match transaction.stage(behavior.datasource(), *id, value) {
                Ok(()) => statuses.push((*id, Status::Success)),
                Err(err) => {
                    let status = Status::from(&err);
                    overall = overall.strictest(status);
                    statuses.push((*id, status));
                }
            }
        }

        if overall.is_success() {
            transaction.commit();
        } else {
            transaction.rollback();
            // 整体失败时逐属性也不落地。
            for (_, status) in statuses.iter_mut() {
                if status.is_success() {
                    *status = Status::Failure;
                }
            }
        }
        (overall, statuses)
    }

    /// Rollback：丢弃暂存并关闭状态。
    pub fn rollback(&self, peer: u64, behavior: &Arc<Behavior>) -> Status {
        let key = Self::key(behavior);
        let mut states = self.states.lock().expect("atomic lock");
        if !self.sweep(&mut states, key) {
            return Status::InvalidInState;
        }
        match states.get(&key).map(|state| state.owner) {
            Some(owner) if owner == peer => {
                states.remove(&key);
                Status::Success
            }
            Some(_) => Status::Busy,
            None => Status::InvalidInState,
        }
    }

    /// 关闭某对端持有的全部状态（会话关闭 / fabric 移除路径）。
    pub fn close_for_peer(&self, peer: u64) {
        self.states
            .lock()
            .expect("atomic lock")
            .retain(|_, state| state.owner != peer);
    }
}

/// 组装 `AtomicResponse` 的响应字段。
pub fn atomic_response_fields(
    overall: Status,
    statuses: &[(AttributeId, Status)],
) -> TlvValue {
    TlvValue::Structure(vec![
        (
            Tag::Context(0),
            TlvValue::UnsignedInt(u64::from(overall.raw())),
        ),
        (
            Tag::Context(1),
            TlvValue::Array(
                statuses
                    .iter()
                    .map(|(id, status)| {
                        TlvValue::Structure(vec![
                            (Tag::Context(0), TlvValue::UnsignedInt(u64::from(id.raw()))),
                            (
                                Tag::Context(1),
                                TlvValue::UnsignedInt(u64::from(status.raw())),
                            ),
                        ])
                    })
                    .collect(),
            ),
        ),
    ])
}

/// 为携带原子属性的 behavior 安装 `AtomicRequest` 命令处理器。
pub fn install_atomic_request(
    behavior: &Arc<Behavior>,
    coordinator: Arc<AtomicCoordinator>,
    command: matter_core::types::CommandId,
    response: matter_core::types::CommandId,
) {
    behavior.set_command(
        command,
        Arc::new(move |ctx, fields| -> Result<CommandOutcome> {
            let request_type = fields
                .field(0)
                .and_then(|v| v.as_u64())
                .and_then(AtomicRequestType::from_raw);
            let attributes: Vec<AttributeId> = fields
                .field(1)
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.as_u64())
                        .map(|raw| AttributeId(raw as u32))
                        .collect()
                })
                .unwrap_or_default();
            let timeout = fields
                .field(2)
                .and_then(|v| v.as_u64())
                .map(Duration::from_millis)
                .unwrap_or(MAX_ATOMIC_TIMEOUT);

            let (overall, statuses) = match request_type {
                Some(AtomicRequestType::Begin) => {
                    coordinator.begin(ctx.peer_key, &ctx.behavior, &attributes, timeout)
                }
                Some(AtomicRequestType::Commit) => coordinator.commit(ctx.peer_key, &ctx.behavior),
                Some(AtomicRequestType::Rollback) => {
                    let status = coordinator.rollback(ctx.peer_key, &ctx.behavior);
                    (status, Vec::new())
                }
                None => (Status::InvalidCommand, Vec::new()),
            };
            Ok(CommandOutcome::Response {
                command: response,
                fields: atomic_response_fields(overall, &statuses),
            })
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use matter_core::clock::MockClock;
    use matter_datamodel::clusters::{self, thermostat_ids};
    use matter_datamodel::supervisor::ClusterPlan;
    use matter_datamodel::transaction::Datasource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn thermostat_behavior() -> Arc<Behavior> {
        let plan = Arc::new(ClusterPlan::compile(clusters::thermostat(), 0));
        Behavior::new(Datasource::new(EndpointNumber(1), plan, None), false)
    }

    fn presets_value(n: u64) -> TlvValue {
        TlvValue::Array(vec![TlvValue::UnsignedInt(n)])
    }

    #[test]
    fn begin_write_commit_applies_all() {
        let clock = MockClock::new();
        let coordinator = AtomicCoordinator::new(Arc::new(clock.clone()));
        let behavior = thermostat_behavior();

        let changing_hits = Arc::new(AtomicUsize::new(0));
        for id in [thermostat_ids::PRESETS, thermostat_ids::SCHEDULES] {
            let hits = Arc::clone(&changing_hits);
            behavior.events().changing(id).subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        let (overall, statuses) = coordinator.begin(
            7,
            &behavior,
            &[thermostat_ids::PRESETS, thermostat_ids::SCHEDULES],
            Duration::from_secs(9),
        );
        assert!(overall.is_success());
        assert!(statuses.iter().all(|(_, s)| s.is_success()));

        assert!(
            coordinator
                .stage_write(7, &behavior, thermostat_ids::PRESETS, &presets_value(1))
                .is_success()
        );
        assert!(
            coordinator
                .stage_write(7, &behavior, thermostat_ids::SCHEDULES, &presets_value(2))
                .is_success()
        );
        // 暂存期间已提交状态不变。
        assert_eq!(
            behavior.datasource().get(thermostat_ids::PRESETS),
            Some(TlvValue::Array(Vec::new()))
        );

        let (overall, statuses) = coordinator.commit(7, &behavior);
        assert!(overall.is_success());
        assert_eq!(statuses.len(), 2);
        assert_eq!(
            behavior.datasource().get(thermostat_ids::PRESETS),
            Some(presets_value(1))
        );
        assert_eq!(
            behavior.datasource().get(thermostat_ids::SCHEDULES),
            Some(presets_value(2))
        );
        // 每属性写入与提交回放各触发一次 $Changing。
        assert_eq!(changing_hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn expired_state_rejects_commit_and_keeps_values() {
        let clock = MockClock::new();
        let coordinator = AtomicCoordinator::new(Arc::new(clock.clone()));
        let behavior = thermostat_behavior();

        coordinator.begin(
            7,
            &behavior,
            &[thermostat_ids::PRESETS],
            Duration::from_secs(9),
        );
        coordinator.stage_write(7, &behavior, thermostat_ids::PRESETS, &presets_value(9));

        clock.advance(Duration::from_secs(10));
        let (overall, _) = coordinator.commit(7, &behavior);
        assert_eq!(overall, Status::InvalidInState);
        assert_eq!(
            behavior.datasource().get(thermostat_ids::PRESETS),
            Some(TlvValue::Array(Vec::new())),
            "expired atomic write must not land"
        );
    }

    #[test]
    fn foreign_peer_is_rejected_with_busy() {
        let clock = MockClock::new();
        let coordinator = AtomicCoordinator::new(Arc::new(clock.clone()));
        let behavior = thermostat_behavior();

        coordinator.begin(
            7,
            &behavior,
            &[thermostat_ids::PRESETS],
            Duration::from_secs(9),
        );
        let (overall, statuses) = coordinator.begin(
            8,
            &behavior,
            &[thermostat_ids::PRESETS],
            Duration::from_secs(9),
        );
        assert_eq!(overall, Status::Failure);
        assert_eq!(statuses[0].1, Status::Busy);
        assert_eq!(
            coordinator.stage_write(8, &behavior, thermostat_ids::PRESETS, &presets_value(1)),
            Status::Busy
        );
    }

    #[test]
    fn non_atomic_attribute_rejected_at_begin() {
        let clock = MockClock::new();
        let coordinator = AtomicCoordinator::new(Arc::new(clock.clone()));
        let behavior = thermostat_behavior();

        let (overall, statuses) = coordinator.begin(
            7,
            &behavior,
            &[AttributeId(0x0000)],
            Duration::from_secs(9),
        );
        assert_eq!(overall, Status::Failure);
        assert_eq!(statuses[0].1, Status::InvalidCommand);
    }
}
