//! 服务端订阅生命周期：脏路径位图、节流与配额。
//!
//! # 节奏（What）
//! - 每次数据模型变更把受影响路径标脏并唤醒订阅任务；
//! - 报告循环：距上次报告至少 `min_interval`；有脏路径即发报告，
//!   否则在 `max_interval` 处发保活；
//! - 每 fabric 配额超限时按建立时间驱逐最老的订阅。

use crate::messages::{AttributePath, EventPath};
use dashmap::DashMap;
use matter_core::clock::Clock;
use matter_core::error::{MatterError, Result, codes};
use matter_core::types::{AttributeId, ClusterId, EndpointNumber, FabricIndex};
use matter_datamodel::ChangeNotice;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// 订阅配额。
#[derive(Clone, Copy, Debug)]
pub struct SubscriptionLimits {
    /// 每 fabric 的最大并发订阅数。
    pub subscriptions_per_fabric: usize,
}

impl Default for SubscriptionLimits {
    fn default() -> Self {
        Self {
            subscriptions_per_fabric: 3,
        }
    }
}

/// 一条服务端订阅。
#[derive(Debug)]
pub struct ServerSubscription {
    pub id: u32,
    pub fabric: Option<FabricIndex>,
    pub attribute_paths: Vec<AttributePath>,
    pub event_paths: Vec<EventPath>,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub fabric_filtered: bool,
    created: Instant,
    dirty: Mutex<HashSet<(u16, u32, u32)>>,
    changed: Notify,
    closed: AtomicBool,
}

impl ServerSubscription {
    /// 某个具体位置是否被本订阅覆盖。
    pub fn covers(&self, endpoint: EndpointNumber, cluster: ClusterId, attribute: AttributeId) -> bool {
        self.attribute_paths.iter().any(|path| {
            path.endpoint.map_or(true, |e| e == endpoint)
                && path.cluster.map_or(true, |c| c == cluster)
                && path.attribute.map_or(true, |a| a == attribute)
        })
    }

    fn mark_dirty(&self, endpoint: EndpointNumber, cluster: ClusterId, attribute: AttributeId) {
        if !self.covers(endpoint, cluster, attribute) {
            return;
        }
        self.dirty
            .lock()
            .expect("dirty lock")
            .insert((endpoint.raw(), cluster.raw(), attribute.raw()));
        self.changed.notify_one();
    }

    /// 取走当前脏集合。
    pub fn take_dirty(&self) -> Vec<(EndpointNumber, ClusterId, AttributeId)> {
        self.dirty
            .lock()
            .expect("dirty lock")
            .drain()
            .map(|(e, c, a)| (EndpointNumber(e), ClusterId(c), AttributeId(a)))
            .collect()
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.lock().expect("dirty lock").is_empty()
    }

    /// 等待下一次标脏（或关闭）。
    pub async fn wait_changed(&self) {
        self.changed.notified().await;
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.changed.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// 订阅注册表。
pub struct SubscriptionEngine {
    clock: Arc<dyn Clock>,
    limits: SubscriptionLimits,
    subscriptions: DashMap<u32, Arc<ServerSubscription>>,
    next_id: AtomicU32,
}

impl SubscriptionEngine {
    pub fn new(clock: Arc<dyn Clock>, limits: SubscriptionLimits) -> Arc<Self> {
        Arc::new(Self {
            clock,
            limits,
            subscriptions: DashMap::new(),
            next_id: AtomicU32::new(1),
        })
    }

    /// 注册新订阅；零路径按 `InvalidAction` 拒绝；超配额驱逐最老者。
    pub fn register(
        &self,
        fabric: Option<FabricIndex>,
        attribute_paths: Vec<AttributePath>,
        event_paths: Vec<EventPath>,
        min_interval: Duration,
        max_interval: Duration,
        fabric_filtered: bool,
    ) -> Result<Arc<ServerSubscription>> {
        if attribute_paths.is_empty() && event_paths.is_empty() {
            return Err(MatterError::protocol(
                codes::INTERACTION_INVALID_ACTION,
                "subscribe request carries no paths",
            ));
        }

        if let Some(fabric) = fabric {
            let mut owned: Vec<Arc<ServerSubscription>> = self
                .subscriptions
                .iter()
                .filter(|entry| entry.value().fabric == Some(fabric))
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            if owned.len() >= self.limits.subscriptions_per_fabric {
                owned.sort_by_key(|sub| sub.created);
                if let Some(oldest) = owned.first() {
                    debug!(id = oldest.id, "evicting oldest subscription over quota");
                    self.remove(oldest.id);
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(ServerSubscription {
            id,
            fabric,
            attribute_paths,
            event_paths,
            min_interval,
            max_interval,
            fabric_filtered,
            created: self.clock.now(),
            dirty: Mutex::new(HashSet::new()),
            changed: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.subscriptions.insert(id, Arc::clone(&subscription));
        Ok(subscription)
    }

    pub fn get(&self, id: u32) -> Option<Arc<ServerSubscription>> {
        self.subscriptions.get(&id).map(|entry| Arc::clone(&entry))
    }

    pub fn remove(&self, id: u32) {
        if let Some((_, subscription)) = self.subscriptions.remove(&id) {
            subscription.close();
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// 数据模型变更入口：`omitted` 为 `changes_omitted` 属性集合。
    pub fn on_change(&self, notice: &ChangeNotice, omitted: &HashSet<AttributeId>) {
        for attribute in &notice.attributes {
            if omitted.contains(attribute) {
                continue;
            }
            for entry in self.subscriptions.iter() {
                entry
                    .value()
                    .mark_dirty(notice.endpoint, notice.cluster, *attribute);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matter_core::clock::MockClock;
    use matter_core::types::DataVersion;

    fn engine() -> Arc<SubscriptionEngine> {
        SubscriptionEngine::new(Arc::new(MockClock::new()), SubscriptionLimits::default())
    }

    fn wildcard_on_off() -> Vec<AttributePath> {
        vec![AttributePath {
            endpoint: Some(EndpointNumber(1)),
            cluster: Some(ClusterId(6)),
            attribute: None,
        }]
    }

    #[test]
    fn zero_paths_is_invalid_action() {
        let engine = engine();
        let err = engine
            .register(
                None,
                Vec::new(),
                Vec::new(),
                Duration::from_secs(1),
                Duration::from_secs(30),
                false,
            )
            .expect_err("no paths");
        assert_eq!(err.code(), codes::INTERACTION_INVALID_ACTION);
    }

    #[test]
    fn change_marks_matching_subscriptions_dirty() {
        let engine = engine();
        let subscription = engine
            .register(
                None,
                wildcard_on_off(),
                Vec::new(),
                Duration::from_secs(1),
                Duration::from_secs(30),
                false,
            )
            .expect("register");

        let notice = ChangeNotice {
            endpoint: EndpointNumber(1),
            cluster: ClusterId(6),
            version: DataVersion(2),
            attributes: vec![AttributeId(0)],
            properties: vec!["onOff"],
        };
        engine.on_change(&notice, &HashSet::new());
        assert!(subscription.has_dirty());

        // 其它端点的变更不影响本订阅。
        let other = ChangeNotice {
            endpoint: EndpointNumber(2),
            ..notice.clone()
        };
        subscription.take_dirty();
        engine.on_change(&other, &HashSet::new());
        assert!(!subscription.has_dirty());
    }

    #[test]
    fn omitted_attributes_never_mark_dirty() {
        let engine = engine();
        let subscription = engine
            .register(
                None,
                wildcard_on_off(),
                Vec::new(),
                Duration::from_secs(1),
                Duration::from_secs(30),
                false,
            )
            .expect("register");

        let notice = ChangeNotice {
            endpoint: EndpointNumber(1),
            cluster: ClusterId(6),
            version: DataVersion(2),
            attributes: vec![AttributeId(7)],
            properties: vec!["hidden"],
        };
        let omitted: HashSet<AttributeId> = [AttributeId(7)].into_iter().collect();
        engine.on_change(&notice, &omitted);
        assert!(!subscription.has_dirty());
    }

    #[test]
    fn quota_evicts_oldest_per_fabric() {
        let engine = engine();
        let fabric = Some(FabricIndex(1));
        let first = engine
            .register(
                fabric,
                wildcard_on_off(),
                Vec::new(),
                Duration::from_secs(1),
                Duration::from_secs(30),
                false,
            )
            .expect("first");
        for _ in 0..3 {
            engine
                .register(
                    fabric,
                    wildcard_on_off(),
                    Vec::new(),
                    Duration::from_secs(1),
                    Duration::from_secs(30),
                    false,
                )
                .expect("more");
        }
        assert_eq!(engine.len(), 3, "quota bounds concurrent subscriptions");
        assert!(first.is_closed(), "oldest evicted first");
    }
}
