//! 事务化 datasource：集群状态容器与多属性提交。
//!
//! # 事务语义（What）
//! - 交互内的首次变更开启事务，交互成功结束时提交；
//! - 每次写入落到暂存副本，校验在暂存值上进行；
//! - 提交时一个集群的 `DataVersion` 恰好递增一次，变更监听器收到
//!   改动的属性名集合；回滚即丢弃暂存副本；
//! - `nonvolatile` 属性在提交时写穿到持久化上下文
//!   `nodes/<node>/<endpoint>/<cluster>/<attributeName>`。

use crate::supervisor::ClusterPlan;
use matter_codec_tlv::TlvValue;
use matter_core::error::Result;
use matter_core::storage::{StorageContext, StorageService};
use matter_core::types::{AttributeId, ClusterId, DataVersion, EndpointNumber};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// 一次提交产生的变更通知。
#[derive(Clone, Debug)]
pub struct ChangeNotice {
    pub endpoint: EndpointNumber,
    pub cluster: ClusterId,
    pub version: DataVersion,
    pub attributes: Vec<AttributeId>,
    pub properties: Vec<&'static str>,
}

type ChangeListener = Box<dyn Fn(&ChangeNotice) + Send + Sync>;

struct DatasourceState {
    version: DataVersion,
    values: HashMap<u32, TlvValue>,
}

/// 一个 `(端点, 集群)` 的状态容器。
pub struct Datasource {
    endpoint: EndpointNumber,
    plan: Arc<ClusterPlan>,
    state: Mutex<DatasourceState>,
    storage: Option<(Arc<dyn StorageService>, StorageContext)>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl Datasource {
    /// 以编译计划的默认值初始化；持久化过的 `nonvolatile` 值覆盖默认。
    pub fn new(
        endpoint: EndpointNumber,
        plan: Arc<ClusterPlan>,
        storage: Option<(Arc<dyn StorageService>, StorageContext)>,
    ) -> Arc<Self> {
        let mut values = HashMap::new();
        for attribute in plan.attributes() {
            if let Some(default) = &attribute.default {
                values.insert(attribute.schema.id.raw(), default.clone());
            }
        }
        if let Some((backend, context)) = &storage {
            for attribute in plan.attributes() {
                if !attribute.schema.quality.nonvolatile {
                    continue;
                }
                if let Some(bytes) = backend.get(context, attribute.schema.name) {
                    match matter_codec_tlv::decode(&bytes) {
                        Ok(value) => {
                            values.insert(attribute.schema.id.raw(), value);
                        }
                        Err(err) => trace!(
                            attribute = attribute.schema.name,
                            error = %err,
                            "persisted value unreadable, keeping default"
                        ),
                    }
                }
            }
        }
        Arc::new(Self {
            endpoint,
            plan,
            state: Mutex::new(DatasourceState {
                // 版本从 1 起步；0 留给“从未提交”语义。
                version: DataVersion(1),
                values,
            }),
            storage,
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn endpoint(&self) -> EndpointNumber {
        self.endpoint
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.plan.cluster_id()
    }

    pub fn plan(&self) -> &Arc<ClusterPlan> {
        &self.plan
    }

    pub fn version(&self) -> DataVersion {
        self.state.lock().expect("datasource lock").version
    }

    /// 读取当前已提交的值。
    pub fn get(&self, id: AttributeId) -> Option<TlvValue> {
        self.state
            .lock()
            .expect("datasource lock")
            .values
            .get(&id.raw())
            .cloned()
    }

    /// 注册提交监听器。
    pub fn subscribe(&self, listener: impl Fn(&ChangeNotice) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("listener lock")
            .push(Box::new(listener));
    }

    /// 单属性写入的便捷事务（命令处理器内部状态变更用）。
    pub fn write_one(self: &Arc<Self>, id: AttributeId, value: TlvValue) -> Result<ChangeNotice> {
        let mut transaction = Transaction::new();
        transaction.stage(self, id, &value)?;
        let mut notices = transaction.commit();
        Ok(notices.remove(0))
    }

    /// 应用一组已校验的写入：恰好一次版本递增。
    fn apply(&self, writes: Vec<(AttributeId, TlvValue)>) -> ChangeNotice {
        let mut state = self.state.lock().expect("datasource lock");
        let mut attributes = Vec::with_capacity(writes.len());
        let mut properties = Vec::with_capacity(writes.len());
        for (id, value) in writes {
            if let Some(attribute) = self.plan.attribute(id) {
                if attribute.schema.quality.nonvolatile {
                    if let Some((backend, context)) = &self.storage {
                        backend.set(
                            context,
                            attribute.schema.name,
                            matter_codec_tlv::encode(&value),
                        );
                    }
                }
                if !attributes.contains(&id) {
                    attributes.push(id);
                    properties.push(attribute.schema.name);
                }
                state.values.insert(id.raw(), value);
            }
        }
        state.version = state.version.next();
        ChangeNotice {
            endpoint: self.endpoint,
            cluster: self.plan.cluster_id(),
            version: state.version,
            attributes,
            properties,
        }
    }

    fn notify(&self, notice: &ChangeNotice) {
        let listeners = self.listeners.lock().expect("listener lock");
        for listener in listeners.iter() {
            listener(notice);
        }
    }
}

impl std::fmt::Debug for Datasource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datasource")
            .field("endpoint", &self.endpoint)
            .field("cluster", &self.plan.cluster_id())
            .field("version", &self.version())
            .finish()
    }
}

/// 跨 datasource 的写事务。
///
/// # 契约说明（What）
/// - `stage` 即时校验（校验跑在暂存值上）；同一属性重复暂存后写覆盖
///   先写；
/// - `commit` 按 datasource 分组应用，每个集群版本恰好 +1，随后通知
///   监听器；
/// - 丢弃事务即回滚，无副作用。
#[derive(Default)]
pub struct Transaction {
    staged: Vec<(Arc<Datasource>, AttributeId, TlvValue)>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// 校验并暂存一笔写入。
    pub fn stage(
        &mut self,
        datasource: &Arc<Datasource>,
        id: AttributeId,
        value: &TlvValue,
    ) -> Result<()> {
        let normalized = datasource.plan().validate(id, value)?;
        // 同属性后写覆盖先写。
        self.staged.retain(|(existing, staged_id, _)| {
            !(Arc::ptr_eq(existing, datasource) && *staged_id == id)
        });
        self.staged.push((Arc::clone(datasource), id, normalized));
        Ok(())
    }

    /// 读己之写：返回某属性的暂存值。
    pub fn staged_value(&self, datasource: &Arc<Datasource>, id: AttributeId) -> Option<&TlvValue> {
        self.staged
            .iter()
            .find(|(existing, staged_id, _)| Arc::ptr_eq(existing, datasource) && *staged_id == id)
            .map(|(_, _, value)| value)
    }

    /// 提交全部暂存写入。
    pub fn commit(self) -> Vec<ChangeNotice> {
        let mut groups: Vec<(Arc<Datasource>, Vec<(AttributeId, TlvValue)>)> = Vec::new();
        for (datasource, id, value) in self.staged {
            match groups
                .iter_mut()
                .find(|(existing, _)| Arc::ptr_eq(existing, &datasource))
            {
                Some((_, writes)) => writes.push((id, value)),
                None => groups.push((datasource, vec![(id, value)])),
            }
        }

        let mut notices = Vec::with_capacity(groups.len());
        for (datasource, writes) in groups {
            let notice = datasource.apply(writes);
            datasource.notify(&notice);
            notices.push(notice);
        }
        notices
    }

    /// 显式回滚（与直接丢弃等价，供调用点表达意图）。
    pub fn rollback(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        AttributeAccess, AttributeSchema, ClusterSchema, Conformance, Constraint, Quality,
        ValueKind,
    };
    use matter_core::storage::MemoryStorage;
    use matter_core::types::ClusterId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plan() -> Arc<ClusterPlan> {
        Arc::new(ClusterPlan::compile(
            ClusterSchema {
                id: ClusterId(0x6),
                name: "OnOff",
                revision: 6,
                attributes: vec![
                    AttributeSchema {
                        id: AttributeId(0),
                        name: "onOff",
                        kind: ValueKind::Bool,
                        conformance: Conformance::Mandatory,
                        quality: Quality {
                            nonvolatile: true,
                            ..Quality::none()
                        },
                        access: AttributeAccess::RO_VIEW,
                        constraint: Constraint::default(),
                        default: Some(TlvValue::Bool(false)),
                    },
                    AttributeSchema {
                        id: AttributeId(0x4000),
                        name: "globalSceneControl",
                        kind: ValueKind::Bool,
                        conformance: Conformance::Mandatory,
                        quality: Quality::none(),
                        access: AttributeAccess::RO_VIEW,
                        constraint: Constraint::default(),
                        default: Some(TlvValue::Bool(true)),
                    },
                ],
                commands: Vec::new(),
                events: Vec::new(),
            },
            0,
        ))
    }

    #[test]
    fn commit_bumps_version_exactly_once() {
        let datasource = Datasource::new(EndpointNumber(1), plan(), None);
        let before = datasource.version();

        let mut transaction = Transaction::new();
        transaction
            .stage(&datasource, AttributeId(0), &TlvValue::Bool(true))
            .expect("stage onOff");
        transaction
            .stage(&datasource, AttributeId(0x4000), &TlvValue::Bool(false))
            .expect("stage gsc");
        let notices = transaction.commit();

        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].version, before.next());
        assert_eq!(datasource.version(), before.next());
        assert_eq!(notices[0].properties, vec!["onOff", "globalSceneControl"]);
    }

    #[test]
    fn rollback_leaves_no_trace() {
        let datasource = Datasource::new(EndpointNumber(1), plan(), None);
        let before = datasource.version();

        let mut transaction = Transaction::new();
        transaction
            .stage(&datasource, AttributeId(0), &TlvValue::Bool(true))
            .expect("stage");
        transaction.rollback();

        assert_eq!(datasource.version(), before);
        assert_eq!(datasource.get(AttributeId(0)), Some(TlvValue::Bool(false)));
    }

    #[test]
    fn staged_overwrite_keeps_last_value_and_notifies_once() {
        let datasource = Datasource::new(EndpointNumber(1), plan(), None);
        let hits = Arc::new(AtomicUsize::new(0));
        let listener_hits = Arc::clone(&hits);
        datasource.subscribe(move |_| {
            listener_hits.fetch_add(1, Ordering::SeqCst);
        });

        let mut transaction = Transaction::new();
        transaction
            .stage(&datasource, AttributeId(0), &TlvValue::Bool(true))
            .expect("first stage");
        transaction
            .stage(&datasource, AttributeId(0), &TlvValue::Bool(false))
            .expect("second stage");
        assert_eq!(
            transaction.staged_value(&datasource, AttributeId(0)),
            Some(&TlvValue::Bool(false))
        );
        transaction.commit();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(datasource.get(AttributeId(0)), Some(TlvValue::Bool(false)));
    }

    #[test]
    fn nonvolatile_values_persist_and_reload() {
        let storage: Arc<dyn StorageService> = Arc::new(MemoryStorage::default());
        let context = StorageContext::new("nodes").child("1").child("1").child("6");

        let datasource = Datasource::new(
            EndpointNumber(1),
            plan(),
            Some((Arc::clone(&storage), context.clone())),
        );
        datasource
            .write_one(AttributeId(0), TlvValue::Bool(true))
            .expect("write");

        // 重建 datasource：nonvolatile 值应当恢复。
        let reloaded = Datasource::new(EndpointNumber(1), plan(), Some((storage, context)));
        assert_eq!(reloaded.get(AttributeId(0)), Some(TlvValue::Bool(true)));
    }
}
