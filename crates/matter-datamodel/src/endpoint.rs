//! 端点树：behavior 的容器与结构变更传播。
//!
//! # 激活次序（What）
//! 1. 校验设备类型要求的集群齐备，缺失则端点以
//!    `datamodel.behavior_initialization` 失败；
//! 2. `early` behavior 先行初始化，顺序按声明序确定；
//! 3. 其余 behavior 初始化，个别失败隔离为 crashed，不拖垮端点；
//! 4. 全部完成后置 `initialized` 并开始接受外部交互。

use crate::behavior::Behavior;
use matter_core::error::{MatterError, Result, codes};
use matter_core::types::{ClusterId, DeviceTypeId, EndpointNumber};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

/// 设备类型声明。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceType {
    pub id: DeviceTypeId,
    pub revision: u16,
    /// 该设备类型要求在场的服务端集群。
    pub required_server_clusters: Vec<ClusterId>,
}

type StructureListener = Box<dyn Fn() + Send + Sync>;
type ParentNotifier = Box<dyn Fn() + Send + Sync>;

/// 一个编号端点。
pub struct Endpoint {
    number: EndpointNumber,
    name: String,
    device_types: Vec<DeviceType>,
    behaviors: Mutex<Vec<Arc<Behavior>>>,
    children: Mutex<Vec<Arc<Endpoint>>>,
    structure_version: AtomicU32,
    structure_listeners: Mutex<Vec<StructureListener>>,
    parent_notifier: Mutex<Option<ParentNotifier>>,
    initialized: AtomicBool,
}

impl Endpoint {
    pub fn new(
        number: EndpointNumber,
        name: impl Into<String>,
        device_types: Vec<DeviceType>,
    ) -> Arc<Self> {
        Arc::new(Self {
            number,
            name: name.into(),
            device_types,
            behaviors: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            structure_version: AtomicU32::new(0),
            structure_listeners: Mutex::new(Vec::new()),
            parent_notifier: Mutex::new(None),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn number(&self) -> EndpointNumber {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_types(&self) -> &[DeviceType] {
        &self.device_types
    }

    pub fn structure_version(&self) -> u32 {
        self.structure_version.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// 登记 behavior（激活前）。
    pub fn add_behavior(&self, behavior: Arc<Behavior>) {
        self.behaviors.lock().expect("behavior lock").push(behavior);
    }

    pub fn behavior(&self, cluster: ClusterId) -> Option<Arc<Behavior>> {
        self.behaviors
            .lock()
            .expect("behavior lock")
            .iter()
            .find(|behavior| behavior.cluster_id() == cluster)
            .cloned()
    }

    pub fn behaviors(&self) -> Vec<Arc<Behavior>> {
        self.behaviors.lock().expect("behavior lock").clone()
    }

    /// 挂接子端点；结构版本沿树向上递增并触发回调。
    pub fn add_child(self: &Arc<Self>, child: Arc<Endpoint>) {
        {
            let weak: Weak<Endpoint> = Arc::downgrade(self);
            *child.parent_notifier.lock().expect("parent lock") = Some(Box::new(move || {
                if let Some(parent) = weak.upgrade() {
                    parent.bump_structure();
                }
            }));
        }
        self.children.lock().expect("children lock").push(child);
        self.bump_structure();
    }

    /// 摘除子端点：先关闭其全部 behavior，再从树上分离。
    pub fn remove_child(self: &Arc<Self>, number: EndpointNumber) -> Option<Arc<Endpoint>> {
        let removed = {
            let mut children = self.children.lock().expect("children lock");
            let index = children.iter().position(|child| child.number == number)?;
            Some(children.remove(index))
        };
        if let Some(child) = &removed {
            for behavior in child.behaviors() {
                behavior.destroy();
            }
            *child.parent_notifier.lock().expect("parent lock") = None;
            self.bump_structure();
        }
        removed
    }

    pub fn children(&self) -> Vec<Arc<Endpoint>> {
        self.children.lock().expect("children lock").clone()
    }

    /// 全部后代端点号（descriptor 的 `parts` 列表）。
    pub fn parts(&self) -> Vec<EndpointNumber> {
        let mut parts = Vec::new();
        for child in self.children() {
            parts.push(child.number);
            parts.extend(child.parts());
        }
        parts
    }

    /// 在子树内（含自身）按端点号查找。
    pub fn find(self: &Arc<Self>, number: EndpointNumber) -> Option<Arc<Endpoint>> {
        if self.number == number {
            return Some(Arc::clone(self));
        }
        for child in self.children() {
            if let Some(found) = child.find(number) {
                return Some(found);
            }
        }
        None
    }

    /// 子树内全部端点（含自身），先序遍历。
    pub fn walk(self: &Arc<Self>) -> Vec<Arc<Endpoint>> {
        let mut out = vec![Arc::clone(self)];
        for child in self.children() {
            out.extend(child.walk());
        }
        out
    }

    pub fn on_structure_changed(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.structure_listeners
            .lock()
            .expect("listener lock")
            .push(Box::new(listener));
    }

    fn bump_structure(&self) {
        self.structure_version.fetch_add(1, Ordering::SeqCst);
        {
            let listeners = self.structure_listeners.lock().expect("listener lock");
            for listener in listeners.iter() {
                listener();
            }
        }
        let notifier = self.parent_notifier.lock().expect("parent lock");
        if let Some(notifier) = notifier.as_ref() {
            notifier();
        }
    }

    /// 激活端点（见模块头的四步次序）。
    pub fn activate(self: &Arc<Self>) -> Result<()> {
        let behaviors = self.behaviors();
        for device_type in &self.device_types {
            for required in &device_type.required_server_clusters {
                if !behaviors.iter().any(|b| b.cluster_id() == *required) {
                    return Err(MatterError::implementation(
                        codes::BEHAVIOR_INITIALIZATION,
                        format!(
                            "endpoint {} misses {required} required by {}",
                            self.number, device_type.id
                        ),
                    ));
                }
            }
        }

        for behavior in behaviors.iter().filter(|b| b.is_early()) {
            if let Err(err) = behavior.initialize() {
                warn!(
                    endpoint = %self.number,
                    cluster = %behavior.cluster_id(),
                    error = %err,
                    "early behavior quarantined"
                );
            }
        }
        for behavior in behaviors.iter().filter(|b| !b.is_early()) {
            if let Err(err) = behavior.initialize() {
                warn!(
                    endpoint = %self.number,
                    cluster = %behavior.cluster_id(),
                    error = %err,
                    "behavior quarantined"
                );
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("number", &self.number)
            .field("name", &self.name)
            .field("children", &self.children.lock().expect("children lock").len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ClusterSchema};
    use crate::supervisor::ClusterPlan;
    use crate::transaction::Datasource;

    fn bare_behavior(cluster: ClusterId, endpoint: EndpointNumber) -> Arc<Behavior> {
        let plan = Arc::new(ClusterPlan::compile(
            ClusterSchema {
                id: cluster,
                name: "Bare",
                revision: 1,
                attributes: Vec::new(),
                commands: Vec::new(),
                events: Vec::new(),
            },
            0,
        ));
        Behavior::new(Datasource::new(endpoint, plan, None), false)
    }

    #[test]
    fn activation_requires_device_type_clusters() {
        let endpoint = Endpoint::new(
            EndpointNumber(1),
            "light",
            vec![DeviceType {
                id: DeviceTypeId(0x0100),
                revision: 1,
                required_server_clusters: vec![ClusterId(0x6)],
            }],
        );
        let err = endpoint.activate().expect_err("missing OnOff");
        assert_eq!(err.code(), codes::BEHAVIOR_INITIALIZATION);

        endpoint.add_behavior(bare_behavior(ClusterId(0x6), EndpointNumber(1)));
        endpoint.activate().expect("activates with OnOff present");
        assert!(endpoint.is_initialized());
    }

    #[test]
    fn structure_changes_propagate_to_root() {
        let root = Endpoint::new(EndpointNumber(0), "root", Vec::new());
        let child = Endpoint::new(EndpointNumber(1), "child", Vec::new());
        let before = root.structure_version();

        root.add_child(Arc::clone(&child));
        assert!(root.structure_version() > before);

        // 孙辈变化沿树向上可见。
        let at_child_add = root.structure_version();
        child.add_child(Endpoint::new(EndpointNumber(2), "grandchild", Vec::new()));
        assert!(root.structure_version() > at_child_add);
        assert_eq!(root.parts(), vec![EndpointNumber(1), EndpointNumber(2)]);
    }

    #[test]
    fn remove_child_destroys_behaviors() {
        let root = Endpoint::new(EndpointNumber(0), "root", Vec::new());
        let child = Endpoint::new(EndpointNumber(1), "child", Vec::new());
        let behavior = bare_behavior(ClusterId(0x6), EndpointNumber(1));
        child.add_behavior(Arc::clone(&behavior));
        root.add_child(Arc::clone(&child));

        let removed = root.remove_child(EndpointNumber(1)).expect("removed");
        assert_eq!(removed.number(), EndpointNumber(1));
        assert_eq!(
            behavior.state(),
            crate::behavior::BackingState::Destroyed
        );
        assert!(root.find(EndpointNumber(1)).is_none());
    }
}
