//! 变更通知与状态流：进程内事件总线与可消费的合并差量序列。
//!
//! # 不变量（What）
//! - 每个 behavior 在待发队列中至多一条条目，脏属性集合并集合并；
//! - 空属性集表示整条全量更新，合并时吞掉任何部分集；
//! - 端点删除会排空该端点的待发条目；
//! - 合并窗口默认 250 ms，窗口内的多次变更折叠为一次输出。

use matter_core::clock::Clock;
use matter_core::environment::EnvironmentService;
use matter_core::types::{ClusterId, DataVersion, EndpointNumber, NodeId};
use matter_datamodel::Endpoint;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

/// 默认合并窗口。
pub const DEFAULT_COALESCE: Duration = Duration::from_millis(250);

/// 一条状态变更。
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    Update {
        node: NodeId,
        endpoint: EndpointNumber,
        cluster: ClusterId,
        version: DataVersion,
        /// 空集合表示全量更新。
        properties: Vec<String>,
    },
    Delete {
        node: NodeId,
        endpoint: EndpointNumber,
    },
}

/// 进程内变更广播。
pub struct ChangeNotificationService {
    tx: broadcast::Sender<Change>,
    wired: Mutex<HashSet<usize>>,
}

impl ChangeNotificationService {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(256);
        Arc::new(Self {
            tx,
            wired: Mutex::new(HashSet::new()),
        })
    }

    /// 发布一条变更（无消费者时静默丢弃）。
    pub fn publish(&self, change: Change) {
        let _ = self.tx.send(change);
    }

    /// 订阅广播流。
    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.tx.subscribe()
    }

    /// 接入一棵端点树：datasource 提交转为 `Update`，结构变化时自动
    /// 接入新增的 behavior（按 datasource 指针去重）。
    pub fn attach_tree(self: &Arc<Self>, node: NodeId, root: &Arc<Endpoint>) {
        self.wire_tree(node, root);
        let service = Arc::downgrade(self);
        let weak_root = Arc::downgrade(root);
        root.on_structure_changed(move || {
            if let (Some(service), Some(root)) = (service.upgrade(), weak_root.upgrade()) {
                service.wire_tree(node, &root);
            }
        });
    }

    fn wire_tree(self: &Arc<Self>, node: NodeId, root: &Arc<Endpoint>) {
        for endpoint in root.walk() {
            for behavior in endpoint.behaviors() {
                let datasource = behavior.datasource();
                let key = Arc::as_ptr(datasource) as usize;
                if !self.wired.lock().expect("wired lock").insert(key) {
                    continue;
                }
                let service = Arc::downgrade(self);
                datasource.subscribe(move |notice| {
                    if let Some(service) = service.upgrade() {
                        service.publish(Change::Update {
                            node,
                            endpoint: notice.endpoint,
                            cluster: notice.cluster,
                            version: notice.version,
                            properties: notice
                                .properties
                                .iter()
                                .map(|name| (*name).to_owned())
                                .collect(),
                        });
                    }
                });
            }
        }
    }

    /// 端点销毁入口（节点移除端点时调用）。
    pub fn publish_delete(&self, node: NodeId, endpoint: EndpointNumber) {
        self.publish(Change::Delete { node, endpoint });
    }
}

impl EnvironmentService for ChangeNotificationService {}

/// 状态流配置。
#[derive(Clone, Default)]
pub struct StateStreamOptions {
    /// 节点允许清单；空表示不过滤。
    pub nodes: Option<Vec<NodeId>>,
    /// 集群允许清单；空表示不过滤。
    pub clusters: Option<Vec<ClusterId>>,
    /// 客户端续传用的初始版本表：版本一致的首条更新被略过。
    pub initial_versions: HashMap<(NodeId, EndpointNumber, ClusterId), DataVersion>,
    /// 合并窗口；`None` 取默认。
    pub coalesce: Option<Duration>,
}

/// 可 await 的合并差量序列。
pub struct StateStream {
    rx: mpsc::Receiver<Change>,
}

impl StateStream {
    /// 打开状态流：后台任务消费广播并按窗口合并。
    pub fn open(
        service: &Arc<ChangeNotificationService>,
        clock: Arc<dyn Clock>,
        options: StateStreamOptions,
    ) -> Self {
        let mut source = service.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let coalesce = options.coalesce.unwrap_or(DEFAULT_COALESCE);

        tokio::spawn(async move {
            let mut resume_table = options.initial_versions.clone();
            // 待发条目：每 behavior 一条。
            let mut pending: Vec<Change> = Vec::new();
            loop {
                let tick = clock.sleep(coalesce);
                tokio::pin!(tick);
                loop {
                    tokio::select! {
                        received = source.recv() => match received {
                            Ok(change) => {
                                if accepts(&options, &change) {
                                    merge(&mut pending, &mut resume_table, change);
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                trace!(skipped, "state stream lagged, entries dropped");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                for change in pending.drain(..) {
                                    let _ = tx.send(change).await;
                                }
                                return;
                            }
                        },
                        _ = &mut tick => break,
                    }
                }
                for change in pending.drain(..) {
                    if tx.send(change).await.is_err() {
                        return;
                    }
                }
            }
        });
        Self { rx }
    }

    /// 下一条合并后的变更；流关闭返回 `None`。
    pub async fn next(&mut self) -> Option<Change> {
        self.rx.recv().await
    }
}

fn accepts(options: &StateStreamOptions, change: &Change) -> bool {
    let node = match change {
        Change::Update { node, .. } | Change::Delete { node, .. } => *node,
    };
    if let Some(nodes) = &options.nodes {
        if !nodes.contains(&node) {
            return false;
        }
    }
    if let Change::Update { cluster, .. } = change {
        if let Some(clusters) = &options.clusters {
            if !clusters.contains(cluster) {
                return false;
            }
        }
    }
    true
}

fn merge(
    pending: &mut Vec<Change>,
    resume_table: &mut HashMap<(NodeId, EndpointNumber, ClusterId), DataVersion>,
    change: Change,
) {
    match change {
        Change::Update {
            node,
            endpoint,
            cluster,
            version,
            properties,
        } => {
            // 续传表命中：客户端已有该版本，首条略过。
            if resume_table.remove(&(node, endpoint, cluster)) == Some(version) {
                return;
            }
            let existing = pending.iter_mut().find(|entry| {
                matches!(entry, Change::Update { node: n, endpoint: e, cluster: c, .. }
                    if *n == node && *e == endpoint && *c == cluster)
            });
            match existing {
                Some(Change::Update {
                    version: pending_version,
                    properties: pending_properties,
                    ..
                }) => {
                    *pending_version = version;
                    if pending_properties.is_empty() || properties.is_empty() {
                        // 全量更新吞掉部分集。
                        pending_properties.clear();
                    } else {
                        for property in properties {
                            if !pending_properties.contains(&property) {
                                pending_properties.push(property);
                            }
                        }
                    }
                }
                _ => pending.push(Change::Update {
                    node,
                    endpoint,
                    cluster,
                    version,
                    properties,
                }),
            }
        }
        Change::Delete { node, endpoint } => {
            // 删除排空该端点的全部待发条目。
            pending.retain(|entry| {
                !matches!(entry, Change::Update { node: n, endpoint: e, .. }
                    if *n == node && *e == endpoint)
            });
            pending.push(Change::Delete { node, endpoint });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matter_core::clock::MockClock;

    fn update(endpoint: u16, version: u32, properties: &[&str]) -> Change {
        Change::Update {
            node: NodeId(1),
            endpoint: EndpointNumber(endpoint),
            cluster: ClusterId(6),
            version: DataVersion(version),
            properties: properties.iter().map(|p| (*p).to_owned()).collect(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn coalesces_per_behavior_with_union_merge() {
        let service = ChangeNotificationService::new();
        let clock = MockClock::new();
        let mut stream = StateStream::open(
            &service,
            Arc::new(clock.clone()),
            StateStreamOptions::default(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        service.publish(update(1, 2, &["onOff"]));
        service.publish(update(1, 3, &["onTime"]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        clock.advance(DEFAULT_COALESCE);

        let merged = stream.next().await.expect("merged entry");
        match merged {
            Change::Update {
                version,
                mut properties,
                ..
            } => {
                assert_eq!(version, DataVersion(3), "latest version wins");
                properties.sort();
                assert_eq!(properties, vec!["onOff", "onTime"]);
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_update_supersedes_partial_sets() {
        let service = ChangeNotificationService::new();
        let clock = MockClock::new();
        let mut stream = StateStream::open(
            &service,
            Arc::new(clock.clone()),
            StateStreamOptions::default(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        service.publish(update(1, 2, &["onOff"]));
        service.publish(update(1, 3, &[]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        clock.advance(DEFAULT_COALESCE);

        match stream.next().await.expect("entry") {
            Change::Update { properties, .. } => {
                assert!(properties.is_empty(), "full update swallows partials");
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_drains_pending_endpoint_entries() {
        let service = ChangeNotificationService::new();
        let clock = MockClock::new();
        let mut stream = StateStream::open(
            &service,
            Arc::new(clock.clone()),
            StateStreamOptions::default(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        service.publish(update(1, 2, &["onOff"]));
        service.publish_delete(NodeId(1), EndpointNumber(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        clock.advance(DEFAULT_COALESCE);

        assert_eq!(
            stream.next().await.expect("entry"),
            Change::Delete {
                node: NodeId(1),
                endpoint: EndpointNumber(1)
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn filters_and_resume_table_apply() {
        let service = ChangeNotificationService::new();
        let clock = MockClock::new();
        let mut options = StateStreamOptions {
            clusters: Some(vec![ClusterId(6)]),
            ..StateStreamOptions::default()
        };
        options
            .initial_versions
            .insert((NodeId(1), EndpointNumber(1), ClusterId(6)), DataVersion(2));
        let mut stream = StateStream::open(&service, Arc::new(clock.clone()), options);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 续传表命中：略过。
        service.publish(update(1, 2, &["onOff"]));
        // 非允许集群：过滤。
        service.publish(Change::Update {
            node: NodeId(1),
            endpoint: EndpointNumber(1),
            cluster: ClusterId(8),
            version: DataVersion(5),
            properties: Vec::new(),
        });
        // 真正的新变更。
        service.publish(update(1, 3, &["onOff"]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        clock.advance(DEFAULT_COALESCE);

        match stream.next().await.expect("entry") {
            Change::Update { version, .. } => assert_eq!(version, DataVersion(3)),
            other => panic!("unexpected change {other:?}"),
        }
    }
}
