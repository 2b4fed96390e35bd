//! # environment 模块说明
//!
//! ## 角色定位（Why）
//! - 进程内唯一的依赖注入层：加密、时钟、存储、网络等服务以类型为键注册，
//!   协议栈各层只声明“需要什么”，不关心“由谁构造”；
//! - 环境组成一棵命名树，子环境默认继承祖先的服务，可在本层覆盖或封禁，
//!   测试场景因此能在子环境内替换时钟/存储而不污染全局。
//!
//! ## 核心契约（What）
//! - `has`/`owns`/`get`/`maybe_get`/`set`/`delete`/`close` 七个操作；
//!   `get` 在注册了工厂时按需构造，构造失败返回 *dependency unavailable*；
//!   `delete` 同时在本层封禁继承；`close` 额外调用服务的释放钩子；
//! - 每个类型槽位的新增/删除都会向监听者广播 [`ServiceEvent`]；
//! - [`SharedServices`] 在环境之上叠加引用计数视图：消费者记录自己取用过
//!   的服务集合，释放时递减计数，最后一个消费者释放才触发 `close`。
//!
//! ## 风险提示（Trade-offs）
//! - 槽位锁在工厂构造期间会被释放再取回，工厂内部因此允许递归 `get`
//!   其它服务；代价是并发首次访问可能构造两份实例，后写者胜出；
//! - 监听器在持锁外调用，监听器内部再注册服务不会死锁。

use std::any::{Any, TypeId, type_name};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{MatterError, Result, codes};

/// 可注册进环境的服务契约。
///
/// `close` 为释放钩子，默认空实现；持有外部资源（套接字、文件句柄）的
/// 服务应在此归还资源。钩子只会被调用一次，失败应自行记录日志。
pub trait EnvironmentService: Any + Send + Sync {
    fn close(&self) {}
}

/// 服务槽位的增删事件，携带类型的稳定名称。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServiceEvent {
    Added { service: &'static str },
    Deleted { service: &'static str },
}

type AnyService = Arc<dyn Any + Send + Sync>;
type FactoryFn =
    Box<dyn Fn(&Environment) -> Result<(AnyService, Arc<dyn EnvironmentService>)> + Send + Sync>;
type Listener = Box<dyn Fn(&ServiceEvent) + Send + Sync>;

enum Slot {
    Instance {
        name: &'static str,
        any: AnyService,
        service: Arc<dyn EnvironmentService>,
    },
    Factory {
        name: &'static str,
        factory: FactoryFn,
    },
    /// 本层显式封禁：既无实例也不再向祖先继承。
    Blocked,
}

/// 命名环境节点。以 `Arc` 共享；子环境持有父环境的强引用。
pub struct Environment {
    name: String,
    parent: Option<Arc<Environment>>,
    slots: Mutex<HashMap<TypeId, Slot>>,
    listeners: Mutex<Vec<Listener>>,
}

impl Environment {
    /// 创建根环境。
    pub fn root(name: impl Into<String>) -> Arc<Environment> {
        Arc::new(Environment {
            name: name.into(),
            parent: None,
            slots: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// 派生子环境；未覆盖的服务向本环境继承。
    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Arc<Environment> {
        Arc::new(Environment {
            name: format!("{}.{}", self.name, name.into()),
            parent: Some(Arc::clone(self)),
            slots: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// 环境的全路径名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 注册（或覆盖）一个服务实例。
    pub fn set<T: EnvironmentService>(&self, service: Arc<T>) {
        let any: AnyService = service.clone();
        let slot = Slot::Instance {
            name: type_name::<T>(),
            any,
            service,
        };
        self.slots.lock().expect("slot lock").insert(TypeId::of::<T>(), slot);
        self.emit(ServiceEvent::Added {
            service: type_name::<T>(),
        });
    }

    /// 注册服务工厂：首次 `get` 时构造并缓存。
    pub fn add_factory<T, F>(&self, factory: F)
    where
        T: EnvironmentService,
        F: Fn(&Environment) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        let wrapped: FactoryFn = Box::new(move |env| {
            let service = factory(env)?;
            let any: AnyService = service.clone();
            Ok((any, service as Arc<dyn EnvironmentService>))
        });
        self.slots.lock().expect("slot lock").insert(
            TypeId::of::<T>(),
            Slot::Factory {
                name: type_name::<T>(),
                factory: wrapped,
            },
        );
    }

    /// 本层是否拥有该服务（实例或工厂，封禁不算拥有）。
    pub fn owns<T: EnvironmentService>(&self) -> bool {
        matches!(
            self.slots.lock().expect("slot lock").get(&TypeId::of::<T>()),
            Some(Slot::Instance { .. }) | Some(Slot::Factory { .. })
        )
    }

    /// 本层或祖先链上是否可获得该服务。
    pub fn has<T: EnvironmentService>(&self) -> bool {
        match self.slots.lock().expect("slot lock").get(&TypeId::of::<T>()) {
            Some(Slot::Blocked) => false,
            Some(_) => true,
            None => self.parent.as_ref().map(|p| p.has::<T>()).unwrap_or(false),
        }
    }

    /// 获取服务；有工厂则按需构造，失败返回 *dependency unavailable*。
    pub fn get<T: EnvironmentService>(&self) -> Result<Arc<T>> {
        let id = TypeId::of::<T>();
        let taken = {
            let mut slots = self.slots.lock().expect("slot lock");
            match slots.get(&id) {
                Some(Slot::Instance { any, .. }) => {
                    return downcast::<T>(any.clone());
                }
                Some(Slot::Blocked) => {
                    return Err(unavailable::<T>(&self.name));
                }
                Some(Slot::Factory { .. }) => match slots.remove(&id) {
                    Some(Slot::Factory { factory, .. }) => Some(factory),
                    _ => unreachable!("factory slot vanished under lock"),
                },
                None => None,
            }
        };

        if let Some(factory) = taken {
            // 构造期间不持锁，工厂可递归获取依赖。
            match factory(self) {
                Ok((any, service)) => {
                    let result = downcast::<T>(any.clone());
                    self.slots.lock().expect("slot lock").insert(
                        id,
                        Slot::Instance {
                            name: type_name::<T>(),
                            any,
                            service,
                        },
                    );
                    self.emit(ServiceEvent::Added {
                        service: type_name::<T>(),
                    });
                    return result;
                }
                Err(err) => {
                    self.slots.lock().expect("slot lock").insert(
                        id,
                        Slot::Factory {
                            name: type_name::<T>(),
                            factory,
                        },
                    );
                    return Err(MatterError::implementation(
                        codes::SERVICE_CONSTRUCTION,
                        format!("factory for `{}` failed in `{}`", type_name::<T>(), self.name),
                    )
                    .with_cause(err));
                }
            }
        }

        match &self.parent {
            Some(parent) => parent.get::<T>(),
            None => Err(unavailable::<T>(&self.name)),
        }
    }

    /// 获取已构造的服务实例；不会触发工厂。
    pub fn maybe_get<T: EnvironmentService>(&self) -> Option<Arc<T>> {
        match self.slots.lock().expect("slot lock").get(&TypeId::of::<T>()) {
            Some(Slot::Instance { any, .. }) => downcast::<T>(any.clone()).ok(),
            Some(_) => None,
            None => self.parent.as_ref().and_then(|p| p.maybe_get::<T>()),
        }
    }

    /// 删除本层槽位并封禁继承；不调用释放钩子。
    pub fn delete<T: EnvironmentService>(&self) {
        self.delete_slot(TypeId::of::<T>(), type_name::<T>(), false);
    }

    /// 删除本层槽位、封禁继承并调用释放钩子。
    pub fn close<T: EnvironmentService>(&self) {
        self.delete_slot(TypeId::of::<T>(), type_name::<T>(), true);
    }

    /// 注册槽位事件监听器。
    pub fn subscribe(&self, listener: impl Fn(&ServiceEvent) + Send + Sync + 'static) {
        self.listeners.lock().expect("listener lock").push(Box::new(listener));
    }

    fn delete_slot(&self, id: TypeId, name: &'static str, run_hook: bool) {
        let removed = self
            .slots
            .lock()
            .expect("slot lock")
            .insert(id, Slot::Blocked);
        if let Some(Slot::Instance { service, .. }) = removed {
            if run_hook {
                service.close();
            }
            self.emit(ServiceEvent::Deleted { service: name });
        }
    }

    fn emit(&self, event: ServiceEvent) {
        let listeners = self.listeners.lock().expect("listener lock");
        for listener in listeners.iter() {
            listener(&event);
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

fn downcast<T: EnvironmentService>(any: AnyService) -> Result<Arc<T>> {
    any.downcast::<T>().map_err(|_| {
        MatterError::implementation(
            codes::SERVICE_TYPE_MISMATCH,
            format!("slot for `{}` holds a different type", type_name::<T>()),
        )
    })
}

fn unavailable<T: EnvironmentService>(env: &str) -> MatterError {
    MatterError::implementation(
        codes::SERVICE_UNAVAILABLE,
        format!("service `{}` unavailable in `{env}`", type_name::<T>()),
    )
}

/// 环境之上的引用计数共享视图。
///
/// # 设计背景（Why）
/// - 多个子系统（MDNS、会话管理器、BDX）共享同一批底层服务；直接在任一
///   子系统关闭时 `close` 会拉垮其它使用者。视图为每个类型槽位维护全局
///   计数，最后一个消费者释放时才真正关闭。
///
/// # 契约说明（What）
/// - `consumer` 派生一个消费者句柄；句柄内部记录自己取用过的类型集合；
/// - 消费者 `release`/Drop 对每个取用过的类型恰好递减一次。
#[derive(Clone)]
pub struct SharedServices {
    env: Arc<Environment>,
    counts: Arc<Mutex<HashMap<TypeId, usize>>>,
}

impl SharedServices {
    pub fn new(env: Arc<Environment>) -> Self {
        Self {
            env,
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 访问底层环境（只读用途，如查询 `has`）。
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// 派生一个带取用记录的消费者。
    pub fn consumer(&self) -> ServiceConsumer {
        ServiceConsumer {
            shared: self.clone(),
            held: Mutex::new(HashSet::new()),
        }
    }

    fn acquire(&self, id: TypeId) {
        *self.counts.lock().expect("count lock").entry(id).or_insert(0) += 1;
    }

    fn release(&self, id: TypeId, name: &'static str) {
        let mut counts = self.counts.lock().expect("count lock");
        let Some(count) = counts.get_mut(&id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            counts.remove(&id);
            drop(counts);
            self.env.delete_slot(id, name, true);
        }
    }
}

/// 单个消费者的服务租借句柄。
///
/// Drop 时对所有仍持有的类型执行一次释放，保证释放钩子不会因异常路径
/// 被跳过，也不会被重复触发。
pub struct ServiceConsumer {
    shared: SharedServices,
    held: Mutex<HashSet<TypeId>>,
}

impl ServiceConsumer {
    /// 获取服务并登记取用；同一消费者重复获取不会重复计数。
    pub fn get<T: EnvironmentService>(&self) -> Result<Arc<T>> {
        let service = self.shared.env.get::<T>()?;
        let id = TypeId::of::<T>();
        let newly_held = self.held.lock().expect("held lock").insert(id);
        if newly_held {
            self.shared.acquire(id);
        }
        Ok(service)
    }

    /// 显式释放单个类型；未持有时为空操作。
    pub fn release<T: EnvironmentService>(&self) {
        let id = TypeId::of::<T>();
        if self.held.lock().expect("held lock").remove(&id) {
            self.shared.release(id, type_name::<T>());
        }
    }
}

impl Drop for ServiceConsumer {
    fn drop(&mut self) {
        let held: Vec<TypeId> = self.held.lock().expect("held lock").drain().collect();
        for id in held {
            // 类型名在 drop 时不可恢复，事件名退化为槽位统称。
            self.shared.release(id, "<consumer-drop>");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default, Debug)]
    struct Counter {
        closed: AtomicUsize,
    }

    impl EnvironmentService for Counter {
        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NeedsCounter;
    impl EnvironmentService for NeedsCounter {}

    #[test]
    fn child_inherits_until_blocked() {
        let root = Environment::root("test");
        root.set(Arc::new(Counter::default()));
        let child = root.child("node");

        assert!(child.has::<Counter>());
        assert!(!child.owns::<Counter>());
        assert!(child.get::<Counter>().is_ok());

        child.delete::<Counter>();
        assert!(!child.has::<Counter>());
        assert!(root.has::<Counter>(), "delete is scoped to the child");
    }

    #[test]
    fn factory_constructs_once_and_can_recurse() {
        let root = Environment::root("test");
        root.set(Arc::new(Counter::default()));
        root.add_factory::<NeedsCounter, _>(|env| {
            env.get::<Counter>()?;
            Ok(Arc::new(NeedsCounter))
        });

        assert!(root.maybe_get::<NeedsCounter>().is_none());
        let first = root.get::<NeedsCounter>().expect("construct");
        let second = root.get::<NeedsCounter>().expect("cached");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn missing_service_reports_dependency_unavailable() {
        let root = Environment::root("test");
        let err = root.get::<Counter>().expect_err("nothing registered");
        assert_eq!(err.code(), codes::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn shared_view_closes_on_last_release() {
        let root = Environment::root("test");
        let counter = Arc::new(Counter::default());
        root.set(counter.clone());

        let shared = SharedServices::new(root);
        let a = shared.consumer();
        let b = shared.consumer();
        a.get::<Counter>().expect("a acquires");
        b.get::<Counter>().expect("b acquires");

        drop(a);
        assert_eq!(counter.closed.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(counter.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_fire_on_add_and_delete() {
        let root = Environment::root("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        root.subscribe(move |event| sink.lock().expect("sink").push(event.clone()));

        root.set(Arc::new(Counter::default()));
        root.close::<Counter>();

        let seen = seen.lock().expect("seen");
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], ServiceEvent::Added { .. }));
        assert!(matches!(seen[1], ServiceEvent::Deleted { .. }));
    }
}
