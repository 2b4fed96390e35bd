//! # storage 模块说明
//!
//! ## 角色定位（Why）
//! - 协议栈的全部持久状态（fabric 凭据、会话恢复记录、属性值、事件环、
//!   BDX 块）都经由同一个键/值+blob 接口落盘；后端（文件、闪存、数据库）
//!   在环境中注册，核心逻辑只面向 [`StorageService`] 契约；
//! - 层级化的 *context*（子树）让每类状态拥有独立命名空间，删除 fabric
//!   时可整树清除 `fabrics/<index>` 而不触碰其它数据。
//!
//! ## 核心契约（What）
//! - context 路径由非空、不含 `/` 的段组成，例如 `nodes/12/0/6`；
//! - `clear` 递归清空整个子树；`contexts` 枚举直接子 context 名；
//! - blob 与普通值共享存储，仅语义不同（整块读写、不参与枚举优化）。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::environment::EnvironmentService;

/// 层级化存储路径。
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StorageContext {
    path: String,
}

impl StorageContext {
    /// 以根段创建 context；段内的 `/` 被替换为 `-` 以保持路径结构稳定。
    pub fn new(root: impl AsRef<str>) -> Self {
        Self {
            path: sanitize(root.as_ref()),
        }
    }

    /// 派生子 context。
    pub fn child(&self, segment: impl AsRef<str>) -> Self {
        Self {
            path: format!("{}/{}", self.path, sanitize(segment.as_ref())),
        }
    }

    /// 完整路径字符串。
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Display for StorageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path)
    }
}

fn sanitize(segment: &str) -> String {
    segment.replace('/', "-")
}

/// 键/值 + blob 持久化后端契约。
pub trait StorageService: Send + Sync + 'static {
    fn get(&self, context: &StorageContext, key: &str) -> Option<Vec<u8>>;

    fn set(&self, context: &StorageContext, key: &str, value: Vec<u8>);

    fn remove(&self, context: &StorageContext, key: &str);

    /// 枚举 context 直接持有的键（不含子 context）。
    fn keys(&self, context: &StorageContext) -> Vec<String>;

    /// 递归清空 context 及其全部子树。
    fn clear(&self, context: &StorageContext);

    /// 枚举直接子 context 名。
    fn contexts(&self, context: &StorageContext) -> Vec<String>;

    /// 整块写入 blob；默认与键值共享存储。
    fn write_blob(&self, context: &StorageContext, key: &str, data: Vec<u8>) {
        self.set(context, key, data);
    }

    /// 整块读取 blob。
    fn read_blob(&self, context: &StorageContext, key: &str) -> Option<Vec<u8>> {
        self.get(context, key)
    }
}

/// 将存储后端注册进环境的服务包装。
pub struct StorageManager {
    backend: Arc<dyn StorageService>,
}

impl StorageManager {
    pub fn new(backend: Arc<dyn StorageService>) -> Self {
        Self { backend }
    }

    /// 默认注册进程内存后端（测试与无盘设备）。
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStorage::default()))
    }

    pub fn backend(&self) -> Arc<dyn StorageService> {
        Arc::clone(&self.backend)
    }
}

impl EnvironmentService for StorageManager {}

/// 进程内存后端：`BTreeMap` 保证键枚举顺序稳定，便于测试断言。
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl StorageService for MemoryStorage {
    fn get(&self, context: &StorageContext, key: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .expect("storage lock")
            .get(&(context.path().to_owned(), key.to_owned()))
            .cloned()
    }

    fn set(&self, context: &StorageContext, key: &str, value: Vec<u8>) {
        self.entries
            .lock()
            .expect("storage lock")
            .insert((context.path().to_owned(), key.to_owned()), value);
    }

    fn remove(&self, context: &StorageContext, key: &str) {
        self.entries
            .lock()
            .expect("storage lock")
            .remove(&(context.path().to_owned(), key.to_owned()));
    }

    fn keys(&self, context: &StorageContext) -> Vec<String> {
        self.entries
            .lock()
            .expect("storage lock")
            .keys()
            .filter(|(ctx, _)| ctx == context.path())
            .map(|(_, key)| key.clone())
            .collect()
    }

    fn clear(&self, context: &StorageContext) {
        let prefix = format!("{}/", context.path());
        self.entries
            .lock()
            .expect("storage lock")
            .retain(|(ctx, _), _| ctx != context.path() && !ctx.starts_with(&prefix));
    }

    fn contexts(&self, context: &StorageContext) -> Vec<String> {
        let prefix = format!("{}/", context.path());
        let mut children: Vec<String> = self
            .entries
            .lock()
            .expect("storage lock")
            .keys()
            .filter_map(|(ctx, _)| ctx.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_owned())
            .collect();
        children.sort();
        children.dedup();
        children
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contexts_enumerates_direct_children_only() {
        let storage = MemoryStorage::default();
        let fabrics = StorageContext::new("fabrics");
        storage.set(&fabrics.child("1"), "label", b"home".to_vec());
        storage.set(&fabrics.child("2"), "label", b"office".to_vec());
        storage.set(&fabrics.child("2").child("acl"), "0", b"entry".to_vec());

        assert_eq!(storage.contexts(&fabrics), vec!["1", "2"]);
        assert_eq!(storage.keys(&fabrics.child("2")), vec!["label"]);
    }

    #[test]
    fn clear_removes_whole_subtree() {
        let storage = MemoryStorage::default();
        let fabrics = StorageContext::new("fabrics");
        storage.set(&fabrics.child("1"), "label", b"home".to_vec());
        storage.set(&fabrics.child("1").child("noc"), "cert", b"bytes".to_vec());
        storage.set(&fabrics.child("10"), "label", b"other".to_vec());

        storage.clear(&fabrics.child("1"));

        assert!(storage.get(&fabrics.child("1"), "label").is_none());
        assert!(storage.get(&fabrics.child("1").child("noc"), "cert").is_none());
        assert_eq!(
            storage.get(&fabrics.child("10"), "label"),
            Some(b"other".to_vec()),
            "prefix match must not clear sibling `10`"
        );
    }
}
