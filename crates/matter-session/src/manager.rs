//! # SessionManager：会话仓储
//!
//! ## 核心意图（Why）
//! - 提供基于 `DashMap` 的并发安全存储，保证多任务环境下会话的分配、
//!   查询与回收具备原子语义；
//! - 本地会话号是入站帧路由的唯一索引，分配必须避开 0（未加密通道
//!   保留值）与在用值。
//!
//! ## 行为契约（What）
//! - `allocate_local_id` 返回当前未占用的会话号；
//! - `insert` 拒绝重复注册同一本地会话号；
//! - `close_*` 系列在移除的同时触发会话的关闭监听器。

use crate::session::SecureSession;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use matter_core::error::{MatterError, Result, codes};
use matter_core::types::{FabricIndex, NodeId, SessionId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

/// 会话仓储。
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<u16, Arc<SecureSession>>,
    next_id: AtomicU16,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU16::new(1),
        }
    }

    /// 分配一个未占用的本地会话号。
    pub fn allocate_local_id(&self) -> SessionId {
        loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            if candidate != 0 && !self.sessions.contains_key(&candidate) {
                return SessionId(candidate);
            }
        }
    }

    /// 注册一条已建立的会话。
    pub fn insert(&self, session: Arc<SecureSession>) -> Result<()> {
        match self.sessions.entry(session.local_id.raw()) {
            Entry::Occupied(_) => Err(MatterError::implementation(
                codes::SESSION_NOT_FOUND,
                format!("local session id {} already registered", session.local_id),
            )),
            Entry::Vacant(vacant) => {
                vacant.insert(session);
                Ok(())
            }
        }
    }

    /// 按本地会话号查询。
    pub fn get(&self, id: SessionId) -> Option<Arc<SecureSession>> {
        self.sessions.get(&id.raw()).map(|entry| Arc::clone(&entry))
    }

    /// 移除并关闭一条会话。
    pub fn close(&self, id: SessionId) {
        if let Some((_, session)) = self.sessions.remove(&id.raw()) {
            session.close();
        }
    }

    /// 关闭指向某 fabric 的全部会话（fabric 移除/failsafe 回滚路径）。
    pub fn close_for_fabric(&self, fabric: FabricIndex) {
        let doomed: Vec<u16> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().fabric_index == Some(fabric))
            .map(|entry| *entry.key())
            .collect();
        for id in doomed {
            self.close(SessionId(id));
        }
    }

    /// 关闭与某对端节点的全部会话。
    pub fn close_for_peer(&self, peer: NodeId) {
        let doomed: Vec<u16> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().peer_node_id == peer)
            .map(|entry| *entry.key())
            .collect();
        for id in doomed {
            self.close(SessionId(id));
        }
    }

    /// 查询与某对端的任意一条开放会话。
    pub fn find_for_peer(&self, peer: NodeId) -> Option<Arc<SecureSession>> {
        self.sessions
            .iter()
            .find(|entry| entry.value().peer_node_id == peer && entry.value().is_open())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// 关闭全部会话（节点停机）。
    pub fn close_all(&self) {
        let all: Vec<u16> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in all {
            self.close(SessionId(id));
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl matter_core::environment::EnvironmentService for SessionManager {
    fn close(&self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests_support::loopback_session;

    #[test]
    fn allocate_skips_zero_and_in_use() {
        let manager = SessionManager::new();
        let first = manager.allocate_local_id();
        assert_ne!(first.raw(), 0);
        let session = loopback_session(first, SessionId(99), Some(FabricIndex(1)));
        manager.insert(session).expect("insert");
        let second = manager.allocate_local_id();
        assert_ne!(second, first);
    }

    #[test]
    fn close_for_fabric_scopes_correctly() {
        let manager = SessionManager::new();
        let fabric_a = loopback_session(SessionId(1), SessionId(10), Some(FabricIndex(1)));
        let fabric_b = loopback_session(SessionId(2), SessionId(20), Some(FabricIndex(2)));
        manager.insert(Arc::clone(&fabric_a)).expect("insert a");
        manager.insert(Arc::clone(&fabric_b)).expect("insert b");

        manager.close_for_fabric(FabricIndex(1));
        assert!(!fabric_a.is_open());
        assert!(fabric_b.is_open());
        assert_eq!(manager.len(), 1);
    }
}
