//! Failsafe：配网期的武装计时器与回滚日志。
//!
//! # 语义（What）
//! - `arm` 以本次 expiry 重置截止时刻，但累计武装时长受设备声明的
//!   上限约束；重复 `arm` 刷新（breadcrumb 语义由集群属性承载）；
//! - 武装期间的每个可回滚动作都追加日志条目；到期或 PASE 对端关闭时
//!   日志**逆序**回放；只有 CommissioningComplete 使变更永久化；
//! - 计时器带代数（generation）：换代后旧计时器静默退出，避免
//!   重武装被上一轮的到期误杀。

use matter_codec_tlv::TlvValue;
use matter_core::clock::Clock;
use matter_core::crypto::OperationalKeypair;
use matter_core::error::{MatterError, Result, codes};
use matter_core::types::{AttributeId, ClusterId, EndpointNumber, FabricIndex};
use matter_session::NocChain;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 回滚日志条目；按追加序记录，回放时逆序执行。
pub enum JournalEntry {
    /// 暂存过信任根：回滚时清空暂存区。
    TrustedRootStaged,
    /// AddNOC 挂入的 fabric：回滚时删除并关闭其 CASE 会话。
    FabricAdded(FabricIndex),
    /// UpdateNOC 的旧材料：回滚时恢复。
    NocUpdated {
        index: FabricIndex,
        prior_chain: NocChain,
        prior_keypair: Arc<OperationalKeypair>,
    },
    /// 网络/通用属性的先前值：回滚时写回。
    AttributeSnapshot {
        endpoint: EndpointNumber,
        cluster: ClusterId,
        attribute: AttributeId,
        prior: TlvValue,
    },
}

impl std::fmt::Debug for JournalEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalEntry::TrustedRootStaged => f.write_str("TrustedRootStaged"),
            JournalEntry::FabricAdded(index) => write!(f, "FabricAdded({index})"),
            JournalEntry::NocUpdated { index, .. } => write!(f, "NocUpdated({index})"),
            JournalEntry::AttributeSnapshot {
                endpoint,
                cluster,
                attribute,
                ..
            } => write!(f, "AttributeSnapshot({endpoint},{cluster},{attribute})"),
        }
    }
}

/// 到期回滚的执行器（节点注入）。
pub type RollbackFn = Arc<dyn Fn(Vec<JournalEntry>) + Send + Sync>;

struct Armed {
    deadline: Instant,
    first_armed: Instant,
    generation: u64,
    journal: Vec<JournalEntry>,
    /// CSRRequest 产出、等待 AddNOC 认领的操作密钥对。
    pending_keypair: Option<OperationalKeypair>,
}

/// Failsafe 上下文（节点级单例）。
pub struct Failsafe {
    clock: Arc<dyn Clock>,
    max_cumulative: Duration,
    state: Mutex<Option<Armed>>,
    next_generation: Mutex<u64>,
}

impl Failsafe {
    pub fn new(clock: Arc<dyn Clock>, max_cumulative: Duration) -> Arc<Self> {
        Arc::new(Self {
            clock,
            max_cumulative,
            state: Mutex::new(None),
            next_generation: Mutex::new(0),
        })
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().expect("failsafe lock").is_some()
    }

    /// 武装（或重武装）；启动代数化的到期任务。
    pub fn arm(self: &Arc<Self>, expiry: Duration, on_expire: RollbackFn) -> Result<()> {
        let generation = {
            let mut next = self.next_generation.lock().expect("generation lock");
            *next += 1;
            *next
        };
        let now = self.clock.now();
        {
            let mut state = self.state.lock().expect("failsafe lock");
            match state.as_mut() {
                Some(armed) => {
                    // 累计武装时长受设备上限约束。
                    let cumulative = now.duration_since(armed.first_armed) + expiry;
                    if cumulative > self.max_cumulative {
                        return Err(MatterError::protocol(
                            codes::COMMISSIONING_ORDER,
                            "cumulative failsafe budget exceeded",
                        ));
                    }
                    armed.deadline = now + expiry;
                    armed.generation = generation;
                }
                None => {
                    *state = Some(Armed {
                        deadline: now + expiry,
                        first_armed: now,
                        generation,
                        journal: Vec::new(),
                        pending_keypair: None,
                    });
                }
            }
        }

        let failsafe = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let remaining = {
                    let state = failsafe.state.lock().expect("failsafe lock");
                    match state.as_ref() {
                        Some(armed) if armed.generation == generation => {
                            armed.deadline.saturating_duration_since(failsafe.clock.now())
                        }
                        // 换代或已解除：本任务退出。
                        _ => return,
                    }
                };
                if remaining.is_zero() {
                    break;
                }
                failsafe.clock.sleep(remaining).await;
            }

            let journal = {
                let mut state = failsafe.state.lock().expect("failsafe lock");
                match state.as_ref() {
                    Some(armed) if armed.generation == generation => {
                        state.take().map(|armed| armed.journal)
                    }
                    _ => None,
                }
            };
            if let Some(journal) = journal {
                info!(entries = journal.len(), "failsafe expired, rolling back");
                on_expire(journal);
            }
        });
        Ok(())
    }

    /// 追加一条回滚日志；未武装时拒绝。
    pub fn record(&self, entry: JournalEntry) -> Result<()> {
        let mut state = self.state.lock().expect("failsafe lock");
        match state.as_mut() {
            Some(armed) => {
                debug!(?entry, "failsafe journal entry");
                armed.journal.push(entry);
                Ok(())
            }
            None => Err(MatterError::protocol(
                codes::COMMISSIONING_FAILSAFE_REQUIRED,
                "operation requires an armed failsafe",
            )),
        }
    }

    /// 未武装即为 `FailsafeRequired`。
    pub fn ensure_armed(&self) -> Result<()> {
        if self.is_armed() {
            Ok(())
        } else {
            Err(MatterError::protocol(
                codes::COMMISSIONING_FAILSAFE_REQUIRED,
                "commissioning step outside failsafe",
            ))
        }
    }

    /// 存放 CSRRequest 产出的密钥对。
    pub fn stash_keypair(&self, keypair: OperationalKeypair) -> Result<()> {
        let mut state = self.state.lock().expect("failsafe lock");
        match state.as_mut() {
            Some(armed) => {
                armed.pending_keypair = Some(keypair);
                Ok(())
            }
            None => Err(MatterError::protocol(
                codes::COMMISSIONING_FAILSAFE_REQUIRED,
                "csr outside failsafe",
            )),
        }
    }

    /// AddNOC 认领待用密钥对。
    pub fn take_keypair(&self) -> Option<OperationalKeypair> {
        self.state
            .lock()
            .expect("failsafe lock")
            .as_mut()
            .and_then(|armed| armed.pending_keypair.take())
    }

    /// CommissioningComplete：解除武装，日志作废（变更永久化）。
    pub fn disarm_commit(&self) -> Result<()> {
        let mut state = self.state.lock().expect("failsafe lock");
        if state.take().is_none() {
            return Err(MatterError::protocol(
                codes::COMMISSIONING_FAILSAFE_REQUIRED,
                "commissioning complete outside failsafe",
            ));
        }
        info!("failsafe disarmed, commissioning committed");
        Ok(())
    }

    /// 显式回滚路径（PASE 对端关闭）：取回日志供调用方逆序回放。
    pub fn disarm_rollback(&self) -> Option<Vec<JournalEntry>> {
        self.state
            .lock()
            .expect("failsafe lock")
            .take()
            .map(|armed| armed.journal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matter_core::clock::MockClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread")]
    async fn expiry_hands_journal_to_rollback() {
        let clock = MockClock::new();
        let failsafe = Failsafe::new(Arc::new(clock.clone()), Duration::from_secs(900));

        let rolled = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&rolled);
        failsafe
            .arm(
                Duration::from_secs(60),
                Arc::new(move |journal| {
                    sink.store(journal.len(), Ordering::SeqCst);
                }),
            )
            .expect("arm");
        failsafe.record(JournalEntry::TrustedRootStaged).expect("record");
        failsafe
            .record(JournalEntry::FabricAdded(FabricIndex(1)))
            .expect("record");

        clock.advance(Duration::from_secs(61));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(rolled.load(Ordering::SeqCst), 2);
        assert!(!failsafe.is_armed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commit_cancels_pending_expiry() {
        let clock = MockClock::new();
        let failsafe = Failsafe::new(Arc::new(clock.clone()), Duration::from_secs(900));

        let rolled = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&rolled);
        failsafe
            .arm(
                Duration::from_secs(60),
                Arc::new(move |_| {
                    sink.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("arm");
        failsafe.disarm_commit().expect("commit");

        clock.advance(Duration::from_secs(120));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rolled.load(Ordering::SeqCst), 0, "committed run must not roll back");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rearm_supersedes_previous_timer() {
        let clock = MockClock::new();
        let failsafe = Failsafe::new(Arc::new(clock.clone()), Duration::from_secs(900));

        let rolled = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&rolled);
        let rollback: RollbackFn = Arc::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        failsafe.arm(Duration::from_secs(30), Arc::clone(&rollback)).expect("arm");
        clock.advance(Duration::from_secs(20));
        failsafe.arm(Duration::from_secs(60), rollback).expect("rearm");

        // 原定 30s 到点：新代计时器尚未到期，不得触发回滚。
        clock.advance(Duration::from_secs(15));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rolled.load(Ordering::SeqCst), 0);
        assert!(failsafe.is_armed());

        clock.advance(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rolled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn record_requires_armed_state() {
        let clock = MockClock::new();
        let failsafe = Failsafe::new(Arc::new(clock), Duration::from_secs(900));
        let err = failsafe
            .record(JournalEntry::TrustedRootStaged)
            .expect_err("not armed");
        assert_eq!(err.code(), codes::COMMISSIONING_FAILSAFE_REQUIRED);
    }
}
