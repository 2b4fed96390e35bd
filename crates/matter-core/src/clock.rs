//! # clock 模块说明
//!
//! ## 角色定位（Why）
//! - MRP 重传、订阅节流、failsafe 到期与 MDNS 抑制窗口全部依赖时间来源；
//!   直接调用系统时钟会让这些逻辑在 CI 中不可复现；
//! - 通过 trait 注入时钟：生产环境使用真实时间，测试注入 [`MockClock`]
//!   并手动推进，以确定性复现唤醒序列。
//!
//! ## 接口约束（What）
//! - `now` 返回单调时间点，实现必须保证单调递增；
//! - `wall` 返回墙钟时间，仅用于事件时间戳与 TXT 记录，不参与调度；
//! - `sleep` 返回在给定时长后完成的 Future，完成前至少等待所给时长。

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant, SystemTime};

use crate::environment::EnvironmentService;

/// 时钟接口返回的统一延迟 Future 类型。
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 可注入的时钟抽象。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前的单调时间点。
    fn now(&self) -> Instant;

    /// 返回当前墙钟时间（事件时间戳用途）。
    fn wall(&self) -> SystemTime;

    /// 返回一个在指定持续时间后完成的睡眠 Future。
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// 将时钟注册进环境的服务包装。
///
/// 环境槽位以具体类型为键，统一经由 `ClockService` 存取，内部的
/// `Arc<dyn Clock>` 可指向任意实现。
pub struct ClockService {
    clock: Arc<dyn Clock>,
}

impl ClockService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// 默认使用基于 Tokio 的系统时钟。
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}

impl EnvironmentService for ClockService {}

/// 基于 Tokio 时间驱动的系统时钟。
///
/// `sleep` 委托给 [`tokio::time::sleep`]，必须在 Tokio 运行时上下文中使用。
#[derive(Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        // Tokio `sleep` 返回 `!Unpin` Future，统一包裹为 `Sleep` 类型。
        Box::pin(tokio::time::sleep(duration))
    }
}

/// 虚拟时钟：手动推进时间，测试中复现确定性的唤醒序列。
///
/// # 行为概览（How）
/// - 内部维护自构造起的偏移量与待触发的睡眠列表；
/// - `advance` 增加偏移量并唤醒到期的睡眠 Future；
/// - `sleep` 返回的 Future 在未到期前返回 `Poll::Pending`，被提前 Drop
///   时从调度列表移除。
#[derive(Clone)]
pub struct MockClock {
    inner: Arc<MockClockInner>,
}

struct MockClockInner {
    origin: Instant,
    wall_origin: SystemTime,
    state: Mutex<MockState>,
}

struct MockState {
    elapsed: Duration,
    sleepers: Vec<SleeperSlot>,
    next_id: u64,
}

struct SleeperSlot {
    id: u64,
    deadline: Duration,
    waker: Option<Waker>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockClockInner {
                origin: Instant::now(),
                wall_origin: SystemTime::now(),
                state: Mutex::new(MockState {
                    elapsed: Duration::ZERO,
                    sleepers: Vec::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    /// 推进虚拟时间并唤醒到期的睡眠者。
    pub fn advance(&self, duration: Duration) {
        let wakers: Vec<Waker> = {
            let mut state = self.inner.state.lock().expect("mock clock lock");
            state.elapsed += duration;
            let now = state.elapsed;
            state
                .sleepers
                .iter_mut()
                .filter(|slot| slot.deadline <= now)
                .filter_map(|slot| slot.waker.take())
                .collect()
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// 当前虚拟偏移量（调试与断言用）。
    pub fn elapsed(&self) -> Duration {
        self.inner.state.lock().expect("mock clock lock").elapsed
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.inner.origin + self.inner.state.lock().expect("mock clock lock").elapsed
    }

    fn wall(&self) -> SystemTime {
        self.inner.wall_origin + self.inner.state.lock().expect("mock clock lock").elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let (id, deadline) = {
            let mut state = self.inner.state.lock().expect("mock clock lock");
            let id = state.next_id;
            state.next_id += 1;
            let deadline = state.elapsed + duration;
            state.sleepers.push(SleeperSlot {
                id,
                deadline,
                waker: None,
            });
            (id, deadline)
        };
        Box::pin(MockSleep {
            inner: Arc::clone(&self.inner),
            id,
            deadline,
        })
    }
}

struct MockSleep {
    inner: Arc<MockClockInner>,
    id: u64,
    deadline: Duration,
}

impl Future for MockSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.inner.state.lock().expect("mock clock lock");
        if state.elapsed >= self.deadline {
            state.sleepers.retain(|slot| slot.id != self.id);
            return Poll::Ready(());
        }
        if let Some(slot) = state.sleepers.iter_mut().find(|slot| slot.id == self.id) {
            slot.waker = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl Drop for MockSleep {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().expect("mock clock lock");
        state.sleepers.retain(|slot| slot.id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn mock_sleep_completes_only_after_advance() {
        let clock = MockClock::new();
        let sleep = clock.sleep(Duration::from_millis(100));
        let handle = tokio::spawn(sleep);

        clock.advance(Duration::from_millis(50));
        assert!(!handle.is_finished());

        clock.advance(Duration::from_millis(50));
        handle.await.expect("sleep task");
    }

    #[test]
    fn mock_now_tracks_advance() {
        let clock = MockClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now() - start, Duration::from_secs(3));
    }
}
