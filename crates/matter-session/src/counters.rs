//! 报文计数器：单调发送计数与滑动窗口重放检测。

use matter_core::error::{MatterError, Result, codes};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// 重放窗口宽度（位图位数）。
const WINDOW_BITS: u32 = 32;

/// 发送方向计数器：每发一帧取一个新值，u32 回绕。
#[derive(Debug)]
pub struct TxCounter {
    next: AtomicU32,
}

impl TxCounter {
    pub fn new(initial: u32) -> Self {
        Self {
            next: AtomicU32::new(initial),
        }
    }

    /// 取下一个计数值。
    pub fn advance(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// 查看下一个将要使用的值（诊断用）。
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}

/// 接收方向状态：最大已见计数 + 32 位历史位图。
///
/// # 契约说明（What）
/// - 新计数大于最大已见：接受并推进窗口；
/// - 落在窗口内且未见过：接受并置位；
/// - 已见过或早于窗口：拒绝为 `message.counter_replay`。
#[derive(Debug, Default)]
pub struct RxWindow {
    state: Mutex<RxState>,
}

#[derive(Debug, Default)]
struct RxState {
    initialized: bool,
    max_seen: u32,
    bitmap: u32,
}

impl RxWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// 校验并登记一个收到的计数值。
    pub fn accept(&self, counter: u32) -> Result<()> {
        let mut state = self.state.lock().expect("rx window lock");
        if !state.initialized {
            state.initialized = true;
            state.max_seen = counter;
            state.bitmap = 0;
            return Ok(());
        }

        let delta = counter.wrapping_sub(state.max_seen);
        if delta != 0 && delta < u32::MAX / 2 {
            // 向前推进：位图左移，旧的最大值落入历史。
            let shift = delta;
            state.bitmap = if shift >= WINDOW_BITS {
                0
            } else {
                (state.bitmap << shift) | (1 << (shift - 1))
            };
            state.max_seen = counter;
            return Ok(());
        }

        if delta == 0 {
            return Err(replay(counter));
        }

        // 落后于最大已见：检查窗口。
        let behind = state.max_seen.wrapping_sub(counter);
        if behind > WINDOW_BITS {
            return Err(replay(counter));
        }
        let bit = 1u32 << (behind - 1);
        if state.bitmap & bit != 0 {
            return Err(replay(counter));
        }
        state.bitmap |= bit;
        Ok(())
    }
}

fn replay(counter: u32) -> MatterError {
    MatterError::framing(
        codes::MESSAGE_COUNTER_REPLAY,
        format!("counter {counter} inside replay window"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_sequence_accepted() {
        let window = RxWindow::new();
        for counter in 10..20 {
            window.accept(counter).expect("fresh counter");
        }
    }

    #[test]
    fn duplicate_rejected() {
        let window = RxWindow::new();
        window.accept(5).expect("first");
        assert!(window.accept(5).is_err());
    }

    #[test]
    fn out_of_order_within_window_accepted_once() {
        let window = RxWindow::new();
        window.accept(100).expect("max");
        window.accept(98).expect("late but fresh");
        assert!(window.accept(98).is_err(), "second delivery is a replay");
    }

    #[test]
    fn too_old_rejected() {
        let window = RxWindow::new();
        window.accept(100).expect("max");
        assert!(window.accept(100 - WINDOW_BITS - 1).is_err());
    }

    #[test]
    fn tx_counter_advances() {
        let counter = TxCounter::new(7);
        assert_eq!(counter.advance(), 7);
        assert_eq!(counter.advance(), 8);
        assert_eq!(counter.peek(), 9);
    }
}
