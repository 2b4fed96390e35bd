//! MRP（Message Reliability Protocol）：不可靠通道上的重传退避。
//!
//! # 退避公式（What）
//! - 首轮等待 = 基准间隔 × 1.1（基准取对端的 active/idle 间隔，视其
//!   活跃状态而定）；
//! - 后续每轮 = 上一轮 × (1 + jitter)，jitter ∈ [0, 0.25] 每轮重抽；
//! - 总传输次数上限 [`MAX_TRANSMISSIONS`]，耗尽后按
//!   `exchange.no_response_timeout` 处理。

use rand::Rng;
use std::time::Duration;

/// 单帧总传输次数上限（含首传）。
pub const MAX_TRANSMISSIONS: u32 = 5;

/// 首轮退避的放大系数。
pub const BACKOFF_MARGIN: f64 = 1.1;

/// 每轮重传的抖动上限。
pub const JITTER_CEILING: f64 = 0.25;

/// 标准 MRP 独立确认的安全通道 opcode。
pub const STANDALONE_ACK_OPCODE: u8 = 0x10;

/// 一帧的重传节奏器。
///
/// # 契约说明（What）
/// - `next_delay` 第 n 次调用返回第 n 轮的等待时长并推进内部状态；
/// - 超过传输上限后返回 `None`，调用方应停止重传并上报超时。
#[derive(Debug)]
pub struct RetransmissionSchedule {
    current: Duration,
    sent: u32,
}

impl RetransmissionSchedule {
    /// 以会话基准间隔起步。
    pub fn new(base_interval: Duration) -> Self {
        Self {
            current: base_interval.mul_f64(BACKOFF_MARGIN),
            sent: 1,
        }
    }

    /// 下一轮等待时长；`None` 表示传输次数已耗尽。
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.sent >= MAX_TRANSMISSIONS {
            return None;
        }
        let delay = self.current;
        let jitter = rand::thread_rng().gen_range(0.0..=JITTER_CEILING);
        self.current = self.current.mul_f64(1.0 + jitter);
        self.sent += 1;
        Some(delay)
    }

    /// 已执行的传输次数（含首传）。
    pub fn transmissions(&self) -> u32 {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_monotonic_and_bounded() {
        let mut schedule = RetransmissionSchedule::new(Duration::from_millis(300));
        let mut delays = Vec::new();
        while let Some(delay) = schedule.next_delay() {
            delays.push(delay);
        }
        // 首传之外最多 4 轮重传。
        assert_eq!(delays.len() as u32, MAX_TRANSMISSIONS - 1);
        assert_eq!(delays[0], Duration::from_millis(300).mul_f64(BACKOFF_MARGIN));
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0], "backoff must not shrink");
            assert!(
                pair[1] <= pair[0].mul_f64(1.0 + JITTER_CEILING + 1e-9),
                "jitter bounded by 25%"
            );
        }
    }
}
