//! 时钟端口
//!
//! 驱动内部所有时间戳都是单调时钟下的微秒数（`u64`），
//! 测试中用 [`ManualClock`] 精确控制超时。

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 时间戳（微秒）
pub type Timestamp = u64;

pub trait Clock: Send + Sync + Debug {
    fn now_us(&self) -> Timestamp;
}

/// 共享时钟句柄
pub type SharedClock = Arc<dyn Clock>;

/// 单调时钟，以构造时刻为零点
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> Timestamp {
        // 从 1 开始，0 保留给"时间戳不可用"
        self.origin.elapsed().as_micros() as u64 + 1
    }
}

/// 手动推进的时钟
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_us: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start_us),
        }
    }

    pub fn set(&self, now_us: Timestamp) {
        self.now.store(now_us, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(by.as_micros() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> Timestamp {
        self.now.load(Ordering::Acquire)
    }
}

/// 毫秒转微秒
pub(crate) fn ms_to_us(ms: u64) -> u64 {
    ms.saturating_mul(1_000)
}
