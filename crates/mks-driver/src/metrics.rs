//! 驱动运行指标
//!
//! 原子计数器，由总线线程与电机工作线程更新，任意线程可读取快照。

use std::sync::atomic::{AtomicU64, Ordering};

/// 驱动实时指标
///
/// ```rust
/// use mks_driver::DriverMetrics;
/// use std::sync::atomic::Ordering;
///
/// let metrics = DriverMetrics::new();
/// metrics.rx_frames_total.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(metrics.snapshot().rx_frames_total, 1);
/// ```
#[derive(Debug, Default)]
pub struct DriverMetrics {
    /// 接收的总帧数
    pub rx_frames_total: AtomicU64,
    /// 没有路由目标而被丢弃的帧数
    pub rx_frames_unrouted: AtomicU64,
    /// 接收超时次数（空闲总线上是正常现象）
    pub rx_timeouts: AtomicU64,
    /// 接收错误次数
    pub rx_errors: AtomicU64,
    /// 成功发送的总帧数
    pub tx_frames_total: AtomicU64,
    /// 发送失败次数
    pub tx_errors: AtomicU64,
    /// 等待发送锁超时（`Busy`）次数
    pub tx_busy: AtomicU64,
    /// 总线告警次数
    pub bus_alerts: AtomicU64,
    /// 经过流水线处理的响应帧数
    pub responses_processed: AtomicU64,
    /// 状态字节为 0 的响应数
    pub protocol_errors: AtomicU64,
    /// 解码失败（校验和、越界等）次数
    pub decode_errors: AtomicU64,
    /// 命令超时次数
    pub command_timeouts: AtomicU64,
}

impl DriverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rx_frames_total: self.rx_frames_total.load(Ordering::Relaxed),
            rx_frames_unrouted: self.rx_frames_unrouted.load(Ordering::Relaxed),
            rx_timeouts: self.rx_timeouts.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            tx_frames_total: self.tx_frames_total.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            tx_busy: self.tx_busy.load(Ordering::Relaxed),
            bus_alerts: self.bus_alerts.load(Ordering::Relaxed),
            responses_processed: self.responses_processed.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            command_timeouts: self.command_timeouts.load(Ordering::Relaxed),
        }
    }

    /// 重置所有计数器
    pub fn reset(&self) {
        for counter in [
            &self.rx_frames_total,
            &self.rx_frames_unrouted,
            &self.rx_timeouts,
            &self.rx_errors,
            &self.tx_frames_total,
            &self.tx_errors,
            &self.tx_busy,
            &self.bus_alerts,
            &self.responses_processed,
            &self.protocol_errors,
            &self.decode_errors,
            &self.command_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
    pub rx_frames_total: u64,
    pub rx_frames_unrouted: u64,
    pub rx_timeouts: u64,
    pub rx_errors: u64,
    pub tx_frames_total: u64,
    pub tx_errors: u64,
    pub tx_busy: u64,
    pub bus_alerts: u64,
    pub responses_processed: u64,
    pub protocol_errors: u64,
    pub decode_errors: u64,
    pub command_timeouts: u64,
}

impl MetricsSnapshot {
    /// 未路由帧占比（百分比），没有接收时返回 0.0
    pub fn unrouted_rate(&self) -> f64 {
        if self.rx_frames_total == 0 {
            return 0.0;
        }
        (self.rx_frames_unrouted as f64 / self.rx_frames_total as f64) * 100.0
    }

    /// 发送失败占比（百分比）
    pub fn tx_error_rate(&self) -> f64 {
        let attempts = self.tx_frames_total + self.tx_errors;
        if attempts == 0 {
            return 0.0;
        }
        (self.tx_errors as f64 / attempts as f64) * 100.0
    }
}
