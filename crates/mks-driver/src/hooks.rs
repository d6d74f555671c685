//! 帧钩子
//!
//! 接收线程在路由前、发送路径在 `send()` 成功后触发已注册的回调，
//! 用于录制、抓包或调试面板。回调在总线线程上同步执行，必须非阻塞。
//!
//! ```rust
//! use mks_driver::hooks::{FrameCallback, HookManager};
//! use mks_protocol::ServoFrame;
//! use crossbeam_channel::{Sender, bounded};
//! use std::sync::Arc;
//!
//! struct Tap {
//!     tx: Sender<ServoFrame>,
//! }
//!
//! impl FrameCallback for Tap {
//!     fn on_frame_received(&self, frame: &ServoFrame) {
//!         let _ = self.tx.try_send(*frame);
//!     }
//! }
//!
//! let (tx, rx) = bounded(64);
//! let mut hooks = HookManager::new();
//! hooks.add_callback(Arc::new(Tap { tx }));
//! hooks.trigger_all(&ServoFrame::new(0x01, &[0x31, 0x32]));
//! assert!(rx.try_recv().is_ok());
//! ```

use mks_protocol::ServoFrame;
use std::sync::Arc;

/// 帧回调
///
/// 实现应当只做 `try_send` 一类的操作，不得持锁或做 I/O。
pub trait FrameCallback: Send + Sync {
    /// 收到帧（路由之前）
    fn on_frame_received(&self, frame: &ServoFrame);

    /// 帧已成功写入总线
    ///
    /// 发送失败的帧不会触发。
    fn on_frame_sent(&self, frame: &ServoFrame) {
        let _ = frame;
    }
}

/// 回调列表
///
/// 自身不做同步，由 [`CanBus`](crate::bus::CanBus) 放在 `RwLock` 里共享。
#[derive(Default)]
pub struct HookManager {
    callbacks: Vec<Arc<dyn FrameCallback>>,
}

impl HookManager {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    pub fn add_callback(&mut self, callback: Arc<dyn FrameCallback>) {
        self.callbacks.push(callback);
    }

    pub fn clear(&mut self) {
        self.callbacks.clear();
    }

    /// 接收线程调用
    pub fn trigger_all(&self, frame: &ServoFrame) {
        for callback in &self.callbacks {
            callback.on_frame_received(frame);
        }
    }

    /// 发送成功后调用
    pub fn trigger_all_sent(&self, frame: &ServoFrame) {
        for callback in &self.callbacks {
            callback.on_frame_sent(frame);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl std::fmt::Debug for HookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookManager")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Sender, bounded};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingTap {
        tx: Sender<(bool, ServoFrame)>,
        count: Arc<AtomicU64>,
    }

    impl FrameCallback for CountingTap {
        fn on_frame_received(&self, frame: &ServoFrame) {
            let _ = self.tx.try_send((false, *frame));
            self.count.fetch_add(1, Ordering::Relaxed);
        }

        fn on_frame_sent(&self, frame: &ServoFrame) {
            let _ = self.tx.try_send((true, *frame));
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct ReceiveOnly;

    impl FrameCallback for ReceiveOnly {
        fn on_frame_received(&self, _frame: &ServoFrame) {}
    }

    fn tap() -> (CountingTap, crossbeam_channel::Receiver<(bool, ServoFrame)>, Arc<AtomicU64>) {
        let (tx, rx) = bounded(8);
        let count = Arc::new(AtomicU64::new(0));
        (
            CountingTap {
                tx,
                count: count.clone(),
            },
            rx,
            count,
        )
    }

    #[test]
    fn test_trigger_received_and_sent() {
        let (callback, rx, count) = tap();
        let mut hooks = HookManager::new();
        hooks.add_callback(Arc::new(callback));

        let frame = ServoFrame::new(0x01, &[0xF1, 0x01, 0xF3]);
        hooks.trigger_all(&frame);
        hooks.trigger_all_sent(&frame);

        assert_eq!(count.load(Ordering::Relaxed), 2);
        assert_eq!(rx.try_recv().unwrap(), (false, frame));
        assert_eq!(rx.try_recv().unwrap(), (true, frame));
    }

    #[test]
    fn test_default_on_sent_is_noop() {
        let mut hooks = HookManager::new();
        hooks.add_callback(Arc::new(ReceiveOnly));
        hooks.trigger_all_sent(&ServoFrame::new(0x01, &[0x30, 0x31]));
        assert_eq!(hooks.len(), 1);
    }

    #[test]
    fn test_clear() {
        let (callback, _rx, _count) = tap();
        let mut hooks = HookManager::new();
        assert!(hooks.is_empty());
        hooks.add_callback(Arc::new(callback));
        hooks.clear();
        assert!(hooks.is_empty());
    }
}
