//! 通知端口
//!
//! 就绪状态迁移与总线告警以事件流的形式向外广播。
//! 订阅者各自持有一个无界 `Receiver`，丢弃后在下一次发布时被清理。

use crate::readiness::ReadinessEvent;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

/// 就绪事件的外部消费者
pub trait Notifier: Send + Sync {
    fn publish(&self, event: &ReadinessEvent);
}

/// 多订阅者广播
#[derive(Debug)]
pub struct Broadcaster<T> {
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone + Send> Broadcaster<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// 发送给所有仍然存活的订阅者，返回送达数
    pub fn send(&self, value: &T) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Notifier for Broadcaster<ReadinessEvent> {
    fn publish(&self, event: &ReadinessEvent) {
        self.send(event);
    }
}

/// 丢弃所有事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn publish(&self, _event: &ReadinessEvent) {}
}
