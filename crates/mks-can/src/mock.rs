//! 内存 CAN 总线（feature `mock`）
//!
//! `MockCanBus` 是测试侧持有的句柄：注入入站帧、检查已发送帧、
//! 设置自动应答、注入发送失败和总线告警。
//! `MockCanAdapter` 是交给驱动的一侧，实现与真实后端相同的 trait。

use crate::{BusAlert, CanAdapter, CanError, RxAdapter, ServoFrame, SplittableAdapter, TxAdapter};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mks_protocol::checksum;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// 默认接收超时
const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(5);

/// 自动应答函数：根据发出的帧生成零个或多个入站帧
pub type Responder = Box<dyn FnMut(&ServoFrame) -> Vec<ServoFrame> + Send>;

/// 发送失败注入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Timeout,
    Busy,
    NotRunning,
    BusOff,
}

impl MockFailure {
    fn to_error(self) -> CanError {
        match self {
            MockFailure::Timeout => CanError::Timeout,
            MockFailure::Busy => CanError::Busy,
            MockFailure::NotRunning => CanError::NotRunning,
            MockFailure::BusOff => CanError::BusOff,
        }
    }
}

struct Shared {
    inbound_tx: Sender<ServoFrame>,
    inbound_rx: Receiver<ServoFrame>,
    alert_tx: Sender<BusAlert>,
    alert_rx: Receiver<BusAlert>,
    sent: Mutex<Vec<ServoFrame>>,
    sent_cond: Condvar,
    responder: Mutex<Option<Responder>>,
    one_shot_failures: Mutex<VecDeque<MockFailure>>,
    sticky_failure: Mutex<Option<MockFailure>>,
    send_delay: Mutex<Duration>,
}

/// 测试侧句柄（可克隆）
#[derive(Clone)]
pub struct MockCanBus {
    shared: Arc<Shared>,
}

impl Default for MockCanBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockCanBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCanBus")
            .field("sent", &self.shared.sent.lock().len())
            .field("pending_inbound", &self.shared.inbound_rx.len())
            .finish()
    }
}

impl MockCanBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let (alert_tx, alert_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                inbound_tx,
                inbound_rx,
                alert_tx,
                alert_rx,
                sent: Mutex::new(Vec::new()),
                sent_cond: Condvar::new(),
                responder: Mutex::new(None),
                one_shot_failures: Mutex::new(VecDeque::new()),
                sticky_failure: Mutex::new(None),
                send_delay: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// 交给驱动的适配器
    pub fn adapter(&self) -> MockCanAdapter {
        MockCanAdapter {
            bus: self.clone(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }

    /// 注入一帧入站数据（模拟驱动器发来的帧）
    pub fn inject(&self, frame: ServoFrame) {
        let _ = self.shared.inbound_tx.send(frame);
    }

    /// 注入入站数据，自动补上校验和
    pub fn inject_with_checksum(&self, id: u16, body: &[u8]) {
        self.inject(frame_with_checksum(id, body));
    }

    /// 注入总线告警
    pub fn raise_alert(&self, alert: BusAlert) {
        let _ = self.shared.alert_tx.send(alert);
    }

    /// 已发送帧的快照
    pub fn sent(&self) -> Vec<ServoFrame> {
        self.shared.sent.lock().clone()
    }

    /// 取出并清空已发送帧
    pub fn take_sent(&self) -> Vec<ServoFrame> {
        std::mem::take(&mut *self.shared.sent.lock())
    }

    /// 等待已发送帧数达到 `count`，超时返回 `false`
    pub fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut sent = self.shared.sent.lock();
        while sent.len() < count {
            if self
                .shared
                .sent_cond
                .wait_until(&mut sent, deadline)
                .timed_out()
            {
                return sent.len() >= count;
            }
        }
        true
    }

    /// 等待出现满足条件的已发送帧
    pub fn wait_for_frame<F>(&self, timeout: Duration, mut predicate: F) -> Option<ServoFrame>
    where
        F: FnMut(&ServoFrame) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut sent = self.shared.sent.lock();
        loop {
            if let Some(frame) = sent.iter().find(|frame| predicate(frame)) {
                return Some(*frame);
            }
            if self
                .shared
                .sent_cond
                .wait_until(&mut sent, deadline)
                .timed_out()
            {
                return sent.iter().find(|frame| predicate(frame)).copied();
            }
        }
    }

    /// 设置自动应答（替换已有的）
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&ServoFrame) -> Vec<ServoFrame> + Send + 'static,
    {
        *self.shared.responder.lock() = Some(Box::new(responder));
    }

    pub fn clear_responder(&self) {
        *self.shared.responder.lock() = None;
    }

    /// 对每一帧回显命令码并应答状态 1（成功 / 已停止）
    pub fn ack_all(&self) {
        self.set_responder(|frame| match frame.command_byte() {
            Some(code) => vec![frame_with_checksum(frame.id, &[code, 0x01])],
            None => Vec::new(),
        });
    }

    /// 下一次发送失败
    pub fn fail_next_send(&self, failure: MockFailure) {
        self.shared.one_shot_failures.lock().push_back(failure);
    }

    /// 之后所有发送都失败，`None` 恢复正常
    pub fn set_sticky_failure(&self, failure: Option<MockFailure>) {
        *self.shared.sticky_failure.lock() = failure;
    }

    /// 每次发送的模拟耗时
    pub fn set_send_delay(&self, delay: Duration) {
        *self.shared.send_delay.lock() = delay;
    }

    fn transmit(&self, frame: ServoFrame) -> Result<(), CanError> {
        let delay = *self.shared.send_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let failure = self
            .shared
            .one_shot_failures
            .lock()
            .pop_front()
            .or(*self.shared.sticky_failure.lock());
        if let Some(failure) = failure {
            trace!("Mock send of ID=0x{:X} failed: {:?}", frame.id, failure);
            return Err(failure.to_error());
        }

        {
            let mut sent = self.shared.sent.lock();
            sent.push(frame);
            self.shared.sent_cond.notify_all();
        }

        let replies = match self.shared.responder.lock().as_mut() {
            Some(responder) => responder(&frame),
            None => Vec::new(),
        };
        for reply in replies {
            self.inject(reply);
        }
        Ok(())
    }
}

/// 给数据区追加校验和
pub fn frame_with_checksum(id: u16, body: &[u8]) -> ServoFrame {
    let mut bytes = body.to_vec();
    bytes.push(checksum(id, body));
    ServoFrame::new(id, &bytes)
}

/// 驱动侧适配器
#[derive(Debug)]
pub struct MockCanAdapter {
    bus: MockCanBus,
    receive_timeout: Duration,
}

impl CanAdapter for MockCanAdapter {
    fn send(&mut self, frame: ServoFrame) -> Result<(), CanError> {
        self.bus.transmit(frame)
    }

    fn receive(&mut self) -> Result<ServoFrame, CanError> {
        receive_from(&self.bus.shared.inbound_rx, self.receive_timeout)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        self.receive_timeout = timeout;
    }
}

impl SplittableAdapter for MockCanAdapter {
    type RxAdapter = MockRxAdapter;
    type TxAdapter = MockTxAdapter;

    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError> {
        let rx = MockRxAdapter {
            inbound: self.bus.shared.inbound_rx.clone(),
            alerts: self.bus.shared.alert_rx.clone(),
            timeout: self.receive_timeout,
        };
        let tx = MockTxAdapter { bus: self.bus };
        Ok((rx, tx))
    }
}

fn receive_from(inbound: &Receiver<ServoFrame>, timeout: Duration) -> Result<ServoFrame, CanError> {
    match inbound.recv_timeout(timeout) {
        Ok(frame) => Ok(frame),
        Err(RecvTimeoutError::Timeout) => Err(CanError::Timeout),
        Err(RecvTimeoutError::Disconnected) => Err(CanError::NotRunning),
    }
}

#[derive(Debug)]
pub struct MockRxAdapter {
    inbound: Receiver<ServoFrame>,
    alerts: Receiver<BusAlert>,
    timeout: Duration,
}

impl RxAdapter for MockRxAdapter {
    fn receive(&mut self) -> Result<ServoFrame, CanError> {
        receive_from(&self.inbound, self.timeout)
    }

    fn poll_alert(&mut self) -> Option<BusAlert> {
        self.alerts.try_recv().ok()
    }
}

#[derive(Debug)]
pub struct MockTxAdapter {
    bus: MockCanBus,
}

impl TxAdapter for MockTxAdapter {
    fn send(&mut self, frame: ServoFrame) -> Result<(), CanError> {
        self.bus.transmit(frame)
    }
}
