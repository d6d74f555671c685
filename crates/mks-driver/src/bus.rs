//! 总线仲裁层
//!
//! 一条物理总线对应一个 `CanBus`：
//!
//! - 一个常驻接收线程，按 CAN ID 把入站帧分发到各电机的路由通道
//! - 一把发送锁，串行化所有电机的 `transmit`（可配置等待上限，超时返回 `Busy`）
//! - 总线告警（bus-off、被动错误等）以广播流的形式交给上层
//!
//! 接收线程不会因为任何错误退出，只有 `CanBus` 被丢弃时才停止。

use crate::clock::SharedClock;
use crate::config::BusConfig;
use crate::hooks::{FrameCallback, HookManager};
use crate::metrics::DriverMetrics;
use crate::notify::Broadcaster;
use crate::thread::{JOIN_TIMEOUT, JoinTimeout};
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, unbounded};
use mks_can::{BusAlert, CanError, RxAdapter, SplittableAdapter, TxAdapter};
use mks_protocol::{MotorId, ServoFrame};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

type RouteTable = HashMap<MotorId, Sender<ServoFrame>>;

/// 某个电机的入站帧通道
///
/// 帧按接收顺序排队；同一 ID 重新注册后旧句柄收不到新帧。
#[derive(Debug)]
pub struct RouteHandle {
    motor_id: MotorId,
    frames: Receiver<ServoFrame>,
}

impl RouteHandle {
    pub fn motor_id(&self) -> MotorId {
        self.motor_id
    }

    pub fn receiver(&self) -> &Receiver<ServoFrame> {
        &self.frames
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<ServoFrame> {
        self.frames.recv_timeout(timeout).ok()
    }
}

struct BusShared {
    tx: Mutex<Box<dyn TxAdapter + Send>>,
    routes: ArcSwap<RouteTable>,
    alerts: Broadcaster<BusAlert>,
    hooks: RwLock<HookManager>,
    metrics: Arc<DriverMetrics>,
    clock: SharedClock,
    lock_timeout: Option<Duration>,
    receive_backoff: Duration,
    is_running: AtomicBool,
}

impl BusShared {
    fn on_receive(&self, frame: ServoFrame) {
        if let Some(hooks) = self.hooks.try_read() {
            hooks.trigger_all(&frame);
        }

        let routes = self.routes.load();
        let delivered = routes
            .get(&frame.id)
            .is_some_and(|route| route.send(frame).is_ok());
        if !delivered {
            DriverMetrics::incr(&self.metrics.rx_frames_unrouted);
            warn!(
                "Dropping frame for unregistered motor 0x{:03X} [{}]",
                frame.id,
                frame.hex_dump()
            );
        }
    }

    fn raise_alert(&self, alert: BusAlert) {
        DriverMetrics::incr(&self.metrics.bus_alerts);
        if alert.is_fatal() {
            error!("CAN bus alert: {}", alert);
        } else {
            warn!("CAN bus alert: {}", alert);
        }
        self.alerts.send(&alert);
    }
}

/// 总线仲裁层
pub struct CanBus {
    shared: Arc<BusShared>,
    rx_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CanBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanBus")
            .field("routes", &self.shared.routes.load().len())
            .field("is_running", &self.is_running())
            .finish()
    }
}

impl CanBus {
    /// 拆分适配器并启动接收线程
    pub fn new<A>(
        mut adapter: A,
        config: &BusConfig,
        clock: SharedClock,
        metrics: Arc<DriverMetrics>,
    ) -> Result<Self, CanError>
    where
        A: SplittableAdapter,
    {
        let receive_timeout = Duration::from_millis(config.receive_timeout_ms.max(1));
        adapter.set_receive_timeout(receive_timeout);
        let (rx, tx) = adapter.split()?;

        let shared = Arc::new(BusShared {
            tx: Mutex::new(Box::new(tx)),
            routes: ArcSwap::from_pointee(RouteTable::new()),
            alerts: Broadcaster::new(),
            hooks: RwLock::new(HookManager::new()),
            metrics,
            clock,
            lock_timeout: config.transmit_lock_timeout(),
            receive_backoff: receive_timeout,
            is_running: AtomicBool::new(true),
        });

        let rx_shared = shared.clone();
        let rx_thread = std::thread::Builder::new()
            .name("mks-can-rx".into())
            .spawn(move || rx_loop(rx, rx_shared))
            .map_err(CanError::Io)?;

        Ok(Self {
            shared,
            rx_thread: Some(rx_thread),
        })
    }

    /// 为电机注册入站路由（覆盖同 ID 的旧路由）
    pub fn register(&self, motor_id: MotorId) -> RouteHandle {
        let (tx, rx) = unbounded();
        self.shared.routes.rcu(|routes| {
            let mut routes = RouteTable::clone(routes);
            routes.insert(motor_id, tx.clone());
            routes
        });
        debug!("Registered route for motor 0x{:03X}", motor_id);
        RouteHandle {
            motor_id,
            frames: rx,
        }
    }

    pub fn unregister(&self, motor_id: MotorId) -> bool {
        let previous = self.shared.routes.rcu(|routes| {
            let mut routes = RouteTable::clone(routes);
            routes.remove(&motor_id);
            routes
        });
        previous.contains_key(&motor_id)
    }

    pub fn is_registered(&self, motor_id: MotorId) -> bool {
        self.shared.routes.load().contains_key(&motor_id)
    }

    /// 发送一帧
    ///
    /// 所有电机共用一把发送锁；配置了等待上限时，等锁超时返回 `CanError::Busy`。
    /// 同一调用方的帧按调用顺序发出。
    pub fn transmit(&self, frame: ServoFrame) -> Result<(), CanError> {
        let result = {
            let mut tx = match self.shared.lock_timeout {
                Some(timeout) => match self.shared.tx.try_lock_for(timeout) {
                    Some(tx) => tx,
                    None => {
                        DriverMetrics::incr(&self.shared.metrics.tx_busy);
                        warn!(
                            "Transmit lock not acquired within {:?} for motor 0x{:03X}",
                            timeout, frame.id
                        );
                        return Err(CanError::Busy);
                    },
                },
                None => self.shared.tx.lock(),
            };
            tx.send(frame)
        };

        match result {
            Ok(()) => {
                DriverMetrics::incr(&self.shared.metrics.tx_frames_total);
                trace!("TX 0x{:03X} [{}]", frame.id, frame.hex_dump());
                if let Some(hooks) = self.shared.hooks.try_read() {
                    hooks.trigger_all_sent(&frame);
                }
                Ok(())
            },
            Err(err) => {
                DriverMetrics::incr(&self.shared.metrics.tx_errors);
                error!("TX 0x{:03X} failed: {}", frame.id, err);
                if matches!(err, CanError::BusOff) {
                    self.shared.raise_alert(BusAlert::BusOff);
                }
                Err(err)
            },
        }
    }

    /// 把一帧当作刚从总线收到的帧处理（路由或丢弃）
    pub fn on_receive(&self, frame: ServoFrame) {
        self.shared.on_receive(frame);
    }

    pub fn subscribe_alerts(&self) -> Receiver<BusAlert> {
        self.shared.alerts.subscribe()
    }

    /// 从驱动侧上报告警（例如上层检测到的异常）
    pub fn raise_alert(&self, alert: BusAlert) {
        self.shared.raise_alert(alert);
    }

    pub fn add_hook(&self, callback: Arc<dyn FrameCallback>) {
        self.shared.hooks.write().add_callback(callback);
    }

    pub fn hooks(&self) -> &RwLock<HookManager> {
        &self.shared.hooks
    }

    pub fn metrics(&self) -> &Arc<DriverMetrics> {
        &self.shared.metrics
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running.load(Ordering::Acquire)
    }
}

impl Drop for CanBus {
    fn drop(&mut self) {
        self.shared.is_running.store(false, Ordering::Release);
        if let Some(handle) = self.rx_thread.take()
            && handle.join_timeout(JOIN_TIMEOUT).is_err()
        {
            error!("CAN RX thread did not exit within {:?}", JOIN_TIMEOUT);
        }
    }
}

/// 接收线程主循环
fn rx_loop(mut rx: impl RxAdapter, shared: Arc<BusShared>) {
    let mut bus_off = false;

    while shared.is_running.load(Ordering::Acquire) {
        match rx.receive() {
            Ok(mut frame) => {
                DriverMetrics::incr(&shared.metrics.rx_frames_total);
                if frame.timestamp_us == 0 {
                    frame.timestamp_us = shared.clock.now_us();
                }
                if bus_off {
                    // 能收到帧说明控制器已经重新上线
                    bus_off = false;
                    shared.raise_alert(BusAlert::BusRecovered);
                }
                shared.on_receive(frame);
            },
            Err(CanError::Timeout) => {
                DriverMetrics::incr(&shared.metrics.rx_timeouts);
            },
            Err(CanError::BusOff) => {
                DriverMetrics::incr(&shared.metrics.rx_errors);
                if !bus_off {
                    bus_off = true;
                    shared.raise_alert(BusAlert::BusOff);
                }
                std::thread::sleep(shared.receive_backoff);
            },
            Err(err) => {
                DriverMetrics::incr(&shared.metrics.rx_errors);
                error!("CAN RX error: {}", err);
                if !err.is_transient() {
                    std::thread::sleep(shared.receive_backoff);
                }
            },
        }

        while let Some(alert) = rx.poll_alert() {
            match alert {
                BusAlert::BusOff if bus_off => continue,
                BusAlert::BusOff => bus_off = true,
                BusAlert::BusRecovered if !bus_off => continue,
                BusAlert::BusRecovered => bus_off = false,
                _ => {},
            }
            shared.raise_alert(alert);
        }
    }

    trace!("CAN RX thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use mks_can::{MockCanBus, MockFailure};
    use std::sync::atomic::AtomicU64;

    const WAIT: Duration = Duration::from_secs(2);

    fn bus_with(config: BusConfig) -> (MockCanBus, CanBus) {
        let mock = MockCanBus::new();
        let bus = CanBus::new(
            mock.adapter(),
            &config,
            Arc::new(MonotonicClock::new()),
            Arc::new(DriverMetrics::new()),
        )
        .unwrap();
        (mock, bus)
    }

    fn bus() -> (MockCanBus, CanBus) {
        bus_with(BusConfig::default())
    }

    #[test]
    fn test_routes_by_id() {
        let (mock, bus) = bus();
        let one = bus.register(0x01);
        let two = bus.register(0x02);

        mock.inject_with_checksum(0x02, &[0xF1, 0x01]);
        mock.inject_with_checksum(0x01, &[0x83, 0x01]);

        let frame = one.recv_timeout(WAIT).unwrap();
        assert_eq!(frame.data_slice()[0], 0x83);
        assert_ne!(frame.timestamp_us, 0);
        assert_eq!(two.recv_timeout(WAIT).unwrap().data_slice()[0], 0xF1);
    }

    #[test]
    fn test_unrouted_frame_is_counted_and_dropped() {
        let (mock, bus) = bus();
        let route = bus.register(0x01);
        mock.inject_with_checksum(0x09, &[0xF1, 0x01]);
        mock.inject_with_checksum(0x01, &[0xF1, 0x01]);

        // 0x01 的帧在 0x09 之后，收到它说明 0x09 已经处理完
        assert!(route.recv_timeout(WAIT).is_some());
        assert_eq!(bus.metrics().snapshot().rx_frames_unrouted, 1);
    }

    #[test]
    fn test_register_overwrites_and_unregister() {
        let (_mock, bus) = bus();
        let old = bus.register(0x01);
        let new = bus.register(0x01);

        bus.on_receive(ServoFrame::new(0x01, &[0xF1, 0x01, 0xF3]));
        assert!(new.receiver().try_recv().is_ok());
        assert!(old.receiver().try_recv().is_err());

        assert!(bus.unregister(0x01));
        assert!(!bus.unregister(0x01));
        assert!(!bus.is_registered(0x01));
    }

    #[test]
    fn test_transmit_records_and_counts() {
        let (mock, bus) = bus();
        bus.transmit(ServoFrame::new(0x01, &[0xF1, 0xF2])).unwrap();
        assert_eq!(mock.sent().len(), 1);
        assert_eq!(bus.metrics().snapshot().tx_frames_total, 1);
    }

    #[test]
    fn test_transmit_error_is_propagated() {
        let (mock, bus) = bus();
        mock.fail_next_send(MockFailure::NotRunning);
        assert!(matches!(
            bus.transmit(ServoFrame::new(0x01, &[0xF1, 0xF2])),
            Err(CanError::NotRunning)
        ));
        assert_eq!(bus.metrics().snapshot().tx_errors, 1);
        // 之后的发送不受影响
        assert!(bus.transmit(ServoFrame::new(0x01, &[0xF1, 0xF2])).is_ok());
    }

    #[test]
    fn test_transmit_bus_off_raises_alert() {
        let (mock, bus) = bus();
        let alerts = bus.subscribe_alerts();
        mock.fail_next_send(MockFailure::BusOff);
        assert!(bus.transmit(ServoFrame::new(0x01, &[0xF1, 0xF2])).is_err());
        assert_eq!(alerts.recv_timeout(WAIT).unwrap(), BusAlert::BusOff);
    }

    #[test]
    fn test_bounded_lock_wait_returns_busy() {
        let (mock, bus) = bus_with(BusConfig {
            transmit_lock_timeout_ms: 5,
            ..BusConfig::default()
        });
        let bus = Arc::new(bus);
        mock.set_send_delay(Duration::from_millis(200));

        let holder = {
            let bus = bus.clone();
            std::thread::spawn(move || bus.transmit(ServoFrame::new(0x01, &[0xF1, 0xF2])))
        };
        // 等持锁线程进入发送
        std::thread::sleep(Duration::from_millis(50));

        let result = bus.transmit(ServoFrame::new(0x02, &[0xF1, 0xF3]));
        assert!(matches!(result, Err(CanError::Busy)));
        assert_eq!(bus.metrics().snapshot().tx_busy, 1);
        assert!(holder.join().unwrap().is_ok());
    }

    #[test]
    fn test_alerts_are_fanned_out() {
        let (mock, bus) = bus();
        let a = bus.subscribe_alerts();
        let b = bus.subscribe_alerts();

        mock.raise_alert(BusAlert::ErrorPassive);
        assert_eq!(a.recv_timeout(WAIT).unwrap(), BusAlert::ErrorPassive);
        assert_eq!(b.recv_timeout(WAIT).unwrap(), BusAlert::ErrorPassive);
    }

    #[test]
    fn test_duplicate_bus_off_is_suppressed() {
        let (mock, bus) = bus();
        let alerts = bus.subscribe_alerts();
        mock.raise_alert(BusAlert::BusOff);
        mock.raise_alert(BusAlert::BusOff);
        mock.raise_alert(BusAlert::BusRecovered);

        assert_eq!(alerts.recv_timeout(WAIT).unwrap(), BusAlert::BusOff);
        assert_eq!(alerts.recv_timeout(WAIT).unwrap(), BusAlert::BusRecovered);
        assert!(alerts.recv_timeout(Duration::from_millis(50)).is_err());
    }

    struct Counter(AtomicU64, AtomicU64);

    impl FrameCallback for Counter {
        fn on_frame_received(&self, _frame: &ServoFrame) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }

        fn on_frame_sent(&self, _frame: &ServoFrame) {
            self.1.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_hooks_see_rx_and_tx() {
        let (mock, bus) = bus();
        let counter = Arc::new(Counter(AtomicU64::new(0), AtomicU64::new(0)));
        bus.add_hook(counter.clone());
        let route = bus.register(0x01);

        bus.transmit(ServoFrame::new(0x01, &[0xF1, 0xF2])).unwrap();
        mock.inject_with_checksum(0x01, &[0xF1, 0x01]);
        assert!(route.recv_timeout(WAIT).is_some());

        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
        assert_eq!(counter.1.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drop_stops_rx_thread() {
        let (_mock, bus) = bus();
        assert!(bus.is_running());
        drop(bus);
    }
}
