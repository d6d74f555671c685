//! 多电机控制器
//!
//! 一条总线 + 若干电机代理 + 一个告警监督线程。
//! 监督线程把总线级事件扇出到所有电机：bus-off 让每个电机进入 Error，
//! 总线恢复后（按配置）对处于 Error 的电机发起恢复。

use crate::bus::CanBus;
use crate::clock::{MonotonicClock, SharedClock};
use crate::config::DriverConfig;
use crate::context::MotorSnapshot;
use crate::error::DriverError;
use crate::hooks::FrameCallback;
use crate::lifecycle::{CommandState, CommandTracker};
use crate::metrics::{DriverMetrics, MetricsSnapshot};
use crate::motor::{AgentDeps, MotorAgent};
use crate::notify::Broadcaster;
use crate::readiness::{ReadinessEvent, ReadinessState};
use crate::thread::{JOIN_TIMEOUT, JoinTimeout};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use mks_can::{BusAlert, SplittableAdapter};
use mks_protocol::{Command, CommandCode, FrameCodec, MotorId, PayloadValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// 控制器构造器
///
/// # Example
///
/// ```no_run
/// use mks_driver::{ControllerBuilder, DriverConfig, MotorConfig};
///
/// let config = DriverConfig::default().with_motor(MotorConfig::new(0x01));
/// # #[cfg(target_os = "linux")]
/// let controller = ControllerBuilder::new(config).build_socketcan().unwrap();
/// ```
pub struct ControllerBuilder {
    config: DriverConfig,
    codec: FrameCodec,
    clock: Option<SharedClock>,
    hooks: Vec<Arc<dyn FrameCallback>>,
    auto_start: bool,
}

impl ControllerBuilder {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            codec: FrameCodec::standard(),
            clock: None,
            hooks: Vec::new(),
            auto_start: true,
        }
    }

    pub fn codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    /// 替换驱动时钟（测试中用 `ManualClock`）
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn hook(mut self, callback: Arc<dyn FrameCallback>) -> Self {
        self.hooks.push(callback);
        self
    }

    /// 构造后是否立即对所有电机执行上线流程（默认是）
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn build<A>(self, adapter: A) -> Result<MotorController, DriverError>
    where
        A: SplittableAdapter,
    {
        self.config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let metrics = Arc::new(DriverMetrics::new());
        let bus = Arc::new(CanBus::new(
            adapter,
            &self.config.bus,
            clock.clone(),
            metrics.clone(),
        )?);
        for hook in self.hooks {
            bus.add_hook(hook);
        }

        let tracker = Arc::new(CommandTracker::new(
            clock.clone(),
            self.config.lifecycle.max_history,
        ));
        let notifications = Arc::new(Broadcaster::<ReadinessEvent>::new());
        let deps = AgentDeps {
            bus: bus.clone(),
            tracker: tracker.clone(),
            codec: self.codec,
            clock,
            notifier: notifications.clone(),
            lifecycle: self.config.lifecycle.clone(),
            recovery: self.config.recovery.clone(),
        };

        let mut agents = BTreeMap::new();
        for motor in &self.config.motors {
            let agent = MotorAgent::spawn(motor.clone(), deps.clone(), metrics.clone())?;
            agents.insert(motor.id, Arc::new(agent));
        }
        let agents = Arc::new(agents);

        let (stop_tx, stop_rx) = bounded(1);
        let supervisor = {
            let alerts = bus.subscribe_alerts();
            let agents = agents.clone();
            let recover_on_bus_recovered = self.config.recovery.recover_on_bus_recovered;
            std::thread::Builder::new()
                .name("mks-supervisor".into())
                .spawn(move || supervise(alerts, stop_rx, agents, recover_on_bus_recovered))
                .map_err(|err| DriverError::Can(err.into()))?
        };

        let controller = MotorController {
            config: self.config,
            bus,
            agents,
            tracker,
            notifications,
            metrics,
            codec: self.codec,
            stop: Some(stop_tx),
            supervisor: Some(supervisor),
        };

        if self.auto_start {
            for agent in controller.agents.values() {
                // 上线失败时电机停在 Error，由恢复逻辑接手
                if let Err(err) = agent.start() {
                    warn!("{}: start failed: {}", agent.config().display_name(), err);
                }
            }
        }

        info!(
            "Controller started on {} with {} motor(s)",
            controller.config.bus.interface,
            controller.agents.len()
        );
        Ok(controller)
    }

    /// 打开配置中的 SocketCAN 接口
    #[cfg(target_os = "linux")]
    pub fn build_socketcan(self) -> Result<MotorController, DriverError> {
        let adapter = mks_can::SocketCanAdapter::new(self.config.bus.interface.clone())?;
        self.build(adapter)
    }
}

/// 告警监督线程
fn supervise(
    alerts: Receiver<BusAlert>,
    stop: Receiver<()>,
    agents: Arc<BTreeMap<MotorId, Arc<MotorAgent>>>,
    recover_on_bus_recovered: bool,
) {
    loop {
        select! {
            recv(alerts) -> alert => match alert {
                Ok(BusAlert::BusOff) => {
                    for agent in agents.values() {
                        agent.fail("CAN bus off");
                    }
                },
                Ok(BusAlert::BusRecovered) if recover_on_bus_recovered => {
                    for agent in agents.values() {
                        if agent.readiness() == ReadinessState::Error
                            && let Err(err) = agent.recover()
                        {
                            warn!("{}: recovery failed: {}", agent.config().display_name(), err);
                        }
                    }
                },
                Ok(_) => {},
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
}

/// 多电机控制器
pub struct MotorController {
    config: DriverConfig,
    bus: Arc<CanBus>,
    agents: Arc<BTreeMap<MotorId, Arc<MotorAgent>>>,
    tracker: Arc<CommandTracker>,
    notifications: Arc<Broadcaster<ReadinessEvent>>,
    metrics: Arc<DriverMetrics>,
    codec: FrameCodec,
    stop: Option<Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MotorController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotorController")
            .field("interface", &self.config.bus.interface)
            .field("motors", &self.motor_ids())
            .finish()
    }
}

impl MotorController {
    fn agent(&self, motor_id: MotorId) -> Result<&Arc<MotorAgent>, DriverError> {
        self.agents
            .get(&motor_id)
            .ok_or(DriverError::UnknownMotor(motor_id))
    }

    /// 以命令码 + 参数下发（参数按注册表布局检查）
    pub fn issue_command(
        &self,
        motor_id: MotorId,
        code: CommandCode,
        args: &[PayloadValue],
    ) -> Result<(), DriverError> {
        self.send(motor_id, &Command::new(code, args))
    }

    pub fn send(&self, motor_id: MotorId, command: &Command) -> Result<(), DriverError> {
        self.agent(motor_id)?.issue_command(command)
    }

    pub fn current_state(&self, motor_id: MotorId) -> Result<MotorSnapshot, DriverError> {
        Ok(self.agent(motor_id)?.snapshot())
    }

    pub fn readiness(&self, motor_id: MotorId) -> Result<ReadinessState, DriverError> {
        Ok(self.agent(motor_id)?.readiness())
    }

    pub fn lifecycle(&self, motor_id: MotorId, code: CommandCode) -> Option<CommandState> {
        self.tracker.state_of(motor_id, code)
    }

    pub fn start(&self, motor_id: MotorId) -> Result<(), DriverError> {
        self.agent(motor_id)?.start()
    }

    pub fn recover(&self, motor_id: MotorId) -> Result<(), DriverError> {
        self.agent(motor_id)?.recover()
    }

    /// 恢复所有处于 Error 的电机，返回各自的结果
    pub fn recover_all(&self) -> Vec<(MotorId, Result<(), DriverError>)> {
        self.agents
            .iter()
            .filter(|(_, agent)| agent.readiness() == ReadinessState::Error)
            .map(|(&id, agent)| (id, agent.recover()))
            .collect()
    }

    /// 订阅所有电机的就绪迁移
    pub fn subscribe(&self) -> Receiver<ReadinessEvent> {
        self.notifications.subscribe()
    }

    pub fn subscribe_alerts(&self) -> Receiver<BusAlert> {
        self.bus.subscribe_alerts()
    }

    /// 阻塞直到电机进入 Ready
    pub fn wait_until_ready(&self, motor_id: MotorId, timeout: Duration) -> Result<(), DriverError> {
        let agent = self.agent(motor_id)?;
        let deadline = Instant::now() + timeout;
        while !agent.is_ready() {
            if Instant::now() >= deadline {
                return Err(DriverError::NotReady {
                    motor_id,
                    state: agent.readiness(),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    pub fn motor_ids(&self) -> Vec<MotorId> {
        self.agents.keys().copied().collect()
    }

    pub fn bus(&self) -> &Arc<CanBus> {
        &self.bus
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for MotorController {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.supervisor.take()
            && handle.join_timeout(JOIN_TIMEOUT).is_err()
        {
            error!("Supervisor thread did not exit within {:?}", JOIN_TIMEOUT);
        }
    }
}
