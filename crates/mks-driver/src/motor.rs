//! 电机代理
//!
//! 每个电机一个后台工作线程，按顺序处理：
//!
//! - 路由过来的入站帧（逐帧走响应流水线）
//! - 本地就绪事件（进入 Ready 开始定时轮询，进入 Error 停止轮询并安排重试）
//! - 定时器：状态轮询、位置轮询、生命周期超时扫描、恢复重试
//!
//! 命令从调用线程直接下发（编码 → 登记生命周期 → 标记 Sent → 发送），
//! 工作线程只负责响应与定时任务。

use crate::bus::{CanBus, RouteHandle};
use crate::clock::{SharedClock, Timestamp, ms_to_us};
use crate::config::{LifecycleConfig, MotorConfig, RecoveryConfig};
use crate::context::{ContextHandle, MotorSnapshot};
use crate::error::DriverError;
use crate::lifecycle::{CommandState, CommandTracker};
use crate::metrics::DriverMetrics;
use crate::notify::Notifier;
use crate::pipeline::{ResponsePipeline, StageContext};
use crate::readiness::{ReadinessEvent, ReadinessState};
use crate::thread::{JOIN_TIMEOUT, JoinTimeout};
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use mks_protocol::{Command, CommandCode, FrameCodec, MotorId, ServoFrame};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// 工作线程最长空闲时间（定时器精度）
const MAX_IDLE: Duration = Duration::from_millis(10);

/// 电机代理依赖的共享组件
#[derive(Clone)]
pub struct AgentDeps {
    pub bus: Arc<CanBus>,
    pub tracker: Arc<CommandTracker>,
    pub codec: FrameCodec,
    pub clock: SharedClock,
    pub notifier: Arc<dyn Notifier>,
    pub lifecycle: LifecycleConfig,
    pub recovery: RecoveryConfig,
}

/// 调用线程与工作线程共享的部分
struct AgentCore {
    config: MotorConfig,
    context: Arc<ContextHandle>,
    bus: Arc<CanBus>,
    tracker: Arc<CommandTracker>,
    codec: FrameCodec,
    clock: SharedClock,
    command_timeout_us: u64,
}

impl AgentCore {
    fn id(&self) -> MotorId {
        self.config.id
    }

    /// 编码并下发一条命令（不检查就绪状态）
    ///
    /// 编码失败时不登记、不发送；生命周期条目在发送前标记为 Sent，
    /// 发送失败时条目与电机都进入 Error。
    fn dispatch(&self, command: &Command) -> Result<(), DriverError> {
        let id = self.id();
        let code = command.code;
        let frame = self.codec.encode_command(id, command)?;

        let deadline = self.clock.now_us().saturating_add(self.command_timeout_us);
        self.tracker.register_sent(id, code, deadline);

        if let Err(err) = self.bus.transmit(frame) {
            if let Err(lifecycle_err) = self.tracker.transition(id, code, CommandState::Error) {
                debug!("{}", lifecycle_err);
            }
            self.context
                .fail(&format!("transmit of {} failed: {}", code.name(), err));
            return Err(err.into());
        }

        trace!("{}: sent {}", self.config.display_name(), code.name());
        Ok(())
    }

    fn issue(&self, command: &Command) -> Result<(), DriverError> {
        if !self.context.is_ready() {
            return Err(DriverError::NotReady {
                motor_id: self.id(),
                state: self.context.readiness(),
            });
        }
        self.dispatch(command)
    }

    /// 进入 Recovering 并下发基线配置
    ///
    /// 基线响应由流水线确认，电机随后进入 Ready。
    /// 任何一步下发失败（包括编码失败）都让电机进入 Error。
    fn bring_up(&self, reason: &str) -> Result<(), DriverError> {
        self.context.transition(ReadinessState::Recovering, reason)?;

        for command in self.baseline() {
            if let Err(err) = self.dispatch(&command) {
                self.context
                    .fail(&format!("baseline {} failed: {}", command.code.name(), err));
                return Err(err);
            }
        }
        Ok(())
    }

    fn baseline(&self) -> Vec<Command> {
        let mut commands = Vec::with_capacity(4);
        if let Some(milliamps) = self.config.working_current_ma {
            commands.push(Command::set_working_current(milliamps));
        }
        if let Some(level) = self.config.holding_current_level() {
            commands.push(Command::set_holding_current(level));
        }
        if let Some(microsteps) = self.config.subdivisions {
            commands.push(Command::set_subdivisions(microsteps));
        }
        // 总是以状态查询确认总线可达
        commands.push(Command::query_motor_status());
        commands
    }
}

enum Control {
    Shutdown,
}

/// 电机代理
pub struct MotorAgent {
    core: Arc<AgentCore>,
    control: Sender<Control>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MotorAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotorAgent")
            .field("motor_id", &self.core.id())
            .field("readiness", &self.core.context.flags().state())
            .finish()
    }
}

impl MotorAgent {
    /// 创建代理（进入 Initializing）并启动工作线程
    pub fn spawn(
        config: MotorConfig,
        deps: AgentDeps,
        metrics: Arc<DriverMetrics>,
    ) -> Result<Self, DriverError> {
        let (event_tx, event_rx) = unbounded();
        let context = Arc::new(ContextHandle::new(
            config.id,
            event_tx,
            deps.notifier.clone(),
            deps.clock.clone(),
        ));
        context.transition(ReadinessState::Initializing, "agent created")?;

        let route = deps.bus.register(config.id);
        let core = Arc::new(AgentCore {
            config,
            context,
            bus: deps.bus,
            tracker: deps.tracker,
            codec: deps.codec,
            clock: deps.clock,
            command_timeout_us: ms_to_us(deps.lifecycle.command_timeout_ms),
        });

        let (control_tx, control_rx) = unbounded();
        let worker = Worker::new(
            core.clone(),
            route,
            event_rx,
            control_rx,
            metrics,
            &deps.lifecycle,
            &deps.recovery,
        );
        let thread_name = format!("mks-motor-{:03x}", core.id());
        let worker = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker.run())
            .map_err(|err| DriverError::Can(err.into()))?;

        Ok(Self {
            core,
            control: control_tx,
            worker: Some(worker),
        })
    }

    pub fn motor_id(&self) -> MotorId {
        self.core.id()
    }

    pub fn config(&self) -> &MotorConfig {
        &self.core.config
    }

    pub fn context(&self) -> &Arc<ContextHandle> {
        &self.core.context
    }

    pub fn readiness(&self) -> ReadinessState {
        self.core.context.readiness()
    }

    pub fn is_ready(&self) -> bool {
        self.core.context.is_ready()
    }

    /// 首次上线：Initializing → Recovering + 基线命令
    pub fn start(&self) -> Result<(), DriverError> {
        self.core.bring_up("start")
    }

    /// 外部恢复：Error → Recovering + 基线命令
    pub fn recover(&self) -> Result<(), DriverError> {
        self.core.bring_up("recover")
    }

    /// 下发命令（要求 Ready）
    pub fn issue_command(&self, command: &Command) -> Result<(), DriverError> {
        self.core.issue(command)
    }

    /// 强制进入 Error
    pub fn fail(&self, reason: &str) -> bool {
        self.core.context.fail(reason)
    }

    pub fn snapshot(&self) -> MotorSnapshot {
        self.core.context.snapshot()
    }

    pub fn lifecycle(&self, code: CommandCode) -> Option<CommandState> {
        self.core.tracker.state_of(self.core.id(), code)
    }
}

impl Drop for MotorAgent {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(handle) = self.worker.take()
            && handle.join_timeout(JOIN_TIMEOUT).is_err()
        {
            error!(
                "{}: worker thread did not exit within {:?}",
                self.core.config.display_name(),
                JOIN_TIMEOUT
            );
        }
        self.core.bus.unregister(self.core.id());
        self.core.tracker.remove_motor(self.core.id());
    }
}

/// 周期定时器（基于驱动时钟）
#[derive(Debug, Clone, Copy)]
struct Periodic {
    period_us: u64,
    next_us: Option<Timestamp>,
}

impl Periodic {
    fn new(period_ms: u64) -> Self {
        Self {
            period_us: ms_to_us(period_ms),
            next_us: None,
        }
    }

    fn enabled(&self) -> bool {
        self.period_us > 0
    }

    fn arm(&mut self, now: Timestamp) {
        if self.enabled() {
            self.next_us = Some(now.saturating_add(self.period_us));
        }
    }

    fn disarm(&mut self) {
        self.next_us = None;
    }

    /// 到期则重新排期并返回 `true`
    fn fire(&mut self, now: Timestamp) -> bool {
        match self.next_us {
            Some(next) if now >= next => {
                self.next_us = Some(now.saturating_add(self.period_us));
                true
            },
            _ => false,
        }
    }
}

struct Worker {
    core: Arc<AgentCore>,
    route: RouteHandle,
    events: Receiver<ReadinessEvent>,
    control: Receiver<Control>,
    metrics: Arc<DriverMetrics>,
    pipeline: ResponsePipeline,
    status_poll: Periodic,
    position_poll: Periodic,
    sweep: Periodic,
    retry_interval_us: u64,
    auto_recover: bool,
    retry_at: Option<Timestamp>,
    idle: Duration,
}

impl Worker {
    fn new(
        core: Arc<AgentCore>,
        route: RouteHandle,
        events: Receiver<ReadinessEvent>,
        control: Receiver<Control>,
        metrics: Arc<DriverMetrics>,
        lifecycle: &LifecycleConfig,
        recovery: &RecoveryConfig,
    ) -> Self {
        let status_poll = Periodic::new(core.config.status_poll_ms);
        let position_poll = Periodic::new(core.config.position_poll_ms);
        let mut sweep = Periodic::new(lifecycle.sweep_interval_ms.max(1));
        sweep.arm(core.clock.now_us());
        let idle = Duration::from_millis(lifecycle.sweep_interval_ms.max(1)).min(MAX_IDLE);

        Self {
            core,
            route,
            events,
            control,
            metrics,
            pipeline: ResponsePipeline::standard(),
            status_poll,
            position_poll,
            sweep,
            retry_interval_us: ms_to_us(recovery.retry_interval_ms),
            auto_recover: recovery.auto_recover,
            retry_at: None,
            idle,
        }
    }

    fn run(mut self) {
        let name = self.core.config.display_name();
        debug!("{}: worker started", name);
        let frames = self.route.receiver().clone();
        let events = self.events.clone();
        let control = self.control.clone();

        loop {
            select! {
                recv(frames) -> frame => match frame {
                    Ok(frame) => self.on_frame(frame),
                    Err(_) => {
                        warn!("{}: route closed, worker exiting", name);
                        break;
                    },
                },
                recv(events) -> event => {
                    if let Ok(event) = event {
                        self.on_event(&event);
                    }
                },
                recv(control) -> msg => match msg {
                    Ok(Control::Shutdown) | Err(_) => break,
                },
                default(self.idle) => {},
            }
            self.on_tick(self.core.clock.now_us());
        }

        debug!("{}: worker stopped", name);
    }

    fn on_frame(&self, frame: ServoFrame) {
        let ctx = StageContext {
            motor_id: self.core.id(),
            context: &self.core.context,
            tracker: &self.core.tracker,
            codec: &self.core.codec,
            metrics: &self.metrics,
        };
        let outcome = self.pipeline.process(&ctx, &frame);
        if let Some(stage) = outcome.halted_at {
            trace!(
                "{}: pipeline halted at {} for [{}]",
                self.core.config.display_name(),
                stage,
                frame.hex_dump()
            );
        }
    }

    fn on_event(&mut self, event: &ReadinessEvent) {
        let now = self.core.clock.now_us();
        if event.to.polls() {
            self.status_poll.arm(now);
            self.position_poll.arm(now);
        } else {
            self.status_poll.disarm();
            self.position_poll.disarm();
        }

        if event.to == ReadinessState::Error {
            if self.auto_recover {
                self.retry_at = Some(now.saturating_add(self.retry_interval_us));
            }
        } else {
            self.retry_at = None;
        }
    }

    fn on_tick(&mut self, now: Timestamp) {
        if self.sweep.fire(now) {
            self.sweep_timeouts(now);
        }

        if self.status_poll.fire(now) {
            self.poll(Command::query_motor_status());
        }
        if self.position_poll.fire(now) {
            self.poll(Command::read_encoder_value_addition());
        }

        if let Some(at) = self.retry_at
            && now >= at
        {
            self.retry_at = None;
            if self.core.context.readiness() == ReadinessState::Error {
                info!("{}: retrying recovery", self.core.config.display_name());
                if let Err(err) = self.core.bring_up("automatic retry") {
                    warn!("{}: recovery failed: {}", self.core.config.display_name(), err);
                }
            }
        }
    }

    fn sweep_timeouts(&self, now: Timestamp) {
        let expired = self.core.tracker.sweep_motor(self.core.id(), now);
        if expired.is_empty() {
            return;
        }

        for code in &expired {
            DriverMetrics::incr(&self.metrics.command_timeouts);
            warn!(
                "{}: {} timed out",
                self.core.config.display_name(),
                code.name()
            );
        }
        if self.core.context.readiness().is_supervised() {
            self.core
                .context
                .fail(&format!("{} timed out", expired[0].name()));
        }
    }

    /// 上一次同类轮询仍未应答时跳过，避免覆盖掉即将超时的条目
    fn poll(&self, command: Command) {
        if self.core.tracker.state_of(self.core.id(), command.code) == Some(CommandState::Sent) {
            trace!(
                "{}: {} still outstanding, skipping poll",
                self.core.config.display_name(),
                command.code.name()
            );
            return;
        }
        if let Err(err) = self.core.dispatch(&command) {
            debug!(
                "{}: poll {} failed: {}",
                self.core.config.display_name(),
                command.code.name(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BusConfig;
    use crate::notify::NullNotifier;
    use mks_can::mock::frame_with_checksum;
    use mks_can::{MockCanBus, MockFailure};

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        mock: MockCanBus,
        clock: Arc<ManualClock>,
        deps: AgentDeps,
        metrics: Arc<DriverMetrics>,
    }

    fn fixture() -> Fixture {
        let mock = MockCanBus::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let metrics = Arc::new(DriverMetrics::new());
        let bus = Arc::new(
            CanBus::new(
                mock.adapter(),
                &BusConfig::default(),
                clock.clone(),
                metrics.clone(),
            )
            .unwrap(),
        );
        let deps = AgentDeps {
            bus,
            tracker: Arc::new(CommandTracker::new(clock.clone(), 16)),
            codec: FrameCodec::standard(),
            clock: clock.clone(),
            notifier: Arc::new(NullNotifier),
            lifecycle: LifecycleConfig::default(),
            recovery: RecoveryConfig {
                auto_recover: false,
                ..RecoveryConfig::default()
            },
        };
        Fixture {
            mock,
            clock,
            deps,
            metrics,
        }
    }

    fn wait_for(mut predicate: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + WAIT;
        while std::time::Instant::now() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        predicate()
    }

    #[test]
    fn test_spawn_enters_initializing() {
        let f = fixture();
        let agent = MotorAgent::spawn(MotorConfig::new(0x01), f.deps.clone(), f.metrics).unwrap();
        assert_eq!(agent.readiness(), ReadinessState::Initializing);
        assert!(f.deps.bus.is_registered(0x01));
    }

    #[test]
    fn test_issue_requires_ready() {
        let f = fixture();
        let agent = MotorAgent::spawn(MotorConfig::new(0x01), f.deps.clone(), f.metrics).unwrap();
        let err = agent.issue_command(&Command::go_home()).unwrap_err();
        assert!(matches!(
            err,
            DriverError::NotReady {
                motor_id: 0x01,
                state: ReadinessState::Initializing
            }
        ));
        assert!(f.mock.sent().is_empty());
    }

    #[test]
    fn test_start_sends_baseline_and_becomes_ready() {
        let f = fixture();
        f.mock.ack_all();
        let config = MotorConfig {
            working_current_ma: Some(1600),
            holding_current_percent: Some(50),
            subdivisions: Some(16),
            ..MotorConfig::new(0x01)
        };
        let agent = MotorAgent::spawn(config, f.deps.clone(), f.metrics).unwrap();
        agent.start().unwrap();

        let codes: Vec<u8> = f
            .mock
            .sent()
            .iter()
            .filter_map(|frame| frame.command_byte())
            .collect();
        assert_eq!(codes, vec![0x83, 0x9B, 0x84, 0xF1]);
        // 保持电流 50% → 档位 4
        assert_eq!(f.mock.sent()[1].data_slice()[1], 0x04);

        assert!(wait_for(|| agent.is_ready()));
        assert!(wait_for(|| {
            agent.lifecycle(CommandCode::QueryMotorStatus) == Some(CommandState::Processed)
        }));
    }

    #[test]
    fn test_transmit_failure_moves_to_error() {
        let f = fixture();
        let agent = MotorAgent::spawn(MotorConfig::new(0x01), f.deps.clone(), f.metrics).unwrap();
        f.mock.fail_next_send(MockFailure::NotRunning);

        assert!(agent.start().is_err());
        assert_eq!(agent.readiness(), ReadinessState::Error);
        assert_eq!(
            agent.lifecycle(CommandCode::QueryMotorStatus),
            Some(CommandState::Error)
        );
        assert!(agent.snapshot().last_error.unwrap().contains("transmit"));
    }

    #[test]
    fn test_codec_error_sends_nothing() {
        let f = fixture();
        f.mock.ack_all();
        let agent = MotorAgent::spawn(MotorConfig::new(0x01), f.deps.clone(), f.metrics).unwrap();
        agent.start().unwrap();
        assert!(wait_for(|| agent.is_ready()));
        f.mock.take_sent();

        let bad = Command::new(CommandCode::GoHome, &[mks_protocol::PayloadValue::uint8(1)]);
        assert!(matches!(
            agent.issue_command(&bad),
            Err(DriverError::Codec(_))
        ));
        assert!(f.mock.sent().is_empty());
        assert!(agent.is_ready());
    }

    #[test]
    fn test_unencodable_baseline_moves_to_error() {
        let f = fixture();
        f.mock.ack_all();
        // 0x0F + 0xF1 ≡ 0 (mod 256)：状态查询帧的校验和为 0，编码被拒绝
        let agent = MotorAgent::spawn(MotorConfig::new(0x0F), f.deps.clone(), f.metrics).unwrap();

        assert!(matches!(agent.start(), Err(DriverError::Codec(_))));
        assert_eq!(agent.readiness(), ReadinessState::Error);
        assert!(
            agent
                .snapshot()
                .last_error
                .unwrap()
                .contains("QUERY_MOTOR_STATUS")
        );
        assert!(f.mock.sent().is_empty());
    }

    #[test]
    fn test_concurrent_issue_of_same_command() {
        let f = fixture();
        f.mock.ack_all();
        let agent = Arc::new(
            MotorAgent::spawn(MotorConfig::new(0x01), f.deps.clone(), f.metrics).unwrap(),
        );
        agent.start().unwrap();
        assert!(wait_for(|| agent.is_ready()));
        f.mock.take_sent();

        let issuers: Vec<_> = (0..2)
            .map(|_| {
                let agent = agent.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        agent.issue_command(&Command::query_motor_status()).unwrap();
                    }
                })
            })
            .collect();
        for issuer in issuers {
            issuer.join().unwrap();
        }
        let sent = f
            .mock
            .sent()
            .iter()
            .filter(|frame| frame.command_byte() == Some(0xF1))
            .count();
        assert_eq!(sent, 200);
    }

    #[test]
    fn test_timeout_moves_to_error() {
        let f = fixture();
        // 不应答
        let agent = MotorAgent::spawn(MotorConfig::new(0x01), f.deps.clone(), f.metrics.clone())
            .unwrap();
        agent.start().unwrap();
        assert_eq!(agent.readiness(), ReadinessState::Recovering);

        f.clock.advance(Duration::from_millis(600));
        assert!(wait_for(|| agent.readiness() == ReadinessState::Error));
        assert_eq!(
            agent.lifecycle(CommandCode::QueryMotorStatus),
            Some(CommandState::Timeout)
        );
        assert_eq!(f.metrics.snapshot().command_timeouts, 1);
    }

    #[test]
    fn test_status_polling_starts_when_ready() {
        let f = fixture();
        f.mock.ack_all();
        let config = MotorConfig {
            status_poll_ms: 100,
            ..MotorConfig::new(0x01)
        };
        let agent = MotorAgent::spawn(config, f.deps.clone(), f.metrics).unwrap();
        agent.start().unwrap();
        assert!(wait_for(|| agent.is_ready()));
        // 等工作线程处理完 Ready 事件
        std::thread::sleep(Duration::from_millis(50));
        f.mock.take_sent();

        f.clock.advance(Duration::from_millis(150));
        assert!(
            f.mock
                .wait_for_frame(WAIT, |frame| frame.command_byte() == Some(0xF1))
                .is_some()
        );
    }

    #[test]
    fn test_auto_recover_retries_after_error() {
        let mut f = fixture();
        f.deps.recovery = RecoveryConfig {
            auto_recover: true,
            retry_interval_ms: 200,
            ..RecoveryConfig::default()
        };
        let agent = MotorAgent::spawn(MotorConfig::new(0x01), f.deps.clone(), f.metrics).unwrap();
        f.mock.fail_next_send(MockFailure::NotRunning);
        assert!(agent.start().is_err());
        assert_eq!(agent.readiness(), ReadinessState::Error);

        f.mock.ack_all();
        std::thread::sleep(Duration::from_millis(50));
        f.clock.advance(Duration::from_millis(250));
        assert!(wait_for(|| agent.is_ready()));
    }

    #[test]
    fn test_drop_unregisters() {
        let f = fixture();
        let agent = MotorAgent::spawn(MotorConfig::new(0x01), f.deps.clone(), f.metrics).unwrap();
        drop(agent);
        assert!(!f.deps.bus.is_registered(0x01));
    }

    #[test]
    fn test_periodic_timer() {
        let mut timer = Periodic::new(10);
        assert!(!timer.fire(100_000));
        timer.arm(0);
        assert!(!timer.fire(9_999));
        assert!(timer.fire(10_000));
        assert!(!timer.fire(10_001));
        timer.disarm();
        assert!(!timer.fire(1_000_000));
        assert!(!Periodic::new(0).enabled());
    }
}
