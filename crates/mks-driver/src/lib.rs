//! 驱动层
//!
//! 在协议层与 CAN 适配层之上提供：
//! - 总线仲裁（单一接收线程按 ID 路由，串行化发送）
//! - 命令生命周期跟踪（Created → Sent → Executing → Processed，超时扫描）
//! - 响应处理流水线（日志、状态检查、数据提取、就绪迁移、生命周期推进）
//! - 电机就绪状态机与后台任务（轮询、超时、恢复重试）
//! - 钩子系统：收发帧回调
//!
//! 大多数用户应该使用 `mks-sdk` 中的 [`MotorController`] 门面。

pub mod bus;
pub mod clock;
pub mod config;
pub mod context;
pub mod controller;
mod error;
pub mod hooks;
pub mod lifecycle;
pub mod metrics;
pub mod motor;
pub mod notify;
pub mod pipeline;
pub mod readiness;
mod thread;

pub use bus::{CanBus, RouteHandle};
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock, Timestamp};
pub use config::{
    BusConfig, ConfigError, DriverConfig, LifecycleConfig, MotorConfig, RecoveryConfig,
};
pub use context::{ContextHandle, MotorSnapshot, ReadinessRecord};
pub use controller::{ControllerBuilder, MotorController};
pub use error::DriverError;
pub use hooks::{FrameCallback, HookManager};
pub use lifecycle::{CommandState, CommandTracker, LifecycleEntry, LifecycleError};
pub use metrics::{DriverMetrics, MetricsSnapshot};
pub use motor::{AgentDeps, MotorAgent};
pub use notify::{Broadcaster, Notifier, NullNotifier};
pub use pipeline::{PipelineOutcome, ResponsePipeline, StageKind};
pub use readiness::{ReadinessError, ReadinessEvent, ReadinessFlags, ReadinessState};
