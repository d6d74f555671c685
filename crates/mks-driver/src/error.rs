//! 驱动层错误类型定义

use crate::config::ConfigError;
use crate::lifecycle::LifecycleError;
use crate::readiness::{ReadinessError, ReadinessState};
use mks_can::CanError;
use mks_protocol::{CodecError, MotorId};
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// CAN 传输错误
    #[error("CAN transport error: {0}")]
    Can(#[from] CanError),

    /// 编解码错误（调用点本地恢复，不会发出任何帧）
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// 命令生命周期错误
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// 就绪状态机错误
    #[error("Readiness error: {0}")]
    Readiness(#[from] ReadinessError),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// 未注册的电机
    #[error("Unknown motor 0x{0:03X}")]
    UnknownMotor(MotorId),

    /// 电机未就绪，拒绝下发命令
    #[error("Motor 0x{motor_id:03X} is not ready (state: {state})")]
    NotReady {
        motor_id: MotorId,
        state: ReadinessState,
    },

    /// 后台线程已退出
    #[error("Channel closed")]
    ChannelClosed,
}
