//! 电机就绪状态机
//!
//! ```text
//! Uninitialized → Initializing → Recovering → Ready
//!                      │              ↑  │      │
//!                      │              │  ↓      ↓
//!                      └──────────→  Error ←────┘
//! ```
//!
//! 迁移本身由 [`ContextHandle`](crate::context::ContextHandle) 在上下文锁内完成，
//! 这里只定义状态、合法性表和对外的无锁镜像。

use mks_protocol::MotorId;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use thiserror::Error;

/// 就绪状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ReadinessState {
    /// 唯一的初始状态
    #[default]
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Error = 3,
    Recovering = 4,
}

impl ReadinessState {
    /// 无效值按 Uninitialized 处理
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::Error,
            4 => Self::Recovering,
            _ => Self::Uninitialized,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// 合法迁移表（不含同状态迁移，那是调用方处理的空操作）
    pub fn can_transition_to(self, to: ReadinessState) -> bool {
        use ReadinessState::*;
        matches!(
            (self, to),
            (Uninitialized, Initializing)
                | (Initializing, Recovering | Ready | Error)
                | (Ready, Error | Recovering)
                | (Error, Recovering)
                | (Recovering, Ready | Error)
        )
    }

    /// 处于该状态时是否应运行定时轮询
    pub fn polls(self) -> bool {
        self == ReadinessState::Ready
    }

    /// 命令超时在这些状态下会把电机打入 Error
    pub fn is_supervised(self) -> bool {
        matches!(
            self,
            ReadinessState::Ready | ReadinessState::Recovering | ReadinessState::Initializing
        )
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadinessState::Uninitialized => "Uninitialized",
            ReadinessState::Initializing => "Initializing",
            ReadinessState::Ready => "Ready",
            ReadinessState::Error => "Error",
            ReadinessState::Recovering => "Recovering",
        };
        f.write_str(name)
    }
}

/// 就绪状态机错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("Illegal readiness transition for motor 0x{motor_id:03X}: {from} -> {to}")]
    IllegalTransition {
        motor_id: MotorId,
        from: ReadinessState,
        to: ReadinessState,
    },
}

/// 就绪状态迁移通知
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ReadinessEvent {
    pub motor_id: MotorId,
    pub from: ReadinessState,
    pub to: ReadinessState,
    /// 迁移时刻（微秒）
    pub at_us: u64,
    /// 触发原因（日志与诊断用）
    pub reason: String,
}

/// 就绪状态的无锁镜像
///
/// 只在上下文锁内写入；外部调用方可以随时读取，
/// 读到的值至多落后一次正在进行的迁移。
#[derive(Debug, Default)]
pub struct ReadinessFlags {
    state: AtomicU8,
    ready: AtomicBool,
    error: AtomicBool,
}

impl ReadinessFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ReadinessState {
        ReadinessState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    pub(crate) fn store(&self, state: ReadinessState) {
        self.ready
            .store(state == ReadinessState::Ready, Ordering::Release);
        self.error
            .store(state == ReadinessState::Error, Ordering::Release);
        self.state.store(state.as_u8(), Ordering::Release);
    }
}
