//! 响应状态字节的语义枚举

use num_enum::{FromPrimitive, IntoPrimitive};

/// 电机运行状态（`QUERY_MOTOR_STATUS` 的 `motor_status` 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, FromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum MovingState {
    /// 查询失败
    Error = 0,
    Stopped = 1,
    Accelerating = 2,
    Decelerating = 3,
    FullSpeed = 4,
    Homing = 5,
    Calibrating = 6,
    /// 尚未查询或无法识别（同时作为 num_enum 的兜底值）
    #[default]
    Unknown = 0xFF,
}

impl MovingState {
    /// 由解码出的字段值转换（超出 u8 的值视为 Unknown）
    pub fn from_field(value: i64) -> Self {
        u8::try_from(value).map(Self::from).unwrap_or(Self::Unknown)
    }

    /// 电机是否处于运动中
    pub fn is_moving(self) -> bool {
        matches!(
            self,
            MovingState::Accelerating
                | MovingState::Decelerating
                | MovingState::FullSpeed
                | MovingState::Homing
        )
    }
}

/// 运动类命令的应答状态（`run_status`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum RunStatus {
    Failed = 0,
    Started = 1,
    Completed = 2,
    /// 触发限位后停止
    StoppedAtLimit = 3,
    #[num_enum(default)]
    Unknown = 0xFF,
}

impl RunStatus {
    pub fn from_field(value: i64) -> Self {
        u8::try_from(value).map(Self::from).unwrap_or(Self::Unknown)
    }

    /// 命令已经执行结束（成功或限位停止）
    pub fn is_finished(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::StoppedAtLimit)
    }
}

/// 设置类命令的应答状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum AckStatus {
    Failed = 0,
    Success = 1,
    #[num_enum(default)]
    Other = 0xFF,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_state_from_field() {
        assert_eq!(MovingState::from_field(0), MovingState::Error);
        assert_eq!(MovingState::from_field(4), MovingState::FullSpeed);
        assert_eq!(MovingState::from_field(6), MovingState::Calibrating);
        assert_eq!(MovingState::from_field(7), MovingState::Unknown);
        assert_eq!(MovingState::from_field(-1), MovingState::Unknown);
        assert_eq!(MovingState::from_field(300), MovingState::Unknown);
    }

    #[test]
    fn test_moving_state_is_moving() {
        assert!(MovingState::FullSpeed.is_moving());
        assert!(!MovingState::Stopped.is_moving());
        assert!(!MovingState::Unknown.is_moving());
    }

    #[test]
    fn test_run_status() {
        assert_eq!(RunStatus::from_field(1), RunStatus::Started);
        assert!(RunStatus::from_field(2).is_finished());
        assert!(RunStatus::from_field(3).is_finished());
        assert!(!RunStatus::Started.is_finished());
        assert_eq!(RunStatus::from_field(9), RunStatus::Unknown);
    }

    #[test]
    fn test_ack_status() {
        assert_eq!(AckStatus::from(0), AckStatus::Failed);
        assert_eq!(AckStatus::from(1), AckStatus::Success);
        assert_eq!(AckStatus::from(2), AckStatus::Other);
    }
}
