//! 类型化命令构造
//!
//! `Command` 只是"命令码 + 参数列表"，真正的字节布局由注册表决定。
//! 这里的构造函数负责把业务参数（方向、速度、加速度……）折叠成布局要求的字段。
//! 运动命令的速度超出 12 bit 时构造即失败，其余取值检查推迟到编码。

use crate::CodecError;
use crate::codec::PayloadValue;
use crate::codes::CommandCode;
use crate::schema::PayloadFieldType;
use smallvec::{SmallVec, smallvec};

/// 速度字段最大值（12 bit）
pub const MAX_SPEED: u16 = 0x0FFF;

/// 旋转方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    Clockwise,
    CounterClockwise,
}

impl Direction {
    fn bit(self) -> u16 {
        match self {
            Direction::Clockwise => 0,
            Direction::CounterClockwise => 1,
        }
    }
}

/// 速度只占 12 bit，超出时报告为第 0 个参数越界
fn checked_speed(speed: u16) -> Result<u16, CodecError> {
    if speed > MAX_SPEED {
        return Err(CodecError::ValueOutOfRange {
            index: 0,
            ty: PayloadFieldType::UInt16,
            value: i64::from(speed),
        });
    }
    Ok(speed)
}

/// 方向位（bit 15）与 12 bit 速度合并为一个 UInt16 字段
fn direction_speed(direction: Direction, speed: u16) -> Result<u16, CodecError> {
    Ok((direction.bit() << 15) | checked_speed(speed)?)
}

/// 待编码的命令
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Command {
    pub code: CommandCode,
    pub args: SmallVec<[PayloadValue; 4]>,
}

impl Command {
    /// 任意命令码 + 参数（类型检查推迟到编码）
    pub fn new(code: CommandCode, args: &[PayloadValue]) -> Self {
        Self {
            code,
            args: SmallVec::from_slice(args),
        }
    }

    /// 无参数命令
    pub fn bare(code: CommandCode) -> Self {
        Self {
            code,
            args: SmallVec::new(),
        }
    }

    fn with_u8(code: CommandCode, value: u8) -> Self {
        Self {
            code,
            args: smallvec![PayloadValue::uint8(value)],
        }
    }

    fn with_u16(code: CommandCode, value: u16) -> Self {
        Self {
            code,
            args: smallvec![PayloadValue::uint16(value)],
        }
    }

    // ---- 查询 ----

    pub fn query_motor_status() -> Self {
        Self::bare(CommandCode::QueryMotorStatus)
    }

    pub fn read_encoder_value_carry() -> Self {
        Self::bare(CommandCode::ReadEncoderValueCarry)
    }

    pub fn read_encoder_value_addition() -> Self {
        Self::bare(CommandCode::ReadEncoderValueAddition)
    }

    pub fn read_motor_speed() -> Self {
        Self::bare(CommandCode::ReadMotorSpeed)
    }

    pub fn read_shaft_protection_state() -> Self {
        Self::bare(CommandCode::ReadShaftProtectionState)
    }

    pub fn release_shaft_protection() -> Self {
        Self::bare(CommandCode::ReleaseShaftProtection)
    }

    // ---- 配置 ----

    /// 工作电流（mA）
    pub fn set_working_current(milliamps: u16) -> Self {
        Self::with_u16(CommandCode::SetWorkingCurrent, milliamps)
    }

    /// 保持电流（占工作电流的百分比档位，0x00 = 10% … 0x08 = 90%）
    pub fn set_holding_current(level: u8) -> Self {
        Self::with_u8(CommandCode::SetHoldingCurrent, level)
    }

    pub fn set_subdivisions(microsteps: u8) -> Self {
        Self::with_u8(CommandCode::SetSubdivisions, microsteps)
    }

    pub fn set_work_mode(mode: u8) -> Self {
        Self::with_u8(CommandCode::SetWorkMode, mode)
    }

    pub fn set_direction(direction: Direction) -> Self {
        Self::with_u8(CommandCode::SetDirection, direction.bit() as u8)
    }

    pub fn set_can_id(id: u16) -> Self {
        Self::with_u16(CommandCode::SetCanId, id)
    }

    pub fn set_group_id(id: u16) -> Self {
        Self::with_u16(CommandCode::SetGroupId, id)
    }

    /// 从机应答：`respond` 是否回复，`active` 是否主动上报完成
    pub fn set_slave_respond(respond: bool, active: bool) -> Self {
        Self {
            code: CommandCode::SetSlaveRespond,
            args: smallvec![
                PayloadValue::uint8(respond as u8),
                PayloadValue::uint8(active as u8)
            ],
        }
    }

    pub fn set_shaft_protection(enabled: bool) -> Self {
        Self::with_u8(CommandCode::SetShaftProtection, enabled as u8)
    }

    pub fn set_key_lock(locked: bool) -> Self {
        Self::with_u8(CommandCode::SetKeyLock, locked as u8)
    }

    /// 回零参数：触发电平、回零方向、回零速度、是否启用限位
    pub fn set_home(trigger_level: u8, direction: Direction, speed: u16, end_limit: bool) -> Self {
        Self {
            code: CommandCode::SetHome,
            args: smallvec![
                PayloadValue::uint8(trigger_level),
                PayloadValue::uint8(direction.bit() as u8),
                PayloadValue::uint16(speed),
                PayloadValue::uint8(end_limit as u8)
            ],
        }
    }

    // ---- 回零 / 运动 ----

    pub fn go_home() -> Self {
        Self::bare(CommandCode::GoHome)
    }

    pub fn set_current_axis_to_zero() -> Self {
        Self::bare(CommandCode::SetCurrentAxisToZero)
    }

    pub fn enable_motor(enabled: bool) -> Self {
        Self::with_u8(CommandCode::EnableMotor, enabled as u8)
    }

    pub fn emergency_stop() -> Self {
        Self::bare(CommandCode::EmergencyStop)
    }

    /// 速度模式：方向、速度（0..=4095 RPM）、加速度档位
    pub fn run_speed_mode(
        direction: Direction,
        speed: u16,
        acceleration: u8,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            code: CommandCode::RunSpeedMode,
            args: smallvec![
                PayloadValue::uint16(direction_speed(direction, speed)?),
                PayloadValue::uint8(acceleration)
            ],
        })
    }

    /// 按坐标绝对运动（坐标为编码器计数，24 bit 有符号）
    pub fn run_absolute_by_axis(
        speed: u16,
        acceleration: u8,
        axis: i32,
    ) -> Result<Self, CodecError> {
        Self::axis_motion(CommandCode::RunAbsoluteByAxis, speed, acceleration, axis)
    }

    /// 按坐标相对运动
    pub fn run_relative_by_axis(
        speed: u16,
        acceleration: u8,
        delta: i32,
    ) -> Result<Self, CodecError> {
        Self::axis_motion(CommandCode::RunRelativeByAxis, speed, acceleration, delta)
    }

    fn axis_motion(
        code: CommandCode,
        speed: u16,
        acceleration: u8,
        axis: i32,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            code,
            args: smallvec![
                PayloadValue::uint16(checked_speed(speed)?),
                PayloadValue::uint8(acceleration),
                PayloadValue::int24(axis)
            ],
        })
    }

    /// 按脉冲数相对运动
    pub fn run_relative_by_pulses(
        direction: Direction,
        speed: u16,
        acceleration: u8,
        pulses: u32,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            code: CommandCode::RunRelativeByPulses,
            args: smallvec![
                PayloadValue::uint16(direction_speed(direction, speed)?),
                PayloadValue::uint8(acceleration),
                PayloadValue::uint24(pulses)
            ],
        })
    }

    /// 按脉冲数绝对运动
    pub fn run_absolute_by_pulses(
        speed: u16,
        acceleration: u8,
        pulses: i32,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            code: CommandCode::RunAbsoluteByPulses,
            args: smallvec![
                PayloadValue::uint16(checked_speed(speed)?),
                PayloadValue::uint8(acceleration),
                PayloadValue::int24(pulses)
            ],
        })
    }
}
