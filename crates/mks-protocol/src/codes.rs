//! 命令码定义
//!
//! 每个命令码占 1 字节，位于帧的 byte 0；驱动器在响应中原样回显。

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 协议命令码（封闭集合，编译期已知）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive, IntoPrimitive,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum CommandCode {
    // ---- 读取参数 ----
    /// 读取编码器值（进位形式）
    ReadEncoderValueCarry = 0x30,
    /// 读取编码器值（累加形式）
    ReadEncoderValueAddition = 0x31,
    /// 读取实时转速（RPM）
    ReadMotorSpeed = 0x32,
    /// 读取已接收脉冲数
    ReadPulseCount = 0x33,
    /// 读取 IO 端口状态
    ReadIoStatus = 0x34,
    /// 读取原始编码器累加值
    ReadRawEncoderAddition = 0x35,
    /// 读取电机轴角度误差
    ReadShaftAngleError = 0x39,
    /// 读取 En 引脚状态
    ReadEnPinStatus = 0x3A,
    /// 读取上电回零状态
    ReadPowerOnHomeStatus = 0x3B,
    /// 解除堵转保护
    ReleaseShaftProtection = 0x3D,
    /// 读取堵转保护状态
    ReadShaftProtectionState = 0x3E,
    /// 恢复出厂参数
    RestoreDefaults = 0x3F,
    /// 重启驱动器
    Restart = 0x41,

    // ---- 设置参数 ----
    /// 校准编码器
    Calibrate = 0x80,
    /// 设置工作模式
    SetWorkMode = 0x82,
    /// 设置工作电流（mA）
    SetWorkingCurrent = 0x83,
    /// 设置细分
    SetSubdivisions = 0x84,
    /// 设置 En 引脚有效电平
    SetEnPinActive = 0x85,
    /// 设置电机旋转正方向
    SetDirection = 0x86,
    /// 设置自动熄屏
    SetAutoScreenOff = 0x87,
    /// 设置堵转保护
    SetShaftProtection = 0x88,
    /// 设置细分插补
    SetInterpolation = 0x89,
    /// 设置 CAN 波特率
    SetCanBitrate = 0x8A,
    /// 设置 CAN ID
    SetCanId = 0x8B,
    /// 设置从机应答/主动上报
    SetSlaveRespond = 0x8C,
    /// 设置组 ID
    SetGroupId = 0x8D,
    /// 设置按键锁定
    SetKeyLock = 0x8F,

    // ---- 回零 ----
    /// 设置回零参数
    SetHome = 0x90,
    /// 执行回零
    GoHome = 0x91,
    /// 将当前位置设为零点
    SetCurrentAxisToZero = 0x92,
    /// 设置上电回零模式
    SetZeroMode = 0x9A,
    /// 设置保持电流百分比
    SetHoldingCurrent = 0x9B,
    /// 限位端口重映射
    SetLimitPortRemap = 0x9E,

    // ---- 运动控制 ----
    /// 查询电机运行状态
    QueryMotorStatus = 0xF1,
    /// 使能/失能电机
    EnableMotor = 0xF3,
    /// 按坐标相对运动
    RunRelativeByAxis = 0xF4,
    /// 按坐标绝对运动
    RunAbsoluteByAxis = 0xF5,
    /// 速度模式运行
    RunSpeedMode = 0xF6,
    /// 紧急停止
    EmergencyStop = 0xF7,
    /// 按脉冲数相对运动
    RunRelativeByPulses = 0xFD,
    /// 按脉冲数绝对运动
    RunAbsoluteByPulses = 0xFE,
    /// 保存/清除速度模式参数
    SaveSpeedMode = 0xFF,
}

impl CommandCode {
    /// 全部命令码（按数值升序）
    pub const ALL: [CommandCode; 42] = [
        CommandCode::ReadEncoderValueCarry,
        CommandCode::ReadEncoderValueAddition,
        CommandCode::ReadMotorSpeed,
        CommandCode::ReadPulseCount,
        CommandCode::ReadIoStatus,
        CommandCode::ReadRawEncoderAddition,
        CommandCode::ReadShaftAngleError,
        CommandCode::ReadEnPinStatus,
        CommandCode::ReadPowerOnHomeStatus,
        CommandCode::ReleaseShaftProtection,
        CommandCode::ReadShaftProtectionState,
        CommandCode::RestoreDefaults,
        CommandCode::Restart,
        CommandCode::Calibrate,
        CommandCode::SetWorkMode,
        CommandCode::SetWorkingCurrent,
        CommandCode::SetSubdivisions,
        CommandCode::SetEnPinActive,
        CommandCode::SetDirection,
        CommandCode::SetAutoScreenOff,
        CommandCode::SetShaftProtection,
        CommandCode::SetInterpolation,
        CommandCode::SetCanBitrate,
        CommandCode::SetCanId,
        CommandCode::SetSlaveRespond,
        CommandCode::SetGroupId,
        CommandCode::SetKeyLock,
        CommandCode::SetHome,
        CommandCode::GoHome,
        CommandCode::SetCurrentAxisToZero,
        CommandCode::SetZeroMode,
        CommandCode::SetHoldingCurrent,
        CommandCode::SetLimitPortRemap,
        CommandCode::QueryMotorStatus,
        CommandCode::EnableMotor,
        CommandCode::RunRelativeByAxis,
        CommandCode::RunAbsoluteByAxis,
        CommandCode::RunSpeedMode,
        CommandCode::EmergencyStop,
        CommandCode::RunRelativeByPulses,
        CommandCode::RunAbsoluteByPulses,
        CommandCode::SaveSpeedMode,
    ];

    /// 命令码字节值
    pub fn as_u8(self) -> u8 {
        self.into()
    }

    /// 从字节解析（未知命令码返回 `None`）
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::try_from(value).ok()
    }

    /// 日志用的命令名（协议手册中的大写写法）
    pub fn name(self) -> &'static str {
        match self {
            CommandCode::ReadEncoderValueCarry => "READ_ENCODER_VALUE_CARRY",
            CommandCode::ReadEncoderValueAddition => "READ_ENCODER_VALUE_ADDITION",
            CommandCode::ReadMotorSpeed => "READ_MOTOR_SPEED",
            CommandCode::ReadPulseCount => "READ_PULSE_COUNT",
            CommandCode::ReadIoStatus => "READ_IO_STATUS",
            CommandCode::ReadRawEncoderAddition => "READ_RAW_ENCODER_ADDITION",
            CommandCode::ReadShaftAngleError => "READ_SHAFT_ANGLE_ERROR",
            CommandCode::ReadEnPinStatus => "READ_EN_PIN_STATUS",
            CommandCode::ReadPowerOnHomeStatus => "READ_POWER_ON_HOME_STATUS",
            CommandCode::ReleaseShaftProtection => "RELEASE_SHAFT_PROTECTION",
            CommandCode::ReadShaftProtectionState => "READ_SHAFT_PROTECTION_STATE",
            CommandCode::RestoreDefaults => "RESTORE_DEFAULT_PARAMETERS",
            CommandCode::Restart => "RESTART",
            CommandCode::Calibrate => "CALIBRATE_ENCODER",
            CommandCode::SetWorkMode => "SET_WORK_MODE",
            CommandCode::SetWorkingCurrent => "SET_WORKING_CURRENT",
            CommandCode::SetSubdivisions => "SET_SUBDIVISIONS",
            CommandCode::SetEnPinActive => "SET_EN_PIN_ACTIVE",
            CommandCode::SetDirection => "SET_DIRECTION",
            CommandCode::SetAutoScreenOff => "SET_AUTO_SCREEN_OFF",
            CommandCode::SetShaftProtection => "SET_SHAFT_PROTECTION",
            CommandCode::SetInterpolation => "SET_INTERPOLATION",
            CommandCode::SetCanBitrate => "SET_CAN_BITRATE",
            CommandCode::SetCanId => "SET_CAN_ID",
            CommandCode::SetSlaveRespond => "SET_SLAVE_RESPOND",
            CommandCode::SetGroupId => "SET_GROUP_ID",
            CommandCode::SetKeyLock => "SET_KEY_LOCK",
            CommandCode::SetHome => "SET_HOME",
            CommandCode::GoHome => "GO_HOME",
            CommandCode::SetCurrentAxisToZero => "SET_CURRENT_AXIS_TO_ZERO",
            CommandCode::SetZeroMode => "SET_ZERO_MODE",
            CommandCode::SetHoldingCurrent => "SET_HOLDING_CURRENT",
            CommandCode::SetLimitPortRemap => "SET_LIMIT_PORT_REMAP",
            CommandCode::QueryMotorStatus => "QUERY_MOTOR_STATUS",
            CommandCode::EnableMotor => "ENABLE_MOTOR",
            CommandCode::RunRelativeByAxis => "RUN_MOTOR_RELATIVE_MOTION_BY_AXIS",
            CommandCode::RunAbsoluteByAxis => "RUN_MOTOR_ABSOLUTE_MOTION_BY_AXIS",
            CommandCode::RunSpeedMode => "RUN_MOTOR_SPEED_MODE",
            CommandCode::EmergencyStop => "EMERGENCY_STOP",
            CommandCode::RunRelativeByPulses => "RUN_MOTOR_RELATIVE_MOTION_BY_PULSES",
            CommandCode::RunAbsoluteByPulses => "RUN_MOTOR_ABSOLUTE_MOTION_BY_PULSES",
            CommandCode::SaveSpeedMode => "SAVE_CLEAN_SPEED_MODE",
        }
    }
}

impl std::fmt::Display for CommandCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_known() {
        assert_eq!(
            CommandCode::from_u8(0x83),
            Some(CommandCode::SetWorkingCurrent)
        );
        assert_eq!(
            CommandCode::from_u8(0x30),
            Some(CommandCode::ReadEncoderValueCarry)
        );
    }

    #[test]
    fn test_from_u8_unknown() {
        assert_eq!(CommandCode::from_u8(0x00), None);
        assert_eq!(CommandCode::from_u8(0x42), None);
    }

    #[test]
    fn test_all_codes_roundtrip_through_u8() {
        for code in CommandCode::ALL {
            assert_eq!(CommandCode::from_u8(code.as_u8()), Some(code));
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            CommandCode::SetWorkingCurrent.to_string(),
            "SET_WORKING_CURRENT(0x83)"
        );
    }
}
