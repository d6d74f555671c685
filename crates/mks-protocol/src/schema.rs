//! 负载布局表（Payload Schema Registry）
//!
//! 每个命令码对应两张表：
//! - 命令布局：发送帧中按顺序排列的字段类型
//! - 响应布局：响应帧数据区（不含回显命令码与校验和）的字段类型与字段名
//!
//! 内置表在编译期求值：任何超过 8 字节硬件帧上限的布局都会直接导致编译失败，
//! 而不是在运行时编码时才暴露。运行时构造的布局使用 `try_new` 返回 [`SchemaError`]。

use crate::codes::CommandCode;
use crate::{MAX_FRAME_LEN, MIN_FRAME_LEN, SchemaError};
use std::collections::HashMap;
use std::sync::OnceLock;

/// 单个布局允许的最大字段数
pub const MAX_FIELDS: usize = 7;

/// 负载字段类型
///
/// 所有字段均为大端（MSB 在前）。`Void` 宽度为 0，在响应布局中作为终止符。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PayloadFieldType {
    Void,
    UInt8,
    UInt16,
    UInt24,
    UInt32,
    UInt48,
    Int16,
    Int24,
    Int32,
    Int48,
}

impl PayloadFieldType {
    /// 编码宽度（字节）
    pub const fn width(self) -> usize {
        match self {
            PayloadFieldType::Void => 0,
            PayloadFieldType::UInt8 => 1,
            PayloadFieldType::UInt16 | PayloadFieldType::Int16 => 2,
            PayloadFieldType::UInt24 | PayloadFieldType::Int24 => 3,
            PayloadFieldType::UInt32 | PayloadFieldType::Int32 => 4,
            PayloadFieldType::UInt48 | PayloadFieldType::Int48 => 6,
        }
    }

    /// 是否为有符号类型（解码时需要符号扩展）
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            PayloadFieldType::Int16
                | PayloadFieldType::Int24
                | PayloadFieldType::Int32
                | PayloadFieldType::Int48
        )
    }

    /// 是否为 `Void`
    pub const fn is_void(self) -> bool {
        matches!(self, PayloadFieldType::Void)
    }

    /// 可表示的取值范围 `(min, max)`（闭区间）
    pub const fn value_range(self) -> (i64, i64) {
        let bits = (self.width() * 8) as u32;
        if bits == 0 {
            return (0, 0);
        }
        if self.is_signed() {
            let half = 1i64 << (bits - 1);
            (-half, half - 1)
        } else {
            (0, (1i64 << bits) - 1)
        }
    }

    /// 判断值是否能无损编码到该类型
    pub const fn fits(self, value: i64) -> bool {
        let (min, max) = self.value_range();
        value >= min && value <= max
    }
}

/// 计算一组字段编码后的整帧长度（含命令码与校验和）
const fn encoded_frame_len(widths_sum: usize) -> usize {
    widths_sum + MIN_FRAME_LEN
}

/// 命令（发送方向）负载布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPayloadSchema {
    fields: &'static [PayloadFieldType],
}

impl CommandPayloadSchema {
    /// 编译期校验的构造器
    ///
    /// 在 `const` 上下文中使用时，违反字段数或帧长限制会成为编译错误。
    pub const fn new(fields: &'static [PayloadFieldType]) -> Self {
        match Self::try_new(fields) {
            Ok(schema) => schema,
            Err(SchemaError::TooManyFields { .. }) => {
                panic!("command payload schema has more than 7 fields")
            },
            Err(SchemaError::FrameTooLarge { .. }) => {
                panic!("command payload schema exceeds the 8-byte frame limit")
            },
        }
    }

    /// 运行时校验的构造器
    pub const fn try_new(fields: &'static [PayloadFieldType]) -> Result<Self, SchemaError> {
        if fields.len() > MAX_FIELDS {
            return Err(SchemaError::TooManyFields {
                count: fields.len(),
            });
        }
        let mut sum = 0;
        let mut i = 0;
        while i < fields.len() {
            sum += fields[i].width();
            i += 1;
        }
        let len = encoded_frame_len(sum);
        if len > MAX_FRAME_LEN {
            return Err(SchemaError::FrameTooLarge { len });
        }
        Ok(Self { fields })
    }

    /// 空布局（无参数命令）
    pub const fn empty() -> Self {
        Self { fields: &[] }
    }

    /// 全部字段（包含 `Void`）
    pub fn fields(&self) -> &'static [PayloadFieldType] {
        self.fields
    }

    /// 需要调用方提供的参数（跳过 `Void`）
    pub fn argument_types(&self) -> impl Iterator<Item = PayloadFieldType> + '_ {
        self.fields.iter().copied().filter(|ty| !ty.is_void())
    }

    /// 参数个数（非 `Void` 字段数）
    pub fn argument_count(&self) -> usize {
        self.argument_types().count()
    }

    /// 编码后的整帧长度（含命令码与校验和）
    pub fn frame_len(&self) -> usize {
        encoded_frame_len(self.fields.iter().map(|ty| ty.width()).sum())
    }
}

/// 响应帧的语义类别
///
/// 决定命令生命周期如何推进；`StatusCheck::StatusBearingOnly` 下也决定是否检查状态字节。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResponseKind {
    /// 设置类应答：1 = 成功，0 = 失败
    Ack,
    /// 运动类应答：0 = 失败，1 = 开始，2 = 完成，3 = 触发限位停止
    Motion,
    /// 状态查询：首字节即状态，0 表示查询失败
    Status,
    /// 数据读取：首字节是数据的一部分
    Data,
}

impl ResponseKind {
    /// byte 1 是否是状态字段（Ack / Motion / Status）
    pub const fn is_status_bearing(self) -> bool {
        !matches!(self, ResponseKind::Data)
    }
}

/// 响应字段（类型 + 字段名）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseField {
    pub ty: PayloadFieldType,
    pub name: &'static str,
}

impl ResponseField {
    pub const fn new(ty: PayloadFieldType, name: &'static str) -> Self {
        Self { ty, name }
    }
}

/// 响应（接收方向）负载布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponsePayloadSchema {
    kind: ResponseKind,
    fields: &'static [ResponseField],
}

impl ResponsePayloadSchema {
    /// 编译期校验的构造器
    pub const fn new(kind: ResponseKind, fields: &'static [ResponseField]) -> Self {
        match Self::try_new(kind, fields) {
            Ok(schema) => schema,
            Err(SchemaError::TooManyFields { .. }) => {
                panic!("response payload schema has more than 7 fields")
            },
            Err(SchemaError::FrameTooLarge { .. }) => {
                panic!("response payload schema exceeds the 8-byte frame limit")
            },
        }
    }

    /// 运行时校验的构造器
    pub const fn try_new(
        kind: ResponseKind,
        fields: &'static [ResponseField],
    ) -> Result<Self, SchemaError> {
        if fields.len() > MAX_FIELDS {
            return Err(SchemaError::TooManyFields {
                count: fields.len(),
            });
        }
        let mut sum = 0;
        let mut i = 0;
        while i < fields.len() {
            sum += fields[i].ty.width();
            i += 1;
        }
        let len = encoded_frame_len(sum);
        if len > MAX_FRAME_LEN {
            return Err(SchemaError::FrameTooLarge { len });
        }
        Ok(Self { kind, fields })
    }

    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    pub fn fields(&self) -> &'static [ResponseField] {
        self.fields
    }

    /// byte 1 是否是状态字段
    pub fn is_status_bearing(&self) -> bool {
        self.kind.is_status_bearing()
    }

    /// 第一个字段名（状态类响应即状态字段名）
    pub fn primary_field(&self) -> Option<&'static str> {
        self.fields.first().map(|field| field.name)
    }
}

// ============================================================================
// 内置协议表
// ============================================================================

use PayloadFieldType::{Int24, UInt8, UInt16, UInt24};

const fn cmd(fields: &'static [PayloadFieldType]) -> CommandPayloadSchema {
    CommandPayloadSchema::new(fields)
}

/// 响应字段字面量（结构体字面量可被常量提升为 'static）
macro_rules! field {
    ($ty:ident, $name:literal) => {
        ResponseField {
            ty: PayloadFieldType::$ty,
            name: $name,
        }
    };
}

const fn ack(fields: &'static [ResponseField]) -> ResponsePayloadSchema {
    ResponsePayloadSchema::new(ResponseKind::Ack, fields)
}

const fn motion(fields: &'static [ResponseField]) -> ResponsePayloadSchema {
    ResponsePayloadSchema::new(ResponseKind::Motion, fields)
}

const fn data(fields: &'static [ResponseField]) -> ResponsePayloadSchema {
    ResponsePayloadSchema::new(ResponseKind::Data, fields)
}

/// 命令布局表
const COMMAND_TABLE: &[(CommandCode, CommandPayloadSchema)] = &[
    (CommandCode::ReadEncoderValueCarry, cmd(&[])),
    (CommandCode::ReadEncoderValueAddition, cmd(&[])),
    (CommandCode::ReadMotorSpeed, cmd(&[])),
    (CommandCode::ReadPulseCount, cmd(&[])),
    (CommandCode::ReadIoStatus, cmd(&[])),
    (CommandCode::ReadRawEncoderAddition, cmd(&[])),
    (CommandCode::ReadShaftAngleError, cmd(&[])),
    (CommandCode::ReadEnPinStatus, cmd(&[])),
    (CommandCode::ReadPowerOnHomeStatus, cmd(&[])),
    (CommandCode::ReleaseShaftProtection, cmd(&[])),
    (CommandCode::ReadShaftProtectionState, cmd(&[])),
    (CommandCode::RestoreDefaults, cmd(&[])),
    (CommandCode::Restart, cmd(&[])),
    (CommandCode::Calibrate, cmd(&[UInt8])),
    (CommandCode::SetWorkMode, cmd(&[UInt8])),
    (CommandCode::SetWorkingCurrent, cmd(&[UInt16])),
    (CommandCode::SetSubdivisions, cmd(&[UInt8])),
    (CommandCode::SetEnPinActive, cmd(&[UInt8])),
    (CommandCode::SetDirection, cmd(&[UInt8])),
    (CommandCode::SetAutoScreenOff, cmd(&[UInt8])),
    (CommandCode::SetShaftProtection, cmd(&[UInt8])),
    (CommandCode::SetInterpolation, cmd(&[UInt8])),
    (CommandCode::SetCanBitrate, cmd(&[UInt8])),
    (CommandCode::SetCanId, cmd(&[UInt16])),
    (CommandCode::SetSlaveRespond, cmd(&[UInt8, UInt8])),
    (CommandCode::SetGroupId, cmd(&[UInt16])),
    (CommandCode::SetKeyLock, cmd(&[UInt8])),
    (CommandCode::SetHome, cmd(&[UInt8, UInt8, UInt16, UInt8])),
    (CommandCode::GoHome, cmd(&[])),
    (CommandCode::SetCurrentAxisToZero, cmd(&[])),
    (CommandCode::SetZeroMode, cmd(&[UInt8, UInt8, UInt8, UInt8])),
    (CommandCode::SetHoldingCurrent, cmd(&[UInt8])),
    (CommandCode::SetLimitPortRemap, cmd(&[UInt8])),
    (CommandCode::QueryMotorStatus, cmd(&[])),
    (CommandCode::EnableMotor, cmd(&[UInt8])),
    (CommandCode::RunRelativeByAxis, cmd(&[UInt16, UInt8, Int24])),
    (CommandCode::RunAbsoluteByAxis, cmd(&[UInt16, UInt8, Int24])),
    (CommandCode::RunSpeedMode, cmd(&[UInt16, UInt8])),
    (CommandCode::EmergencyStop, cmd(&[])),
    (CommandCode::RunRelativeByPulses, cmd(&[UInt16, UInt8, UInt24])),
    (CommandCode::RunAbsoluteByPulses, cmd(&[UInt16, UInt8, Int24])),
    (CommandCode::SaveSpeedMode, cmd(&[UInt8])),
];

/// 响应布局表
const RESPONSE_TABLE: &[(CommandCode, ResponsePayloadSchema)] = &[
    // ---- 读取参数 ----
    (
        CommandCode::ReadEncoderValueCarry,
        data(&[
            field!(Int32, "current_position"),
            field!(UInt16, "encoder_value"),
        ]),
    ),
    (
        CommandCode::ReadEncoderValueAddition,
        data(&[field!(Int48, "encoder_addition")]),
    ),
    (
        CommandCode::ReadMotorSpeed,
        data(&[field!(Int16, "speed_rpm")]),
    ),
    (
        CommandCode::ReadPulseCount,
        data(&[field!(Int32, "pulse_count")]),
    ),
    (
        CommandCode::ReadIoStatus,
        data(&[field!(UInt8, "io_status")]),
    ),
    (
        CommandCode::ReadRawEncoderAddition,
        data(&[field!(Int48, "raw_encoder_addition")]),
    ),
    (
        CommandCode::ReadShaftAngleError,
        data(&[field!(Int32, "shaft_angle_error")]),
    ),
    (
        CommandCode::ReadEnPinStatus,
        data(&[field!(UInt8, "en_pin_status")]),
    ),
    (
        CommandCode::ReadPowerOnHomeStatus,
        data(&[field!(UInt8, "power_on_home_status")]),
    ),
    (
        CommandCode::ReleaseShaftProtection,
        ack(&[field!(UInt8, "release_shaft_protection_status")]),
    ),
    (
        CommandCode::ReadShaftProtectionState,
        data(&[field!(UInt8, "shaft_protection_state")]),
    ),
    (
        CommandCode::RestoreDefaults,
        ack(&[field!(UInt8, "restore_defaults_status")]),
    ),
    (
        CommandCode::Restart,
        ack(&[field!(UInt8, "restart_status")]),
    ),
    // ---- 设置参数 ----
    // 校准过程中上报 0（进行中），不是失败
    (
        CommandCode::Calibrate,
        data(&[field!(UInt8, "calibration_status")]),
    ),
    (
        CommandCode::SetWorkMode,
        ack(&[field!(UInt8, "set_work_mode_status")]),
    ),
    (
        CommandCode::SetWorkingCurrent,
        ack(&[field!(UInt8, "set_working_current_status")]),
    ),
    (
        CommandCode::SetSubdivisions,
        ack(&[field!(UInt8, "set_subdivisions_status")]),
    ),
    (
        CommandCode::SetEnPinActive,
        ack(&[field!(UInt8, "set_en_pin_active_status")]),
    ),
    (
        CommandCode::SetDirection,
        ack(&[field!(UInt8, "set_direction_status")]),
    ),
    (
        CommandCode::SetAutoScreenOff,
        ack(&[field!(UInt8, "set_auto_screen_off_status")]),
    ),
    (
        CommandCode::SetShaftProtection,
        ack(&[field!(UInt8, "set_shaft_protection_status")]),
    ),
    (
        CommandCode::SetInterpolation,
        ack(&[field!(UInt8, "set_interpolation_status")]),
    ),
    (
        CommandCode::SetCanBitrate,
        ack(&[field!(UInt8, "set_can_bitrate_status")]),
    ),
    (
        CommandCode::SetCanId,
        ack(&[field!(UInt8, "set_can_id_status")]),
    ),
    (
        CommandCode::SetSlaveRespond,
        ack(&[field!(UInt8, "set_slave_respond_status")]),
    ),
    (
        CommandCode::SetGroupId,
        ack(&[field!(UInt8, "set_group_id_status")]),
    ),
    (
        CommandCode::SetKeyLock,
        ack(&[field!(UInt8, "set_key_lock_status")]),
    ),
    // ---- 回零 ----
    (
        CommandCode::SetHome,
        ack(&[field!(UInt8, "set_home_status")]),
    ),
    (CommandCode::GoHome, motion(&[field!(UInt8, "run_status")])),
    (
        CommandCode::SetCurrentAxisToZero,
        ack(&[field!(UInt8, "set_current_axis_to_zero_status")]),
    ),
    (
        CommandCode::SetZeroMode,
        ack(&[field!(UInt8, "set_zero_mode_status")]),
    ),
    (
        CommandCode::SetHoldingCurrent,
        ack(&[field!(UInt8, "set_holding_current_status")]),
    ),
    (
        CommandCode::SetLimitPortRemap,
        ack(&[field!(UInt8, "set_limit_port_remap_status")]),
    ),
    // ---- 运动控制 ----
    (
        CommandCode::QueryMotorStatus,
        ResponsePayloadSchema::new(ResponseKind::Status, &[field!(UInt8, "motor_status")]),
    ),
    (
        CommandCode::EnableMotor,
        ack(&[field!(UInt8, "enable_motor_status")]),
    ),
    (
        CommandCode::RunRelativeByAxis,
        motion(&[field!(UInt8, "run_status")]),
    ),
    (
        CommandCode::RunAbsoluteByAxis,
        motion(&[field!(UInt8, "run_status")]),
    ),
    (
        CommandCode::RunSpeedMode,
        motion(&[field!(UInt8, "run_status")]),
    ),
    (
        CommandCode::EmergencyStop,
        ack(&[field!(UInt8, "emergency_stop_status")]),
    ),
    (
        CommandCode::RunRelativeByPulses,
        motion(&[field!(UInt8, "run_status")]),
    ),
    (
        CommandCode::RunAbsoluteByPulses,
        motion(&[field!(UInt8, "run_status")]),
    ),
    (
        CommandCode::SaveSpeedMode,
        ack(&[field!(UInt8, "save_speed_mode_status")]),
    ),
];

// ============================================================================
// 注册表
// ============================================================================

/// 命令码 → 负载布局的只读查找表
///
/// 标准表通过 [`SchemaRegistry::standard`] 获取（进程内只构建一次）；
/// 需要扩展或裁剪命令集时使用 [`SchemaRegistry::builder`]。
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    commands: HashMap<CommandCode, CommandPayloadSchema>,
    responses: HashMap<CommandCode, ResponsePayloadSchema>,
}

impl SchemaRegistry {
    /// 内置协议表
    pub fn standard() -> &'static SchemaRegistry {
        static STANDARD: OnceLock<SchemaRegistry> = OnceLock::new();
        STANDARD.get_or_init(|| {
            let mut builder = SchemaRegistry::builder();
            for &(code, schema) in COMMAND_TABLE {
                builder = builder.command(code, schema);
            }
            for &(code, schema) in RESPONSE_TABLE {
                builder = builder.response(code, schema);
            }
            builder.build()
        })
    }

    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    /// 命令布局（未注册返回 `None`）
    pub fn schema_for(&self, code: CommandCode) -> Option<&CommandPayloadSchema> {
        self.commands.get(&code)
    }

    /// 响应布局（未注册返回 `None`，表示该命令没有响应负载）
    pub fn response_schema_for(&self, code: CommandCode) -> Option<&ResponsePayloadSchema> {
        self.responses.get(&code)
    }

    /// 已注册命令布局的命令码（升序）
    pub fn command_codes(&self) -> Vec<CommandCode> {
        let mut codes: Vec<_> = self.commands.keys().copied().collect();
        codes.sort_unstable();
        codes
    }

    /// 已注册响应布局的命令码（升序）
    pub fn response_codes(&self) -> Vec<CommandCode> {
        let mut codes: Vec<_> = self.responses.keys().copied().collect();
        codes.sort_unstable();
        codes
    }
}

/// [`SchemaRegistry`] 构建器，后注册的同码布局覆盖先注册的
#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
    inner: SchemaRegistry,
}

impl SchemaRegistryBuilder {
    /// 从标准表出发
    pub fn from_standard() -> Self {
        Self {
            inner: SchemaRegistry::standard().clone(),
        }
    }

    pub fn command(mut self, code: CommandCode, schema: CommandPayloadSchema) -> Self {
        self.inner.commands.insert(code, schema);
        self
    }

    pub fn response(mut self, code: CommandCode, schema: ResponsePayloadSchema) -> Self {
        self.inner.responses.insert(code, schema);
        self
    }

    pub fn remove(mut self, code: CommandCode) -> Self {
        self.inner.commands.remove(&code);
        self.inner.responses.remove(&code);
        self
    }

    pub fn build(self) -> SchemaRegistry {
        self.inner
    }
}
