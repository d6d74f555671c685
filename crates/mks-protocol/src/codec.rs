//! 帧编解码
//!
//! 编码：命令码 + 按命令布局大端排列的参数 + 校验和。
//! 解码：跳过回显的命令码，按响应布局逐字段读取，有符号字段做符号扩展，
//! 并强制校验帧尾校验和。

use crate::codes::CommandCode;
use crate::command::Command;
use crate::schema::{PayloadFieldType, ResponseKind, ResponsePayloadSchema, SchemaRegistry};
use crate::{CodecError, MAX_FRAME_LEN, MIN_FRAME_LEN, MotorId, ServoFrame, checksum, verify_checksum};
use smallvec::SmallVec;

/// 带类型标注的参数值
///
/// 值统一用 `i64` 承载，编码时按字段宽度截断为补码。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PayloadValue {
    pub ty: PayloadFieldType,
    pub value: i64,
}

impl PayloadValue {
    pub const fn new(ty: PayloadFieldType, value: i64) -> Self {
        Self { ty, value }
    }

    pub const fn uint8(value: u8) -> Self {
        Self::new(PayloadFieldType::UInt8, value as i64)
    }

    pub const fn uint16(value: u16) -> Self {
        Self::new(PayloadFieldType::UInt16, value as i64)
    }

    /// 24 位无符号（高 8 位在编码时被范围检查拒绝）
    pub const fn uint24(value: u32) -> Self {
        Self::new(PayloadFieldType::UInt24, value as i64)
    }

    pub const fn uint32(value: u32) -> Self {
        Self::new(PayloadFieldType::UInt32, value as i64)
    }

    pub const fn int16(value: i16) -> Self {
        Self::new(PayloadFieldType::Int16, value as i64)
    }

    pub const fn int24(value: i32) -> Self {
        Self::new(PayloadFieldType::Int24, value as i64)
    }

    pub const fn int32(value: i32) -> Self {
        Self::new(PayloadFieldType::Int32, value as i64)
    }

    pub const fn int48(value: i64) -> Self {
        Self::new(PayloadFieldType::Int48, value)
    }
}

/// 校验和为 0 时的处理策略
///
/// 固件侧把计算结果为 0 的校验和当作构帧失败，`RejectZero` 保持这一行为；
/// 协议手册并未声明 0 是非法值，需要发送这类帧时使用 `AllowZero`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ChecksumPolicy {
    #[default]
    RejectZero,
    AllowZero,
}

/// 状态字节（byte 1）"0 = 失败"检查的适用范围
///
/// 默认对所有响应生效。数据查询的 byte 1 是数据的最高字节，
/// 读数较小时也是 0，需要区分时改用 `StatusBearingOnly`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StatusCheck {
    #[default]
    AllResponses,
    /// 只检查 Ack / Motion / Status 类响应
    StatusBearingOnly,
}

/// 解码结果：按布局顺序排列的 `(字段名, 值)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseFields {
    entries: SmallVec<[(&'static str, i64); 4]>,
}

impl ResponseFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &'static str, value: i64) {
        self.entries.push((name, value));
    }

    /// 按字段名查找
    pub fn get(&self, name: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|(field, _)| *field == name)
            .map(|&(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, i64)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 第一个字段的值（状态类响应即状态字节）
    pub fn first(&self) -> Option<i64> {
        self.entries.first().map(|&(_, value)| value)
    }
}

impl IntoIterator for ResponseFields {
    type Item = (&'static str, i64);
    type IntoIter = smallvec::IntoIter<[(&'static str, i64); 4]>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// 一帧响应的完整解码结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedResponse {
    pub motor_id: MotorId,
    pub code: CommandCode,
    pub kind: ResponseKind,
    pub fields: ResponseFields,
}

impl DecodedResponse {
    /// 状态类响应（Ack / Motion / Status）的状态值；数据类响应返回 `None`
    pub fn status(&self) -> Option<u8> {
        if self.kind.is_status_bearing() {
            self.fields.first().map(|value| value as u8)
        } else {
            None
        }
    }
}

/// 把参数编码为一帧
///
/// 校验顺序：命令布局存在 → 参数个数 → 逐个参数类型与取值范围 → 帧长 → 校验和。
/// 任何一步失败都不会产生帧。
pub fn encode(
    registry: &SchemaRegistry,
    policy: ChecksumPolicy,
    id: MotorId,
    code: CommandCode,
    args: &[PayloadValue],
) -> Result<ServoFrame, CodecError> {
    let schema = registry
        .schema_for(code)
        .ok_or(CodecError::SchemaNotFound { code: code.as_u8() })?;

    let expected = schema.argument_count();
    if args.len() != expected {
        return Err(CodecError::ArgumentCountMismatch {
            code: code.as_u8(),
            expected,
            actual: args.len(),
        });
    }

    let mut bytes: SmallVec<[u8; MAX_FRAME_LEN]> = SmallVec::new();
    bytes.push(code.as_u8());

    for (index, (ty, arg)) in schema.argument_types().zip(args).enumerate() {
        if arg.ty != ty {
            return Err(CodecError::ArgumentTypeMismatch {
                index,
                expected: ty,
                actual: arg.ty,
            });
        }
        if !ty.fits(arg.value) {
            return Err(CodecError::ValueOutOfRange {
                index,
                ty,
                value: arg.value,
            });
        }
        let raw = arg.value as u64;
        for shift in (0..ty.width()).rev() {
            bytes.push((raw >> (shift * 8)) as u8);
        }
    }

    if bytes.len() + 1 > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            len: bytes.len() + 1,
        });
    }

    let crc = checksum(id, &bytes);
    if crc == 0 && policy == ChecksumPolicy::RejectZero {
        return Err(CodecError::ChecksumZero);
    }
    bytes.push(crc);

    ServoFrame::try_new(id, &bytes)
}

/// 按响应布局解析原始数据（含回显命令码与校验和）
///
/// 先校验校验和，再从 byte 1 开始逐字段读取；遇到 `Void` 提前结束。
/// 字段只允许落在命令码与校验和之间。
pub fn decode_fields(
    id: MotorId,
    schema: &ResponsePayloadSchema,
    bytes: &[u8],
) -> Result<ResponseFields, CodecError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(CodecError::FrameTooShort { len: bytes.len() });
    }
    if bytes.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge { len: bytes.len() });
    }
    verify_checksum(&ServoFrame::new(id, bytes))?;

    let body_end = bytes.len() - 1;
    let mut fields = ResponseFields::new();
    let mut offset = 1;

    for field in schema.fields() {
        if field.ty.is_void() {
            break;
        }
        let width = field.ty.width();
        if offset + width > body_end {
            return Err(CodecError::IndexOutOfRange {
                offset,
                width,
                len: body_end,
            });
        }
        let value = read_be(&bytes[offset..offset + width], field.ty.is_signed());
        fields.push(field.name, value);
        offset += width;
    }

    Ok(fields)
}

/// 大端读取，有符号类型按最高位做符号扩展
fn read_be(bytes: &[u8], signed: bool) -> i64 {
    let raw = bytes
        .iter()
        .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte));
    let bits = bytes.len() * 8;
    if signed && bits > 0 && bits < 64 && raw & (1u64 << (bits - 1)) != 0 {
        (raw | (u64::MAX << bits)) as i64
    } else {
        raw as i64
    }
}

/// 注册表 + 校验和策略 + 状态检查范围
///
/// 驱动层持有一个 `FrameCodec`，所有编解码都通过它完成。
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    registry: &'static SchemaRegistry,
    policy: ChecksumPolicy,
    status_check: StatusCheck,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::standard()
    }
}

impl FrameCodec {
    /// 内置协议表 + 默认策略
    pub fn standard() -> Self {
        Self::new(SchemaRegistry::standard(), ChecksumPolicy::default())
    }

    pub fn new(registry: &'static SchemaRegistry, policy: ChecksumPolicy) -> Self {
        Self {
            registry,
            policy,
            status_check: StatusCheck::default(),
        }
    }

    pub fn with_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_status_check(mut self, status_check: StatusCheck) -> Self {
        self.status_check = status_check;
        self
    }

    pub fn status_check(&self) -> StatusCheck {
        self.status_check
    }

    /// 该命令的响应是否按"byte 1 为 0 = 失败"处理
    pub fn checks_status(&self, code: CommandCode) -> bool {
        match self.status_check {
            StatusCheck::AllResponses => true,
            StatusCheck::StatusBearingOnly => self
                .registry
                .response_schema_for(code)
                .is_some_and(|schema| schema.is_status_bearing()),
        }
    }

    pub fn registry(&self) -> &'static SchemaRegistry {
        self.registry
    }

    pub fn policy(&self) -> ChecksumPolicy {
        self.policy
    }

    pub fn encode(
        &self,
        id: MotorId,
        code: CommandCode,
        args: &[PayloadValue],
    ) -> Result<ServoFrame, CodecError> {
        encode(self.registry, self.policy, id, code, args)
    }

    pub fn encode_command(&self, id: MotorId, command: &Command) -> Result<ServoFrame, CodecError> {
        self.encode(id, command.code, &command.args)
    }

    /// 解码一帧响应
    ///
    /// 校验和总是先被验证；命令码未知返回 `SchemaNotFound`；
    /// 命令码已知但没有响应布局时返回 `Ok(None)`。
    pub fn decode(&self, frame: &ServoFrame) -> Result<Option<DecodedResponse>, CodecError> {
        verify_checksum(frame)?;
        let byte = frame
            .command_byte()
            .ok_or(CodecError::FrameTooShort { len: 0 })?;
        let code = CommandCode::from_u8(byte).ok_or(CodecError::SchemaNotFound { code: byte })?;

        let Some(schema) = self.registry.response_schema_for(code) else {
            return Ok(None);
        };
        let fields = decode_fields(frame.id, schema, frame.data_slice())?;

        Ok(Some(DecodedResponse {
            motor_id: frame.id,
            code,
            kind: schema.kind(),
            fields,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CommandPayloadSchema, ResponseField};
    use proptest::prelude::*;

    fn codec() -> FrameCodec {
        FrameCodec::standard()
    }

    fn with_crc(id: MotorId, body: &[u8]) -> ServoFrame {
        let mut bytes = body.to_vec();
        bytes.push(checksum(id, body));
        ServoFrame::new(id, &bytes)
    }

    /// 设置工作电流 1600 mA
    #[test]
    fn test_encode_set_working_current() {
        let frame = codec()
            .encode(
                0x01,
                CommandCode::SetWorkingCurrent,
                &[PayloadValue::uint16(1600)],
            )
            .unwrap();
        assert_eq!(frame.data_slice(), &[0x83, 0x06, 0x40, 0xCA]);
    }

    #[test]
    fn test_encode_no_arguments() {
        let frame = codec()
            .encode(0x01, CommandCode::QueryMotorStatus, &[])
            .unwrap();
        assert_eq!(frame.data_slice(), &[0xF1, 0xF2]);
    }

    #[test]
    fn test_encode_signed_axis() {
        let frame = codec()
            .encode(
                0x01,
                CommandCode::RunAbsoluteByAxis,
                &[
                    PayloadValue::uint16(600),
                    PayloadValue::uint8(2),
                    PayloadValue::int24(-1),
                ],
            )
            .unwrap();
        assert_eq!(&frame.data_slice()[..7], &[0xF5, 0x02, 0x58, 0x02, 0xFF, 0xFF, 0xFF]);
        assert_eq!(frame.len, 8);
    }

    #[test]
    fn test_encode_argument_count_mismatch() {
        let err = codec()
            .encode(0x01, CommandCode::SetWorkingCurrent, &[])
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::ArgumentCountMismatch {
                code: 0x83,
                expected: 1,
                actual: 0
            }
        );
    }

    #[test]
    fn test_encode_argument_type_mismatch() {
        let err = codec()
            .encode(
                0x01,
                CommandCode::SetWorkingCurrent,
                &[PayloadValue::uint8(16)],
            )
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::ArgumentTypeMismatch {
                index: 0,
                expected: PayloadFieldType::UInt16,
                actual: PayloadFieldType::UInt8
            }
        );
    }

    #[test]
    fn test_encode_value_out_of_range() {
        let err = codec()
            .encode(
                0x01,
                CommandCode::RunRelativeByPulses,
                &[
                    PayloadValue::uint16(100),
                    PayloadValue::uint8(1),
                    PayloadValue::uint24(0x0100_0000),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, CodecError::ValueOutOfRange { index: 2, .. }));
    }

    #[test]
    fn test_encode_schema_not_found() {
        let registry: &'static SchemaRegistry =
            Box::leak(Box::new(SchemaRegistry::builder().build()));
        let codec = FrameCodec::new(registry, ChecksumPolicy::RejectZero);
        let err = codec
            .encode(0x01, CommandCode::QueryMotorStatus, &[])
            .unwrap_err();
        assert_eq!(err, CodecError::SchemaNotFound { code: 0xF1 });
    }

    #[test]
    fn test_checksum_zero_policy() {
        // 0x0F + 0xF1 = 0x100 -> 0x00
        let rejecting = codec();
        assert_eq!(
            rejecting.encode(0x0F, CommandCode::QueryMotorStatus, &[]),
            Err(CodecError::ChecksumZero)
        );

        let allowing = codec().with_policy(ChecksumPolicy::AllowZero);
        let frame = allowing
            .encode(0x0F, CommandCode::QueryMotorStatus, &[])
            .unwrap();
        assert_eq!(frame.data_slice(), &[0xF1, 0x00]);
    }

    #[test]
    fn test_status_check_scope() {
        let all = codec();
        assert_eq!(all.status_check(), StatusCheck::AllResponses);
        assert!(all.checks_status(CommandCode::SetWorkingCurrent));
        assert!(all.checks_status(CommandCode::ReadEnPinStatus));
        assert!(all.checks_status(CommandCode::ReadEncoderValueAddition));

        let narrow = codec().with_status_check(StatusCheck::StatusBearingOnly);
        assert!(narrow.checks_status(CommandCode::SetWorkingCurrent));
        assert!(narrow.checks_status(CommandCode::QueryMotorStatus));
        assert!(!narrow.checks_status(CommandCode::ReadEnPinStatus));
        assert!(!narrow.checks_status(CommandCode::Calibrate));
    }

    #[test]
    fn test_encode_invalid_id() {
        let err = codec()
            .encode(0x800, CommandCode::QueryMotorStatus, &[])
            .unwrap_err();
        assert_eq!(err, CodecError::InvalidId { id: 0x800 });
    }

    /// 读取编码器值（进位形式）：位置 5，编码器 10
    #[test]
    fn test_decode_encoder_carry() {
        let frame = with_crc(0x01, &[0x30, 0x00, 0x00, 0x00, 0x05, 0x00, 0x0A]);
        let decoded = codec().decode(&frame).unwrap().unwrap();
        assert_eq!(decoded.code, CommandCode::ReadEncoderValueCarry);
        assert_eq!(decoded.kind, ResponseKind::Data);
        assert_eq!(decoded.fields.get("current_position"), Some(5));
        assert_eq!(decoded.fields.get("encoder_value"), Some(10));
        assert_eq!(decoded.status(), None);
    }

    #[test]
    fn test_decode_sign_extension_int24() {
        static FIELDS: [ResponseField; 1] = [ResponseField::new(PayloadFieldType::Int24, "axis")];
        let schema = ResponsePayloadSchema::try_new(ResponseKind::Data, &FIELDS).unwrap();
        let body = [0xF5, 0xFF, 0xFF, 0xFF];
        let mut bytes = body.to_vec();
        bytes.push(checksum(0x01, &body));

        let fields = decode_fields(0x01, &schema, &bytes).unwrap();
        assert_eq!(fields.get("axis"), Some(-1));
    }

    #[test]
    fn test_decode_negative_position() {
        let frame = with_crc(0x02, &[0x30, 0xFF, 0xFF, 0xFF, 0xFE, 0x3F, 0xFF]);
        let decoded = codec().decode(&frame).unwrap().unwrap();
        assert_eq!(decoded.fields.get("current_position"), Some(-2));
        assert_eq!(decoded.fields.get("encoder_value"), Some(0x3FFF));
    }

    #[test]
    fn test_decode_int48() {
        let frame = with_crc(0x01, &[0x31, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x9C]);
        let decoded = codec().decode(&frame).unwrap().unwrap();
        assert_eq!(decoded.fields.get("encoder_addition"), Some(-100));
    }

    #[test]
    fn test_decode_ack_status() {
        let frame = with_crc(0x01, &[0x83, 0x01]);
        let decoded = codec().decode(&frame).unwrap().unwrap();
        assert_eq!(decoded.kind, ResponseKind::Ack);
        assert_eq!(decoded.status(), Some(1));
        assert_eq!(decoded.fields.get("set_working_current_status"), Some(1));
    }

    #[test]
    fn test_decode_checksum_mismatch() {
        let frame = ServoFrame::new(0x01, &[0x83, 0x01, 0x00]);
        assert_eq!(
            codec().decode(&frame),
            Err(CodecError::ChecksumMismatch {
                expected: 0x85,
                actual: 0x00
            })
        );
    }

    #[test]
    fn test_decode_truncated_frame() {
        // 进位形式响应只有 4 字节数据区中的 2 字节
        let frame = with_crc(0x01, &[0x30, 0x00, 0x05]);
        assert_eq!(
            codec().decode(&frame),
            Err(CodecError::IndexOutOfRange {
                offset: 1,
                width: 4,
                len: 3
            })
        );
    }

    #[test]
    fn test_decode_unknown_code() {
        let frame = with_crc(0x01, &[0x42, 0x01]);
        assert_eq!(
            codec().decode(&frame),
            Err(CodecError::SchemaNotFound { code: 0x42 })
        );
    }

    #[test]
    fn test_decode_without_response_schema() {
        let registry: &'static SchemaRegistry = Box::leak(Box::new(
            SchemaRegistry::builder()
                .command(CommandCode::Restart, CommandPayloadSchema::empty())
                .build(),
        ));
        let codec = FrameCodec::new(registry, ChecksumPolicy::RejectZero);
        let frame = with_crc(0x01, &[0x41, 0x01]);
        assert_eq!(codec.decode(&frame), Ok(None));
    }

    #[test]
    fn test_decode_void_terminates() {
        static FIELDS: [ResponseField; 3] = [
            ResponseField::new(PayloadFieldType::UInt8, "a"),
            ResponseField::new(PayloadFieldType::Void, "end"),
            ResponseField::new(PayloadFieldType::UInt8, "never"),
        ];
        let schema = ResponsePayloadSchema::try_new(ResponseKind::Data, &FIELDS).unwrap();
        let body = [0x34, 0x07];
        let mut bytes = body.to_vec();
        bytes.push(checksum(0x03, &body));

        let fields = decode_fields(0x03, &schema, &bytes).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("a"), Some(7));
        assert_eq!(fields.get("never"), None);
    }

    /// 命令布局与响应布局都是单个 UInt8 的命令
    fn uint8_roundtrip_codes() -> Vec<CommandCode> {
        let registry = SchemaRegistry::standard();
        CommandCode::ALL
            .into_iter()
            .filter(|&code| {
                let cmd = registry.schema_for(code).map(|s| s.fields().to_vec());
                let rsp = registry
                    .response_schema_for(code)
                    .map(|s| s.fields().iter().map(|f| f.ty).collect::<Vec<_>>());
                cmd.is_some() && cmd == rsp
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_uint8_ack_roundtrip(
            index in 0usize..64,
            id in 1u16..=0x7FF,
            value in any::<u8>(),
        ) {
            let codes = uint8_roundtrip_codes();
            prop_assume!(!codes.is_empty());
            let code = codes[index % codes.len()];
            let codec = codec().with_policy(ChecksumPolicy::AllowZero);

            let frame = codec.encode(id, code, &[PayloadValue::uint8(value)]).unwrap();
            let decoded = codec.decode(&frame).unwrap().unwrap();
            prop_assert_eq!(decoded.fields.first(), Some(i64::from(value)));
        }

        #[test]
        fn prop_checksum_invariant(
            id in 1u16..=0x7FF,
            speed in any::<u16>(),
            acc in any::<u8>(),
            axis in -8_388_608i32..=8_388_607,
            corrupt_at in 0usize..7,
            flip in 1u8..=255,
        ) {
            let codec = codec().with_policy(ChecksumPolicy::AllowZero);
            let frame = codec
                .encode(
                    id,
                    CommandCode::RunAbsoluteByAxis,
                    &[PayloadValue::uint16(speed), PayloadValue::uint8(acc), PayloadValue::int24(axis)],
                )
                .unwrap();
            let data = frame.data_slice();
            let last = data.len() - 1;
            prop_assert_eq!(data[last], checksum(id, &data[..last]));

            let mut corrupted = frame;
            corrupted.data[corrupt_at] ^= flip;
            prop_assert!(verify_checksum(&corrupted).is_err());
        }

        #[test]
        fn prop_int24_sign_extension(value in -8_388_608i64..=8_388_607) {
            let raw = (value as u64) & 0xFF_FFFF;
            let bytes = [(raw >> 16) as u8, (raw >> 8) as u8, raw as u8];
            prop_assert_eq!(read_be(&bytes, true), value);
        }
    }
}
