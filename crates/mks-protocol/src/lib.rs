//! # MKS Protocol
//!
//! MKS SERVO 系列闭环步进驱动器 CAN 总线协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `codes`: 命令码定义
//! - `schema`: 命令/响应负载布局表（Payload Schema Registry）
//! - `codec`: 帧编码与响应解码
//! - `command`: 类型化命令构造
//! - `status`: 响应状态字节的语义枚举
//!
//! ## 帧格式
//!
//! ```text
//! byte[0]        命令码
//! byte[1..N-1]   按 schema 顺序排列的字段（大端，MSB 在前）
//! byte[N-1]      校验和 = (CAN ID + Σ byte[0..N-1]) mod 256
//! ```
//!
//! 帧定界完全依赖 CAN 总线本身，协议层不引入起止符。

pub mod codec;
pub mod codes;
pub mod command;
pub mod schema;
pub mod status;

// 重新导出常用类型
pub use codec::{
    ChecksumPolicy, DecodedResponse, FrameCodec, PayloadValue, ResponseFields, StatusCheck,
};
pub use codes::CommandCode;
pub use command::Command;
pub use schema::{
    CommandPayloadSchema, PayloadFieldType, ResponseKind, ResponsePayloadSchema, SchemaRegistry,
};
pub use status::{AckStatus, MovingState, RunStatus};

use thiserror::Error;

/// 单帧最大数据长度（CAN 2.0）
pub const MAX_FRAME_LEN: usize = 8;

/// 最小帧长度：命令码 + 校验和
pub const MIN_FRAME_LEN: usize = 2;

/// 标准帧 ID 最大值（11-bit）
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// 电机总线地址（即 CAN 标准帧 ID）
pub type MotorId = u16;

/// CAN 2.0 标准帧的统一抽象
///
/// `ServoFrame` 是协议层和硬件层之间的中间抽象：
/// - 协议层只产生/消费 `ServoFrame`，不依赖 SocketCAN 等具体实现
/// - 固定 8 字节数据区，`Copy`，无堆分配
/// - `timestamp_us` 由接收端填充（0 表示不可用）
///
/// ```rust
/// use mks_protocol::ServoFrame;
///
/// let frame = ServoFrame::new(0x01, &[0xF1, 0xF2]);
/// assert_eq!(frame.id(), 0x01);
/// assert_eq!(frame.data_slice(), &[0xF1, 0xF2]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServoFrame {
    /// CAN 标准帧 ID（电机地址）
    pub id: MotorId,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; MAX_FRAME_LEN],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 接收时间戳（微秒），0 表示不可用
    pub timestamp_us: u64,
}

impl ServoFrame {
    /// 创建标准帧
    ///
    /// 超过 8 字节的数据会被截断；需要严格校验的调用方应使用 [`ServoFrame::try_new`]。
    pub fn new(id: MotorId, data: &[u8]) -> Self {
        let mut fixed_data = [0u8; MAX_FRAME_LEN];
        let len = data.len().min(MAX_FRAME_LEN);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id,
            data: fixed_data,
            len: len as u8,
            timestamp_us: 0,
        }
    }

    /// 创建标准帧（长度与 ID 严格校验）
    pub fn try_new(id: MotorId, data: &[u8]) -> Result<Self, CodecError> {
        if data.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge { len: data.len() });
        }
        if id > MAX_STANDARD_ID {
            return Err(CodecError::InvalidId { id });
        }
        Ok(Self::new(id, data))
    }

    /// 附加接收时间戳
    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 获取 CAN ID
    pub fn id(&self) -> MotorId {
        self.id
    }

    /// 命令码字节（byte 0），空帧返回 `None`
    pub fn command_byte(&self) -> Option<u8> {
        self.data_slice().first().copied()
    }

    /// 状态字节（byte 1），按本协议族约定 0 表示失败
    pub fn status_byte(&self) -> Option<u8> {
        self.data_slice().get(1).copied()
    }

    /// 帧尾校验和字节
    pub fn checksum_byte(&self) -> Option<u8> {
        self.data_slice().last().copied()
    }

    /// 十六进制字节转储（用于日志）
    pub fn hex_dump(&self) -> String {
        let mut out = String::with_capacity(self.len as usize * 3);
        for (i, byte) in self.data_slice().iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&format!("{byte:02X}"));
        }
        out
    }
}

/// 计算校验和：`(id + Σ bytes) mod 256`
///
/// 只有 ID 的低 8 位参与运算（与固件一致）。
pub fn checksum(id: MotorId, bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(id as u8, |acc, &byte| acc.wrapping_add(byte))
}

/// 校验帧尾字节是否等于重新计算的校验和
pub fn verify_checksum(frame: &ServoFrame) -> Result<(), CodecError> {
    let bytes = frame.data_slice();
    if bytes.len() < MIN_FRAME_LEN {
        return Err(CodecError::FrameTooShort { len: bytes.len() });
    }
    let (body, tail) = bytes.split_at(bytes.len() - 1);
    let expected = checksum(frame.id, body);
    if tail[0] != expected {
        return Err(CodecError::ChecksumMismatch {
            expected,
            actual: tail[0],
        });
    }
    Ok(())
}

/// 编解码错误类型
///
/// 所有错误都可在调用点本地恢复：出错时不会发送或接受任何帧。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("No payload schema registered for command 0x{code:02X}")]
    SchemaNotFound { code: u8 },

    #[error("Argument count mismatch for command 0x{code:02X}: expected {expected}, got {actual}")]
    ArgumentCountMismatch {
        code: u8,
        expected: usize,
        actual: usize,
    },

    #[error("Argument {index} type mismatch: schema expects {expected:?}, got {actual:?}")]
    ArgumentTypeMismatch {
        index: usize,
        expected: PayloadFieldType,
        actual: PayloadFieldType,
    },

    #[error("Argument {index} value {value} does not fit {ty:?}")]
    ValueOutOfRange {
        index: usize,
        ty: PayloadFieldType,
        value: i64,
    },

    #[error("Frame too large: {len} bytes (max 8)")]
    FrameTooLarge { len: usize },

    #[error("Frame too short: {len} bytes (min 2)")]
    FrameTooShort { len: usize },

    #[error("Computed checksum is zero")]
    ChecksumZero,

    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Field at offset {offset} (width {width}) exceeds frame data length {len}")]
    IndexOutOfRange {
        offset: usize,
        width: usize,
        len: usize,
    },

    #[error("Invalid CAN ID: 0x{id:X}")]
    InvalidId { id: u16 },
}

/// Schema 构造错误（协议定义错误）
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Schema has {count} fields (max 7)")]
    TooManyFields { count: usize },

    #[error("Schema encodes to {len} bytes (max 8 including command code and checksum)")]
    FrameTooLarge { len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_truncates_to_eight_bytes() {
        let frame = ServoFrame::new(0x01, &[0; 12]);
        assert_eq!(frame.len, 8);
    }

    #[test]
    fn test_try_new_rejects_oversized() {
        let result = ServoFrame::try_new(0x01, &[0; 9]);
        assert_eq!(result, Err(CodecError::FrameTooLarge { len: 9 }));
    }

    #[test]
    fn test_try_new_rejects_extended_id() {
        let result = ServoFrame::try_new(0x800, &[0x30, 0x31]);
        assert_eq!(result, Err(CodecError::InvalidId { id: 0x800 }));
    }

    #[test]
    fn test_accessors() {
        let frame = ServoFrame::new(0x02, &[0x83, 0x01, 0x86]);
        assert_eq!(frame.command_byte(), Some(0x83));
        assert_eq!(frame.status_byte(), Some(0x01));
        assert_eq!(frame.checksum_byte(), Some(0x86));
        assert_eq!(frame.hex_dump(), "83 01 86");
    }

    #[test]
    fn test_checksum_includes_id() {
        // 0x01 + 0x83 + 0x06 + 0x40 = 0xCA
        assert_eq!(checksum(0x01, &[0x83, 0x06, 0x40]), 0xCA);
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(0xFF, &[0x01]), 0x00);
        assert_eq!(checksum(0x7FF, &[0x02]), 0x01);
    }

    #[test]
    fn test_verify_checksum() {
        let good = ServoFrame::new(0x01, &[0x83, 0x01, 0x85]);
        assert!(verify_checksum(&good).is_ok());

        let bad = ServoFrame::new(0x01, &[0x83, 0x01, 0x86]);
        assert_eq!(
            verify_checksum(&bad),
            Err(CodecError::ChecksumMismatch {
                expected: 0x85,
                actual: 0x86
            })
        );

        let short = ServoFrame::new(0x01, &[0x83]);
        assert_eq!(
            verify_checksum(&short),
            Err(CodecError::FrameTooShort { len: 1 })
        );
    }
}
