//! # MKS CAN Adapter Layer
//!
//! CAN 硬件抽象层，提供统一的收发接口与传输错误分类。
//!
//! - `socketcan`: Linux SocketCAN 后端
//! - `mock`: 内存总线（feature `mock`），用于测试与仿真

use std::fmt;
use std::time::Duration;
use thiserror::Error;

// 重新导出 mks-protocol 中的 ServoFrame
pub use mks_protocol::ServoFrame;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(target_os = "linux")]
pub use socketcan::{SocketCanAdapter, SocketCanRxAdapter, SocketCanTxAdapter};

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockCanAdapter, MockCanBus, MockFailure, MockRxAdapter, MockTxAdapter};

/// CAN 适配层统一错误类型（传输错误的封闭分类）
///
/// 除 `Io` 外每个变体都对应一类驱动可以做出不同反应的情况；
/// 无法归类的系统错误保留在 `Io` 中。
#[derive(Error, Debug)]
pub enum CanError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Operation timed out")]
    Timeout,
    #[error("Bus busy")]
    Busy,
    #[error("Interface not running")]
    NotRunning,
    #[error("Operation not supported")]
    NotSupported,
    #[error("Bus off")]
    BusOff,
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl CanError {
    /// 超时或忙，稍后重试可能成功
    pub fn is_transient(&self) -> bool {
        matches!(self, CanError::Timeout | CanError::Busy)
    }
}

/// Linux errno：发送队列满
const ENOBUFS: i32 = 105;

/// 把操作系统错误归入封闭分类
pub fn classify_io_error(err: std::io::Error) -> CanError {
    use std::io::ErrorKind;

    if err.raw_os_error() == Some(ENOBUFS) {
        return CanError::Busy;
    }
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => CanError::Timeout,
        ErrorKind::InvalidInput => CanError::InvalidArgument(err.to_string()),
        ErrorKind::Unsupported => CanError::NotSupported,
        ErrorKind::ResourceBusy => CanError::Busy,
        ErrorKind::NetworkDown | ErrorKind::NotConnected | ErrorKind::BrokenPipe => {
            CanError::NotRunning
        },
        _ => CanError::Io(err),
    }
}

/// 总线级告警
///
/// 与单个电机无关的控制器事件，以旁路事件流的形式上报，
/// 由上层监督者决定如何映射到各电机的就绪状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BusAlert {
    /// 仲裁失败
    ArbitrationLost,
    /// 位错误、格式错误、无应答等协议层错误
    BusError,
    /// 错误计数超过告警阈值
    ErrorWarning,
    /// 进入被动错误状态
    ErrorPassive,
    /// 总线关闭
    BusOff,
    /// 控制器从总线关闭中恢复
    BusRecovered,
    /// 接收队列溢出
    RxQueueFull,
    /// 发送失败或超时
    TxFailed,
}

impl BusAlert {
    /// 是否导致总线不可用
    pub fn is_fatal(self) -> bool {
        matches!(self, BusAlert::BusOff)
    }
}

impl fmt::Display for BusAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BusAlert::ArbitrationLost => "arbitration lost",
            BusAlert::BusError => "bus error",
            BusAlert::ErrorWarning => "error warning",
            BusAlert::ErrorPassive => "error passive",
            BusAlert::BusOff => "bus off",
            BusAlert::BusRecovered => "bus recovered",
            BusAlert::RxQueueFull => "rx queue full",
            BusAlert::TxFailed => "tx failed",
        };
        f.write_str(name)
    }
}

pub trait CanAdapter {
    fn send(&mut self, frame: ServoFrame) -> Result<(), CanError>;
    fn receive(&mut self) -> Result<ServoFrame, CanError>;
    fn set_receive_timeout(&mut self, _timeout: Duration) {}
    fn receive_timeout(&mut self, timeout: Duration) -> Result<ServoFrame, CanError> {
        self.set_receive_timeout(timeout);
        self.receive()
    }
    fn try_receive(&mut self) -> Result<Option<ServoFrame>, CanError> {
        match self.receive_timeout(Duration::ZERO) {
            Ok(frame) => Ok(Some(frame)),
            Err(CanError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }
    fn send_timeout(&mut self, frame: ServoFrame, _timeout: Duration) -> Result<(), CanError> {
        self.send(frame)
    }
}

/// 接收半部
///
/// `receive` 在超时后返回 `CanError::Timeout`，以便接收循环检查退出信号。
/// 错误帧不会作为数据帧返回，而是排入告警队列，由 `poll_alert` 取出。
pub trait RxAdapter {
    fn receive(&mut self) -> Result<ServoFrame, CanError>;

    fn poll_alert(&mut self) -> Option<BusAlert> {
        None
    }
}

/// 发送半部
pub trait TxAdapter {
    fn send(&mut self, frame: ServoFrame) -> Result<(), CanError>;
}

pub trait SplittableAdapter: CanAdapter {
    type RxAdapter: RxAdapter + Send + 'static;
    type TxAdapter: TxAdapter + Send + 'static;
    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_classify_timeout() {
        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(matches!(classify_io_error(err), CanError::Timeout));
        let err = io::Error::from(io::ErrorKind::TimedOut);
        assert!(matches!(classify_io_error(err), CanError::Timeout));
    }

    #[test]
    fn test_classify_busy() {
        let err = io::Error::from_raw_os_error(ENOBUFS);
        assert!(matches!(classify_io_error(err), CanError::Busy));
    }

    #[test]
    fn test_classify_invalid_and_unsupported() {
        let err = io::Error::new(io::ErrorKind::InvalidInput, "bad id");
        assert!(matches!(
            classify_io_error(err),
            CanError::InvalidArgument(_)
        ));
        let err = io::Error::from(io::ErrorKind::Unsupported);
        assert!(matches!(classify_io_error(err), CanError::NotSupported));
    }

    #[test]
    fn test_classify_not_running() {
        let err = io::Error::from(io::ErrorKind::NetworkDown);
        assert!(matches!(classify_io_error(err), CanError::NotRunning));
    }

    #[test]
    fn test_classify_unmapped() {
        let err = io::Error::other("weird");
        assert!(matches!(classify_io_error(err), CanError::Io(_)));
    }

    #[test]
    fn test_transient() {
        assert!(CanError::Timeout.is_transient());
        assert!(CanError::Busy.is_transient());
        assert!(!CanError::BusOff.is_transient());
    }

    #[test]
    fn test_alert_display() {
        assert_eq!(BusAlert::BusOff.to_string(), "bus off");
        assert!(BusAlert::BusOff.is_fatal());
        assert!(!BusAlert::ErrorPassive.is_fatal());
    }
}
