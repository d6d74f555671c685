//! Linux SocketCAN 后端
//!
//! MKS 驱动器只使用 11-bit 标准帧：扩展帧与远程帧在接收端直接跳过。
//! 内核上报的错误帧转换为 [`BusAlert`]，由接收循环通过 `poll_alert` 取走。
//!
//! 波特率由 `ip link set canX type can bitrate ...` 在系统侧配置，
//! 这里只打开已经 up 的接口。

use crate::{BusAlert, CanAdapter, CanError, ServoFrame, SplittableAdapter, classify_io_error};
use mks_protocol::MAX_FRAME_LEN;
use socketcan::{
    CanError as SocketCanError, CanErrorFrame, CanFrame, CanSocket, EmbeddedFrame, Frame, Socket,
    SocketOptions, StandardId,
};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{error, trace, warn};

mod split;

pub use split::{SocketCanRxAdapter, SocketCanTxAdapter};

/// 默认读超时，接收循环据此检查退出信号
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// 单 socket 适配器，交给总线仲裁层前通过 `split` 拆成收发两半
///
/// ```no_run
/// use mks_can::{CanAdapter, ServoFrame, SocketCanAdapter};
///
/// let mut can = SocketCanAdapter::new("can0").unwrap();
/// // 查询 0x01 号电机状态
/// can.send(ServoFrame::new(0x01, &[0xF1, 0xF2])).unwrap();
/// let reply = can.receive().unwrap();
/// ```
#[derive(Debug)]
pub struct SocketCanAdapter {
    socket: CanSocket,
    interface: String,
    read_timeout: Duration,
    alerts: VecDeque<BusAlert>,
}

impl SocketCanAdapter {
    /// 打开接口并接收全部错误帧
    ///
    /// 接口不存在时返回 `CanError::NotRunning`。
    pub fn new(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();
        let socket = open_socket(&interface)?;
        socket
            .set_read_timeout(DEFAULT_READ_TIMEOUT)
            .map_err(classify_io_error)?;
        socket
            .set_error_filter_accept_all()
            .map_err(classify_io_error)?;

        trace!("SocketCAN interface '{}' opened", interface);
        Ok(Self {
            socket,
            interface,
            read_timeout: DEFAULT_READ_TIMEOUT,
            alerts: VecDeque::new(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), CanError> {
        self.socket
            .set_read_timeout(timeout)
            .map_err(classify_io_error)?;
        self.read_timeout = timeout;
        Ok(())
    }

    /// 取出一条排队的总线告警
    pub fn poll_alert(&mut self) -> Option<BusAlert> {
        self.alerts.pop_front()
    }
}

/// 打开 socket；`ENODEV` 归为 `NotRunning`
pub(crate) fn open_socket(interface: &str) -> Result<CanSocket, CanError> {
    CanSocket::open(interface).map_err(|e| {
        error!("Failed to open CAN interface '{}': {}", interface, e);
        match e.raw_os_error() {
            // ENODEV
            Some(19) => CanError::NotRunning,
            _ => classify_io_error(e),
        }
    })
}

/// `ServoFrame` → SocketCAN 标准帧
pub(crate) fn to_can_frame(frame: &ServoFrame) -> Result<CanFrame, CanError> {
    StandardId::new(frame.id)
        .and_then(|id| CanFrame::new(id, frame.data_slice()))
        .ok_or_else(|| {
            CanError::InvalidArgument(format!(
                "cannot build standard frame with ID 0x{:X}, len {}",
                frame.id, frame.len
            ))
        })
}

/// 发送一帧，系统错误归入封闭分类
pub(crate) fn write_frame(socket: &CanSocket, frame: &ServoFrame) -> Result<(), CanError> {
    let can_frame = to_can_frame(frame)?;
    socket.write_frame(&can_frame).map_err(classify_io_error)?;
    trace!("TX 0x{:03X} [{}]", frame.id, frame.hex_dump());
    Ok(())
}

/// 读取下一帧数据帧
///
/// 错误帧转换为告警后继续读取；直到读到数据帧或超时为止。
pub(crate) fn read_frame(
    socket: &CanSocket,
    alerts: &mut VecDeque<BusAlert>,
) -> Result<ServoFrame, CanError> {
    loop {
        let can_frame = socket.read_frame().map_err(classify_io_error)?;
        match can_frame {
            CanFrame::Data(data_frame) => {
                if data_frame.is_extended() {
                    trace!("Ignoring extended frame ID=0x{:X}", data_frame.raw_id());
                    continue;
                }
                let data = data_frame.data();
                let len = data.len().min(MAX_FRAME_LEN);
                let frame = ServoFrame::new(data_frame.raw_id() as u16, &data[..len]);
                trace!("RX 0x{:03X} [{}]", frame.id, frame.hex_dump());
                return Ok(frame);
            },
            CanFrame::Remote(_) => continue,
            CanFrame::Error(error_frame) => {
                if let Some(alert) = alert_from_error_frame(error_frame) {
                    alerts.push_back(alert);
                }
                // 告警优先交给调用方处理
                return Err(CanError::Timeout);
            },
        }
    }
}

/// 错误帧 → 总线告警
fn alert_from_error_frame(error_frame: CanErrorFrame) -> Option<BusAlert> {
    let kind = SocketCanError::from(error_frame);
    let alert = match &kind {
        SocketCanError::BusOff => {
            error!("Controller entered bus-off");
            BusAlert::BusOff
        },
        SocketCanError::Restarted => BusAlert::BusRecovered,
        SocketCanError::LostArbitration(_) => BusAlert::ArbitrationLost,
        SocketCanError::TransmitTimeout => BusAlert::TxFailed,
        SocketCanError::ControllerProblem(problem) => {
            let text = problem.to_string().to_lowercase();
            if text.contains("overflow") {
                BusAlert::RxQueueFull
            } else if text.contains("passive") {
                BusAlert::ErrorPassive
            } else if text.contains("warning") {
                BusAlert::ErrorWarning
            } else {
                warn!("Unmapped controller problem: {}", problem);
                return None;
            }
        },
        SocketCanError::ProtocolViolation { .. }
        | SocketCanError::NoAck
        | SocketCanError::BusError
        | SocketCanError::TransceiverError => BusAlert::BusError,
        _ => {
            warn!("Unmapped error frame: {}", kind);
            return None;
        },
    };
    Some(alert)
}

impl SplittableAdapter for SocketCanAdapter {
    type RxAdapter = SocketCanRxAdapter;
    type TxAdapter = SocketCanTxAdapter;

    /// 原 socket 归接收半部；发送半部在同一接口上另开一个 socket
    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError> {
        let tx = SocketCanTxAdapter::open(&self.interface)?;
        trace!("'{}' split into rx/tx halves", self.interface);
        Ok((SocketCanRxAdapter::new(self.socket, self.alerts), tx))
    }
}

impl CanAdapter for SocketCanAdapter {
    fn send(&mut self, frame: ServoFrame) -> Result<(), CanError> {
        write_frame(&self.socket, &frame)
    }

    fn receive(&mut self) -> Result<ServoFrame, CanError> {
        read_frame(&self.socket, &mut self.alerts)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        if let Err(err) = self.set_read_timeout(timeout) {
            warn!("'{}': read timeout unchanged: {}", self.interface, err);
        }
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Result<ServoFrame, CanError> {
        let previous = self.read_timeout;
        self.set_read_timeout(timeout)?;
        let received = self.receive();
        if let Err(err) = self.set_read_timeout(previous) {
            warn!("'{}': failed to restore read timeout: {}", self.interface, err);
        }
        received
    }

    fn send_timeout(&mut self, frame: ServoFrame, timeout: Duration) -> Result<(), CanError> {
        self.socket
            .set_write_timeout(timeout)
            .map_err(classify_io_error)?;
        let sent = self.send(frame);
        if let Err(err) = self.socket.set_write_timeout(None) {
            warn!("'{}': write timeout not restored: {}", self.interface, err);
        }
        sent
    }
}
