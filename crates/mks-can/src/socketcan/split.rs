//! SocketCAN 分离后的收发半部

use super::{open_socket, read_frame, write_frame};
use crate::{BusAlert, CanError, RxAdapter, ServoFrame, TxAdapter, classify_io_error};
use socketcan::{CanSocket, SocketOptions};
use std::collections::VecDeque;
use tracing::warn;

/// 接收半部（接收循环独占）
#[derive(Debug)]
pub struct SocketCanRxAdapter {
    socket: CanSocket,
    alerts: VecDeque<BusAlert>,
}

impl SocketCanRxAdapter {
    pub(super) fn new(socket: CanSocket, alerts: VecDeque<BusAlert>) -> Self {
        Self { socket, alerts }
    }
}

impl RxAdapter for SocketCanRxAdapter {
    fn receive(&mut self) -> Result<ServoFrame, CanError> {
        read_frame(&self.socket, &mut self.alerts)
    }

    fn poll_alert(&mut self) -> Option<BusAlert> {
        self.alerts.pop_front()
    }
}

/// 发送半部（总线仲裁层在独占锁内使用）
#[derive(Debug)]
pub struct SocketCanTxAdapter {
    socket: CanSocket,
}

impl SocketCanTxAdapter {
    pub(super) fn open(interface: &str) -> Result<Self, CanError> {
        let socket = open_socket(interface)?;
        if let Err(e) = socket.set_loopback(false) {
            warn!("Failed to disable loopback on '{}': {}", interface, e);
        }
        // 只写不读：丢弃所有入站帧，避免接收缓冲区被填满
        socket.set_filter_drop_all().map_err(classify_io_error)?;
        Ok(Self { socket })
    }
}

impl TxAdapter for SocketCanTxAdapter {
    fn send(&mut self, frame: ServoFrame) -> Result<(), CanError> {
        write_frame(&self.socket, &frame)
    }
}
