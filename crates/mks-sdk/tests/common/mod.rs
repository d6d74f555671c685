//! 集成测试共用的模拟电机

#![allow(dead_code)]

use mks_can::MockCanBus;
use mks_can::mock::frame_with_checksum;
use mks_sdk::ServoFrame;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(2);

/// 模拟固件：按命令码给出符合响应布局的应答
#[derive(Debug, Clone, Default)]
pub struct SimulatedMotor {
    /// 累加编码器值（0x31 应答）
    pub position: Arc<AtomicI64>,
    /// 下一次应答的状态字节（0 表示失败）
    pub status: Arc<AtomicU8>,
}

impl SimulatedMotor {
    pub fn new() -> Self {
        let motor = Self::default();
        motor.status.store(1, Ordering::Relaxed);
        motor
    }

    /// 安装到模拟总线上（替换已有应答器）
    pub fn attach(&self, mock: &MockCanBus) {
        let motor = self.clone();
        mock.set_responder(move |frame| motor.respond(frame));
    }

    pub fn respond(&self, frame: &ServoFrame) -> Vec<ServoFrame> {
        let Some(code) = frame.command_byte() else {
            return Vec::new();
        };
        let id = frame.id;
        let status = self.status.load(Ordering::Relaxed);

        match code {
            0x30 => {
                let position = self.position.load(Ordering::Relaxed) as i32;
                let mut body = vec![0x30];
                body.extend_from_slice(&position.to_be_bytes());
                body.extend_from_slice(&0x0Au16.to_be_bytes());
                vec![frame_with_checksum(id, &body)]
            },
            0x31 => {
                let position = self.position.load(Ordering::Relaxed);
                let mut body = vec![0x31];
                body.extend_from_slice(&position.to_be_bytes()[2..]);
                vec![frame_with_checksum(id, &body)]
            },
            // 运动命令：先报"开始"，再报"完成"
            0x91 | 0xF4 | 0xF5 | 0xF6 | 0xFD | 0xFE => {
                if status == 0 {
                    return vec![frame_with_checksum(id, &[code, 0x00])];
                }
                vec![
                    frame_with_checksum(id, &[code, 0x01]),
                    frame_with_checksum(id, &[code, 0x02]),
                ]
            },
            _ => vec![frame_with_checksum(id, &[code, status])],
        }
    }
}

pub fn wait_for(mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    predicate()
}
