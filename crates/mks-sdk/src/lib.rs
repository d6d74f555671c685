//! MKS SDK - MKS SERVO 闭环步进电机 CAN 驱动
//!
//! # 架构设计
//!
//! 本 SDK 采用分层架构，从底层到高层：
//!
//! - **协议层** (`protocol`): 负载布局注册表、帧编码/解码、校验和
//! - **CAN 层** (`can`): CAN 硬件抽象（SocketCAN 与内存模拟总线）
//! - **驱动层** (`driver`): 总线仲裁、命令生命周期、响应流水线、就绪状态机
//!
//! # 快速开始
//!
//! ```no_run
//! use mks_sdk::prelude::*;
//!
//! mks_sdk::logging::init_logging().ok();
//! let config = DriverConfig::load("motors.toml").unwrap();
//! # #[cfg(target_os = "linux")]
//! # {
//! let controller = ControllerBuilder::new(config).build_socketcan().unwrap();
//! controller.wait_until_ready(0x01, std::time::Duration::from_secs(1)).unwrap();
//! controller.send(0x01, &Command::run_absolute_by_axis(600, 2, 16_384).unwrap()).unwrap();
//! # }
//! ```

pub use mks_can as can;
pub use mks_driver as driver;
pub use mks_protocol as protocol;

pub mod logging;
pub mod prelude;

pub use can::{BusAlert, CanAdapter, CanError, ServoFrame};
pub use driver::{
    ControllerBuilder, DriverConfig, DriverError, MotorConfig, MotorController, MotorSnapshot,
    ReadinessEvent, ReadinessState,
};
pub use protocol::{CodecError, Command, CommandCode, FrameCodec, PayloadValue};
