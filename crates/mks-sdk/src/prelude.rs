//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use mks_sdk::prelude::*;
//! ```

// 控制器（推荐入口）
pub use crate::driver::{ControllerBuilder, MotorController};
pub use crate::driver::{DriverConfig, MotorConfig};

// 状态查询
pub use crate::driver::{CommandState, MotorSnapshot, ReadinessEvent, ReadinessState};
pub use crate::protocol::{MovingState, RunStatus};

// 命令构造
pub use crate::protocol::command::Direction;
pub use crate::protocol::{Command, CommandCode, PayloadValue};

// CAN 层（常用 Trait）
pub use crate::can::{BusAlert, CanAdapter};

// 错误类型
pub use crate::can::CanError;
pub use crate::driver::DriverError;
pub use crate::protocol::CodecError;
