//! 驱动配置
//!
//! 所有段落都有默认值，最小的配置文件只需要列出电机：
//!
//! ```toml
//! [[motors]]
//! id = 1
//! working_current_ma = 1600
//! ```

use mks_protocol::{MAX_STANDARD_ID, MotorId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Duplicate motor id 0x{0:03X}")]
    DuplicateMotor(MotorId),

    #[error("Motor id 0x{0:03X} outside 1..=0x7FF")]
    InvalidMotorId(MotorId),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

/// 总线配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// SocketCAN 接口名
    pub interface: String,
    /// 波特率（仅作记录，接口速率由 `ip link` 设置）
    pub bitrate: u32,
    /// 接收循环的读超时（毫秒）
    pub receive_timeout_ms: u64,
    /// 等待发送锁的上限（毫秒），0 表示无限等待
    pub transmit_lock_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
            bitrate: 500_000,
            receive_timeout_ms: 10,
            transmit_lock_timeout_ms: 0,
        }
    }
}

impl BusConfig {
    pub fn transmit_lock_timeout(&self) -> Option<Duration> {
        (self.transmit_lock_timeout_ms > 0)
            .then(|| Duration::from_millis(self.transmit_lock_timeout_ms))
    }
}

/// 命令生命周期配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// 已发送命令等待响应的时限（毫秒）
    pub command_timeout_ms: u64,
    /// 每个命令保留的状态历史条数
    pub max_history: usize,
    /// 超时扫描周期（毫秒）
    pub sweep_interval_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 500,
            max_history: 16,
            sweep_interval_ms: 50,
        }
    }
}

/// 故障恢复配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// 进入 Error 后自动重试恢复
    pub auto_recover: bool,
    /// 自动恢复的重试间隔（毫秒）
    pub retry_interval_ms: u64,
    /// 总线从 bus-off 恢复后是否恢复所有电机
    pub recover_on_bus_recovered: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_recover: true,
            retry_interval_ms: 1_000,
            recover_on_bus_recovered: true,
        }
    }
}

/// 单个电机配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    /// 总线地址（CAN ID）
    pub id: MotorId,
    pub name: Option<String>,
    /// 恢复时下发的工作电流（mA）
    pub working_current_ma: Option<u16>,
    /// 恢复时下发的保持电流（10..=90，步长 10）
    pub holding_current_percent: Option<u8>,
    /// 恢复时下发的细分
    pub subdivisions: Option<u8>,
    /// 状态轮询周期（毫秒）
    pub status_poll_ms: u64,
    /// 位置轮询周期（毫秒），0 表示不轮询
    pub position_poll_ms: u64,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            id: 1,
            name: None,
            working_current_ma: None,
            holding_current_percent: None,
            subdivisions: None,
            status_poll_ms: 500,
            position_poll_ms: 0,
        }
    }
}

impl MotorConfig {
    pub fn new(id: MotorId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// 日志用名称
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => format!("{name}(0x{:03X})", self.id),
            None => format!("motor 0x{:03X}", self.id),
        }
    }

    /// 保持电流百分比 → 协议档位（10% = 0x00 … 90% = 0x08）
    pub fn holding_current_level(&self) -> Option<u8> {
        self.holding_current_percent
            .map(|percent| (percent / 10).saturating_sub(1))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.id == 0 || self.id > MAX_STANDARD_ID {
            return Err(ConfigError::InvalidMotorId(self.id));
        }
        if self.status_poll_ms == 0 {
            return Err(invalid(
                format!("motors[0x{:03X}].status_poll_ms", self.id),
                "must be greater than 0",
            ));
        }
        if let Some(percent) = self.holding_current_percent
            && (!(10..=90).contains(&percent) || percent % 10 != 0)
        {
            return Err(invalid(
                format!("motors[0x{:03X}].holding_current_percent", self.id),
                format!("{percent} is not one of 10, 20, ..., 90"),
            ));
        }
        Ok(())
    }
}

/// 驱动总配置
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub bus: BusConfig,
    pub lifecycle: LifecycleConfig,
    pub recovery: RecoveryConfig,
    pub motors: Vec<MotorConfig>,
}

impl DriverConfig {
    /// 解析并校验 TOML 文本
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: DriverConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// 序列化为 TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn with_motor(mut self, motor: MotorConfig) -> Self {
        self.motors.push(motor);
        self
    }

    pub fn motor(&self, id: MotorId) -> Option<&MotorConfig> {
        self.motors.iter().find(|motor| motor.id == id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.receive_timeout_ms == 0 {
            return Err(invalid("bus.receive_timeout_ms", "must be greater than 0"));
        }
        if self.lifecycle.command_timeout_ms == 0 {
            return Err(invalid(
                "lifecycle.command_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.lifecycle.sweep_interval_ms == 0 {
            return Err(invalid(
                "lifecycle.sweep_interval_ms",
                "must be greater than 0",
            ));
        }
        if self.lifecycle.max_history == 0 {
            return Err(invalid("lifecycle.max_history", "must be greater than 0"));
        }
        if self.recovery.auto_recover && self.recovery.retry_interval_ms == 0 {
            return Err(invalid(
                "recovery.retry_interval_ms",
                "must be greater than 0 when auto_recover is enabled",
            ));
        }

        let mut seen = HashSet::new();
        for motor in &self.motors {
            motor.validate()?;
            if !seen.insert(motor.id) {
                return Err(ConfigError::DuplicateMotor(motor.id));
            }
        }
        Ok(())
    }
}
