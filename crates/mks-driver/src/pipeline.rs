//! 响应处理流水线
//!
//! 每个入站帧依次经过固定顺序的五个阶段：
//!
//! 1. `Log`：记录 ID、长度、命令名与字节转储
//! 2. `ErrorCheck`：状态字节为 0 时把电机与对应命令打入 Error（不中断）
//! 3. `DataExtraction`：解码并写入属性表；校验失败时中断
//! 4. `ReadinessTransition`：Initializing / Recovering → Ready
//! 5. `LifecycleUpdate`：把命令记录推进到 Executing / Processed
//!
//! 阶段之间不传递数据，只通过电机上下文与生命周期跟踪器通信，
//! 因此每个阶段都可以单独测试。

use crate::context::ContextHandle;
use crate::lifecycle::{CommandState, CommandTracker, LifecycleError};
use crate::metrics::DriverMetrics;
use crate::readiness::ReadinessState;
use mks_protocol::{
    CodecError, CommandCode, FrameCodec, MotorId, ResponseKind, RunStatus, ServoFrame,
    verify_checksum,
};
use std::fmt;
use tracing::{debug, trace, warn};

/// 阶段执行时可见的共享状态
pub struct StageContext<'a> {
    pub motor_id: MotorId,
    pub context: &'a ContextHandle,
    pub tracker: &'a CommandTracker,
    pub codec: &'a FrameCodec,
    pub metrics: &'a DriverMetrics,
}

/// 阶段函数：返回 `false` 中断后续阶段
pub type Stage = fn(&StageContext<'_>, &ServoFrame) -> bool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Log,
    ErrorCheck,
    DataExtraction,
    ReadinessTransition,
    LifecycleUpdate,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 单帧处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// 实际执行的阶段数
    pub stages_run: usize,
    /// 返回 `false` 的阶段
    pub halted_at: Option<StageKind>,
}

impl PipelineOutcome {
    pub fn completed(&self) -> bool {
        self.halted_at.is_none()
    }
}

/// 固定顺序的阶段表
#[derive(Clone, Copy)]
pub struct ResponsePipeline {
    stages: [(StageKind, Stage); 5],
}

impl fmt::Debug for ResponsePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|(kind, _)| kind))
            .finish()
    }
}

impl Default for ResponsePipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl ResponsePipeline {
    pub const fn standard() -> Self {
        Self {
            stages: [
                (StageKind::Log, log_stage),
                (StageKind::ErrorCheck, error_check_stage),
                (StageKind::DataExtraction, data_extraction_stage),
                (StageKind::ReadinessTransition, readiness_transition_stage),
                (StageKind::LifecycleUpdate, lifecycle_update_stage),
            ],
        }
    }

    pub fn stages(&self) -> impl Iterator<Item = StageKind> + '_ {
        self.stages.iter().map(|&(kind, _)| kind)
    }

    pub fn process(&self, ctx: &StageContext<'_>, frame: &ServoFrame) -> PipelineOutcome {
        DriverMetrics::incr(&ctx.metrics.responses_processed);
        let mut outcome = PipelineOutcome {
            stages_run: 0,
            halted_at: None,
        };
        for &(kind, stage) in &self.stages {
            outcome.stages_run += 1;
            if !stage(ctx, frame) {
                trace!("Motor 0x{:03X}: pipeline halted at {}", ctx.motor_id, kind);
                outcome.halted_at = Some(kind);
                break;
            }
        }
        outcome
    }
}

fn command_of(frame: &ServoFrame) -> Option<CommandCode> {
    frame.command_byte().and_then(CommandCode::from_u8)
}

fn command_name(frame: &ServoFrame) -> &'static str {
    command_of(frame).map_or("UNKNOWN", CommandCode::name)
}

pub fn log_stage(ctx: &StageContext<'_>, frame: &ServoFrame) -> bool {
    debug!(
        "RX motor 0x{:03X} len={} {} [{}]",
        ctx.motor_id,
        frame.len,
        command_name(frame),
        frame.hex_dump()
    );
    true
}

pub fn error_check_stage(ctx: &StageContext<'_>, frame: &ServoFrame) -> bool {
    // 校验失败的帧交给解码阶段处理，这里不信任它的状态字节
    if verify_checksum(frame).is_err() {
        return true;
    }
    let Some(code) = command_of(frame) else {
        return true;
    };
    if !ctx.codec.checks_status(code) || frame.status_byte() != Some(0) {
        return true;
    }

    DriverMetrics::incr(&ctx.metrics.protocol_errors);
    let reason = format!("{} reported failure (status 0)", code.name());
    warn!("Motor 0x{:03X}: {}", ctx.motor_id, reason);
    ctx.context.fail(&reason);
    match ctx.tracker.transition(ctx.motor_id, code, CommandState::Error) {
        Ok(()) | Err(LifecycleError::UnknownEntry { .. }) => {},
        Err(err) => debug!("{err}"),
    }
    true
}

pub fn data_extraction_stage(ctx: &StageContext<'_>, frame: &ServoFrame) -> bool {
    match ctx.codec.decode(frame) {
        Ok(Some(response)) => {
            ctx.context.apply_response(&response);
            true
        },
        Ok(None) => {
            ctx.context.touch();
            true
        },
        Err(CodecError::SchemaNotFound { code }) => {
            debug!(
                "Motor 0x{:03X}: no schema for command byte 0x{:02X}",
                ctx.motor_id, code
            );
            ctx.context.touch();
            true
        },
        Err(err) => {
            DriverMetrics::incr(&ctx.metrics.decode_errors);
            let reason = format!("malformed {} response: {}", command_name(frame), err);
            warn!("Motor 0x{:03X}: {} [{}]", ctx.motor_id, reason, frame.hex_dump());
            ctx.context.fail(&reason);
            false
        },
    }
}

pub fn readiness_transition_stage(ctx: &StageContext<'_>, frame: &ServoFrame) -> bool {
    let reason = format!("{} response received", command_name(frame));
    if let Err(err) = ctx.context.transition_if(
        &[ReadinessState::Initializing, ReadinessState::Recovering],
        ReadinessState::Ready,
        &reason,
    ) {
        debug!("{err}");
    }
    true
}

pub fn lifecycle_update_stage(ctx: &StageContext<'_>, frame: &ServoFrame) -> bool {
    let Some(code) = command_of(frame) else {
        return true;
    };
    let Some(schema) = ctx.codec.registry().response_schema_for(code) else {
        return true;
    };

    let target = match schema.kind() {
        ResponseKind::Motion => {
            match RunStatus::from_field(i64::from(frame.status_byte().unwrap_or(0))) {
                RunStatus::Failed => return true,
                RunStatus::Started => CommandState::Executing,
                _ => CommandState::Processed,
            }
        },
        _ => CommandState::Processed,
    };

    match ctx.tracker.state_of(ctx.motor_id, code) {
        None => {
            trace!(
                "Motor 0x{:03X}: unsolicited {} response",
                ctx.motor_id,
                code.name()
            );
        },
        Some(CommandState::Error) => {},
        Some(_) => {
            if let Err(err) = ctx.tracker.advance_toward(ctx.motor_id, code, target) {
                debug!("{err}");
            }
        },
    }
    true
}
