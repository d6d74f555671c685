//! 电机上下文
//!
//! 每个电机一份可变状态：就绪状态、运行状态、最近一次收到响应的时间、
//! 属性表与最近错误。所有读写都在同一把锁内完成，
//! 就绪迁移的通知也在锁内发出，保证订阅者看到的顺序与迁移顺序一致。

use crate::clock::{SharedClock, Timestamp};
use crate::notify::Notifier;
use crate::readiness::{ReadinessError, ReadinessEvent, ReadinessFlags, ReadinessState};
use crossbeam_channel::Sender;
use mks_protocol::{CommandCode, DecodedResponse, MotorId, MovingState};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

/// 就绪历史保留条数
pub const READINESS_HISTORY_LEN: usize = 32;

/// 一次就绪迁移的记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ReadinessRecord {
    pub state: ReadinessState,
    pub at_us: Timestamp,
}

/// 锁内状态
#[derive(Debug, Clone, Default)]
pub struct MotorContext {
    pub readiness: ReadinessState,
    pub moving: MovingState,
    pub last_seen_us: Option<Timestamp>,
    /// 响应字段（字段名 → 最近一次的值）
    pub properties: BTreeMap<&'static str, i64>,
    pub last_error: Option<String>,
    pub history: VecDeque<ReadinessRecord>,
}

/// 对外的只读副本
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct MotorSnapshot {
    pub motor_id: MotorId,
    pub readiness: ReadinessState,
    pub moving: MovingState,
    pub last_seen_us: Option<Timestamp>,
    pub properties: BTreeMap<String, i64>,
    pub last_error: Option<String>,
    pub history: Vec<ReadinessRecord>,
}

impl MotorSnapshot {
    pub fn property(&self, name: &str) -> Option<i64> {
        self.properties.get(name).copied()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness == ReadinessState::Ready
    }
}

/// 电机上下文句柄（在电机工作线程、流水线与控制器之间共享）
pub struct ContextHandle {
    motor_id: MotorId,
    inner: Mutex<MotorContext>,
    flags: ReadinessFlags,
    events: Sender<ReadinessEvent>,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("motor_id", &self.motor_id)
            .field("readiness", &self.flags.state())
            .finish()
    }
}

impl ContextHandle {
    /// `events` 是电机工作线程的本地通道，`notifier` 是全局通知端口
    pub fn new(
        motor_id: MotorId,
        events: Sender<ReadinessEvent>,
        notifier: Arc<dyn Notifier>,
        clock: SharedClock,
    ) -> Self {
        Self {
            motor_id,
            inner: Mutex::new(MotorContext::default()),
            flags: ReadinessFlags::new(),
            events,
            notifier,
            clock,
        }
    }

    pub fn motor_id(&self) -> MotorId {
        self.motor_id
    }

    /// 就绪状态迁移
    ///
    /// 迁移到当前状态返回 `Ok(false)`：不记录历史、不发通知。
    pub fn transition(
        &self,
        to: ReadinessState,
        reason: &str,
    ) -> Result<bool, ReadinessError> {
        let mut ctx = self.inner.lock();
        self.transition_locked(&mut ctx, to, reason)
    }

    fn transition_locked(
        &self,
        ctx: &mut MotorContext,
        to: ReadinessState,
        reason: &str,
    ) -> Result<bool, ReadinessError> {
        let from = ctx.readiness;
        if from == to {
            return Ok(false);
        }
        if !from.can_transition_to(to) {
            return Err(ReadinessError::IllegalTransition {
                motor_id: self.motor_id,
                from,
                to,
            });
        }

        let now = self.clock.now_us();
        ctx.readiness = to;
        ctx.history.push_back(ReadinessRecord {
            state: to,
            at_us: now,
        });
        while ctx.history.len() > READINESS_HISTORY_LEN {
            ctx.history.pop_front();
        }
        if to == ReadinessState::Error {
            ctx.last_error = Some(reason.to_string());
        }
        self.flags.store(to);

        if to == ReadinessState::Error {
            warn!("Motor 0x{:03X}: {} -> {} ({})", self.motor_id, from, to, reason);
        } else {
            info!("Motor 0x{:03X}: {} -> {} ({})", self.motor_id, from, to, reason);
        }

        let event = ReadinessEvent {
            motor_id: self.motor_id,
            from,
            to,
            at_us: now,
            reason: reason.to_string(),
        };
        self.notifier.publish(&event);
        // 工作线程退出后本地通道会断开，此时没有人需要这条通知
        let _ = self.events.send(event);
        Ok(true)
    }

    /// 进入 Error
    ///
    /// 已在 Error 时只更新 `last_error`；返回是否发生了迁移。
    pub fn fail(&self, reason: &str) -> bool {
        let mut ctx = self.inner.lock();
        match ctx.readiness {
            ReadinessState::Error => {
                ctx.last_error = Some(reason.to_string());
                false
            },
            _ => match self.transition_locked(&mut ctx, ReadinessState::Error, reason) {
                Ok(changed) => changed,
                Err(err) => {
                    ctx.last_error = Some(reason.to_string());
                    warn!("{err} ({reason})");
                    false
                },
            },
        }
    }

    /// 仅在当前状态为 `from` 之一时迁移（读取与迁移在同一次加锁内）
    pub fn transition_if(
        &self,
        from: &[ReadinessState],
        to: ReadinessState,
        reason: &str,
    ) -> Result<bool, ReadinessError> {
        let mut ctx = self.inner.lock();
        if !from.contains(&ctx.readiness) {
            return Ok(false);
        }
        self.transition_locked(&mut ctx, to, reason)
    }

    /// 把解码出的响应写入上下文
    pub fn apply_response(&self, response: &DecodedResponse) {
        let now = self.clock.now_us();
        let mut ctx = self.inner.lock();
        ctx.last_seen_us = Some(now);
        for (name, value) in response.fields.iter() {
            ctx.properties.insert(name, value);
        }
        if response.code == CommandCode::QueryMotorStatus
            && let Some(status) = response.fields.get("motor_status")
        {
            ctx.moving = MovingState::from_field(status);
        }
    }

    /// 收到了没有数据的响应
    pub fn touch(&self) {
        let now = self.clock.now_us();
        self.inner.lock().last_seen_us = Some(now);
    }

    /// 记录错误但不迁移
    pub fn record_error(&self, reason: &str) {
        self.inner.lock().last_error = Some(reason.to_string());
    }

    /// 在锁内读取
    pub fn with<R>(&self, f: impl FnOnce(&MotorContext) -> R) -> R {
        f(&*self.inner.lock())
    }

    pub fn readiness(&self) -> ReadinessState {
        self.inner.lock().readiness
    }

    /// 无锁读取（可能落后于正在进行的迁移）
    pub fn flags(&self) -> &ReadinessFlags {
        &self.flags
    }

    pub fn is_ready(&self) -> bool {
        self.flags.is_ready()
    }

    pub fn snapshot(&self) -> MotorSnapshot {
        let ctx = self.inner.lock();
        MotorSnapshot {
            motor_id: self.motor_id,
            readiness: ctx.readiness,
            moving: ctx.moving,
            last_seen_us: ctx.last_seen_us,
            properties: ctx
                .properties
                .iter()
                .map(|(&name, &value)| (name.to_string(), value))
                .collect(),
            last_error: ctx.last_error.clone(),
            history: ctx.history.iter().copied().collect(),
        }
    }
}
