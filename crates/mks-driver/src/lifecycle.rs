//! 命令生命周期跟踪
//!
//! 每个 (电机, 命令码) 对应一条记录，状态沿
//! `Created → Sent → Executing → Processed` 推进，或落入 `Error` / `Timeout`。
//! 非法迁移与不存在的记录都以 `Err` 返回，不会被静默吞掉。
//!
//! 锁粒度为每电机一把 `Mutex`，外层 `RwLock` 只在增删电机时写锁定。

use crate::clock::{SharedClock, Timestamp};
use mks_protocol::{CommandCode, MotorId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// 默认历史条数上限
pub const DEFAULT_MAX_HISTORY: usize = 16;

/// 命令状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum CommandState {
    Created,
    Sent,
    Executing,
    Processed,
    Error,
    Timeout,
    Unknown,
}

impl CommandState {
    /// 合法迁移表
    pub fn can_transition_to(self, to: CommandState) -> bool {
        use CommandState::*;
        matches!(
            (self, to),
            (Created, Sent)
                | (Sent, Executing)
                | (Executing, Processed)
                | (Timeout, Executing)
                | (Unknown, Created)
                | (Sent, Timeout)
                | (Created | Sent | Executing | Timeout, Error)
        )
    }

    /// 已结束（不会再被响应推进）
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Processed | CommandState::Error)
    }

    /// 已发出、等待驱动器响应或完成
    pub fn is_pending(self) -> bool {
        matches!(self, CommandState::Sent | CommandState::Executing)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 生命周期错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("No lifecycle entry for motor 0x{motor_id:03X} command {}", .code.name())]
    UnknownEntry { motor_id: MotorId, code: CommandCode },

    #[error(
        "Illegal lifecycle transition for motor 0x{motor_id:03X} command {}: {from} -> {to}",
        .code.name()
    )]
    IllegalTransition {
        motor_id: MotorId,
        code: CommandCode,
        from: CommandState,
        to: CommandState,
    },
}

/// 一次状态变更
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct StateRecord {
    pub state: CommandState,
    pub at_us: Timestamp,
}

/// 单条命令的生命周期记录
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct LifecycleEntry {
    pub state: CommandState,
    pub created_at_us: Timestamp,
    pub updated_at_us: Timestamp,
    /// 仅在 `Sent` 状态下有效
    pub deadline_us: Option<Timestamp>,
    /// 最近的状态记录（超过上限时丢弃最旧的）
    pub history: VecDeque<StateRecord>,
}

impl LifecycleEntry {
    fn new(now: Timestamp, max_history: usize) -> Self {
        let mut history = VecDeque::with_capacity(max_history.min(DEFAULT_MAX_HISTORY));
        history.push_back(StateRecord {
            state: CommandState::Created,
            at_us: now,
        });
        Self {
            state: CommandState::Created,
            created_at_us: now,
            updated_at_us: now,
            deadline_us: None,
            history,
        }
    }

    fn record(&mut self, state: CommandState, now: Timestamp, max_history: usize) {
        self.state = state;
        self.updated_at_us = now;
        if state != CommandState::Sent {
            self.deadline_us = None;
        }
        self.history.push_back(StateRecord { state, at_us: now });
        while self.history.len() > max_history {
            self.history.pop_front();
        }
    }

    /// 是否已过期（仅 `Sent` 记录会过期）
    pub fn is_overdue(&self, now: Timestamp) -> bool {
        self.state == CommandState::Sent && self.deadline_us.is_some_and(|deadline| now >= deadline)
    }
}

type MotorCommands = HashMap<CommandCode, LifecycleEntry>;

/// 命令生命周期跟踪器
pub struct CommandTracker {
    motors: RwLock<HashMap<MotorId, Arc<Mutex<MotorCommands>>>>,
    clock: SharedClock,
    max_history: usize,
}

impl fmt::Debug for CommandTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTracker")
            .field("motors", &self.motors.read().len())
            .field("max_history", &self.max_history)
            .finish()
    }
}

impl CommandTracker {
    pub fn new(clock: SharedClock, max_history: usize) -> Self {
        Self {
            motors: RwLock::new(HashMap::new()),
            clock,
            max_history: max_history.max(1),
        }
    }

    fn slot(&self, motor_id: MotorId) -> Option<Arc<Mutex<MotorCommands>>> {
        self.motors.read().get(&motor_id).cloned()
    }

    fn slot_or_insert(&self, motor_id: MotorId) -> Arc<Mutex<MotorCommands>> {
        if let Some(slot) = self.slot(motor_id) {
            return slot;
        }
        self.motors.write().entry(motor_id).or_default().clone()
    }

    /// 在单个电机的锁内操作一条已存在的记录
    fn with_entry<R>(
        &self,
        motor_id: MotorId,
        code: CommandCode,
        f: impl FnOnce(&mut LifecycleEntry) -> Result<R, LifecycleError>,
    ) -> Result<R, LifecycleError> {
        let slot = self
            .slot(motor_id)
            .ok_or(LifecycleError::UnknownEntry { motor_id, code })?;
        let mut commands = slot.lock();
        let entry = commands
            .get_mut(&code)
            .ok_or(LifecycleError::UnknownEntry { motor_id, code })?;
        f(entry)
    }

    /// 为一次新的命令下发创建记录
    ///
    /// 同一命令码已有记录时直接覆盖，旧记录不归档。
    pub fn register(&self, motor_id: MotorId, code: CommandCode) {
        let now = self.clock.now_us();
        let slot = self.slot_or_insert(motor_id);
        let previous = slot
            .lock()
            .insert(code, LifecycleEntry::new(now, self.max_history));
        if let Some(previous) = previous
            && previous.state.is_pending()
        {
            debug!(
                "Motor 0x{:03X}: {} re-issued while {}",
                motor_id,
                code.name(),
                previous.state
            );
        }
    }

    /// 登记并标记为 `Sent`（同一次加锁内完成）
    ///
    /// 下发路径使用这个入口：并发下发同一命令码时，每一次下发都得到
    /// 自己的 `Created → Sent` 记录，不会互相撞上 `Sent → Sent`。
    pub fn register_sent(&self, motor_id: MotorId, code: CommandCode, deadline_us: Timestamp) {
        let now = self.clock.now_us();
        let mut entry = LifecycleEntry::new(now, self.max_history);
        entry.record(CommandState::Sent, now, self.max_history);
        entry.deadline_us = Some(deadline_us);

        let slot = self.slot_or_insert(motor_id);
        let previous = slot.lock().insert(code, entry);
        if let Some(previous) = previous
            && previous.state.is_pending()
        {
            debug!(
                "Motor 0x{:03X}: {} re-issued while {}",
                motor_id,
                code.name(),
                previous.state
            );
        }
    }

    /// 按迁移表推进一步
    pub fn transition(
        &self,
        motor_id: MotorId,
        code: CommandCode,
        to: CommandState,
    ) -> Result<(), LifecycleError> {
        let now = self.clock.now_us();
        let max_history = self.max_history;
        self.with_entry(motor_id, code, |entry| {
            Self::step(motor_id, code, entry, to, now, max_history)
        })
    }

    fn step(
        motor_id: MotorId,
        code: CommandCode,
        entry: &mut LifecycleEntry,
        to: CommandState,
        now: Timestamp,
        max_history: usize,
    ) -> Result<(), LifecycleError> {
        let from = entry.state;
        if !from.can_transition_to(to) {
            return Err(LifecycleError::IllegalTransition {
                motor_id,
                code,
                from,
                to,
            });
        }
        entry.record(to, now, max_history);
        trace!("Motor 0x{:03X}: {} {} -> {}", motor_id, code.name(), from, to);
        Ok(())
    }

    /// `Created → Sent`，并设置响应截止时间
    pub fn mark_sent(
        &self,
        motor_id: MotorId,
        code: CommandCode,
        deadline_us: Timestamp,
    ) -> Result<(), LifecycleError> {
        let now = self.clock.now_us();
        let max_history = self.max_history;
        self.with_entry(motor_id, code, |entry| {
            Self::step(motor_id, code, entry, CommandState::Sent, now, max_history)?;
            entry.deadline_us = Some(deadline_us);
            Ok(())
        })
    }

    /// 沿正常路径逐步推进到 `target`（`Executing` 或 `Processed`）
    ///
    /// 已在 `Processed` 时为空操作；迟到的响应可以把 `Timeout` 拉回 `Executing`。
    /// 返回推进后的状态。
    pub fn advance_toward(
        &self,
        motor_id: MotorId,
        code: CommandCode,
        target: CommandState,
    ) -> Result<CommandState, LifecycleError> {
        let now = self.clock.now_us();
        let max_history = self.max_history;
        self.with_entry(motor_id, code, |entry| {
            if !matches!(target, CommandState::Executing | CommandState::Processed) {
                return Err(LifecycleError::IllegalTransition {
                    motor_id,
                    code,
                    from: entry.state,
                    to: target,
                });
            }
            loop {
                let next = match (entry.state, target) {
                    (CommandState::Processed, _) => break,
                    (CommandState::Executing, CommandState::Executing) => break,
                    (CommandState::Sent | CommandState::Timeout, _) => CommandState::Executing,
                    (CommandState::Executing, _) => CommandState::Processed,
                    (from, to) => {
                        return Err(LifecycleError::IllegalTransition {
                            motor_id,
                            code,
                            from,
                            to,
                        });
                    },
                };
                Self::step(motor_id, code, entry, next, now, max_history)?;
            }
            Ok(entry.state)
        })
    }

    pub fn entry(&self, motor_id: MotorId, code: CommandCode) -> Option<LifecycleEntry> {
        self.slot(motor_id)?.lock().get(&code).cloned()
    }

    pub fn state_of(&self, motor_id: MotorId, code: CommandCode) -> Option<CommandState> {
        self.slot(motor_id)?.lock().get(&code).map(|entry| entry.state)
    }

    /// 仍在等待的命令（`Sent` / `Executing`），按命令码排序
    pub fn pending(&self, motor_id: MotorId) -> Vec<CommandCode> {
        let Some(slot) = self.slot(motor_id) else {
            return Vec::new();
        };
        let mut codes: Vec<_> = slot
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state.is_pending())
            .map(|(&code, _)| code)
            .collect();
        codes.sort();
        codes
    }

    /// 把一个电机所有过期的 `Sent` 记录迁移到 `Timeout`
    pub fn sweep_motor(&self, motor_id: MotorId, now: Timestamp) -> Vec<CommandCode> {
        let Some(slot) = self.slot(motor_id) else {
            return Vec::new();
        };
        let mut commands = slot.lock();
        let mut expired = Vec::new();
        for (&code, entry) in commands.iter_mut() {
            if entry.is_overdue(now)
                && Self::step(
                    motor_id,
                    code,
                    entry,
                    CommandState::Timeout,
                    now,
                    self.max_history,
                )
                .is_ok()
            {
                expired.push(code);
            }
        }
        expired.sort();
        expired
    }

    /// 扫描全部电机
    pub fn sweep_timeouts(&self, now: Timestamp) -> Vec<(MotorId, CommandCode)> {
        let mut motor_ids: Vec<MotorId> = self.motors.read().keys().copied().collect();
        motor_ids.sort_unstable();
        motor_ids
            .into_iter()
            .flat_map(|motor_id| {
                self.sweep_motor(motor_id, now)
                    .into_iter()
                    .map(move |code| (motor_id, code))
            })
            .collect()
    }

    pub fn remove_motor(&self, motor_id: MotorId) -> bool {
        self.motors.write().remove(&motor_id).is_some()
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }
}
