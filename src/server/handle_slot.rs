//! 一次性句柄槽
//!
//! 启动阶段把服务器句柄放进槽里，关闭阶段无阻塞地取出。
//! 封口之后不会再有句柄到来，此时读到空槽即表示“从未启动”。

use std::sync::{Mutex, MutexGuard, OnceLock};

/// 槽的观测状态
#[derive(Debug, PartialEq, Eq)]
pub enum SlotState<'a, T> {
    /// 尚未投递也未封口
    Pending,
    /// 已投递
    Delivered(&'a T),
    /// 已封口且从未投递
    NeverStarted,
}

/// 一次性句柄槽
///
/// 投递与封口在同一把锁下完成：封口之后观测到的状态不会再变。
pub struct HandleSlot<T> {
    value: OnceLock<T>,
    sealed: Mutex<bool>,
}

impl<T> HandleSlot<T> {
    pub const fn new() -> Self {
        Self {
            value: OnceLock::new(),
            sealed: Mutex::new(false),
        }
    }

    fn sealed(&self) -> MutexGuard<'_, bool> {
        self.sealed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 投递句柄；已投递或已封口时把值原样退回
    pub fn deliver(&self, value: T) -> Result<(), T> {
        let sealed = self.sealed();
        if *sealed {
            return Err(value);
        }
        self.value.set(value)
    }

    /// 封口：之后的投递全部失败
    pub fn seal(&self) {
        *self.sealed() = true;
    }

    pub fn is_sealed(&self) -> bool {
        *self.sealed()
    }

    pub fn get(&self) -> Option<&T> {
        self.value.get()
    }

    pub fn state(&self) -> SlotState<'_, T> {
        let sealed = self.sealed();
        match self.value.get() {
            Some(value) => SlotState::Delivered(value),
            None if *sealed => SlotState::NeverStarted,
            None => SlotState::Pending,
        }
    }
}

impl<T> Default for HandleSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
