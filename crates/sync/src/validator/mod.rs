//! 锁序校验器
//!
//! 旁路观察所有 CPU 上的自旋锁获取与释放，在执行过程中持续证明两件事：
//!
//! 1. 已观察到的加锁行为尚未构成死锁；
//! 2. 释放严格遵循嵌套顺序（释放的必须是持有 CPU 上最近获取、仍持有的锁）。
//!
//! # 死锁判定
//!
//! 等待关系 `waits(cpu) = other` 每次现算：`cpu` 有一次挂起的获取尝试，
//! 且目标锁当前由 `other` 持有。若 `waits(A) = B` 且 `waits(B) = A`，
//! 两个 CPU 都在自旋、都无法执行到释放自己所持锁的代码，必然已经死锁。
//! 环长固定为 2，每次检查的开销有上界。
//!
//! # 失败语义
//!
//! 结构性损坏总是停机；顺序违例与死锁在 fatal 模式下停机，否则返回错误并记录警告。
//! 在 ready 之前，所有操作都是成功的空操作。

mod table;

pub use table::LockStack;

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use lock_api::Mutex;

use self::table::{LockTable, RawTableLock, TableGuard};
use crate::intr_guard::IntrGuard;
use crate::{ArchOps, FatalHandler, LockId, ValidationError};

/// 默认可跟踪的 CPU 数量
pub const DEFAULT_MAX_CPUS: usize = 16;

/// 默认每个 CPU 可嵌套持有的锁数量
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// 校验器视角下一把锁的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// 没有 CPU 持有或尝试获取
    Inactive,
    /// 有 CPU 正在尝试获取，但没有 CPU 持有
    Attempted,
    /// 被某个 CPU 持有
    Acquired,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockState::Inactive => "inactive",
            LockState::Attempted => "attempted",
            LockState::Acquired => "acquired",
        };
        f.write_str(name)
    }
}

/// 自旋锁向校验器报告事件的接口
///
/// 这些方法从不停机：违例以 `Err` 返回，由调用方（自旋锁）以自己的致命诊断上报。
pub trait LockTracker: Sync {
    /// 即将开始自旋获取 `lock`
    fn attempted(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError>;

    /// 自旋期间重新检查是否已形成死锁
    fn check(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError>;

    /// 已经获得 `lock`
    fn acquired(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError>;

    /// 即将释放 `lock`
    fn released(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError>;
}

/// 锁序校验器
///
/// 显式构造、可注入；测试中可以建立多个互不干扰的实例。
/// 容量由 `CPUS` 与 `DEPTH` 决定，以便 `const` 构造为 `static`。
pub struct LockOrderValidator<
    'a,
    const CPUS: usize = DEFAULT_MAX_CPUS,
    const DEPTH: usize = DEFAULT_MAX_DEPTH,
> {
    ready: AtomicBool,
    fatal: AtomicBool,
    arch: &'a dyn ArchOps,
    halt: &'a dyn FatalHandler,
    table: Mutex<RawTableLock, LockTable<CPUS, DEPTH>>,
}

impl<'a, const CPUS: usize, const DEPTH: usize> LockOrderValidator<'a, CPUS, DEPTH> {
    /// 创建校验器。初始既未 ready 也非 fatal。
    ///
    /// `arch` 用于在访问账本期间关闭本地中断。
    pub const fn new(arch: &'a dyn ArchOps, halt: &'a dyn FatalHandler) -> Self {
        LockOrderValidator {
            ready: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            arch,
            halt,
            table: Mutex::const_new(
                <RawTableLock as lock_api::RawMutex>::INIT,
                LockTable::new(),
            ),
        }
    }

    /// 开始校验（内核初始化完成后调用）
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
        log::debug!("lock tracking: ready");
    }

    /// 停止校验，之后所有操作都是空操作
    pub fn clear_ready(&self) {
        self.ready.store(false, Ordering::Release);
        log::debug!("lock tracking: not ready");
    }

    /// 违例时停机
    pub fn set_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
        log::debug!("lock tracking: violations are fatal");
    }

    /// 违例时仅返回错误
    pub fn clear_fatal(&self) {
        self.fatal.store(false, Ordering::Release);
        log::debug!("lock tracking: violations are not fatal");
    }

    /// 是否已 ready
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// 是否处于 fatal 模式
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// 记录 `cpu` 将要获取 `lock`。总是成功。
    pub fn lock_attempted(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError> {
        self.enforce(self.record_attempt(lock, cpu))
    }

    /// 按当前状态重新判断 `cpu` 对 `lock` 的挂起尝试是否已处于死锁环中。
    ///
    /// 纯查询，不修改任何状态；没有中间修改时重复调用结果相同。
    /// `cpu` 没有对 `lock` 的挂起尝试时总是成功。
    pub fn check_state(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError> {
        self.enforce(self.evaluate(lock, cpu))
    }

    /// 记录 `cpu` 已获得 `lock`，将其压入 `cpu` 的获取栈。
    pub fn lock_acquired(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError> {
        self.enforce(self.record_acquire(lock, cpu))
    }

    /// 记录 `lock` 被释放。
    ///
    /// 释放可以在与获取不同的 CPU 上报告（例如中断处理程序中），
    /// 出栈的是实际持有者的获取栈，且被释放的锁必须位于栈顶。
    pub fn lock_released(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError> {
        self.enforce(self.record_release(lock, cpu))
    }

    /// `cpu` 当前持有的锁（栈底到栈顶）
    pub fn held_locks(&self, cpu: usize) -> LockStack<DEPTH> {
        self.lock_table()
            .slot(cpu)
            .map(|slot| slot.held)
            .unwrap_or(LockStack::EMPTY)
    }

    /// `cpu` 挂起的获取尝试
    pub fn pending(&self, cpu: usize) -> Option<LockId> {
        self.lock_table().slot(cpu).and_then(|slot| slot.pending)
    }

    /// 持有 `lock` 的 CPU
    pub fn holder_of(&self, lock: LockId) -> Option<usize> {
        self.lock_table().holder_of(lock)
    }

    /// `lock` 的当前状态
    pub fn state_of(&self, lock: LockId) -> LockState {
        let table = self.lock_table();
        Self::state_in(&table, lock)
    }

    /// 输出所有有活动的 CPU 的挂起尝试与获取栈
    pub fn dump(&self, out: &mut impl fmt::Write) -> fmt::Result {
        let table = self.lock_table();
        for (cpu, slot) in table.slots() {
            if slot.held.is_empty() && slot.pending.is_none() {
                continue;
            }
            write!(out, "CPU {}: pending ", cpu)?;
            match slot.pending {
                Some(lock) => write!(out, "{} ({})", lock, Self::state_in(&table, lock))?,
                None => out.write_str("-")?,
            }
            out.write_str(", held [")?;
            for (i, lock) in slot.held.as_slice().iter().enumerate() {
                if i > 0 {
                    out.write_str(", ")?;
                }
                write!(out, "{}", lock)?;
            }
            out.write_str("]\n")?;
        }
        Ok(())
    }

    fn state_in(table: &LockTable<CPUS, DEPTH>, lock: LockId) -> LockState {
        if table.holder_of(lock).is_some() {
            LockState::Acquired
        } else if table.is_attempted(lock) {
            LockState::Attempted
        } else {
            LockState::Inactive
        }
    }

    /// 关闭本地中断并锁住账本
    fn lock_table(&self) -> TableGuard<'_, CPUS, DEPTH> {
        let intr = IntrGuard::new(self.arch);
        TableGuard::new(self.table.lock(), intr)
    }

    /// 按 fatal 开关处理违例
    fn enforce(&self, result: Result<(), ValidationError>) -> Result<(), ValidationError> {
        if let Err(err) = result {
            if err.is_corruption() || self.is_fatal() {
                self.halt.fatal(format_args!("PANIC: {}", err));
            }
            log::warn!("lock tracking: {}", err);
        }
        result
    }

    fn check_cpu(cpu: usize) -> Result<(), ValidationError> {
        if cpu >= CPUS {
            return Err(ValidationError::CpuOutOfRange { cpu });
        }
        Ok(())
    }

    fn record_attempt(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError> {
        if !self.is_ready() {
            return Ok(());
        }
        Self::check_cpu(cpu)?;
        self.lock_table().set_pending(cpu, lock);
        Ok(())
    }

    fn evaluate(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError> {
        if !self.is_ready() {
            return Ok(());
        }
        Self::check_cpu(cpu)?;
        let table = self.lock_table();
        let pending = table.slot(cpu).and_then(|slot| slot.pending);
        if pending != Some(lock) {
            return Ok(());
        }
        let Some(other) = table.waits(cpu) else {
            return Ok(());
        };
        if table.waits(other) == Some(cpu) {
            return Err(ValidationError::Inversion { cpu, other });
        }
        Ok(())
    }

    fn record_acquire(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError> {
        if !self.is_ready() {
            return Ok(());
        }
        Self::check_cpu(cpu)?;
        let mut table = self.lock_table();
        if let Some(holder) = table.holder_of(lock) {
            if holder != cpu {
                return Err(ValidationError::AlreadyHeld { lock, holder, cpu });
            }
        }
        if !table.push_held(cpu, lock) {
            return Err(ValidationError::StackOverflow { cpu, lock });
        }
        Ok(())
    }

    fn record_release(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError> {
        if !self.is_ready() {
            return Ok(());
        }
        Self::check_cpu(cpu)?;
        let mut table = self.lock_table();
        let holder = table
            .holder_of(lock)
            .ok_or(ValidationError::NotHeld { lock, cpu })?;
        let top = table.slot(holder).and_then(|slot| slot.held.top());
        match top {
            Some(top) if top == lock => {
                table.pop_held(holder);
                Ok(())
            }
            Some(expected) => Err(ValidationError::OutOfOrderRelease {
                released: lock,
                expected,
                expected_state: Self::state_in(&table, expected),
            }),
            // holder_of 找到了持有者，栈不可能为空
            None => Err(ValidationError::NotHeld { lock, cpu }),
        }
    }
}

impl<const CPUS: usize, const DEPTH: usize> LockTracker for LockOrderValidator<'_, CPUS, DEPTH> {
    fn attempted(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError> {
        self.record_attempt(lock, cpu)
    }

    fn check(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError> {
        self.evaluate(lock, cpu)
    }

    fn acquired(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError> {
        self.record_acquire(lock, cpu)
    }

    fn released(&self, lock: LockId, cpu: usize) -> Result<(), ValidationError> {
        self.record_release(lock, cpu)
    }
}
