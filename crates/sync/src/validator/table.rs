//! 校验器内部的账本与保护它的原始锁
//!
//! 账本本身不能使用被校验的自旋锁（否则校验器会递归校验自己），
//! 因此使用一把独立的测试并设置锁，通过 `lock_api` 包装成互斥量。
//! 持有账本期间本地中断始终关闭，见 [`TableGuard`]。

use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use lock_api::MutexGuard;

use crate::LockId;
use crate::intr_guard::IntrGuard;

/// 账本专用的原始锁，本身不禁用中断，也不参与锁序校验。
///
/// 只能通过 [`TableGuard`] 持有。
pub(super) struct RawTableLock {
    locked: AtomicBool,
}

unsafe impl lock_api::RawMutex for RawTableLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawTableLock {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// 账本的保护器：先关闭本地中断再加锁，先解锁再恢复中断。
///
/// 持有期间同一 CPU 上的中断处理程序无法进入校验器。
pub(super) struct TableGuard<'v, const CPUS: usize, const DEPTH: usize> {
    // 字段按声明顺序析构：账本锁必须先于中断保护器释放
    table: MutexGuard<'v, RawTableLock, LockTable<CPUS, DEPTH>>,
    _intr: IntrGuard<'v>,
}

impl<'v, const CPUS: usize, const DEPTH: usize> TableGuard<'v, CPUS, DEPTH> {
    /// `intr` 必须在加锁之前创建
    pub(super) fn new(
        table: MutexGuard<'v, RawTableLock, LockTable<CPUS, DEPTH>>,
        intr: IntrGuard<'v>,
    ) -> Self {
        TableGuard { table, _intr: intr }
    }
}

impl<const CPUS: usize, const DEPTH: usize> Deref for TableGuard<'_, CPUS, DEPTH> {
    type Target = LockTable<CPUS, DEPTH>;

    fn deref(&self) -> &Self::Target {
        &self.table
    }
}

impl<const CPUS: usize, const DEPTH: usize> DerefMut for TableGuard<'_, CPUS, DEPTH> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.table
    }
}

/// 单个 CPU 的获取栈（栈底为最早获取，栈顶为最近获取）
#[derive(Debug, Clone, Copy)]
pub struct LockStack<const DEPTH: usize> {
    locks: [LockId; DEPTH],
    len: usize,
}

impl<const DEPTH: usize> LockStack<DEPTH> {
    pub(crate) const EMPTY: Self = LockStack {
        locks: [LockId::new(0); DEPTH],
        len: 0,
    };

    /// 按获取顺序排列的锁
    pub fn as_slice(&self) -> &[LockId] {
        &self.locks[..self.len]
    }

    /// 栈中锁的数量（递归获取的锁会出现多次）
    pub fn len(&self) -> usize {
        self.len
    }

    /// 栈是否为空
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 最近获取且仍持有的锁
    pub fn top(&self) -> Option<LockId> {
        self.as_slice().last().copied()
    }

    /// 栈中是否有该锁
    pub fn contains(&self, lock: LockId) -> bool {
        self.as_slice().contains(&lock)
    }

    fn push(&mut self, lock: LockId) -> bool {
        if self.len == DEPTH {
            return false;
        }
        self.locks[self.len] = lock;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<LockId> {
        let top = self.top()?;
        self.len -= 1;
        Some(top)
    }
}

#[derive(Clone, Copy)]
pub(super) struct CpuSlot<const DEPTH: usize> {
    pub(super) held: LockStack<DEPTH>,
    /// 正在尝试获取（可能正在自旋）的锁
    pub(super) pending: Option<LockId>,
}

impl<const DEPTH: usize> CpuSlot<DEPTH> {
    const EMPTY: Self = CpuSlot {
        held: LockStack::EMPTY,
        pending: None,
    };
}

/// 所有 CPU 的账本
pub(super) struct LockTable<const CPUS: usize, const DEPTH: usize> {
    cpus: [CpuSlot<DEPTH>; CPUS],
}

impl<const CPUS: usize, const DEPTH: usize> LockTable<CPUS, DEPTH> {
    pub(super) const fn new() -> Self {
        LockTable {
            cpus: [CpuSlot::EMPTY; CPUS],
        }
    }

    pub(super) fn slot(&self, cpu: usize) -> Option<&CpuSlot<DEPTH>> {
        self.cpus.get(cpu)
    }

    pub(super) fn slots(&self) -> impl Iterator<Item = (usize, &CpuSlot<DEPTH>)> {
        self.cpus.iter().enumerate()
    }

    /// 当前持有 `lock` 的 CPU
    pub(super) fn holder_of(&self, lock: LockId) -> Option<usize> {
        self.cpus.iter().position(|slot| slot.held.contains(lock))
    }

    /// 是否有 CPU 正在尝试获取 `lock`
    pub(super) fn is_attempted(&self, lock: LockId) -> bool {
        self.cpus.iter().any(|slot| slot.pending == Some(lock))
    }

    /// `cpu` 若在等待 `lock`，返回它正在等待的 CPU。
    ///
    /// 每次都按当前持有者现算：锁已释放或被 `cpu` 自己持有时不构成等待。
    pub(super) fn waits_on(&self, lock: LockId, cpu: usize) -> Option<usize> {
        self.holder_of(lock).filter(|&holder| holder != cpu)
    }

    /// `cpu` 按其记录的挂起尝试所等待的 CPU
    pub(super) fn waits(&self, cpu: usize) -> Option<usize> {
        let pending = self.cpus.get(cpu)?.pending?;
        self.waits_on(pending, cpu)
    }

    pub(super) fn set_pending(&mut self, cpu: usize, lock: LockId) {
        self.cpus[cpu].pending = Some(lock);
    }

    /// 压栈并清除挂起标记，栈满时返回 false
    pub(super) fn push_held(&mut self, cpu: usize, lock: LockId) -> bool {
        let slot = &mut self.cpus[cpu];
        if !slot.held.push(lock) {
            return false;
        }
        if slot.pending == Some(lock) {
            slot.pending = None;
        }
        true
    }

    pub(super) fn pop_held(&mut self, cpu: usize) -> Option<LockId> {
        self.cpus[cpu].held.pop()
    }
}
