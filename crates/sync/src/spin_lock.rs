//! 数据型自旋锁
//!
//! [`SpinLock`] 把受保护的数据与一把 [`RawSpinLock`] 绑在一起，只能经由保护器访问。

use core::cell::UnsafeCell;

use crate::LockContext;
use crate::raw_spin_lock::{RawSpinLock, RawSpinLockGuard};

/// 拥有数据的自旋锁。
///
/// 与其它自旋锁共享同一个 [`LockContext`]：上下文接入了校验器时，
/// 每次 [`lock`](Self::lock) / [`try_lock`](Self::try_lock) 及保护器析构都会被记账，
/// 否则就是裸锁。
///
/// # 示例
/// ```ignore
/// static COUNTER: SpinLock<'static, u64> = SpinLock::new(&CTX, 0);
/// *COUNTER.lock() += 1;
/// ```
///
/// # 注意
/// 不可重入：持有时再次 [`lock`](Self::lock) 会被判定为自锁并停机。
/// 持锁期间本地中断关闭，临界区应尽量短。
#[derive(Debug)]
pub struct SpinLock<'a, T> {
    raw_lock: RawSpinLock<'a>,
    data: UnsafeCell<T>,
}

impl<'a, T> SpinLock<'a, T> {
    /// 在 `ctx` 下创建，`data` 为初始值
    pub const fn new(ctx: &'a LockContext<'a>, data: T) -> Self {
        SpinLock {
            raw_lock: RawSpinLock::new(ctx),
            data: UnsafeCell::new(data),
        }
    }

    /// 自旋直到获得锁，返回可读写数据的保护器
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, 'a, T> {
        let _raw_guard = self.raw_lock.lock();
        SpinLockGuard {
            _raw_guard,
            // SAFETY: 持有锁期间对数据的访问是独占的
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 只尝试一次，锁被占用时返回 `None`
    #[track_caller]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, 'a, T>> {
        self.raw_lock.try_lock().map(|_raw_guard| SpinLockGuard {
            _raw_guard,
            // SAFETY: 同上
            data: unsafe { &mut *self.data.get() },
        })
    }

    /// 通过独占引用直接访问数据，无需加锁
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// 消耗锁并取出数据
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// 内部的原始锁
    pub fn raw(&self) -> &RawSpinLock<'a> {
        &self.raw_lock
    }

    /// 检查锁是否被占用
    pub fn is_locked(&self) -> bool {
        self.raw_lock.is_locked()
    }
}

/// [`SpinLock`] 的保护器，析构时释放锁并向校验器报告。
pub struct SpinLockGuard<'g, 'a, T> {
    _raw_guard: RawSpinLockGuard<'g, 'a>,
    data: &'g mut T,
}

impl<T> core::ops::Deref for SpinLockGuard<'_, '_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T> core::ops::DerefMut for SpinLockGuard<'_, '_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

// SAFETY: 数据只经由持锁的保护器访问
unsafe impl<T: Send> Send for SpinLock<'_, T> {}
unsafe impl<T: Send> Sync for SpinLock<'_, T> {}
