//! 自旋锁实现
//!
//! 基于原子操作实现自旋锁机制，持锁期间禁用本地中断。
//! 支持同一线程的递归获取，并在接入校验器时报告每一次尝试、获取与释放。

use core::fmt;
use core::panic::Location;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crate::intr_guard::IntrGuard;
use crate::{LockContext, LockId, LockTracker, ValidationError};

/// 自旋锁的损坏检测标记
pub const SPINLOCK_MAGIC: u32 = 0xdead_baba;

/// 未被任何 CPU 持有
const NO_CPU: usize = usize::MAX;

/// 自旋锁结构体，提供互斥访问临界区的能力。
///
/// 状态机为 `Free → Held(level=1..N) → Free`：每次非递归 [`acquire`](Self::acquire)
/// 或每次递归计数增加，都必须对应一次 [`release`](Self::release)。
///
/// 获取时禁用本地中断并保存之前的状态，最外层释放时恢复。
/// 持有期间不能移动或销毁。
///
/// # 示例
/// ```ignore
/// static LOCK: RawSpinLock<'static> = RawSpinLock::new(&CTX);
/// {
///   let _guard = LOCK.lock(); // 获取锁，禁用中断
///   // 临界区代码
/// } // 离开作用域，自动释放锁并恢复中断状态
/// ```
pub struct RawSpinLock<'a> {
    magic: AtomicU32,
    lock: AtomicBool,
    /// 持有线程，0 表示无
    owner: AtomicUsize,
    owner_cpu: AtomicUsize,
    level: AtomicUsize,
    saved_flags: AtomicUsize,
    acquired_at: AtomicPtr<Location<'static>>,
    ctx: &'a LockContext<'a>,
}

impl<'a> RawSpinLock<'a> {
    /// 创建一个新的 RawSpinLock 实例。
    pub const fn new(ctx: &'a LockContext<'a>) -> Self {
        RawSpinLock {
            magic: AtomicU32::new(SPINLOCK_MAGIC),
            lock: AtomicBool::new(false),
            owner: AtomicUsize::new(0),
            owner_cpu: AtomicUsize::new(NO_CPU),
            level: AtomicUsize::new(0),
            saved_flags: AtomicUsize::new(0),
            acquired_at: AtomicPtr::new(ptr::null_mut()),
            ctx,
        }
    }

    /// 获取自旋锁，忙等直到成功。
    ///
    /// - `recurse`：若锁已被当前线程持有，则只增加递归计数。
    /// - `safe`：多核系统上，自旋时若发现持有者就是本 CPU（必然自锁），立即停机。
    ///
    /// 返回时总是 `true`；任何违例都会停机而不是返回。
    #[track_caller]
    pub fn acquire(&self, recurse: bool, safe: bool) -> bool {
        let arch = self.ctx.arch();
        let intr = IntrGuard::new(arch);
        self.check_magic("acquire");

        let cpu = arch.cpu_id();
        let thread = arch.current_thread();
        self.report("attempt", cpu, |t, lock, cpu| t.attempted(lock, cpu));

        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if recurse && thread != 0 && self.owner.load(Ordering::Relaxed) == thread {
                self.level.fetch_add(1, Ordering::Relaxed);
                self.report("recursive acquire", cpu, |t, lock, cpu| t.acquired(lock, cpu));
                // 外层获取已关闭中断，这里恢复的仍是关闭状态
                drop(intr);
                return true;
            }

            self.report("state check", cpu, |t, lock, cpu| t.check(lock, cpu));

            if safe && arch.cpu_count() > 1 && self.owner_cpu.load(Ordering::Relaxed) == cpu {
                self.fatal(format_args!(
                    "Spinlock {} has deadlocked: CPU {} already owns it [acquired at {}].",
                    self.id(),
                    cpu,
                    self.describe_acquirer()
                ));
            }

            arch.pause();
        }

        self.report("acquire", cpu, |t, lock, cpu| t.acquired(lock, cpu));
        self.claimed(thread, cpu, intr.into_flags(), Location::caller());
        true
    }

    /// 以默认参数（不递归、检测自锁）获取锁，并返回一个 RAII 保护器。
    #[track_caller]
    pub fn lock(&self) -> RawSpinLockGuard<'_, 'a> {
        self.acquire(false, true);
        RawSpinLockGuard { lock: self }
    }

    /// 尝试获取自旋锁一次，不自旋、不递归。
    ///
    /// 失败时立即恢复中断状态（通过 Drop IntrGuard）。
    #[track_caller]
    pub fn try_acquire(&self) -> bool {
        let arch = self.ctx.arch();
        let intr = IntrGuard::new(arch);
        self.check_magic("try_acquire");

        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        let cpu = arch.cpu_id();
        self.report("attempt", cpu, |t, lock, cpu| t.attempted(lock, cpu));
        self.report("acquire", cpu, |t, lock, cpu| t.acquired(lock, cpu));
        self.claimed(arch.current_thread(), cpu, intr.into_flags(), Location::caller());
        true
    }

    /// 尝试获取自旋锁，如果成功则返回 RAII 保护器，否则返回 None。
    #[track_caller]
    pub fn try_lock(&self) -> Option<RawSpinLockGuard<'_, 'a>> {
        self.try_acquire().then(|| RawSpinLockGuard { lock: self })
    }

    /// 释放一层持有。
    ///
    /// 必须在中断关闭时调用。递归计数不为 0 时只减少计数；
    /// 否则清除持有者信息、释放锁标志并恢复获取时保存的中断状态。
    pub fn release(&self) {
        self.check_magic("release");
        let arch = self.ctx.arch();
        if arch.interrupts_enabled() {
            self.fatal(format_args!(
                "Spinlock {} released with interrupts enabled [acquired at {}].",
                self.id(),
                self.describe_acquirer()
            ));
        }

        let cpu = arch.cpu_id();
        self.report("release", cpu, |t, lock, cpu| t.released(lock, cpu));

        let level = self.level.load(Ordering::Relaxed);
        if level > 0 {
            self.level.store(level - 1, Ordering::Relaxed);
            return;
        }

        let flags = self.saved_flags.load(Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        self.owner_cpu.store(NO_CPU, Ordering::Relaxed);
        self.acquired_at.store(ptr::null_mut(), Ordering::Relaxed);

        if self
            .lock
            .compare_exchange(true, false, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            self.fatal(format_args!(
                "Spinlock {} released while not held (double release or corruption).",
                self.id()
            ));
        }

        // SAFETY: flags 由获取时的 IntrGuard 保存
        unsafe { arch.restore_interrupts(flags) };
    }

    /// 强制释放：用于异常终止与调度器交接。
    ///
    /// 清除全部递归与持有者记录，不经 CAS 直接释放锁标志。
    /// 不恢复中断，而是把获取时保存的中断状态返回给调用者。
    /// 向校验器报告的违例只记录日志，不停机。
    pub fn exit(&self) -> usize {
        self.check_magic("exit");
        let cpu = self.ctx.arch().cpu_id();

        if let Some(tracker) = self.ctx.tracker() {
            let id = self.id();
            for _ in 0..=self.level.load(Ordering::Relaxed) {
                if let Err(err) = tracker.released(id, cpu) {
                    log::error!("Spinlock {}: forced exit: {}", id, err);
                    break;
                }
            }
        }

        let flags = self.saved_flags.load(Ordering::Relaxed);
        self.unwind();
        self.acquired_at.store(ptr::null_mut(), Ordering::Relaxed);
        self.lock.store(false, Ordering::Release);
        flags
    }

    /// 清除递归计数与持有者记录，不动锁标志。
    pub fn unwind(&self) {
        self.level.store(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        self.owner_cpu.store(NO_CPU, Ordering::Relaxed);
    }

    /// 锁是否被占用
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    /// 持有锁的 CPU
    pub fn owner_cpu(&self) -> Option<usize> {
        match self.owner_cpu.load(Ordering::Relaxed) {
            NO_CPU => None,
            cpu => Some(cpu),
        }
    }

    /// 持有锁的线程
    pub fn owner_thread(&self) -> Option<usize> {
        match self.owner.load(Ordering::Relaxed) {
            0 => None,
            thread => Some(thread),
        }
    }

    /// 当前递归层数（首次获取为 0）
    pub fn recursion_level(&self) -> usize {
        self.level.load(Ordering::Relaxed)
    }

    /// 最外层获取的调用位置
    pub fn acquired_at(&self) -> Option<&'static Location<'static>> {
        let loc = self.acquired_at.load(Ordering::Relaxed);
        // SAFETY: 只会存入 Location::caller() 返回的 'static 引用或空指针
        unsafe { loc.as_ref() }
    }

    /// 锁的标识（由地址派生）
    pub fn id(&self) -> LockId {
        LockId::of(self)
    }

    /// 破坏损坏检测标记 (仅用于测试)
    #[cfg(test)]
    pub(crate) fn corrupt_magic(&self) {
        self.magic.store(0, Ordering::Relaxed);
    }

    fn claimed(&self, thread: usize, cpu: usize, flags: usize, at: &'static Location<'static>) {
        self.owner.store(thread, Ordering::Relaxed);
        self.owner_cpu.store(cpu, Ordering::Relaxed);
        self.level.store(0, Ordering::Relaxed);
        self.saved_flags.store(flags, Ordering::Relaxed);
        self.acquired_at
            .store(ptr::from_ref(at).cast_mut(), Ordering::Relaxed);
    }

    fn check_magic(&self, op: &str) {
        let magic = self.magic.load(Ordering::Relaxed);
        if magic != SPINLOCK_MAGIC {
            self.fatal(format_args!(
                "Spinlock {}: wrong magic in {} [magic = {:#x}, should be {:#x}].",
                self.id(),
                op,
                magic,
                SPINLOCK_MAGIC
            ));
        }
    }

    /// 向校验器报告事件，违例作为本锁自己的致命诊断上报
    fn report(
        &self,
        event: &str,
        cpu: usize,
        f: impl FnOnce(&dyn LockTracker, LockId, usize) -> Result<(), ValidationError>,
    ) {
        let Some(tracker) = self.ctx.tracker() else {
            return;
        };
        if let Err(err) = f(tracker, self.id(), cpu) {
            self.fatal(format_args!(
                "Spinlock {}: lock tracking rejected {} on CPU {}: {}",
                self.id(),
                event,
                cpu,
                err
            ));
        }
    }

    fn describe_acquirer(&self) -> AcquiredAt {
        AcquiredAt(self.acquired_at())
    }

    fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
        self.ctx.fatal_handler().fatal(args)
    }
}

struct AcquiredAt(Option<&'static Location<'static>>);

impl fmt::Display for AcquiredAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(loc) => write!(f, "{}", loc),
            None => f.write_str("unknown"),
        }
    }
}

impl fmt::Debug for RawSpinLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSpinLock")
            .field("id", &self.id())
            .field("locked", &self.is_locked())
            .field("owner_cpu", &self.owner_cpu())
            .field("level", &self.recursion_level())
            .finish()
    }
}

impl Drop for RawSpinLock<'_> {
    fn drop(&mut self) {
        if self.is_locked() {
            log::error!(
                "Spinlock {} destroyed while held [acquired at {}]",
                self.id(),
                self.describe_acquirer()
            );
        }
    }
}

/// 自动释放自旋锁和恢复中断状态的 RAII 结构体
pub struct RawSpinLockGuard<'g, 'a> {
    lock: &'g RawSpinLock<'a>,
}

impl Drop for RawSpinLockGuard<'_, '_> {
    /// 退出作用域时自动释放一层持有，最外层释放时恢复中断状态。
    fn drop(&mut self) {
        self.lock.release();
    }
}
