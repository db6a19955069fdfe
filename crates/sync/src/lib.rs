//! 同步原语
//!
//! 向其它内核模块提供自旋锁，以及一个运行时锁序校验器。
//!
//! # 组成
//!
//! - [`RawSpinLock`]：忙等互斥原语，支持同一线程的递归获取，持锁期间禁用本地中断。
//! - [`SpinLock`]：在 [`RawSpinLock`] 之上封装数据，提供 RAII 保护器。
//! - [`LockOrderValidator`]：旁路观察者，只按“锁标识 + CPU ID”记账，
//!   在每次获取/释放时判断是否已经形成死锁（二元等待环）或违反了嵌套释放顺序。
//!
//! # 架构依赖
//!
//! 此 crate 不直接访问硬件，而是通过 [`ArchOps`] 与 [`FatalHandler`] 两个 trait
//! 抽象 CPU/中断/线程信息和停机路径。使用方构造一个 [`LockContext`]，
//! 让所有自旋锁引用它；是否接入校验器只取决于上下文里是否带有 [`LockTracker`]。
//!
//! ```ignore
//! static VALIDATOR: LockOrderValidator<'static> =
//!     LockOrderValidator::new(&ARCH, &KERNEL_PANIC);
//! static CTX: LockContext<'static> =
//!     LockContext::new(&ARCH, &KERNEL_PANIC).with_tracker(&VALIDATOR);
//! static SCHED_LOCK: RawSpinLock<'static> = RawSpinLock::new(&CTX);
//! ```

#![no_std]

mod error;
mod intr_guard;
mod raw_spin_lock;
mod spin_lock;
mod validator;

#[cfg(test)]
mod tests;

pub use error::ValidationError;
pub use intr_guard::IntrGuard;
pub use raw_spin_lock::*;
pub use spin_lock::*;
pub use validator::{
    DEFAULT_MAX_CPUS, DEFAULT_MAX_DEPTH, LockOrderValidator, LockStack, LockState, LockTracker,
};

use core::fmt;

/// 架构相关操作的 trait
///
/// 由内核实现，提供中断控制、CPU 信息和当前线程标识。
pub trait ArchOps: Send + Sync {
    /// 读取并禁用中断，返回之前的状态
    ///
    /// # Safety
    /// 调用者必须确保在适当的上下文中调用
    unsafe fn read_and_disable_interrupts(&self) -> usize;

    /// 恢复中断状态
    ///
    /// # Safety
    /// flags 必须是之前 read_and_disable_interrupts 返回的值
    unsafe fn restore_interrupts(&self, flags: usize);

    /// 当前 CPU 上中断是否处于启用状态
    fn interrupts_enabled(&self) -> bool;

    /// 获取当前 CPU ID
    fn cpu_id(&self) -> usize;

    /// 获取在线 CPU 数量
    fn cpu_count(&self) -> usize;

    /// 获取当前线程标识，没有线程上下文（早期启动、中断）时返回 0
    fn current_thread(&self) -> usize;

    /// 忙等循环中的暂停提示
    fn pause(&self) {
        core::hint::spin_loop();
    }
}

/// 最高严重级别的诊断出口：输出消息并停机，永不返回。
///
/// 较低级别的诊断统一走 `log` 门面。
pub trait FatalHandler: Send + Sync {
    /// 输出致命诊断并停止执行
    fn fatal(&self, args: fmt::Arguments<'_>) -> !;
}

/// 锁的标识
///
/// 由锁的地址派生，只用于诊断和校验器记账，没有任何顺序含义。
/// 以十进制显示。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(usize);

impl LockId {
    /// 由原始数值构造
    pub const fn new(raw: usize) -> Self {
        LockId(raw)
    }

    /// 由对象地址构造
    pub fn of<T: ?Sized>(object: &T) -> Self {
        LockId(object as *const T as *const () as usize)
    }

    /// 原始数值
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 自旋锁运行所需的外部协作者
///
/// 一个内核通常只构造一个（或每种用途一个）上下文，所有自旋锁共享引用。
/// 带 tracker 的上下文即“插桩”版本，不带的即裸版本，两者共用同一份实现。
#[derive(Clone, Copy)]
pub struct LockContext<'a> {
    arch: &'a dyn ArchOps,
    fatal: &'a dyn FatalHandler,
    tracker: Option<&'a dyn LockTracker>,
}

impl<'a> LockContext<'a> {
    /// 创建不带校验器的上下文
    pub const fn new(arch: &'a dyn ArchOps, fatal: &'a dyn FatalHandler) -> Self {
        LockContext {
            arch,
            fatal,
            tracker: None,
        }
    }

    /// 接入锁序校验
    pub const fn with_tracker(mut self, tracker: &'a dyn LockTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// 架构操作
    pub fn arch(&self) -> &'a dyn ArchOps {
        self.arch
    }

    /// 停机出口
    pub fn fatal_handler(&self) -> &'a dyn FatalHandler {
        self.fatal
    }

    /// 已接入的校验器
    pub fn tracker(&self) -> Option<&'a dyn LockTracker> {
        self.tracker
    }
}
