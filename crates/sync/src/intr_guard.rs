//! 中断保护器
//!
//! 基于 RAII 实现中断保护，在创建时禁用中断，销毁时恢复。
//!
//! 注意：禁用中断只能阻止**本地 CPU** 的“任务 vs 本地中断”并发，
//! 并不能阻止其他 CPU 的并行访问；多核共享数据仍需要配合自旋锁等原语。

use crate::ArchOps;
use core::mem::ManuallyDrop;
use core::ops::Drop;

/// 中断保护器，基于 RAII 实现中断保护。
///
/// 在创建时原子地禁用中断并保存之前的状态；
/// 在销毁时自动恢复之前的中断状态。
/// 若需要把保存的状态交给别处（例如自旋锁在释放时才恢复），使用 [`IntrGuard::into_flags`]。
///
/// # 示例
/// ```ignore
/// {
///     let guard = IntrGuard::new(arch); // 禁用中断
///     // 临界区代码
/// } // 离开作用域，自动恢复中断状态
/// ```
pub struct IntrGuard<'a> {
    arch: &'a dyn ArchOps,
    flags: usize,
}

impl<'a> IntrGuard<'a> {
    /// 原子地禁用中断并返回一个 IntrGuard 实例。
    pub fn new(arch: &'a dyn ArchOps) -> Self {
        // SAFETY: 保存的 flags 只会在 drop 或 into_flags 的持有者处恢复一次。
        let flags = unsafe { arch.read_and_disable_interrupts() };
        IntrGuard { arch, flags }
    }

    /// 进入临界区前保存的中断状态
    pub fn flags(&self) -> usize {
        self.flags
    }

    /// 放弃自动恢复，返回保存的中断状态，由调用者负责之后恢复。
    pub fn into_flags(self) -> usize {
        let this = ManuallyDrop::new(self);
        this.flags
    }
}

impl Drop for IntrGuard<'_> {
    /// 当 IntrGuard 离开作用域时，自动恢复中断状态。
    fn drop(&mut self) {
        // SAFETY: flags 是在创建 IntrGuard 时保存的，
        // 因此恢复操作是安全的。
        unsafe { self.arch.restore_interrupts(self.flags) };
    }
}
