//! 锁序校验错误类型
//!
//! 错误分两类：结构性损坏（无论是否处于 fatal 模式都立即停机），
//! 以及顺序/反转违例（仅在 fatal 模式下停机，否则返回给调用者）。

use core::fmt;

use crate::LockId;
use crate::validator::LockState;

/// 锁序校验器报告的违例
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    // 顺序相关
    /// 释放的锁不是其持有 CPU 栈顶（最近获取、仍持有）的锁
    OutOfOrderRelease {
        /// 被释放的锁
        released: LockId,
        /// 持有 CPU 栈顶的锁
        expected: LockId,
        /// 栈顶锁当前的状态
        expected_state: LockState,
    },
    /// 释放了一把没有任何 CPU 持有的锁
    NotHeld {
        /// 被释放的锁
        lock: LockId,
        /// 报告释放的 CPU
        cpu: usize,
    },
    /// 锁已被另一个 CPU 记录为持有，又被本 CPU 报告获取
    AlreadyHeld {
        /// 锁
        lock: LockId,
        /// 已记录的持有者
        holder: usize,
        /// 报告获取的 CPU
        cpu: usize,
    },

    // 死锁
    /// 两个 CPU 互相等待对方持有的锁
    Inversion {
        /// 正在检查的 CPU
        cpu: usize,
        /// 环上的另一个 CPU
        other: usize,
    },

    // 结构性损坏
    /// CPU ID 超出校验器容量
    CpuOutOfRange {
        /// 越界的 CPU ID
        cpu: usize,
    },
    /// 单个 CPU 上嵌套持有的锁超过校验器容量
    StackOverflow {
        /// CPU
        cpu: usize,
        /// 无法入栈的锁
        lock: LockId,
    },
}

impl ValidationError {
    /// 是否属于结构性损坏（与 fatal 开关无关，总是停机）
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ValidationError::CpuOutOfRange { .. } | ValidationError::StackOverflow { .. }
        )
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::OutOfOrderRelease {
                released,
                expected,
                expected_state,
            } => write!(
                f,
                "Spinlock {} released out-of-order [expected lock {}, state {}].",
                released, expected, expected_state
            ),
            ValidationError::NotHeld { lock, cpu } => {
                write!(f, "Spinlock {} released on CPU {} but is not held.", lock, cpu)
            }
            ValidationError::AlreadyHeld { lock, holder, cpu } => write!(
                f,
                "Spinlock {} acquired on CPU {} while held by CPU {}.",
                lock, cpu, holder
            ),
            ValidationError::Inversion { cpu, other } => write!(
                f,
                "Detected lock dependency inversion (deadlock) between {} and {}!",
                other, cpu
            ),
            ValidationError::CpuOutOfRange { cpu } => {
                write!(f, "Lock tracking: CPU {} is out of range.", cpu)
            }
            ValidationError::StackOverflow { cpu, lock } => write!(
                f,
                "Lock tracking: too many locks held on CPU {} (acquiring {}).",
                cpu, lock
            ),
        }
    }
}
