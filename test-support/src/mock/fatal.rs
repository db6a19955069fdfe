//! 停机出口的 Mock 实现
//!
//! 真实内核在致命诊断后停机；测试中改为带消息 panic，
//! 以便用 `#[should_panic(expected = ...)]` 断言诊断内容。

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Mock 停机出口
pub struct MockFatal {
    pub count: AtomicUsize,
}

impl MockFatal {
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    pub fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
        self.count.fetch_add(1, Ordering::SeqCst);
        panic!("{}", args)
    }

    pub fn fatal_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}
