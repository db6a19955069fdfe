//! 架构相关操作的 Mock 实现

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 中断使能位
pub const MOCK_SIE: usize = 0x2;

/// Mock 架构操作
///
/// 只模拟单个 CPU 的视角：当前 CPU、当前线程都可以在测试中随时切换。
pub struct MockArchOps {
    pub interrupt_state: AtomicBool,
    pub cpu_id: AtomicUsize,
    pub max_cpus: AtomicUsize,
    pub thread: AtomicUsize,
    pub pauses: AtomicUsize,
}

impl MockArchOps {
    pub const fn new() -> Self {
        Self {
            interrupt_state: AtomicBool::new(true),
            cpu_id: AtomicUsize::new(0),
            max_cpus: AtomicUsize::new(1),
            thread: AtomicUsize::new(1),
            pauses: AtomicUsize::new(0),
        }
    }

    /// 创建一个有 `cpus` 个 CPU 的 Mock
    pub const fn with_cpus(cpus: usize) -> Self {
        let mut ops = Self::new();
        ops.max_cpus = AtomicUsize::new(cpus);
        ops
    }

    pub unsafe fn read_and_disable_interrupts(&self) -> usize {
        if self.interrupt_state.swap(false, Ordering::SeqCst) {
            MOCK_SIE
        } else {
            0
        }
    }

    pub unsafe fn restore_interrupts(&self, flags: usize) {
        self.interrupt_state
            .store(flags & MOCK_SIE != 0, Ordering::SeqCst);
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupt_state.load(Ordering::SeqCst)
    }

    pub fn set_interrupts(&self, enabled: bool) {
        self.interrupt_state.store(enabled, Ordering::SeqCst);
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id.load(Ordering::Relaxed)
    }

    pub fn set_cpu(&self, cpu: usize) {
        self.cpu_id.store(cpu, Ordering::Relaxed);
    }

    pub fn max_cpu_count(&self) -> usize {
        self.max_cpus.load(Ordering::Relaxed)
    }

    pub fn current_thread(&self) -> usize {
        self.thread.load(Ordering::Relaxed)
    }

    pub fn set_thread(&self, thread: usize) {
        self.thread.store(thread, Ordering::Relaxed);
    }

    pub fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
        core::hint::spin_loop();
    }

    pub fn pause_count(&self) -> usize {
        self.pauses.load(Ordering::Relaxed)
    }
}
