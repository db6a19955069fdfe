// Unit tests for ksync.
//
// These run on the host with standard `cargo test`; the platform is provided by the
// `test-support` mocks. Fatal diagnostics panic with their message, so fatal paths are
// asserted with `#[should_panic(expected = ...)]`.

extern crate alloc;

use core::fmt;

use test_support::mock::{arch::MockArchOps, fatal::MockFatal};

use crate::{ArchOps, FatalHandler, LockContext, LockId, LockOrderValidator};

mod intr_guard;
mod spin_lock;

const LOCK_A: LockId = LockId::new(1);
const LOCK_B: LockId = LockId::new(2);
const LOCK_C: LockId = LockId::new(3);
const LOCK_D: LockId = LockId::new(4);

const CPU_1: usize = 1;
const CPU_2: usize = 2;
const CPU_3: usize = 3;

impl ArchOps for MockArchOps {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        unsafe { MockArchOps::read_and_disable_interrupts(self) }
    }

    unsafe fn restore_interrupts(&self, flags: usize) {
        unsafe { MockArchOps::restore_interrupts(self, flags) }
    }

    fn interrupts_enabled(&self) -> bool {
        MockArchOps::interrupts_enabled(self)
    }

    fn cpu_id(&self) -> usize {
        MockArchOps::cpu_id(self)
    }

    fn cpu_count(&self) -> usize {
        MockArchOps::max_cpu_count(self)
    }

    fn current_thread(&self) -> usize {
        MockArchOps::current_thread(self)
    }

    fn pause(&self) {
        MockArchOps::pause(self)
    }
}

impl FatalHandler for MockFatal {
    fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
        MockFatal::fatal(self, args)
    }
}

/// 已 ready 且处于 fatal 模式的校验器
fn fatal_validator<'a>(arch: &'a MockArchOps, fatal: &'a MockFatal) -> LockOrderValidator<'a> {
    let validator = LockOrderValidator::new(arch, fatal);
    validator.set_ready();
    validator.set_fatal();
    validator
}

/// 已 ready、违例只返回错误的校验器
fn lenient_validator<'a>(arch: &'a MockArchOps, fatal: &'a MockFatal) -> LockOrderValidator<'a> {
    let validator = LockOrderValidator::new(arch, fatal);
    validator.set_ready();
    validator
}

/// 在 `cpu` 上完整地获取 `lock`
fn take<const C: usize, const D: usize>(
    validator: &LockOrderValidator<'_, C, D>,
    lock: LockId,
    cpu: usize,
) {
    assert_eq!(validator.lock_attempted(lock, cpu), Ok(()));
    assert_eq!(validator.lock_acquired(lock, cpu), Ok(()));
}

/// 不带校验器的上下文
fn bare_context<'a>(arch: &'a MockArchOps, fatal: &'a MockFatal) -> LockContext<'a> {
    LockContext::new(arch, fatal)
}
