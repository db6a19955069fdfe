//! 多线程模拟多核：每个线程扮演一个 CPU，中断状态与 CPU ID 都是线程局部的。

use std::cell::Cell;
use std::fmt;
use std::sync::Barrier;
use std::thread;

use ksync::{ArchOps, FatalHandler, LockContext, LockOrderValidator, RawSpinLock, SpinLock};

const SIE: usize = 0x2;
const CPUS: usize = 4;

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
    static INTR: Cell<bool> = const { Cell::new(true) };
}

struct ThreadArch;

impl ArchOps for ThreadArch {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        if INTR.with(|i| i.replace(false)) { SIE } else { 0 }
    }

    unsafe fn restore_interrupts(&self, flags: usize) {
        INTR.with(|i| i.set(flags & SIE != 0));
    }

    fn interrupts_enabled(&self) -> bool {
        INTR.with(Cell::get)
    }

    fn cpu_id(&self) -> usize {
        CPU.with(Cell::get)
    }

    fn cpu_count(&self) -> usize {
        CPUS
    }

    fn current_thread(&self) -> usize {
        CPU.with(Cell::get) + 1
    }
}

struct PanicFatal;

impl FatalHandler for PanicFatal {
    fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
        panic!("{}", args)
    }
}

fn become_cpu(cpu: usize) {
    CPU.with(|c| c.set(cpu));
    INTR.with(|i| i.set(true));
}

fn ready_validator() -> LockOrderValidator<'static> {
    let validator = LockOrderValidator::new(&ThreadArch, &PanicFatal);
    validator.set_ready();
    validator.set_fatal();
    validator
}

#[test]
fn test_mutual_exclusion() {
    let ctx = LockContext::new(&ThreadArch, &PanicFatal);
    let counter = SpinLock::new(&ctx, 0u64);

    thread::scope(|s| {
        for cpu in 0..CPUS {
            let counter = &counter;
            s.spawn(move || {
                become_cpu(cpu);
                for _ in 0..1000 {
                    *counter.lock() += 1;
                }
                assert!(ThreadArch.interrupts_enabled());
            });
        }
    });

    assert_eq!(counter.into_inner(), 4000);
}

#[test]
fn test_consistent_order_under_validation() {
    let validator = ready_validator();
    let ctx = LockContext::new(&ThreadArch, &PanicFatal).with_tracker(&validator);
    let first = SpinLock::new(&ctx, 0u64);
    let second = SpinLock::new(&ctx, 0u64);

    thread::scope(|s| {
        for cpu in 0..CPUS {
            let (first, second) = (&first, &second);
            s.spawn(move || {
                become_cpu(cpu);
                for _ in 0..500 {
                    let mut a = first.lock();
                    let mut b = second.lock();
                    *a += 1;
                    *b += 2;
                }
            });
        }
    });

    assert_eq!(*first.lock(), 2000);
    assert_eq!(*second.lock(), 4000);
    for cpu in 0..CPUS {
        assert!(validator.held_locks(cpu).is_empty());
        assert_eq!(validator.pending(cpu), None);
    }
}

#[test]
fn test_lock_inversion_is_detected() {
    let validator = ready_validator();
    let ctx = LockContext::new(&ThreadArch, &PanicFatal).with_tracker(&validator);
    let a = RawSpinLock::new(&ctx);
    let b = RawSpinLock::new(&ctx);
    let barrier = Barrier::new(2);

    let results = thread::scope(|s| {
        let (a, b, barrier) = (&a, &b, &barrier);
        let t1 = s.spawn(move || {
            become_cpu(1);
            let _a = a.lock();
            barrier.wait();
            let _b = b.lock();
        });
        let t2 = s.spawn(move || {
            become_cpu(2);
            let _b = b.lock();
            barrier.wait();
            let _a = a.lock();
        });
        [t1.join(), t2.join()]
    });

    let messages: Vec<String> = results
        .into_iter()
        .filter_map(Result::err)
        .filter_map(|payload| payload.downcast::<String>().ok().map(|m| *m))
        .collect();
    assert!(!messages.is_empty());
    assert!(
        messages
            .iter()
            .all(|m| m.contains("Detected lock dependency inversion (deadlock) between"))
    );

    assert!(!a.is_locked());
    assert!(!b.is_locked());
}

#[test]
fn test_release_on_another_cpu() {
    let validator = ready_validator();
    let ctx = LockContext::new(&ThreadArch, &PanicFatal).with_tracker(&validator);
    let lock = RawSpinLock::new(&ctx);

    thread::scope(|s| {
        s.spawn(|| {
            become_cpu(1);
            lock.acquire(false, true);
        });
    });
    assert_eq!(lock.owner_cpu(), Some(1));
    assert_eq!(validator.holder_of(lock.id()), Some(1));

    thread::scope(|s| {
        s.spawn(|| {
            become_cpu(2);
            let flags = unsafe { ThreadArch.read_and_disable_interrupts() };
            assert_eq!(flags, SIE);
            lock.release();
            // 恢复的是 CPU 1 获取时保存的状态
            assert!(ThreadArch.interrupts_enabled());
        });
    });

    assert!(!lock.is_locked());
    assert_eq!(validator.holder_of(lock.id()), None);
    assert!(validator.held_locks(1).is_empty());
}
