use super::*;
use crate::SpinLock;
use alloc::vec::Vec;

#[test]
fn test_lock_and_mutate() {
    let arch = MockArchOps::new();
    let fatal = MockFatal::new();
    let ctx = bare_context(&arch, &fatal);
    let counter = SpinLock::new(&ctx, 0u64);

    for _ in 0..10 {
        let mut guard = counter.lock();
        *guard += 1;
        assert!(counter.is_locked());
        assert!(!arch.interrupts_enabled());
    }

    assert!(!counter.is_locked());
    assert!(arch.interrupts_enabled());
    assert_eq!(*counter.lock(), 10);
}

#[test]
fn test_try_lock_while_held() {
    let arch = MockArchOps::new();
    let fatal = MockFatal::new();
    let ctx = bare_context(&arch, &fatal);
    let data = SpinLock::new(&ctx, Vec::new());

    let mut guard = data.lock();
    guard.push(1);
    assert!(data.try_lock().is_none());
    drop(guard);

    let mut guard = data.try_lock().unwrap();
    guard.push(2);
    assert_eq!(guard.as_slice(), &[1, 2]);
}

#[test]
fn test_get_mut_and_into_inner() {
    let arch = MockArchOps::new();
    let fatal = MockFatal::new();
    let ctx = bare_context(&arch, &fatal);
    let mut data = SpinLock::new(&ctx, 5);

    *data.get_mut() += 1;
    assert!(!data.is_locked());
    assert_eq!(data.into_inner(), 6);
}

#[test]
fn test_tracked_nested_locks() {
    let arch = MockArchOps::new();
    let fatal = MockFatal::new();
    let v = fatal_validator(&arch, &fatal);
    let ctx = LockContext::new(&arch, &fatal).with_tracker(&v);
    let outer = SpinLock::new(&ctx, 1);
    let inner = SpinLock::new(&ctx, 2);

    {
        let a = outer.lock();
        let b = inner.lock();
        assert_eq!(
            v.held_locks(0).as_slice(),
            &[outer.raw().id(), inner.raw().id()]
        );
        assert_eq!(*a + *b, 3);
        // 按声明的逆序析构：先 b 后 a
    }

    assert!(v.held_locks(0).is_empty());
    assert!(arch.interrupts_enabled());
}

#[test]
#[should_panic(expected = "has deadlocked")]
fn test_relock_is_fatal() {
    let arch = MockArchOps::with_cpus(2);
    let fatal = MockFatal::new();
    let ctx = bare_context(&arch, &fatal);
    let data = SpinLock::new(&ctx, ());

    let _first = data.lock();
    let _second = data.lock();
}
