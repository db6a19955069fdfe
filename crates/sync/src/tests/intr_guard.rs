use super::*;
use crate::IntrGuard;
use test_support::mock::arch::MOCK_SIE;

#[test]
fn test_guard_disables_and_restores() {
    let arch = MockArchOps::new();

    {
        let guard = IntrGuard::new(&arch);
        assert_eq!(guard.flags(), MOCK_SIE);
        assert!(!arch.interrupts_enabled());
    }
    assert!(arch.interrupts_enabled());
}

#[test]
fn test_nested_guards() {
    let arch = MockArchOps::new();

    let outer = IntrGuard::new(&arch);
    {
        let inner = IntrGuard::new(&arch);
        assert_eq!(inner.flags(), 0);
    }
    // 内层只恢复到“关闭”
    assert!(!arch.interrupts_enabled());
    drop(outer);
    assert!(arch.interrupts_enabled());
}

#[test]
fn test_into_flags_skips_restore() {
    let arch = MockArchOps::new();

    let flags = IntrGuard::new(&arch).into_flags();
    assert_eq!(flags, MOCK_SIE);
    assert!(!arch.interrupts_enabled());

    unsafe { ArchOps::restore_interrupts(&arch, flags) };
    assert!(arch.interrupts_enabled());
}
