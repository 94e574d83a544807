//! Drives the interceptor over the real Linux primitives.
//!
//! Only the `Interceptor` is exercised here; the test binary's own `mmap` is never
//! hooked. Other test threads share the address space, so assertions stick to
//! memory this test owns.

use std::ffi::c_void;

use mapguard::{
    AccessRights, Interceptor, MapGuardError, MapRequest, PolicyConfig, Primitives, Syscalls,
    Violation, POISON_BYTE,
};

const RW: i32 = libc::PROT_READ | libc::PROT_WRITE;

fn interceptor(config: PolicyConfig) -> Interceptor<Syscalls> {
    Interceptor::new(config, Syscalls::new())
}

fn guarded() -> PolicyConfig {
    PolicyConfig::default()
        .with_mapping_cache(true)
        .with_guard_pages(true)
}

/// `mincore` fails with `ENOMEM` for unmapped pages, whatever their protection.
fn is_mapped(addr: usize, page_size: usize) -> bool {
    let mut residency = 0u8;
    unsafe { libc::mincore(addr as *mut c_void, page_size, &mut residency) == 0 }
}

#[test]
fn guard_pages_are_real_mappings() {
    let mg = interceptor(guarded());
    let page = mg.primitives().page_size();
    let base = unsafe { mg.create(MapRequest::anonymous(2 * page, RW)) }.unwrap();

    let record = mg.lookup(base).unwrap();
    assert_eq!(record.length, 2 * page);
    for guard in [record.guard_below, record.guard_above].into_iter().flatten() {
        assert!(is_mapped(guard, page));
    }
    if let Some(above) = record.guard_above {
        assert_eq!(above, base + 2 * page);
    }

    unsafe { mg.remove(base, 2 * page) }.unwrap();
    assert_eq!(mg.tracked_count(), 0);
    assert!(mg.lookup(base).is_none());
}

#[test]
fn fresh_writable_memory_is_poisoned() {
    let mg = interceptor(PolicyConfig::default().with_poison_on_allocation(true));
    let page = mg.primitives().page_size();
    let base = unsafe { mg.create(MapRequest::anonymous(2 * page, RW)) }.unwrap();

    let bytes = unsafe { std::slice::from_raw_parts(base as *const u8, 2 * page) };
    assert!(bytes.iter().all(|&b| b == POISON_BYTE));
    unsafe { mg.remove(base, 2 * page) }.unwrap();
}

#[test]
fn write_execute_is_refused_before_the_kernel_sees_it() {
    let mg = interceptor(PolicyConfig::default().with_disallow_rwx(true).with_mapping_cache(true));
    let page = mg.primitives().page_size();
    let err = unsafe {
        mg.create(MapRequest::anonymous(
            page,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ))
    }
    .unwrap_err();
    assert!(matches!(
        err,
        MapGuardError::PolicyViolation {
            violation: Violation::WriteExecute,
            ..
        }
    ));
    assert_eq!(mg.tracked_count(), 0);
}

#[test]
fn writable_memory_stays_non_executable() {
    let mg = interceptor(
        PolicyConfig::default()
            .with_mapping_cache(true)
            .with_disallow_transition_to_x(true),
    );
    let page = mg.primitives().page_size();
    let base = unsafe { mg.create(MapRequest::anonymous(page, RW)) }.unwrap();
    unsafe { mg.reprotect(base, page, libc::PROT_READ) }.unwrap();

    let err = unsafe { mg.reprotect(base, page, libc::PROT_READ | libc::PROT_EXEC) }.unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
    assert_eq!(mg.lookup(base).unwrap().current, AccessRights::READ);
    unsafe { mg.remove(base, page) }.unwrap();
}

#[test]
fn growth_keeps_contents_and_tracking() {
    let mg = interceptor(guarded());
    let page = mg.primitives().page_size();
    let base = unsafe { mg.create(MapRequest::anonymous(page, RW)) }.unwrap();
    unsafe { *(base as *mut u8) = 0x5a };

    let moved = unsafe { mg.relocate(base, page, 4 * page, libc::MREMAP_MAYMOVE, 0) }.unwrap();
    assert_eq!(unsafe { *(moved as *const u8) }, 0x5a);

    let record = mg.lookup(moved).unwrap();
    assert_eq!((record.base, record.length), (moved, 4 * page));
    if let Some(above) = record.guard_above {
        assert_eq!(above, moved + 4 * page);
        assert!(is_mapped(above, page));
    }
    unsafe { mg.remove(moved, 4 * page) }.unwrap();
    assert_eq!(mg.tracked_count(), 0);
}

#[test]
fn punching_a_hole_leaves_two_records() {
    let mg = interceptor(PolicyConfig::default().with_mapping_cache(true));
    let page = mg.primitives().page_size();
    let base = unsafe { mg.create(MapRequest::anonymous(4 * page, RW)) }.unwrap();

    unsafe { mg.remove(base + page, page) }.unwrap();
    assert!(mg.lookup(base + page).is_none());
    assert_eq!(mg.tracked_count(), 2);
    assert_eq!(mg.lookup(base).unwrap().length, page);
    assert_eq!(mg.lookup(base + 2 * page).unwrap().length, 2 * page);

    unsafe {
        mg.remove(base, page).unwrap();
        mg.remove(base + 2 * page, 2 * page).unwrap();
    }
    assert_eq!(mg.tracked_count(), 0);
}

#[test]
fn execute_only_round_trip() {
    let mg = interceptor(PolicyConfig::default().with_mapping_cache(true));
    let page = mg.primitives().page_size();
    // `ret`
    let addr = mg.make_execute_only(page, &[0xc3]).unwrap();

    let record = mg.lookup(addr).unwrap();
    assert_eq!(record.current, AccessRights::EXEC);
    assert!(record.execute_only.is_some());

    unsafe { mg.release_execute_only(addr, page) }.unwrap();
    assert_eq!(mg.tracked_count(), 0);
}
