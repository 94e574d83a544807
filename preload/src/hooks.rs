//! The exported C entry points.

use std::ffi::{c_int, c_void};

use mapguard::{Errno, MapGuardError, MapRequest, Primitives};

use crate::{dispatch, report};

fn syscall(op: &'static str) -> impl FnOnce(Errno) -> MapGuardError {
    move |errno| MapGuardError::SyscallFailed { op, errno }
}

fn to_ptr(result: Result<usize, MapGuardError>) -> *mut c_void {
    match result {
        Ok(addr) => addr as *mut c_void,
        Err(err) => {
            report(&err);
            libc::MAP_FAILED
        }
    }
}

fn to_status(result: Result<(), MapGuardError>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => {
            report(&err);
            -1
        }
    }
}

unsafe fn map(request: MapRequest) -> *mut c_void {
    to_ptr(dispatch(
        |mg| mg.create(request),
        |sys| {
            sys.map(
                request.addr,
                request.length,
                request.prot,
                request.flags,
                request.fd,
                request.offset,
            )
            .map_err(syscall("mmap"))
        },
    ))
}

#[no_mangle]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    map(MapRequest {
        addr: addr as usize,
        length,
        prot,
        flags,
        fd,
        offset: offset as i64,
    })
}

#[no_mangle]
pub unsafe extern "C" fn mmap64(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off64_t,
) -> *mut c_void {
    map(MapRequest {
        addr: addr as usize,
        length,
        prot,
        flags,
        fd,
        offset,
    })
}

#[no_mangle]
pub unsafe extern "C" fn munmap(addr: *mut c_void, length: usize) -> c_int {
    let addr = addr as usize;
    to_status(dispatch(
        |mg| mg.remove(addr, length),
        |sys| sys.unmap(addr, length).map_err(syscall("munmap")),
    ))
}

#[no_mangle]
pub unsafe extern "C" fn mprotect(addr: *mut c_void, length: usize, prot: c_int) -> c_int {
    let addr = addr as usize;
    to_status(dispatch(
        |mg| mg.reprotect(addr, length, prot),
        |sys| sys.protect(addr, length, prot).map_err(syscall("mprotect")),
    ))
}

/// `mremap` is variadic in C; the fifth argument is only read with `MREMAP_FIXED`,
/// and callers that omit it leave an unused register behind.
#[no_mangle]
pub unsafe extern "C" fn mremap(
    old_address: *mut c_void,
    old_size: usize,
    new_size: usize,
    flags: c_int,
    new_address: *mut c_void,
) -> *mut c_void {
    let old = old_address as usize;
    let new = if flags & libc::MREMAP_FIXED != 0 {
        new_address as usize
    } else {
        0
    };
    to_ptr(dispatch(
        |mg| mg.relocate(old, old_size, new_size, flags, new),
        |sys| {
            sys.remap(old, old_size, new_size, flags, new)
                .map_err(syscall("mremap"))
        },
    ))
}

/// Copies `src_size` bytes of `src` into a new `allocation_size`-byte mapping and
/// makes it execute-only. Returns `MAP_FAILED` on failure.
#[no_mangle]
pub unsafe extern "C" fn memcpy_xom(
    allocation_size: usize,
    src: *const c_void,
    src_size: usize,
) -> *mut c_void {
    if src.is_null() {
        return to_ptr(Err(MapGuardError::InvalidExtensionRequest("null source")));
    }
    let code = std::slice::from_raw_parts(src as *const u8, src_size);
    to_ptr(dispatch(
        |mg| mg.make_execute_only(allocation_size, code),
        |_| Err(MapGuardError::CacheDisabled),
    ))
}

/// Releases a mapping created by [`memcpy_xom`]. Returns `-1` if it is unknown.
#[no_mangle]
pub unsafe extern "C" fn munmap_xom(addr: *mut c_void, length: usize) -> c_int {
    let addr = addr as usize;
    to_status(dispatch(
        |mg| mg.release_execute_only(addr, length),
        |_| Err(MapGuardError::NotTracked(addr)),
    ))
}
