use std::arch::asm;

/// Returns the two PKRU bits (access-disable, write-disable) the calling thread
/// currently holds for `key`.
///
/// # Safety
///
/// The CPU must support PKU and the OS must have enabled it (`ospke`); otherwise
/// `RDPKRU` raises `#UD`. A successful `pkey_alloc` proves both.
#[inline]
pub unsafe fn key_bits(key: u32) -> u32 {
    let pkru: u32;
    asm!(
        "rdpkru",
        out("eax") pkru, out("edx") _, in("ecx") 0,
        options(nomem, nostack, preserves_flags)
    );
    (pkru >> (key * 2)) & 0b11
}
