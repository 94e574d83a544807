//! An in-memory, page-granular model of a process address space.
//!
//! Addresses are plain numbers; nothing is ever dereferenced. Placement is top-down
//! like the Linux mmap allocator, so consecutive mappings land right next to each
//! other and neighbouring guard pages can collide.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::{Mutex, MutexGuard};

use crate::{round_up, Errno, PkeyAccessRights, Primitives};

pub const PAGE: usize = 4096;
const TOP: usize = 0x7f00_0000_0000;

#[derive(Debug, Clone)]
struct Page {
    prot: i32,
    pkey: Option<u32>,
    bytes: Option<Box<[u8]>>,
}

#[derive(Debug, Default)]
struct State {
    pages: BTreeMap<usize, Page>,
    pkeys_supported: bool,
    next_key: u32,
    keys: BTreeMap<u32, PkeyAccessRights>,
    fail_next_map: Option<Errno>,
    fail_next_protect: Option<Errno>,
    fail_next_remap: Option<Errno>,
}

impl State {
    fn is_free(&self, start: usize, len: usize) -> bool {
        self.pages.range(start..start + len).next().is_none()
    }

    fn all_mapped(&self, start: usize, len: usize) -> bool {
        (start..start + len)
            .step_by(PAGE)
            .all(|page| self.pages.contains_key(&page))
    }

    /// Whether the range would be a single kernel VMA, which `mremap` requires.
    fn is_uniform(&self, start: usize, len: usize) -> bool {
        let mut pages = self.pages.range(start..start + len).map(|(_, page)| (page.prot, page.pkey));
        let first = pages.next();
        pages.all(|attrs| Some(attrs) == first)
    }

    fn find_free(&self, len: usize) -> Option<usize> {
        let mut end = TOP;
        while end >= len {
            let start = end - len;
            match self.pages.range(start..end).next_back() {
                None => return Some(start),
                Some((&occupied, _)) => end = occupied,
            }
        }
        None
    }

    fn insert(&mut self, start: usize, len: usize, prot: i32) {
        for page in (start..start + len).step_by(PAGE) {
            self.pages.insert(
                page,
                Page {
                    prot,
                    pkey: None,
                    bytes: None,
                },
            );
        }
    }

    fn remove(&mut self, start: usize, len: usize) -> Vec<(usize, Page)> {
        let doomed: Vec<usize> = self.pages.range(start..start + len).map(|(a, _)| *a).collect();
        doomed
            .into_iter()
            .filter_map(|addr| self.pages.remove(&addr).map(|page| (addr, page)))
            .collect()
    }

    fn page_mut(&mut self, addr: usize) -> &mut Page {
        self.pages
            .get_mut(&(addr & !(PAGE - 1)))
            .unwrap_or_else(|| panic!("access to unmapped address {addr:#x}"))
    }
}

#[derive(Debug, Default)]
pub struct EmulatedSpace {
    state: Mutex<State>,
}

impl EmulatedSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// An address space whose platform supports protection keys.
    pub fn with_pkeys() -> Self {
        let space = Self::default();
        space.state().pkeys_supported = true;
        space.state().next_key = 1;
        space
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }

    pub fn fail_next_map(&self, errno: Errno) {
        self.state().fail_next_map = Some(errno);
    }

    pub fn fail_next_protect(&self, errno: Errno) {
        self.state().fail_next_protect = Some(errno);
    }

    pub fn fail_next_remap(&self, errno: Errno) {
        self.state().fail_next_remap = Some(errno);
    }

    pub fn is_mapped(&self, addr: usize) -> bool {
        self.state().pages.contains_key(&(addr & !(PAGE - 1)))
    }

    pub fn prot_at(&self, addr: usize) -> Option<i32> {
        self.state().pages.get(&(addr & !(PAGE - 1))).map(|p| p.prot)
    }

    pub fn pkey_at(&self, addr: usize) -> Option<u32> {
        self.state()
            .pages
            .get(&(addr & !(PAGE - 1)))
            .and_then(|p| p.pkey)
    }

    pub fn mapped_pages(&self) -> usize {
        self.state().pages.len()
    }

    pub fn live_keys(&self) -> usize {
        self.state().keys.len()
    }

    pub fn read(&self, addr: usize, len: usize) -> Vec<u8> {
        let mut state = self.state();
        (addr..addr + len)
            .map(|a| {
                let page = state.page_mut(a);
                page.bytes.as_ref().map_or(0, |bytes| bytes[a % PAGE])
            })
            .collect()
    }

    fn write(&self, addr: usize, bytes: impl Iterator<Item = u8>) {
        let mut state = self.state();
        for (a, byte) in (addr..).zip(bytes) {
            let page = state.page_mut(a);
            page.bytes.get_or_insert_with(|| vec![0; PAGE].into_boxed_slice())[a % PAGE] = byte;
        }
    }
}

impl Primitives for EmulatedSpace {
    fn page_size(&self) -> usize {
        PAGE
    }

    unsafe fn map(
        &self,
        addr: usize,
        length: usize,
        prot: i32,
        flags: i32,
        _fd: i32,
        _offset: i64,
    ) -> Result<usize, Errno> {
        let mut state = self.state();
        if let Some(errno) = state.fail_next_map.take() {
            return Err(errno);
        }
        if length == 0 {
            return Err(libc::EINVAL);
        }
        let len = round_up(length, PAGE);
        let aligned = addr % PAGE == 0;

        let start = if flags & libc::MAP_FIXED_NOREPLACE != 0 {
            if !aligned {
                return Err(libc::EINVAL);
            }
            if !state.is_free(addr, len) {
                return Err(libc::EEXIST);
            }
            addr
        } else if flags & libc::MAP_FIXED != 0 {
            if !aligned {
                return Err(libc::EINVAL);
            }
            state.remove(addr, len);
            addr
        } else if addr != 0 && aligned && state.is_free(addr, len) {
            addr
        } else {
            state.find_free(len).ok_or(libc::ENOMEM)?
        };

        state.insert(start, len, prot);
        Ok(start)
    }

    unsafe fn unmap(&self, addr: usize, length: usize) -> Result<(), Errno> {
        if addr % PAGE != 0 || length == 0 {
            return Err(libc::EINVAL);
        }
        self.state().remove(addr, round_up(length, PAGE));
        Ok(())
    }

    unsafe fn protect(&self, addr: usize, length: usize, prot: i32) -> Result<(), Errno> {
        let mut state = self.state();
        if let Some(errno) = state.fail_next_protect.take() {
            return Err(errno);
        }
        if addr % PAGE != 0 {
            return Err(libc::EINVAL);
        }
        let len = round_up(length, PAGE);
        if !state.all_mapped(addr, len) {
            return Err(libc::ENOMEM);
        }
        for (_, page) in state.pages.range_mut(addr..addr + len) {
            page.prot = prot;
        }
        Ok(())
    }

    unsafe fn remap(
        &self,
        old_addr: usize,
        old_length: usize,
        new_length: usize,
        flags: i32,
        new_addr: usize,
    ) -> Result<usize, Errno> {
        let mut state = self.state();
        if let Some(errno) = state.fail_next_remap.take() {
            return Err(errno);
        }
        if old_addr % PAGE != 0 || new_length == 0 {
            return Err(libc::EINVAL);
        }
        let old_len = round_up(old_length, PAGE);
        let new_len = round_up(new_length, PAGE);
        if !state.all_mapped(old_addr, old_len) || !state.is_uniform(old_addr, old_len) {
            return Err(libc::EFAULT);
        }
        let may_move = flags & libc::MREMAP_MAYMOVE != 0;

        if flags & libc::MREMAP_FIXED == 0 {
            if new_len <= old_len {
                state.remove(old_addr + new_len, old_len - new_len);
                return Ok(old_addr);
            }
            if state.is_free(old_addr + old_len, new_len - old_len) {
                let prot = state.page_mut(old_addr + old_len - PAGE).prot;
                state.insert(old_addr + old_len, new_len - old_len, prot);
                return Ok(old_addr);
            }
            if !may_move {
                return Err(libc::ENOMEM);
            }
        } else if !may_move || new_addr % PAGE != 0 {
            return Err(libc::EINVAL);
        }

        let moved = state.remove(old_addr, old_len);
        let prot = moved.last().map_or(libc::PROT_NONE, |(_, page)| page.prot);
        let dst = if flags & libc::MREMAP_FIXED != 0 {
            state.remove(new_addr, new_len);
            new_addr
        } else {
            state.find_free(new_len).ok_or(libc::ENOMEM)?
        };
        for (addr, page) in moved.into_iter().filter(|(addr, _)| addr - old_addr < new_len) {
            state.pages.insert(dst + (addr - old_addr), page);
        }
        if new_len > old_len {
            state.insert(dst + old_len, new_len - old_len, prot);
        }
        Ok(dst)
    }

    unsafe fn fill(&self, addr: usize, length: usize, byte: u8) {
        self.write(addr, std::iter::repeat(byte).take(length));
    }

    unsafe fn copy_into(&self, addr: usize, bytes: &[u8]) {
        self.write(addr, bytes.iter().copied());
    }

    fn pkey_alloc(&self, rights: PkeyAccessRights) -> Result<u32, Errno> {
        let mut state = self.state();
        if !state.pkeys_supported {
            return Err(libc::ENOSYS);
        }
        if state.keys.len() >= 15 {
            return Err(libc::ENOSPC);
        }
        let key = state.next_key;
        state.next_key += 1;
        state.keys.insert(key, rights);
        Ok(key)
    }

    unsafe fn pkey_protect(
        &self,
        addr: usize,
        length: usize,
        prot: i32,
        key: u32,
    ) -> Result<(), Errno> {
        let mut state = self.state();
        if !state.keys.contains_key(&key) {
            return Err(libc::EINVAL);
        }
        let len = round_up(length, PAGE);
        if !state.all_mapped(addr, len) {
            return Err(libc::ENOMEM);
        }
        for (_, page) in state.pages.range_mut(addr..addr + len) {
            page.prot = prot;
            page.pkey = Some(key);
        }
        Ok(())
    }

    fn pkey_rights(&self, key: u32) -> Option<PkeyAccessRights> {
        self.state().keys.get(&key).copied()
    }

    fn pkey_free(&self, key: u32) {
        self.state().keys.remove(&key);
    }
}

/// Keys currently allocated, for leak checks.
pub fn allocated_keys(space: &EmulatedSpace) -> BTreeSet<u32> {
    space.state().keys.keys().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANON: i32 = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    #[test]
    fn placement_is_top_down_and_adjacent() {
        let space = EmulatedSpace::new();
        unsafe {
            let a = space.map(0, PAGE, libc::PROT_READ, ANON, -1, 0).unwrap();
            let b = space.map(0, 2 * PAGE, libc::PROT_READ, ANON, -1, 0).unwrap();
            assert_eq!(a, TOP - PAGE);
            assert_eq!(b, a - 2 * PAGE);
            assert_eq!(
                space.map(a, PAGE, 0, ANON | libc::MAP_FIXED_NOREPLACE, -1, 0),
                Err(libc::EEXIST)
            );
        }
    }

    #[test]
    fn remap_moves_bytes_when_blocked() {
        let space = EmulatedSpace::new();
        unsafe {
            let _a = space.map(0, PAGE, libc::PROT_READ, ANON, -1, 0).unwrap();
            let b = space.map(0, PAGE, libc::PROT_READ | libc::PROT_WRITE, ANON, -1, 0).unwrap();
            space.fill(b, 4, 7);
            // `a` sits right above `b`, so growing `b` in place is impossible.
            assert_eq!(space.remap(b, PAGE, 2 * PAGE, 0, 0), Err(libc::ENOMEM));
            let moved = space.remap(b, PAGE, 2 * PAGE, libc::MREMAP_MAYMOVE, 0).unwrap();
            assert_ne!(moved, b);
            assert_eq!(space.read(moved, 4), vec![7; 4]);
            assert!(space.is_mapped(moved + PAGE));
            assert_eq!(space.prot_at(moved + PAGE), Some(libc::PROT_READ | libc::PROT_WRITE));
        }
    }

    #[test]
    fn remap_refuses_mixed_protections() {
        let space = EmulatedSpace::new();
        unsafe {
            let base = space.map(0, 2 * PAGE, libc::PROT_READ | libc::PROT_WRITE, ANON, -1, 0).unwrap();
            space.protect(base, PAGE, libc::PROT_READ).unwrap();
            assert_eq!(
                space.remap(base, 2 * PAGE, 4 * PAGE, libc::MREMAP_MAYMOVE, 0),
                Err(libc::EFAULT)
            );
            assert_eq!(space.prot_at(base), Some(libc::PROT_READ));

            space.protect(base + PAGE, PAGE, libc::PROT_READ).unwrap();
            let moved = space.remap(base, 2 * PAGE, 4 * PAGE, libc::MREMAP_MAYMOVE, 0).unwrap();
            assert_eq!(space.prot_at(moved + 3 * PAGE), Some(libc::PROT_READ));
        }
    }
}
