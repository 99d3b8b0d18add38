//! Methods compiled by the zygote, shared with every forked child.
//!
//! ```text
//!  0        8           16      17        64
//!  | magic  | capacity  | state | padding | entries: capacity x (method, code)
//! ```
//!
//! Only the zygote writes. It fills the entries, then publishes them by
//! moving the state byte to `Done` with release ordering. Children read the
//! state with acquire ordering before touching any entry and trust the
//! entries only once the state reached `NotifiedOk`.

use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, warn};

use crate::error::JitResult;
use crate::method::ArtMethod;
use crate::method_header::entry_point_from_code;
use crate::options::JitOptions;
use crate::os::{self, MemoryPermission};

pub const ZYGOTE_MAP_MAGIC: u64 = 0x6f67_797a_6e72_6574;
pub const MAGIC_OFFSET: usize = 0;
pub const CAPACITY_OFFSET: usize = 8;
pub const STATE_OFFSET: usize = 16;
pub const ENTRIES_OFFSET: usize = 64;
pub const ENTRY_SIZE: usize = 2 * size_of::<usize>();

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ZygoteCompilationState {
    InProgress = 0,
    Done = 1,
    NotifiedOk = 2,
    NotifiedFailure = 3,
}

fn hash(method: usize, mask: usize) -> usize {
    let h = ((method as u64) >> 3).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    (h >> 32) as usize & mask
}

unsafe fn slot<'a>(base: *const u8, offset: usize) -> &'a AtomicUsize {
    unsafe { AtomicUsize::from_ptr(base.add(offset) as *mut usize) }
}

unsafe fn state_byte<'a>(base: *const u8) -> &'a AtomicU8 {
    unsafe { AtomicU8::from_ptr(base.add(STATE_OFFSET) as *mut u8) }
}

fn read_state(base: *const u8) -> ZygoteCompilationState {
    let raw = unsafe { state_byte(base) }.load(Ordering::Acquire);
    ZygoteCompilationState::try_from(raw).unwrap_or_else(|_| panic!("corrupt zygote state byte {}", raw))
}

fn find(base: *const u8, capacity: usize, method: usize) -> Option<usize> {
    let mask = capacity - 1;
    let mut idx = hash(method, mask);
    for _ in 0..capacity {
        let entry = ENTRIES_OFFSET + idx * ENTRY_SIZE;
        let current = unsafe { slot(base, entry) }.load(Ordering::Relaxed);
        if current == method {
            return Some(unsafe { slot(base, entry + size_of::<usize>()) }.load(Ordering::Relaxed));
        }
        if current == 0 {
            return None;
        }
        idx = (idx + 1) & mask;
    }
    None
}

/// Writer side, owned by the zygote.
pub struct ZygoteMap {
    base: *mut u8,
    mapping_size: usize,
    capacity: usize,
    len: usize,
}

unsafe impl Send for ZygoteMap {}

impl ZygoteMap {
    /// Maps a shared region for at least `capacity` entries, rounded up to a
    /// power of two.
    pub fn new(capacity: usize) -> JitResult<ZygoteMap> {
        let capacity = capacity.max(1).next_power_of_two();
        let mapping_size = os::page_align_up(ENTRIES_OFFSET + capacity * ENTRY_SIZE);
        let base = os::map_anonymous(mapping_size, MemoryPermission::ReadWrite, true)?;

        unsafe {
            (base.add(MAGIC_OFFSET) as *mut u64).write(ZYGOTE_MAP_MAGIC);
            (base.add(CAPACITY_OFFSET) as *mut u64).write(capacity as u64);
            state_byte(base).store(ZygoteCompilationState::InProgress.into(), Ordering::Release);
        }

        Ok(ZygoteMap {
            base,
            mapping_size,
            capacity,
            len: 0,
        })
    }

    pub fn from_options(options: &JitOptions) -> JitResult<ZygoteMap> {
        ZygoteMap::new(options.zygote_map_capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn base(&self) -> *const u8 {
        self.base
    }

    pub fn put(&mut self, method: usize, code: usize) {
        assert_ne!(method, 0);
        assert_eq!(
            self.compilation_state(),
            ZygoteCompilationState::InProgress,
            "zygote map is frozen"
        );

        let mask = self.capacity - 1;
        let mut idx = hash(method, mask);
        for _ in 0..self.capacity {
            let entry = ENTRIES_OFFSET + idx * ENTRY_SIZE;
            let key = unsafe { slot(self.base, entry) };
            let value = unsafe { slot(self.base, entry + size_of::<usize>()) };
            let current = key.load(Ordering::Relaxed);
            if current == 0 || current == method {
                value.store(code, Ordering::Relaxed);
                key.store(method, Ordering::Relaxed);
                if current == 0 {
                    self.len += 1;
                }
                return;
            }
            idx = (idx + 1) & mask;
        }
        panic!("zygote map full ({} entries)", self.capacity);
    }

    pub fn get_code_for(&self, method: usize) -> Option<usize> {
        find(self.base, self.capacity, method)
    }

    pub fn compilation_state(&self) -> ZygoteCompilationState {
        read_state(self.base)
    }

    /// Advances the state byte. Transitions only go forward:
    /// `InProgress -> Done -> NotifiedOk | NotifiedFailure`.
    pub fn set_compilation_state(&self, state: ZygoteCompilationState) {
        let current = self.compilation_state();
        let valid = matches!(
            (current, state),
            (ZygoteCompilationState::InProgress, ZygoteCompilationState::Done)
                | (ZygoteCompilationState::Done, ZygoteCompilationState::NotifiedOk)
                | (ZygoteCompilationState::Done, ZygoteCompilationState::NotifiedFailure)
        );
        assert!(valid, "invalid zygote state transition {:?} -> {:?}", current, state);

        debug!(from = ?current, to = ?state, entries = self.len, "zygote compilation state");
        unsafe { state_byte(self.base) }.store(state.into(), Ordering::Release);
    }

    pub fn view(&self) -> ZygoteMapView<'_> {
        ZygoteMapView {
            base: self.base,
            capacity: self.capacity,
            _map: PhantomData,
        }
    }
}

impl Drop for ZygoteMap {
    fn drop(&mut self) {
        os::unmap(self.base, self.mapping_size);
    }
}

/// Read-only access, as used by forked children.
#[derive(Copy, Clone)]
pub struct ZygoteMapView<'a> {
    base: *const u8,
    capacity: usize,
    _map: PhantomData<&'a ZygoteMap>,
}

impl<'a> ZygoteMapView<'a> {
    /// View of a map at `base`, checked against the magic.
    ///
    /// # Safety
    /// `base` must point to readable memory of at least `ENTRIES_OFFSET`
    /// bytes that stays mapped for `'a`, and to the full table when the
    /// magic matches.
    pub unsafe fn from_raw(base: *const u8) -> Option<ZygoteMapView<'a>> {
        let magic = unsafe { (base.add(MAGIC_OFFSET) as *const u64).read() };
        if magic != ZYGOTE_MAP_MAGIC {
            return None;
        }
        let capacity = unsafe { (base.add(CAPACITY_OFFSET) as *const u64).read() } as usize;
        if !capacity.is_power_of_two() {
            return None;
        }
        Some(ZygoteMapView {
            base,
            capacity,
            _map: PhantomData,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn compilation_state(&self) -> ZygoteCompilationState {
        read_state(self.base)
    }

    pub fn is_compilation_notified_ok(&self) -> bool {
        self.compilation_state() == ZygoteCompilationState::NotifiedOk
    }

    /// The published entries, or `None` unless the zygote's compilation
    /// was validated.
    pub fn entries(&self) -> Option<ZygoteEntries<'a>> {
        match self.compilation_state() {
            ZygoteCompilationState::NotifiedOk => Some(ZygoteEntries {
                base: self.base,
                capacity: self.capacity,
                idx: 0,
                _map: PhantomData,
            }),
            ZygoteCompilationState::NotifiedFailure => {
                warn!("zygote compilation failed, not using shared code");
                None
            }
            _ => None,
        }
    }

    pub fn get_code_for(&self, method: usize) -> Option<usize> {
        if !self.is_compilation_notified_ok() {
            return None;
        }
        find(self.base, self.capacity, method)
    }

    /// Points every published method at its shared code. Returns the number
    /// of methods patched.
    ///
    /// # Safety
    /// Each method key must be the address of an `ArtMethod` alive in this
    /// process, as it is in a child forked from the zygote.
    pub unsafe fn install_entry_points(&self) -> usize {
        let Some(entries) = self.entries() else {
            return 0;
        };
        let mut count = 0;
        for (method, code) in entries {
            let method = unsafe { &*(method as *const ArtMethod) };
            method.set_entry_point(entry_point_from_code(code));
            count += 1;
        }
        count
    }
}

pub struct ZygoteEntries<'a> {
    base: *const u8,
    capacity: usize,
    idx: usize,
    _map: PhantomData<&'a ZygoteMap>,
}

impl Iterator for ZygoteEntries<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        while self.idx < self.capacity {
            let entry = ENTRIES_OFFSET + self.idx * ENTRY_SIZE;
            self.idx += 1;
            let method = unsafe { slot(self.base, entry) }.load(Ordering::Relaxed);
            if method != 0 {
                let code = unsafe { slot(self.base, entry + size_of::<usize>()) }.load(Ordering::Relaxed);
                return Some((method, code));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let map = ZygoteMap::new(3).unwrap();
        assert_eq!(map.capacity(), 4);
        unsafe {
            assert_eq!((map.base().add(MAGIC_OFFSET) as *const u64).read(), ZYGOTE_MAP_MAGIC);
            assert_eq!((map.base().add(CAPACITY_OFFSET) as *const u64).read(), 4);
            assert_eq!(*map.base().add(STATE_OFFSET), 0);
        }
    }

    #[test]
    fn test_capacity_from_options() {
        let options = JitOptions {
            zygote_map_capacity: 100,
            ..JitOptions::default()
        };
        assert_eq!(ZygoteMap::from_options(&options).unwrap().capacity(), 128);
    }

    #[test]
    fn test_put_and_probe() {
        let mut map = ZygoteMap::new(8).unwrap();
        for i in 1..=6 {
            map.put(0x1000 * i, 0x9000 + i);
        }
        map.put(0x2000, 0x7777);
        assert_eq!(map.len(), 6);
        assert_eq!(map.get_code_for(0x2000), Some(0x7777));
        assert_eq!(map.get_code_for(0x6000), Some(0x9006));
        assert_eq!(map.get_code_for(0x8000), None);
    }

    #[test]
    fn test_entries_hidden_until_notified_ok() {
        let mut map = ZygoteMap::new(4).unwrap();
        map.put(0x1000, 0x2000);
        assert!(map.view().entries().is_none());
        assert_eq!(map.view().get_code_for(0x1000), None);

        map.set_compilation_state(ZygoteCompilationState::Done);
        assert!(map.view().entries().is_none());

        map.set_compilation_state(ZygoteCompilationState::NotifiedOk);
        let entries: Vec<_> = map.view().entries().unwrap().collect();
        assert_eq!(entries, vec![(0x1000, 0x2000)]);
        assert_eq!(map.view().get_code_for(0x1000), Some(0x2000));
    }

    #[test]
    fn test_notified_failure_hides_entries() {
        let mut map = ZygoteMap::new(4).unwrap();
        map.put(0x1000, 0x2000);
        map.set_compilation_state(ZygoteCompilationState::Done);
        map.set_compilation_state(ZygoteCompilationState::NotifiedFailure);
        assert!(map.view().entries().is_none());
        assert_eq!(unsafe { map.view().install_entry_points() }, 0);
    }

    #[test]
    #[should_panic(expected = "invalid zygote state transition")]
    fn test_state_never_goes_back() {
        let map = ZygoteMap::new(4).unwrap();
        map.set_compilation_state(ZygoteCompilationState::Done);
        map.set_compilation_state(ZygoteCompilationState::InProgress);
    }

    #[test]
    #[should_panic(expected = "frozen")]
    fn test_no_writes_after_done() {
        let mut map = ZygoteMap::new(4).unwrap();
        map.set_compilation_state(ZygoteCompilationState::Done);
        map.put(0x1000, 0x2000);
    }

    #[test]
    fn test_view_checks_magic() {
        let bytes = [0u64; 16];
        assert!(unsafe { ZygoteMapView::from_raw(bytes.as_ptr() as *const u8) }.is_none());

        let map = ZygoteMap::new(4).unwrap();
        let view = unsafe { ZygoteMapView::from_raw(map.base()) }.unwrap();
        assert_eq!(view.capacity(), 4);
    }
}
