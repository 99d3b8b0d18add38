use std::mem::size_of;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};

use crate::method::MethodRef;

pub const INLINE_CACHE_SIZE: usize = 5;

/// Marks a slot whose class died. Never a valid class address, so the slot
/// stays occupied and the order of the remaining classes is kept.
pub const CLEARED_CLASS: usize = 1;

/// Receiver classes seen at one call site, written by mutators without
/// locks.
pub struct InlineCache {
    dex_pc: u32,
    classes: [AtomicUsize; INLINE_CACHE_SIZE],
}

impl InlineCache {
    fn new(dex_pc: u32) -> InlineCache {
        InlineCache {
            dex_pc,
            classes: Default::default(),
        }
    }

    pub fn dex_pc(&self) -> u32 {
        self.dex_pc
    }

    /// Records `class`. Returns false when the cache is full of other
    /// classes, i.e. the site is megamorphic.
    pub fn add_class(&self, class: usize) -> bool {
        debug_assert!(class != 0 && class != CLEARED_CLASS);
        for slot in &self.classes {
            let current = slot.load(Ordering::Relaxed);
            if current == class {
                return true;
            }
            if current == 0 {
                match slot.compare_exchange(0, class, Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => return true,
                    Err(winner) if winner == class => return true,
                    // Lost the slot to another class; try the next one.
                    Err(_) => {}
                }
            }
        }
        false
    }

    pub fn classes(&self) -> Vec<usize> {
        self.classes
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .filter(|&class| class != 0 && class != CLEARED_CLASS)
            .collect()
    }

    pub fn is_uninitialized(&self) -> bool {
        self.classes[0].load(Ordering::Relaxed) == 0
    }

    pub fn is_monomorphic(&self) -> bool {
        self.classes[0].load(Ordering::Relaxed) != 0 && self.classes[1].load(Ordering::Relaxed) == 0
    }

    pub fn is_megamorphic(&self) -> bool {
        self.classes.iter().all(|slot| slot.load(Ordering::Relaxed) != 0)
    }

    /// Replaces dead classes by `CLEARED_CLASS`. Returns how many died.
    pub(crate) fn sweep(&self, is_live: &dyn Fn(usize) -> bool) -> usize {
        let mut cleared = 0;
        for slot in &self.classes {
            let class = slot.load(Ordering::Relaxed);
            if class != 0 && class != CLEARED_CLASS && !is_live(class) {
                slot.store(CLEARED_CLASS, Ordering::Relaxed);
                cleared += 1;
            }
        }
        cleared
    }
}

pub struct ProfilingInfo {
    method: MethodRef,
    baseline_hotness_count: AtomicU16,
    /// Compilations currently inlining from this info; keeps the method's
    /// code alive across collections.
    current_inline_uses: AtomicU32,
    caches: Vec<InlineCache>,
}

impl ProfilingInfo {
    pub(crate) fn new(method: MethodRef, dex_pcs: &[u32]) -> ProfilingInfo {
        debug_assert!(dex_pcs.windows(2).all(|w| w[0] < w[1]));
        ProfilingInfo {
            method,
            baseline_hotness_count: AtomicU16::new(0),
            current_inline_uses: AtomicU32::new(0),
            caches: dex_pcs.iter().map(|&pc| InlineCache::new(pc)).collect(),
        }
    }

    pub fn method(&self) -> &MethodRef {
        &self.method
    }

    pub fn inline_cache(&self, dex_pc: u32) -> Option<&InlineCache> {
        self.caches
            .binary_search_by_key(&dex_pc, |cache| cache.dex_pc)
            .ok()
            .map(|idx| &self.caches[idx])
    }

    pub fn inline_caches(&self) -> &[InlineCache] {
        &self.caches
    }

    /// Returns the new count, saturating.
    pub fn increment_hotness(&self) -> u16 {
        let previous = self
            .baseline_hotness_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| count.checked_add(1))
            .unwrap_or(u16::MAX);
        previous.saturating_add(1)
    }

    pub fn hotness(&self) -> u16 {
        self.baseline_hotness_count.load(Ordering::Relaxed)
    }

    pub fn increment_inline_use(&self) {
        self.current_inline_uses.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_inline_use(&self) {
        let previous = self.current_inline_uses.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "unbalanced inline use");
    }

    pub fn is_in_use_by_compiler(&self) -> bool {
        self.current_inline_uses.load(Ordering::Acquire) > 0
    }

    pub fn memory_size(&self) -> usize {
        size_of::<ProfilingInfo>() + self.caches.len() * size_of::<InlineCache>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::ArtMethod;
    use std::sync::Arc;
    use std::thread;

    fn info() -> ProfilingInfo {
        ProfilingInfo::new(ArtMethod::new("m", "V", 0, 1, 0), &[2, 9, 14])
    }

    #[test]
    fn test_lookup_by_dex_pc() {
        let info = info();
        assert_eq!(info.inline_cache(9).map(|c| c.dex_pc()), Some(9));
        assert!(info.inline_cache(3).is_none());
    }

    #[test]
    fn test_cache_states() {
        let info = info();
        let cache = info.inline_cache(2).unwrap();
        assert!(cache.is_uninitialized());
        assert!(cache.add_class(0x100));
        assert!(cache.add_class(0x100));
        assert!(cache.is_monomorphic());
        for class in 1..INLINE_CACHE_SIZE {
            assert!(cache.add_class(0x100 + 0x10 * class));
        }
        assert!(cache.is_megamorphic());
        assert!(!cache.add_class(0x900));
        assert_eq!(cache.classes().len(), INLINE_CACHE_SIZE);
    }

    #[test]
    fn test_sweep_keeps_slots_occupied() {
        let info = info();
        let cache = info.inline_cache(14).unwrap();
        cache.add_class(0x100);
        cache.add_class(0x200);
        assert_eq!(cache.sweep(&|class| class != 0x100), 1);
        assert_eq!(cache.classes(), vec![0x200]);
        // 0x200 is still found in its slot instead of being added twice.
        assert!(cache.add_class(0x200));
        assert_eq!(cache.classes(), vec![0x200]);
    }

    #[test]
    fn test_concurrent_adds_never_duplicate() {
        let info = Arc::new(info());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let info = info.clone();
                thread::spawn(move || {
                    let cache = info.inline_cache(9).unwrap();
                    for round in 0..100 {
                        cache.add_class(0x1000 + 0x10 * ((t + round) % 3));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut classes = info.inline_cache(9).unwrap().classes();
        classes.sort();
        assert_eq!(classes, vec![0x1000, 0x1010, 0x1020]);
    }

    #[test]
    fn test_hotness_saturates() {
        let info = info();
        assert_eq!(info.increment_hotness(), 1);
        info.baseline_hotness_count.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(info.increment_hotness(), u16::MAX);
    }
}
