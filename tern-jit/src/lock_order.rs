use std::cell::RefCell;

/// Locks of the code cache in acquisition order.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum LockLevel {
    JitLock,
    JitMutatorLock,
    ChaLock,
}

thread_local! {
    static HELD: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
}

/// Registers the acquisition of `level` on this thread. Debug builds
/// abort when a lock of the same or a later level is already held.
#[must_use]
pub fn enter(level: LockLevel) -> LockLevelGuard {
    if cfg!(debug_assertions) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&last) = held.last() {
                assert!(last < level, "lock order violation: acquiring {:?} while holding {:?}", level, last);
            }
            held.push(level);
        });
    }
    LockLevelGuard { level }
}

/// Only tracked in debug builds.
pub fn is_held(level: LockLevel) -> bool {
    HELD.with(|held| held.borrow().contains(&level))
}

pub struct LockLevelGuard {
    level: LockLevel,
}

impl Drop for LockLevelGuard {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            HELD.with(|held| {
                let popped = held.borrow_mut().pop();
                debug_assert_eq!(popped, Some(self.level), "lock levels released out of order");
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_acquisition() {
        let _jit = enter(LockLevel::JitLock);
        {
            let _cha = enter(LockLevel::ChaLock);
            assert!(is_held(LockLevel::ChaLock));
        }
        let _mutator = enter(LockLevel::JitMutatorLock);
        assert!(is_held(LockLevel::JitLock));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn test_inverted_order_aborts() {
        let _cha = enter(LockLevel::ChaLock);
        let _jit = enter(LockLevel::JitLock);
    }
}
