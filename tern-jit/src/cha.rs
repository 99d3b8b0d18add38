//! Class hierarchy analysis dependencies: compiled code that assumed a
//! method has a single implementation.

use std::collections::{HashMap, HashSet};

use crate::method::MethodRef;

#[derive(Default)]
pub struct ChaDependencies {
    /// Single-implementation method key -> (dependent method, code).
    dependents: HashMap<usize, Vec<(MethodRef, usize)>>,
    invalidated: HashSet<usize>,
}

impl ChaDependencies {
    pub fn new() -> ChaDependencies {
        ChaDependencies::default()
    }

    pub fn is_invalidated(&self, method: &MethodRef) -> bool {
        self.invalidated.contains(&method.key())
    }

    pub fn add_dependency(&mut self, single_implementation: &MethodRef, dependent: &MethodRef, code: usize) {
        self.dependents
            .entry(single_implementation.key())
            .or_default()
            .push((dependent.clone(), code));
    }

    /// Drops every dependency recorded for `code`.
    pub fn remove_dependents_for_code(&mut self, code: usize) {
        self.dependents.retain(|_, list| {
            list.retain(|&(_, c)| c != code);
            !list.is_empty()
        });
    }

    /// Marks `method` as no longer single-implementation and returns the
    /// code that relied on it.
    pub fn invalidate(&mut self, method: &MethodRef) -> Vec<(MethodRef, usize)> {
        self.invalidated.insert(method.key());
        self.dependents.remove(&method.key()).unwrap_or_default()
    }

    pub fn dependent_count(&self) -> usize {
        self.dependents.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::ArtMethod;

    #[test]
    fn test_invalidate_returns_dependents_once() {
        let base = ArtMethod::new("base", "V", 0, 1, 0);
        let caller = ArtMethod::new("caller", "V", 0, 2, 0);
        let mut cha = ChaDependencies::new();
        cha.add_dependency(&base, &caller, 0x100);
        cha.add_dependency(&base, &caller, 0x200);

        let dependents = cha.invalidate(&base);
        assert_eq!(dependents.len(), 2);
        assert!(cha.is_invalidated(&base));
        assert!(cha.invalidate(&base).is_empty());
    }

    #[test]
    fn test_remove_for_code() {
        let base = ArtMethod::new("base", "V", 0, 1, 0);
        let other = ArtMethod::new("other", "V", 0, 1, 0);
        let caller = ArtMethod::new("caller", "V", 0, 2, 0);
        let mut cha = ChaDependencies::new();
        cha.add_dependency(&base, &caller, 0x100);
        cha.add_dependency(&other, &caller, 0x100);
        cha.add_dependency(&other, &caller, 0x300);

        cha.remove_dependents_for_code(0x100);
        assert_eq!(cha.dependent_count(), 1);
        assert!(cha.invalidate(&base).is_empty());
    }
}
