//! Session-scoped unique identifier generation. Every element, label
//! reference, and generated label name draws from one of these pools, so
//! ids are unique for the lifetime of a compile session and are never
//! reused: removing an element retires its id permanently.

use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// Identity of an element in the registry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct ElementId(pub u64);

impl Display for ElementId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "id({})", self.0)
    }
}

/// Identity of an unresolved label reference inside an instruction block.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct LabelRefId(pub u64);

/// Monotonic id source. Ids start at 1 so that zero can never collide
/// with a real identity.
#[derive(Clone, Debug)]
pub struct IdPool {
    next: u64,
}

impl IdPool {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocate the next raw id.
    pub fn allocate(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn next_element_id(&mut self) -> ElementId {
        ElementId(self.allocate())
    }

    pub fn next_label_ref_id(&mut self) -> LabelRefId {
        LabelRefId(self.allocate())
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_and_unique() {
        let mut pool = IdPool::new();
        let first = pool.next_element_id();
        let second = pool.next_element_id();
        let label = pool.next_label_ref_id();
        assert!(first.0 > 0);
        assert!(second.0 > first.0);
        assert!(label.0 > second.0);
    }

    #[test]
    fn test_pools_are_independent() {
        let mut a = IdPool::new();
        let mut b = IdPool::new();
        assert_eq!(a.next_element_id(), b.next_element_id());
        a.allocate();
        assert!(a.allocate() > b.allocate());
    }
}
