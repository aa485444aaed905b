//! Per-target operation registry (C8): at most one operation (or, for
//! multi-frame fan-out, one sequence of operations) bound per
//! `(target, slot)` pair, with replace-and-cancel semantics.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use crate::operation::CombinedOperation;

/// Either a single bound operation or a sequence of them, the latter
/// for a "set" that spawns N parallel downloads under one slot (e.g.
/// one animated image's frames).
#[derive(Clone)]
pub enum Slot {
    Single(CombinedOperation),
    Sequence(Vec<CombinedOperation>),
}

impl Slot {
    fn cancel(&self) {
        match self {
            Slot::Single(op) => op.cancel(),
            Slot::Sequence(ops) => ops.iter().for_each(CombinedOperation::cancel),
        }
    }
}

/// `target -> slot-name -> Slot` table. `T` identifies the caller's view
/// or other attachment point; entries are lazily created on first bind.
pub struct OperationRegistry<T> {
    bindings: Mutex<HashMap<(T, String), Slot>>,
}

impl<T: Eq + Hash + Clone> OperationRegistry<T> {
    pub fn new() -> Self {
        Self { bindings: Mutex::new(HashMap::new()) }
    }

    /// Cancels and replaces whatever was previously bound to
    /// `(target, slot)`.
    pub fn bind(&self, target: T, slot: impl Into<String>, value: Slot) {
        let key = (target, slot.into());
        let previous = {
            let mut bindings = self.bindings.lock().unwrap();
            let previous = bindings.remove(&key);
            bindings.insert(key, value);
            previous
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Cancels and removes whatever is bound to `(target, slot)`, if
    /// anything.
    pub fn cancel(&self, target: &T, slot: &str) {
        let removed = self.bindings.lock().unwrap().remove(&(target.clone(), slot.to_string()));
        if let Some(removed) = removed {
            removed.cancel();
        }
    }

    /// Removes the binding without cancelling it --- for a caller that
    /// has already claimed ownership of the operation's lifecycle.
    pub fn remove(&self, target: &T, slot: &str) {
        self.bindings.lock().unwrap().remove(&(target.clone(), slot.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.lock().unwrap().is_empty()
    }
}

impl<T: Eq + Hash + Clone> Default for OperationRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn binding_a_new_operation_cancels_the_previous_one_exactly_once() {
        let registry: OperationRegistry<u32> = OperationRegistry::new();
        let first = CombinedOperation::new();
        let cancels = Arc::new(AtomicUsize::new(0));
        let cancels_clone = Arc::clone(&cancels);
        first.set_cancel_hook(move || {
            cancels_clone.fetch_add(1, Ordering::SeqCst);
        });

        registry.bind(1, "image", Slot::Single(first.clone()));
        assert_eq!(cancels.load(Ordering::SeqCst), 0);

        let second = CombinedOperation::new();
        registry.bind(1, "image", Slot::Single(second));
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert!(first.is_cancelled());
    }

    #[test]
    fn cancel_removes_and_cancels_the_slot() {
        let registry: OperationRegistry<u32> = OperationRegistry::new();
        let op = CombinedOperation::new();
        registry.bind(1, "image", Slot::Single(op.clone()));
        registry.cancel(&1, "image");
        assert!(op.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_clears_the_binding_without_cancelling() {
        let registry: OperationRegistry<u32> = OperationRegistry::new();
        let op = CombinedOperation::new();
        registry.bind(1, "image", Slot::Single(op.clone()));
        registry.remove(&1, "image");
        assert!(!op.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn sequence_slots_cancel_every_member() {
        let registry: OperationRegistry<u32> = OperationRegistry::new();
        let ops = vec![CombinedOperation::new(), CombinedOperation::new(), CombinedOperation::new()];
        registry.bind(1, "animation", Slot::Sequence(ops.clone()));
        registry.cancel(&1, "animation");
        assert!(ops.iter().all(CombinedOperation::is_cancelled));
    }

    #[test]
    fn distinct_slots_on_the_same_target_are_independent() {
        let registry: OperationRegistry<u32> = OperationRegistry::new();
        let image_op = CombinedOperation::new();
        let anim_op = CombinedOperation::new();
        registry.bind(1, "image", Slot::Single(image_op.clone()));
        registry.bind(1, "animation", Slot::Single(anim_op.clone()));
        registry.cancel(&1, "image");
        assert!(image_op.is_cancelled());
        assert!(!anim_op.is_cancelled());
    }
}
