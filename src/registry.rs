//! The registry of all live handle slots.
//!
//! An indexed vector: `pointers[i].index == i` at all times. Registration
//! appends; deregistration swaps the last slot into the vacated position so
//! both are O(1). The displaced slot is handed back to the caller because a
//! swap during root marking can move an unscanned slot behind the cursor.

use std::ptr::NonNull;

use crate::handle::HandleSlot;

#[derive(Default)]
pub(crate) struct PointerRegistry {
    slots: Vec<NonNull<HandleSlot>>,
}

impl PointerRegistry {
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn get(&self, i: usize) -> NonNull<HandleSlot> {
        self.slots[i]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = NonNull<HandleSlot>> + '_ {
        self.slots.iter().copied()
    }

    pub(crate) fn register(&mut self, slot: NonNull<HandleSlot>) {
        assert!(self.slots.len() < u32::MAX as usize, "pointer registry overflow");
        unsafe { slot.as_ref() }.index.set(self.slots.len() as u32);
        self.slots.push(slot);
    }

    /// Remove `slot`, returning the slot displaced into its position, if any.
    pub(crate) fn unregister(&mut self, slot: NonNull<HandleSlot>) -> Option<NonNull<HandleSlot>> {
        let i = unsafe { slot.as_ref() }.index.get() as usize;
        debug_assert!(
            i < self.slots.len() && self.slots[i] == slot,
            "handle registry index desync"
        );
        let last = self.slots.pop().expect("unregister from an empty registry");
        if last == slot {
            return None;
        }
        self.slots[i] = last;
        unsafe { last.as_ref() }.index.set(i as u32);
        Some(last)
    }
}
