//! Ordered set of allocations, keyed by payload address range.
//!
//! Payload ranges never overlap, so ordering by payload start address is
//! total and a range query answers "which allocation owns this address" in
//! O(log N). The sweep walks the set in address order through a key-based
//! cursor that stays valid across erasures.

use std::collections::BTreeMap;
use std::ptr::NonNull;

use crate::meta::ObjMeta;

#[derive(Default)]
pub(crate) struct MetaSet {
    metas: BTreeMap<usize, NonNull<ObjMeta>>,
}

impl MetaSet {
    pub(crate) fn len(&self) -> usize {
        self.metas.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = NonNull<ObjMeta>> + '_ {
        self.metas.values().copied()
    }

    pub(crate) fn insert(&mut self, meta: NonNull<ObjMeta>) {
        let key = unsafe { meta.as_ref() }.payload_start();
        #[cfg(debug_assertions)]
        {
            let end = unsafe { meta.as_ref() }.payload_end();
            if let Some((_, prev)) = self.metas.range(..=key).next_back() {
                debug_assert!(
                    unsafe { prev.as_ref() }.payload_end() <= key,
                    "overlapping payload ranges in the meta set"
                );
            }
            if let Some((&next_key, _)) = self.metas.range(key..).next() {
                debug_assert!(next_key >= end, "overlapping payload ranges in the meta set");
            }
        }
        let previous = self.metas.insert(key, meta);
        debug_assert!(previous.is_none(), "meta inserted twice");
    }

    pub(crate) fn remove(&mut self, key: usize) -> Option<NonNull<ObjMeta>> {
        self.metas.remove(&key)
    }

    pub(crate) fn pop_first(&mut self) -> Option<NonNull<ObjMeta>> {
        self.metas.pop_first().map(|(_, meta)| meta)
    }

    pub(crate) fn first_key(&self) -> Option<usize> {
        self.metas.keys().next().copied()
    }

    /// First entry whose payload starts at or after `key`.
    pub(crate) fn at_or_after(&self, key: usize) -> Option<(usize, NonNull<ObjMeta>)> {
        self.metas.range(key..).next().map(|(&k, &m)| (k, m))
    }

    /// The allocation owning `addr`, if any.
    pub(crate) fn find_owner(&self, addr: usize) -> Option<NonNull<ObjMeta>> {
        let (_, meta) = self.metas.range(..=addr).next_back()?;
        if unsafe { meta.as_ref() }.contains(addr) {
            Some(*meta)
        } else {
            None
        }
    }
}
