//! The collector: state machine, write barrier, and global lifecycle.
//!
//! Collection is incremental: [`collect`] performs up to `steps` work units
//! in the current state and may transition. States cycle `RootMarking →
//! ChildMarking → Sweeping → RootMarking`; cursors persist across calls, so
//! callers bound their pause times by choosing small step counts.
//!
//! One exclusion lock serializes every registry, meta-set, and mark-state
//! mutation. User code never runs under it: constructors run between
//! metadata insertion and fixup, and sweep destructors run in an unlock
//! window, so handle traffic from inside a destructor cannot deadlock.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::handle::{read_handle_word, HandleSlot};
use crate::meta::{MarkColor, ObjMeta};
use crate::meta_set::MetaSet;
use crate::registry::PointerRegistry;

/// State of the incremental collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectState {
    /// Scanning the handle registry for roots to gray.
    RootMarking,
    /// Draining the gray work list, graying children.
    ChildMarking,
    /// Walking allocations in address order, freeing the unmarked.
    Sweeping,
}

impl std::fmt::Display for CollectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CollectState::RootMarking => "RootMarking",
            CollectState::ChildMarking => "ChildMarking",
            CollectState::Sweeping => "Sweeping",
        })
    }
}

pub(crate) struct Collector {
    registry: PointerRegistry,
    metas: MetaSet,
    gray: Vec<NonNull<ObjMeta>>,
    next_root: usize,
    /// Payload address the sweep resumes from; `None` outside a sweep walk.
    next_sweep: Option<usize>,
    state: CollectState,
    /// A sweep destructor is on the stack (the lock is being juggled around
    /// it); re-entrant `collect` calls back off.
    in_destructor: bool,
    /// Reusable buffer for offset snapshots on the hot tracing paths.
    scratch: Vec<u16>,
    #[cfg(debug_assertions)]
    live_slots: std::collections::HashSet<usize>,
}

// The collector stores raw slot and meta pointers but every access is
// serialized by the global lock; handles themselves never cross threads.
unsafe impl Send for Collector {}

static COLLECTOR: Lazy<Mutex<Collector>> = Lazy::new(|| {
    // Tear down at process exit, running every remaining destructor.
    unsafe {
        libc::atexit(exit_hook);
    }
    Mutex::new(Collector {
        registry: PointerRegistry::default(),
        metas: MetaSet::default(),
        gray: Vec::with_capacity(1024),
        next_root: 0,
        next_sweep: None,
        state: CollectState::RootMarking,
        in_destructor: false,
        scratch: Vec::new(),
        #[cfg(debug_assertions)]
        live_slots: std::collections::HashSet::new(),
    })
});

/// Number of constructors currently on any thread's stack. Collection
/// stands down while nonzero: a half-born allocation is unreferenced and
/// unmarked, exactly what a sweep would free.
static CONSTRUCTING: AtomicUsize = AtomicUsize::new(0);

extern "C" fn exit_hook() {
    shutdown();
}

pub(crate) fn with<R>(f: impl FnOnce(&mut Collector) -> R) -> R {
    f(&mut COLLECTOR.lock())
}

pub(crate) fn constructing_inc() {
    CONSTRUCTING.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn constructing_dec() {
    CONSTRUCTING.fetch_sub(1, Ordering::SeqCst);
}

impl Collector {
    pub(crate) fn register_slot(&mut self, slot: NonNull<HandleSlot>) {
        self.registry.register(slot);
        #[cfg(debug_assertions)]
        self.live_slots.insert(slot.as_ptr() as usize);
    }

    pub(crate) fn unregister_slot(&mut self, slot: NonNull<HandleSlot>) {
        #[cfg(debug_assertions)]
        self.live_slots.remove(&(slot.as_ptr() as usize));
        let vacated = unsafe { slot.as_ref() }.index.get() as usize;
        let displaced = self.registry.unregister(slot);
        // A slot swapped behind the root-marking cursor would be skipped
        // this round; examine it now so no root goes unmarked.
        if let Some(displaced) = displaced {
            if self.state == CollectState::RootMarking && vacated < self.next_root {
                self.try_mark_root(displaced);
            }
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn slot_is_live(&self, addr: usize) -> bool {
        self.live_slots.contains(&addr)
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn slot_is_live(&self, _addr: usize) -> bool {
        true
    }

    pub(crate) fn add_meta(&mut self, meta: NonNull<ObjMeta>) {
        // An allocation made while the sweep is mid-walk must not be freed
        // by it: ahead of the cursor it is created Alive (this sweep resets
        // it and passes over), behind it the cursor never returns. Either
        // way the next cycle evaluates it fresh.
        if self.state == CollectState::Sweeping {
            if let Some(cursor) = self.next_sweep {
                if unsafe { meta.as_ref() }.payload_start() >= cursor {
                    unsafe { meta.as_ref() }.set_mark(MarkColor::Alive);
                }
            }
        }
        self.metas.insert(meta);
    }

    /// Back out a metadata insertion whose constructor never completed.
    pub(crate) fn remove_meta(&mut self, meta: NonNull<ObjMeta>) {
        let removed = self.metas.remove(unsafe { meta.as_ref() }.payload_start());
        debug_assert!(removed.is_some(), "backing out a meta that was never inserted");
    }

    pub(crate) fn find_owner(&self, addr: usize) -> Option<NonNull<ObjMeta>> {
        self.metas.find_owner(addr)
    }

    /// Gray the pointee of a root handle that has not been reached yet.
    fn try_mark_root(&mut self, slot: NonNull<HandleSlot>) {
        let s = unsafe { slot.as_ref() };
        if !s.is_root.get() {
            return;
        }
        let Some(meta) = s.meta.get() else { return };
        let m = unsafe { meta.as_ref() };
        if m.mark() == MarkColor::Unmarked {
            m.set_mark(MarkColor::Gray);
            self.gray.push(meta);
        }
    }

    /// Mark the embedded handles of `meta`'s payload as sub-pointers.
    ///
    /// Runs for every pointed-to object during the root scan, ahead of the
    /// tri-color walk, so root status reflects the current object graph.
    fn demote_sub_ptrs(&mut self, meta: NonNull<ObjMeta>) {
        let (cls, payload) = unsafe {
            let m = meta.as_ref();
            (m.cls(), m.payload())
        };
        let mut offsets = std::mem::take(&mut self.scratch);
        offsets.clear();
        cls.with_offsets(|o| offsets.extend_from_slice(o));
        for &off in &offsets {
            if let Some(slot) = unsafe { read_handle_word(payload, off) } {
                debug_assert!(
                    self.slot_is_live(slot.as_ptr() as usize),
                    "stale handle word at a recorded offset of `{}`",
                    cls.type_name
                );
                unsafe { slot.as_ref() }.is_root.set(false);
            }
        }
        self.scratch = offsets;
    }

    /// The write barrier: a handle's pointee changed while a cycle may be
    /// in flight.
    pub(crate) fn on_pointee_changed(&mut self, slot: NonNull<HandleSlot>) {
        let s = unsafe { slot.as_ref() };
        let Some(meta) = s.meta.get() else { return };
        match self.state {
            CollectState::RootMarking => {
                // Behind the cursor the handle's root status has already
                // been decided this round; re-examine it. Ahead of the
                // cursor the scan will reach it anyway.
                if (s.index.get() as usize) < self.next_root {
                    self.try_mark_root(slot);
                }
            }
            CollectState::ChildMarking => {
                self.try_mark_root(slot);
            }
            CollectState::Sweeping => {
                let m = unsafe { meta.as_ref() };
                if m.mark() == MarkColor::Unmarked {
                    match self.next_sweep {
                        // Behind the cursor: already visited and reset,
                        // safe until the next cycle decides it afresh.
                        Some(cursor) if m.payload_start() < cursor => {}
                        // Ahead: spare it from the sweep in progress.
                        _ => m.set_mark(MarkColor::Alive),
                    }
                }
            }
        }
    }

    fn stats_locked(&self) -> GcStats {
        GcStats {
            pointers: self.registry.len(),
            metas: self.metas.len(),
            gray: self.gray.len(),
            live: self
                .metas
                .iter()
                .filter(|m| unsafe { m.as_ref() }.array_length() != 0)
                .count(),
            state: self.state,
        }
    }
}

/// Run one object's destructor and release its block. Called with the
/// collector lock released so the destructor may allocate, drop handles,
/// or inspect stats.
fn destroy(meta: NonNull<ObjMeta>) {
    let (dctor, payload, type_name) = unsafe {
        let m = meta.as_ref();
        (m.cls().dctor, m.payload(), m.cls().type_name)
    };
    let result = catch_unwind(AssertUnwindSafe(|| unsafe { dctor(payload) }));
    if result.is_err() {
        eprintln!("stepgc: destructor of `{type_name}` panicked during sweep; continuing");
    }
    unsafe { ObjMeta::free_block(meta) };
}

/// Drive the collector by up to `steps` work units.
///
/// One unit is spent per handle scanned, per gray object popped, per child
/// handle visited, and per sweep candidate inspected; state transitions are
/// free. A call made while any constructor is running, or from within a
/// sweeping destructor, returns without doing anything.
///
/// # Examples
///
/// ```
/// use stepgc::{collect, make_gc, stats};
///
/// let n = make_gc(|| 7u64).unwrap();
/// collect(1_000);
/// assert!(stats().metas >= 1);
/// drop(n);
/// ```
pub fn collect(steps: usize) {
    if CONSTRUCTING.load(Ordering::SeqCst) > 0 {
        return;
    }
    let mut budget = i64::try_from(steps).unwrap_or(i64::MAX);
    let mut c = COLLECTOR.lock();
    if c.in_destructor {
        return;
    }

    loop {
        match c.state {
            CollectState::RootMarking => {
                while c.next_root < c.registry.len() && budget > 0 {
                    budget -= 1;
                    let slot = c.registry.get(c.next_root);
                    c.next_root += 1;
                    let meta = unsafe { slot.as_ref() }.meta.get();
                    let Some(meta) = meta else { continue };
                    c.demote_sub_ptrs(meta);
                    c.try_mark_root(slot);
                }
                if c.next_root < c.registry.len() {
                    break;
                }
                c.next_root = 0;
                c.state = CollectState::ChildMarking;
            }
            CollectState::ChildMarking => {
                while budget > 0 {
                    let Some(meta) = c.gray.pop() else { break };
                    budget -= 1;
                    let (cls, payload) = unsafe {
                        let m = meta.as_ref();
                        m.set_mark(MarkColor::Alive);
                        (m.cls(), m.payload())
                    };
                    let mut offsets = std::mem::take(&mut c.scratch);
                    offsets.clear();
                    cls.with_offsets(|o| offsets.extend_from_slice(o));
                    for &off in &offsets {
                        budget -= 1;
                        let Some(child) = (unsafe { read_handle_word(payload, off) }) else {
                            continue;
                        };
                        let child_meta = unsafe { child.as_ref() }.meta.get();
                        if let Some(child_meta) = child_meta {
                            let m = unsafe { child_meta.as_ref() };
                            if m.mark() == MarkColor::Unmarked {
                                m.set_mark(MarkColor::Gray);
                                c.gray.push(child_meta);
                            }
                        }
                    }
                    c.scratch = offsets;
                }
                if !c.gray.is_empty() {
                    break;
                }
                c.state = CollectState::Sweeping;
                c.next_sweep = c.metas.first_key();
            }
            CollectState::Sweeping => {
                while budget > 0 {
                    let Some(cursor) = c.next_sweep else { break };
                    let Some((key, meta)) = c.metas.at_or_after(cursor) else {
                        c.next_sweep = None;
                        break;
                    };
                    budget -= 1;
                    if unsafe { meta.as_ref() }.mark() == MarkColor::Unmarked {
                        c.metas.remove(key);
                        c.next_sweep = Some(key + 1);
                        // The destructor is arbitrary user code; run it
                        // with the lock released.
                        c.in_destructor = true;
                        drop(c);
                        destroy(meta);
                        c = COLLECTOR.lock();
                        c.in_destructor = false;
                    } else {
                        unsafe { meta.as_ref() }.set_mark(MarkColor::Unmarked);
                        c.next_sweep = Some(key + 1);
                    }
                }
                let at_end = match c.next_sweep {
                    None => true,
                    Some(key) => c.metas.at_or_after(key).is_none(),
                };
                if !at_end {
                    break;
                }
                c.state = CollectState::RootMarking;
                c.next_root = 0;
                c.next_sweep = None;
                if c.metas.is_empty() || budget <= 0 {
                    break;
                }
            }
        }
    }
}

/// A snapshot of collector occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Live handle slots in the registry.
    pub pointers: usize,
    /// Allocations tracked by the meta set.
    pub metas: usize,
    /// Entries in the gray work list.
    pub gray: usize,
    /// Allocations with a nonzero array length.
    pub live: usize,
    /// Current state of the collection cycle.
    pub state: CollectState,
}

impl std::fmt::Display for GcStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "========= [gc] ========")?;
        writeln!(f, "[total pointers ] {:3}", self.pointers)?;
        writeln!(f, "[total meta     ] {:3}", self.metas)?;
        writeln!(f, "[total gray meta] {:3}", self.gray)?;
        writeln!(f, "[live objects   ] {:3}", self.live)?;
        writeln!(f, "[collector state] {}", self.state)?;
        write!(f, "=======================")
    }
}

/// Snapshot the collector's counters.
pub fn stats() -> GcStats {
    COLLECTOR.lock().stats_locked()
}

/// Print [`stats`] to stdout.
pub fn dump_stats() {
    println!("{}", stats());
}

/// Tear the collector down: every tracked allocation is destructed and
/// freed, reachable or not, and surviving handles are nulled so late drops
/// are inert. Registered to run at process exit; safe to call earlier.
pub fn shutdown() {
    {
        let mut c = COLLECTOR.lock();
        // Work-list entries would dangle once their metas die.
        c.gray.clear();
        c.next_sweep = None;
        c.next_root = 0;
        c.state = CollectState::RootMarking;
    }
    loop {
        let meta = {
            let mut c = COLLECTOR.lock();
            match c.metas.pop_first() {
                Some(meta) => {
                    c.in_destructor = true;
                    meta
                }
                // Destructors may have allocated; the loop drains those too.
                None => break,
            }
        };
        destroy(meta);
        COLLECTOR.lock().in_destructor = false;
    }
    let c = COLLECTOR.lock();
    for slot in c.registry.iter() {
        let s = unsafe { slot.as_ref() };
        s.meta.set(None);
        s.pointee.set(std::ptr::null());
    }
}

/// Assert the collector's structural invariants. A debugging aid for tests
/// and stress harnesses; panics on violation.
pub fn validate() {
    let c = COLLECTOR.lock();
    for i in 0..c.registry.len() {
        let slot = c.registry.get(i);
        assert_eq!(
            unsafe { slot.as_ref() }.index.get() as usize,
            i,
            "registry slot index desync at {i}"
        );
    }
    let mut prev_end = 0usize;
    for meta in c.metas.iter() {
        let m = unsafe { meta.as_ref() };
        assert!(
            m.payload_start() >= prev_end,
            "meta set ranges overlap or are unordered"
        );
        prev_end = m.payload_end();
    }
    for meta in &c.gray {
        assert_eq!(
            unsafe { meta.as_ref() }.mark(),
            MarkColor::Gray,
            "gray work list holds a non-gray meta"
        );
    }
}
