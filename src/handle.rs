//! Managed pointer handles and the allocation factory.
//!
//! Every live handle owns a heap-resident [`HandleSlot`] registered with the
//! collector; the user-facing [`GcPtr`] is a single word (the slot address),
//! so handle values move freely while the registered record stays put. A
//! handle word embedded in a managed payload is therefore exactly one
//! pointer-sized field, which is the unit the offset-discovery scan and the
//! tracing reads operate on.
//!
//! Construction protocol: [`make_gc`] inserts the allocation's metadata
//! before the user constructor runs, records every slot created while the
//! constructor is on the stack in a thread-local frame, and, once the
//! finished value reaches its payload address, matches the payload's words
//! against the frame to learn which of them are embedded handles. Matched
//! slots are demoted from roots to sub-pointers and, on the first allocation
//! of a type, their offsets are frozen into the type's [`ClassInfo`].

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::class_info::ClassInfo;
use crate::collector::{self, Collector};
use crate::error::{GcError, GcResult};
use crate::meta::ObjMeta;

/// Registered record backing one live handle.
///
/// All fields are read and written only under the collector lock.
pub(crate) struct HandleSlot {
    /// Position in the pointer registry; `pointers[index]` is this slot.
    pub(crate) index: Cell<u32>,
    /// Roots are handles not embedded in any managed allocation.
    pub(crate) is_root: Cell<bool>,
    /// Metadata of the pointee, when the pointee is managed.
    pub(crate) meta: Cell<Option<NonNull<ObjMeta>>>,
    /// Address the handle dereferences to (payload or interior).
    pub(crate) pointee: Cell<*const u8>,
}

thread_local! {
    /// Stack of construction frames; each records the slots created while
    /// the corresponding constructor runs on this thread.
    static FRAMES: RefCell<Vec<Vec<NonNull<HandleSlot>>>> = const { RefCell::new(Vec::new()) };
}

fn frame_record(slot: NonNull<HandleSlot>) {
    // Handles may drop during thread teardown, after this key is gone.
    let _ = FRAMES.try_with(|frames| {
        if let Some(top) = frames.borrow_mut().last_mut() {
            top.push(slot);
        }
    });
}

fn frame_unrecord(slot: NonNull<HandleSlot>) {
    let _ = FRAMES.try_with(|frames| {
        for frame in frames.borrow_mut().iter_mut().rev() {
            if let Some(pos) = frame.iter().position(|s| *s == slot) {
                frame.swap_remove(pos);
                return;
            }
        }
    });
}

/// Allocate and register a fresh slot under the collector lock.
///
/// Runs the write barrier when the slot starts out with a pointee, so a
/// handle created mid-cycle participates in the current cycle's marking.
pub(crate) fn register_new_slot(
    c: &mut Collector,
    meta: Option<NonNull<ObjMeta>>,
    pointee: *const u8,
) -> NonNull<HandleSlot> {
    let slot = NonNull::from(Box::leak(Box::new(HandleSlot {
        index: Cell::new(0),
        is_root: Cell::new(true),
        meta: Cell::new(meta),
        pointee: Cell::new(pointee),
    })));
    c.register_slot(slot);
    if meta.is_some() {
        c.on_pointee_changed(slot);
    }
    slot
}

/// Read the handle word at `payload + off` as a slot pointer.
///
/// # Safety
///
/// `payload + off` must hold a live handle word, i.e. `off` must be a
/// recorded sub-pointer offset of the payload's class.
pub(crate) unsafe fn read_handle_word(
    payload: *mut u8,
    off: u16,
) -> Option<NonNull<HandleSlot>> {
    let word = payload.add(off as usize).cast::<usize>().read();
    let slot = NonNull::new(word as *mut HandleSlot);
    debug_assert!(slot.is_some(), "null handle word at a recorded sub-pointer offset");
    slot
}

/// Demote embedded handles of a freshly constructed object and, on the
/// first allocation of its type, learn their offsets.
pub(crate) fn fixup_new_object(
    c: &mut Collector,
    meta: NonNull<ObjMeta>,
    frame: &[NonNull<HandleSlot>],
) {
    let (cls, payload) = unsafe {
        let m = meta.as_ref();
        (m.cls(), m.payload())
    };

    if cls.is_registered() {
        cls.with_offsets(|offsets| {
            for &off in offsets {
                if let Some(slot) = unsafe { read_handle_word(payload, off) } {
                    debug_assert!(
                        c.slot_is_live(slot.as_ptr() as usize),
                        "handle word at a frozen offset of `{}` is not a registered slot \
                         (layouts with variant-dependent handle positions are unsupported)",
                        cls.type_name
                    );
                    unsafe { slot.as_ref() }.is_root.set(false);
                }
            }
        });
        return;
    }

    // First allocation of the type: scan the payload's pointer-sized words
    // for slots registered during the construction frame. Ascending scan
    // order equals field declaration order for the layouts supported here.
    let word = std::mem::size_of::<usize>();
    let mut found: Vec<(usize, NonNull<HandleSlot>)> = Vec::new();
    let mut ambiguous = false;
    let mut off = 0;
    while off + word <= cls.size {
        let value = unsafe { payload.add(off).cast::<usize>().read_unaligned() };
        if let Some(slot) = frame.iter().copied().find(|s| s.as_ptr() as usize == value) {
            if found.iter().any(|&(_, seen)| seen == slot) {
                // A moved handle left its bit pattern behind in padding; the
                // real offset cannot be told apart from the residue.
                ambiguous = true;
            }
            found.push((off, slot));
        }
        off += word;
    }

    if ambiguous {
        eprintln!(
            "stepgc: ambiguous sub-pointer discovery for `{}`; its embedded handles stay roots",
            cls.type_name
        );
        cls.freeze_conservative();
        return;
    }
    for &(off, slot) in &found {
        unsafe { slot.as_ref() }.is_root.set(false);
        cls.register_sub_ptr(off);
    }
    cls.freeze();
}

/// A managed pointer.
///
/// `GcPtr<T>` is the application's replacement for `&T`/`Box<T>` when `T`
/// lives on the collected heap. Handles are values: clone to share, drop to
/// release; embed them as fields of managed types to build traced object
/// graphs. The pointee is mutated in place with [`set`](GcPtr::set) /
/// [`clear`](GcPtr::clear) / [`take`](GcPtr::take); there is no `&mut`
/// access to an embedded handle, which is what keeps the collector's
/// root/sub-pointer bookkeeping stable. Interior mutability of the payload
/// itself is the payload's business (`Cell`, `RefCell`).
///
/// Two handles compare equal when they refer to the same allocation, even
/// if they address different sub-objects of it.
///
/// A handle created inside a `make_gc` constructor and stored in the new
/// object becomes a traced sub-pointer. Handles that merely pass through a
/// constructor (moved in from outside, or stored behind `Box`/`Vec`
/// indirection) stay roots and pin their pointee until dropped.
///
/// # Examples
///
/// ```
/// use stepgc::{make_gc, GcPtr};
///
/// struct Node {
///     next: GcPtr<Node>,
///     value: u32,
/// }
///
/// let tail = make_gc(|| Node { next: GcPtr::null(), value: 2 }).unwrap();
/// let head = make_gc(|| Node { next: tail.clone(), value: 1 }).unwrap();
/// assert_eq!(head.next.value, 2);
/// assert_eq!(head.next, tail);
/// ```
#[repr(transparent)]
pub struct GcPtr<T: 'static> {
    slot: NonNull<HandleSlot>,
    _marker: PhantomData<*const T>,
}

impl<T: 'static> GcPtr<T> {
    /// A registered handle with no pointee.
    pub fn null() -> GcPtr<T> {
        let slot = collector::with(|c| register_new_slot(c, None, std::ptr::null()));
        frame_record(slot);
        GcPtr { slot, _marker: PhantomData }
    }

    /// Handle to the allocation owning `r`.
    ///
    /// If `r` points into a managed payload the handle carries that
    /// allocation's identity (interior references included). Otherwise the
    /// handle dereferences to `r` but is invisible to the collector.
    pub fn from_ref(r: &T) -> GcPtr<T> {
        let addr = r as *const T as *const u8;
        let slot = collector::with(|c| {
            let meta = c.find_owner(addr as usize);
            register_new_slot(c, meta, addr)
        });
        frame_record(slot);
        GcPtr { slot, _marker: PhantomData }
    }

    /// Like [`GcPtr::from_ref`], but fails instead of producing an
    /// untracked handle when `r` does not point into a managed allocation.
    pub fn try_from_ref(r: &T) -> GcResult<GcPtr<T>> {
        let addr = r as *const T as *const u8;
        let slot = collector::with(|c| {
            let meta = c.find_owner(addr as usize).ok_or(GcError::InvalidReference)?;
            Ok(register_new_slot(c, Some(meta), addr))
        })?;
        frame_record(slot);
        Ok(GcPtr { slot, _marker: PhantomData })
    }

    /// Whether the handle points at nothing.
    pub fn is_null(&self) -> bool {
        collector::with(|_| unsafe { self.slot.as_ref() }.pointee.get().is_null())
    }

    /// Shared reference to the pointee, or `None` for a null handle.
    ///
    /// The reference is valid while this handle lives; dropping the last
    /// handle chain to the pointee and then driving [`collect`] past it
    /// invalidates it, as with any collected heap.
    ///
    /// [`collect`]: crate::collect
    pub fn get(&self) -> Option<&T> {
        let pointee = collector::with(|_| unsafe { self.slot.as_ref() }.pointee.get());
        if pointee.is_null() {
            None
        } else {
            Some(unsafe { &*pointee.cast::<T>() })
        }
    }

    /// Point this handle at `other`'s pointee.
    pub fn set(&self, other: &GcPtr<T>) {
        collector::with(|c| {
            let (meta, pointee) = {
                let o = unsafe { other.slot.as_ref() };
                (o.meta.get(), o.pointee.get())
            };
            let s = unsafe { self.slot.as_ref() };
            s.meta.set(meta);
            s.pointee.set(pointee);
            c.on_pointee_changed(self.slot);
        });
    }

    /// Null this handle out.
    pub fn clear(&self) {
        collector::with(|c| {
            let s = unsafe { self.slot.as_ref() };
            s.meta.set(None);
            s.pointee.set(std::ptr::null());
            c.on_pointee_changed(self.slot);
        });
    }

    /// Transfer the pointee out, leaving this handle null.
    pub fn take(&self) -> GcPtr<T> {
        let out = self.clone();
        self.clear();
        out
    }

    /// Whether this handle currently counts as a root.
    ///
    /// Handles embedded in managed payloads are demoted to sub-pointers;
    /// everything else is a root.
    pub fn is_root(&self) -> bool {
        collector::with(|_| unsafe { self.slot.as_ref() }.is_root.get())
    }

    /// Whether two handles (of any types) refer to the same allocation.
    pub fn same_allocation<U: 'static>(&self, other: &GcPtr<U>) -> bool {
        collector::with(|_| unsafe {
            self.slot.as_ref().meta.get() == other.slot.as_ref().meta.get()
        })
    }
}

impl<T: 'static> Clone for GcPtr<T> {
    fn clone(&self) -> Self {
        let slot = collector::with(|c| {
            let (meta, pointee) = {
                let s = unsafe { self.slot.as_ref() };
                (s.meta.get(), s.pointee.get())
            };
            register_new_slot(c, meta, pointee)
        });
        frame_record(slot);
        GcPtr { slot, _marker: PhantomData }
    }
}

impl<T: 'static> Default for GcPtr<T> {
    fn default() -> Self {
        GcPtr::null()
    }
}

impl<T: 'static> Deref for GcPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get().expect("dereferenced a null gc pointer")
    }
}

impl<T: 'static> PartialEq for GcPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.same_allocation(other)
    }
}

impl<T: 'static> Eq for GcPtr<T> {}

impl<T: 'static> std::fmt::Debug for GcPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (pointee, root) = collector::with(|_| {
            let s = unsafe { self.slot.as_ref() };
            (s.pointee.get(), s.is_root.get())
        });
        write!(
            f,
            "GcPtr<{}>({:p}{})",
            std::any::type_name::<T>(),
            pointee,
            if root { "" } else { ", sub" }
        )
    }
}

impl<T: 'static> Drop for GcPtr<T> {
    fn drop(&mut self) {
        frame_unrecord(self.slot);
        collector::with(|c| c.unregister_slot(self.slot));
        unsafe { drop(Box::from_raw(self.slot.as_ptr())) };
    }
}

/// Cleanup for a constructor that unwinds: the half-born allocation is
/// removed before anything can observe it.
struct CtorGuard {
    meta: NonNull<ObjMeta>,
    armed: bool,
}

impl Drop for CtorGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        collector::constructing_dec();
        FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
        collector::with(|c| c.remove_meta(self.meta));
        unsafe { ObjMeta::free_block(self.meta) };
    }
}

/// Allocate a managed `T` and return a root handle to it.
///
/// The constructor runs with the allocation's metadata already inserted, so
/// nested `make_gc` calls and handle creation inside `ctor` are fine. On
/// the first allocation of each type, the offsets of handle fields are
/// discovered and frozen into the type's [`ClassInfo`]; later allocations
/// reuse the table.
///
/// Fails with [`GcError::OutOfMemory`](crate::GcError::OutOfMemory) when
/// the underlying block cannot be allocated, in which case nothing is
/// registered.
///
/// # Examples
///
/// ```
/// use stepgc::make_gc;
///
/// let n = make_gc(|| 41u32).unwrap();
/// assert_eq!(*n, 41);
/// ```
pub fn make_gc<T: 'static>(ctor: impl FnOnce() -> T) -> GcResult<GcPtr<T>> {
    let cls = ClassInfo::of::<T>();
    if !cls.is_registered() {
        cls.begin_registration();
    }

    let meta = ObjMeta::alloc_block(cls)?;
    // The constructing count must be visible before the meta is, so a
    // concurrent collect cannot sweep the half-born allocation.
    collector::constructing_inc();
    collector::with(|c| c.add_meta(meta));
    FRAMES.with(|frames| frames.borrow_mut().push(Vec::new()));

    let mut guard = CtorGuard { meta, armed: true };
    let value = ctor();
    guard.armed = false;

    let payload = unsafe { meta.as_ref().payload() };
    let frame = FRAMES.with(|frames| frames.borrow_mut().pop()).unwrap_or_default();
    let slot = collector::with(move |c| {
        unsafe { std::ptr::write(payload.cast::<T>(), value) };
        fixup_new_object(c, meta, &frame);
        register_new_slot(c, Some(meta), payload)
    });
    collector::constructing_dec();
    // Recorded into the enclosing frame, if any: the returned handle may be
    // about to become a field of an object still under construction.
    frame_record(slot);
    Ok(GcPtr { slot, _marker: PhantomData })
}
