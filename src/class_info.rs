//! Per-type class descriptors.
//!
//! A [`ClassInfo`] is the process-wide descriptor for one managed type:
//! payload size and alignment, the destructor thunk the sweep invokes, and
//! the learned table of sub-pointer offsets. No tracer is ever declared by
//! the user; the offset table is discovered on the first allocation of the
//! type and frozen when that allocation's constructor completes.

use std::any::TypeId;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Registration state of a class's sub-pointer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    /// No object of this type has been allocated yet.
    Unregistered,
    /// The first object is under construction; offsets are being learned.
    Registering,
    /// The offset table is frozen.
    Registered,
}

struct SubPtrTable {
    state: RegState,
    /// In-payload byte offsets of embedded handle words, strictly increasing.
    offsets: Vec<u16>,
}

/// Process-wide descriptor for one managed type.
///
/// Obtained with [`ClassInfo::of`]; there is exactly one instance per type
/// for the lifetime of the process.
///
/// # Examples
///
/// ```
/// use stepgc::{ClassInfo, RegState};
///
/// struct Point {
///     x: f64,
///     y: f64,
/// }
///
/// let cls = ClassInfo::of::<Point>();
/// assert_eq!(cls.size, std::mem::size_of::<Point>());
/// assert!(std::ptr::eq(cls, ClassInfo::of::<Point>()));
/// assert_eq!(cls.reg_state(), RegState::Unregistered);
/// ```
pub struct ClassInfo {
    /// Payload size in bytes.
    pub size: usize,
    /// Payload alignment in bytes.
    pub align: usize,
    /// Type name, for diagnostics only.
    pub type_name: &'static str,
    pub(crate) dctor: unsafe fn(*mut u8),
    table: RwLock<SubPtrTable>,
}

static CLASSES: Lazy<DashMap<TypeId, &'static ClassInfo>> = Lazy::new(DashMap::new);

unsafe fn drop_thunk<T>(payload: *mut u8) {
    std::ptr::drop_in_place(payload.cast::<T>());
}

impl ClassInfo {
    /// Intern the descriptor for `T`.
    pub fn of<T: 'static>() -> &'static ClassInfo {
        *CLASSES.entry(TypeId::of::<T>()).or_insert_with(|| {
            Box::leak(Box::new(ClassInfo {
                size: std::mem::size_of::<T>(),
                align: std::mem::align_of::<T>(),
                type_name: std::any::type_name::<T>(),
                dctor: drop_thunk::<T>,
                table: RwLock::new(SubPtrTable {
                    state: RegState::Unregistered,
                    offsets: Vec::new(),
                }),
            }))
        })
    }

    pub fn reg_state(&self) -> RegState {
        self.table.read().state
    }

    pub fn is_registered(&self) -> bool {
        self.reg_state() == RegState::Registered
    }

    /// Snapshot of the learned sub-pointer offsets, in ascending order.
    pub fn sub_ptr_offsets(&self) -> Vec<u16> {
        self.table.read().offsets.clone()
    }

    pub(crate) fn with_offsets<R>(&self, f: impl FnOnce(&[u16]) -> R) -> R {
        f(&self.table.read().offsets)
    }

    /// First allocation of the type begins learning offsets.
    pub(crate) fn begin_registration(&self) {
        let mut table = self.table.write();
        if table.state == RegState::Unregistered {
            table.state = RegState::Registering;
        }
    }

    /// Append a discovered sub-pointer offset.
    ///
    /// Returns `false` without appending when the table is already frozen or
    /// when `offset` does not extend the table (a constructor recursed into
    /// another allocation of the same type, which re-walks an already
    /// recorded prefix).
    pub(crate) fn register_sub_ptr(&self, offset: usize) -> bool {
        let mut table = self.table.write();
        if table.state == RegState::Registered {
            return false;
        }
        assert!(
            offset <= u16::MAX as usize,
            "sub-pointer offset {} in `{}` exceeds the representable range",
            offset,
            self.type_name
        );
        debug_assert!(
            offset + std::mem::size_of::<usize>() <= self.size,
            "sub-pointer offset {} escapes the payload of `{}`",
            offset,
            self.type_name
        );
        let offset = offset as u16;
        if let Some(&last) = table.offsets.last() {
            if offset <= last {
                return false;
            }
        }
        table.offsets.push(offset);
        true
    }

    /// Freeze the offset table; later allocations skip discovery.
    pub(crate) fn freeze(&self) {
        self.table.write().state = RegState::Registered;
    }

    /// Freeze with no offsets, discarding anything learned so far.
    ///
    /// Used when discovery was ambiguous: embedded handles of such a type
    /// simply remain roots, trading precision for safety.
    pub(crate) fn freeze_conservative(&self) {
        let mut table = self.table.write();
        table.offsets.clear();
        table.state = RegState::Registered;
    }
}

impl std::fmt::Debug for ClassInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.read();
        f.debug_struct("ClassInfo")
            .field("type_name", &self.type_name)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("state", &table.state)
            .field("offsets", &table.offsets)
            .finish()
    }
}
