//! Incremental mark-sweep garbage collection for Rust objects.
//!
//! Applications allocate through [`make_gc`] and hold objects through the
//! [`GcPtr`] handle; a process-wide collector reclaims whatever becomes
//! unreachable — reference cycles included — when the application drives it
//! with [`collect`]. The modules provide:
//!
//! - Per-type descriptors with runtime discovery of pointer-field offsets
//!   (no tracer declarations, no derive)
//! - A handle registry that tells roots from sub-pointers automatically
//! - An address-ordered allocation index answering owner queries in
//!   O(log N)
//! - The incremental tri-color state machine and its write barrier
//!
//! Collection is cooperative: nothing is reclaimed until the application
//! calls [`collect`], and each call does a bounded amount of work.
//!
//! # Examples
//!
//! ```
//! use stepgc::{collect, make_gc, GcPtr};
//!
//! struct Node {
//!     next: GcPtr<Node>,
//!     label: &'static str,
//! }
//!
//! // A two-node cycle, reachable only through `a`.
//! let a = make_gc(|| Node { next: GcPtr::null(), label: "a" }).unwrap();
//! let b = make_gc(|| Node { next: a.clone(), label: "b" }).unwrap();
//! a.next.set(&b);
//! assert_eq!(a.next.label, "b");
//! assert_eq!(a.next.next.label, "a");
//!
//! // Dropping the external handles strands the cycle; collection frees it.
//! drop(a);
//! drop(b);
//! collect(10_000);
//! ```

pub mod class_info;
pub mod collector;
pub mod error;
pub mod handle;
mod meta;
mod meta_set;
mod registry;

pub use class_info::{ClassInfo, RegState};
pub use collector::{collect, dump_stats, shutdown, stats, validate, CollectState, GcStats};
pub use error::{GcError, GcResult};
pub use handle::{make_gc, GcPtr};
