//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard};

use stepgc::{CollectState, GcStats};

static LOCK: Mutex<()> = Mutex::new(());

/// The collector is process-wide; scenarios take this guard so their
/// absolute observations (meta counts, machine state) are not interleaved.
pub fn serialized() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Destruction counter. The factory itself does not count; every
/// [`DropTally`] token it hands out bumps the count once when dropped.
pub struct Tally(Rc<Cell<u32>>);

impl Tally {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Tally {
        Tally(Rc::new(Cell::new(0)))
    }

    pub fn token(&self) -> DropTally {
        DropTally(Rc::clone(&self.0))
    }

    pub fn count(&self) -> u32 {
        self.0.get()
    }
}

/// Drop-counting payload member: each destructed owner bumps the counter.
pub struct DropTally(Rc<Cell<u32>>);

impl Drop for DropTally {
    fn drop(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

/// A generous whole-cycle budget: everything currently unreachable is swept
/// within one call.
pub fn collect_cycles() {
    stepgc::collect(200_000);
}

/// Run the machine until the heap population is stable and a fresh cycle is
/// about to begin, then snapshot the baseline.
pub fn settle() -> GcStats {
    let mut last = stepgc::stats();
    for _ in 0..16 {
        collect_cycles();
        let now = stepgc::stats();
        if now.metas == last.metas && now.state == CollectState::RootMarking && now.gray == 0 {
            return now;
        }
        last = now;
    }
    panic!("collector failed to settle: {:?}", last);
}
