//! End-to-end reclamation scenarios: single objects, chains, cycles,
//! incrementality, and exactly-once destructor execution.

mod common;

use common::{collect_cycles, serialized, settle, DropTally, Tally};
use stepgc::{make_gc, stats, GcPtr};

struct Leaf {
    _t: DropTally,
}

struct Link {
    next: GcPtr<Link>,
    _t: DropTally,
}

#[test]
fn single_object_reclaimed_after_last_handle_drops() {
    let _g = serialized();
    let base = settle();
    let tally = Tally::new();

    let token = tally.token();
    let a = make_gc(move || Leaf { _t: token }).unwrap();
    assert_eq!(stats().metas, base.metas + 1);

    collect_cycles();
    assert_eq!(tally.count(), 0, "a rooted object must not be reclaimed");

    drop(a);
    let mut spins = 0;
    while stats().metas > base.metas {
        stepgc::collect(10);
        spins += 1;
        assert!(spins < 100_000, "collector failed to reach idle");
    }
    assert_eq!(tally.count(), 1);
    stepgc::validate();
}

#[test]
fn chain_survives_through_its_root_and_dies_with_it() {
    let _g = serialized();
    let base = settle();
    let tally = Tally::new();

    let c = make_gc(|| Link { next: GcPtr::null(), _t: tally.token() }).unwrap();
    let b = make_gc(|| Link { next: c.clone(), _t: tally.token() }).unwrap();
    let a = make_gc(|| Link { next: b.clone(), _t: tally.token() }).unwrap();
    drop(b);
    drop(c);

    collect_cycles();
    collect_cycles();
    assert_eq!(tally.count(), 0, "everything is reachable from `a`");
    assert_eq!(stats().metas, base.metas + 3);

    // The chain is intact: a -> b -> c -> null.
    assert!(a.next.next.next.is_null());

    drop(a);
    collect_cycles();
    assert_eq!(tally.count(), 3);
    assert_eq!(stats().metas, base.metas);
    stepgc::validate();
}

#[test]
fn two_node_cycle_is_collected() {
    let _g = serialized();
    let base = settle();
    let tally = Tally::new();

    let a = make_gc(|| Link { next: GcPtr::null(), _t: tally.token() }).unwrap();
    let b = make_gc(|| Link { next: a.clone(), _t: tally.token() }).unwrap();
    a.next.set(&b);

    collect_cycles();
    assert_eq!(tally.count(), 0);

    drop(a);
    drop(b);
    collect_cycles();
    assert_eq!(tally.count(), 2, "both cycle members destructed exactly once");
    assert_eq!(stats().metas, base.metas);
    stepgc::validate();
}

#[test]
fn self_referential_object_is_collected() {
    let _g = serialized();
    let base = settle();
    let tally = Tally::new();

    let token = tally.token();
    let a = make_gc(move || Link { next: GcPtr::null(), _t: token }).unwrap();
    a.next.set(&a);
    drop(a);

    collect_cycles();
    assert_eq!(tally.count(), 1);
    assert_eq!(stats().metas, base.metas);
}

#[test]
fn single_step_calls_reclaim_incrementally() {
    let _g = serialized();
    let base = settle();
    let tally = Tally::new();

    for _ in 0..4 {
        make_gc(|| Leaf { _t: tally.token() }).unwrap();
    }
    assert_eq!(stats().metas, base.metas + 4);

    // Single work units: the call that reclaimed the first object cannot
    // have freed the other three.
    let mut calls = 0;
    while tally.count() == 0 {
        stepgc::collect(1);
        calls += 1;
        assert!(calls < 100_000);
    }
    assert_eq!(tally.count(), 1);
    assert_eq!(stats().metas, base.metas + 3);

    // Repeated unit calls converge to the same final state as one big call.
    while stats().metas > base.metas {
        stepgc::collect(1);
        calls += 1;
        assert!(calls < 100_000);
    }
    assert_eq!(tally.count(), 4);
    stepgc::validate();
}

#[test]
fn shared_tail_freed_only_after_every_owner_dies() {
    let _g = serialized();
    let base = settle();
    let tally = Tally::new();

    let tail = make_gc(|| Link { next: GcPtr::null(), _t: tally.token() }).unwrap();
    let left = make_gc(|| Link { next: tail.clone(), _t: tally.token() }).unwrap();
    let right = make_gc(|| Link { next: tail.clone(), _t: tally.token() }).unwrap();
    drop(tail);

    collect_cycles();
    assert_eq!(tally.count(), 0);

    drop(left);
    collect_cycles();
    assert_eq!(tally.count(), 1, "only the left owner is gone");

    drop(right);
    collect_cycles();
    assert_eq!(tally.count(), 3);
    assert_eq!(stats().metas, base.metas);
}

#[test]
fn unlinking_mid_graph_strands_the_suffix() {
    let _g = serialized();
    let base = settle();
    let tally = Tally::new();

    let c = make_gc(|| Link { next: GcPtr::null(), _t: tally.token() }).unwrap();
    let b = make_gc(|| Link { next: c.clone(), _t: tally.token() }).unwrap();
    let a = make_gc(|| Link { next: b.clone(), _t: tally.token() }).unwrap();
    drop(b);
    drop(c);

    a.next.next.clear();
    collect_cycles();
    assert_eq!(tally.count(), 1, "only `c` became unreachable");
    assert_eq!(stats().metas, base.metas + 2);

    drop(a);
    collect_cycles();
    assert_eq!(tally.count(), 3);
    stepgc::validate();
}

#[test]
fn stats_report_renders_every_counter() {
    let _g = serialized();
    settle();

    let a = make_gc(|| 5u8).unwrap();
    let report = stats().to_string();
    for line in [
        "[total pointers ]",
        "[total meta     ]",
        "[total gray meta]",
        "[live objects   ]",
        "[collector state]",
    ] {
        assert!(report.contains(line), "missing `{line}` in:\n{report}");
    }
    stepgc::dump_stats();
    drop(a);
    collect_cycles();
}

#[test]
fn take_transfers_the_pointee() {
    let _g = serialized();
    let base = settle();
    let tally = Tally::new();

    let a = make_gc(|| Link { next: GcPtr::null(), _t: tally.token() }).unwrap();
    let b = a.take();
    assert!(a.is_null());
    assert!(!b.is_null());

    drop(a);
    collect_cycles();
    assert_eq!(tally.count(), 0, "the pointee moved to `b`");

    drop(b);
    collect_cycles();
    assert_eq!(tally.count(), 1);
    assert_eq!(stats().metas, base.metas);
}
