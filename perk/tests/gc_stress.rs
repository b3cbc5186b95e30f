//! Collection reclaims an overwritten working set: a million 48-byte
//! records keyed into a map, then replaced wholesale by one sentinel. After
//! a mark/sweep pass the shared heap holds only the surviving map spine.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use heap::{Allocator, Block, Collector, CollectorSettings};
use object::{GreyRef, Header, ObjectKind, Slot};
use perk::builtins::map;
use perk::objects::{self, alloc_with_tail, StructInst};

const RECORDS: usize = 1_000_000;

fn record(alloc: &Allocator, index: i64) -> Slot {
    // fixed fields plus one payload slot: a 48-byte record
    let r = alloc_with_tail(
        alloc,
        true,
        size_of::<Slot>(),
        StructInst {
            header: Header::new(ObjectKind::StructInst),
            stype: Slot::Undef,
            len: 1,
        },
    )
    .expect("record allocation");
    // SAFETY: freshly allocated.
    unsafe {
        r.cast_mut::<StructInst>().fields_mut()[0] = Slot::Int(index);
    }
    Slot::Ref(r)
}

#[test]
fn overwritten_records_are_reclaimed() {
    let collector = Collector::new(
        CollectorSettings::default(),
        objects::trace_object,
        objects::finalize_object,
    );
    let alloc = Allocator::new(Arc::clone(&collector));
    collector.start();

    // build the populated map, all in the shared tier
    let mut populated = map::empty(&alloc, true).expect("empty map");
    for i in 0..RECORDS {
        let value = record(&alloc, i as i64);
        populated = map::assoc(&alloc, populated, Slot::Int(i as i64), value, true)
            .expect("assoc record");
    }
    assert_eq!(map::count(populated), Some(RECORDS as u64));

    let used_populated = alloc.snapshot().shared.used_bytes;

    // overwrite every entry with a single shared sentinel
    let sentinel = objects::new_str(&alloc, "sentinel", true).expect("sentinel");
    let mut overwritten = map::empty(&alloc, true).expect("empty map");
    for i in 0..RECORDS {
        overwritten = map::assoc(&alloc, overwritten, Slot::Int(i as i64), sentinel, true)
            .expect("assoc sentinel");
    }

    // one full mark/sweep with only the overwritten map as root
    collector.mark_concurrent(vec![GreyRef(overwritten.as_ref().unwrap().as_ptr())]);
    let dirty = alloc.dirty_mask.load(Ordering::Relaxed);
    alloc.dirty_mask.store(!dirty, Ordering::Relaxed);
    alloc.sweep_heads();
    alloc.sweep_concurrent();

    let used_after = alloc.snapshot().shared.used_bytes;

    // the records and the first map's spine are gone; what survives is the
    // overwritten map's spine plus the sentinel
    assert!(used_after < used_populated / 2);

    // spot-check: the sentinel's slot survived, a record did not get marked
    let (block, idx) = unsafe {
        Block::and_index_from_ptr(sentinel.as_ref().unwrap().as_ptr() as *const u8)
    };
    assert!(!block.is_marked(idx));
    assert!(block.used() >= 1);

    // reachable entries still read back
    assert_eq!(
        map::get(overwritten, Slot::Int(0))
            .unwrap()
            .map(|s| common::str_value(s)),
        Some("sentinel".to_string())
    );
    collector.stop();
}
