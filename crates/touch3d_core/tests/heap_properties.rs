//! # Heap Allocator Properties
//!
//! Randomized allocate/deallocate/reallocate sequences against the
//! structural invariants, plus the reuse and growth guarantees.

#![allow(missing_docs)]

use std::sync::Arc;

use proptest::prelude::*;
use touch3d_core::memory::{DEFAULT_ALIGNMENT, HEADER_SIZE};
use touch3d_core::{HeapAllocator, HeapPtr, VirtualMemory};

const ARENA_LIMIT: usize = 4 * 1024 * 1024;

fn heap() -> HeapAllocator {
    HeapAllocator::new(Arc::new(VirtualMemory::new(ARENA_LIMIT)), ARENA_LIMIT).unwrap()
}

#[derive(Clone, Debug)]
enum Op {
    Allocate(usize),
    Deallocate(usize),
    Reallocate(usize, usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..2048).prop_map(Op::Allocate),
        2 => any::<usize>().prop_map(Op::Deallocate),
        1 => (any::<usize>(), 1usize..4096).prop_map(|(i, s)| Op::Reallocate(i, s)),
    ]
}

/// A live allocation and the byte it was filled with.
struct Live {
    ptr: HeapPtr,
    len: usize,
    fill: u8,
}

fn assert_disjoint(heap: &HeapAllocator, live: &[Live]) {
    let mut ranges: Vec<_> = live
        .iter()
        .map(|l| (l.ptr.offset(), l.ptr.offset() + heap.usable_size(l.ptr).unwrap()))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlap: {:?} and {:?}", pair[0], pair[1]);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_sequences_keep_invariants(ops in prop::collection::vec(arb_op(), 1..200)) {
        let mut heap = heap();
        let mut live: Vec<Live> = Vec::new();
        let mut next_fill = 1u8;

        for op in ops {
            match op {
                Op::Allocate(size) => {
                    let ptr = heap.allocate(size, DEFAULT_ALIGNMENT).unwrap();
                    heap.bytes_mut(ptr).unwrap()[..size].fill(next_fill);
                    live.push(Live { ptr, len: size, fill: next_fill });
                    next_fill = next_fill.wrapping_add(1).max(1);
                }
                Op::Deallocate(i) if !live.is_empty() => {
                    let gone = live.swap_remove(i % live.len());
                    heap.deallocate(gone.ptr).unwrap();
                }
                Op::Reallocate(i, size) if !live.is_empty() => {
                    let index = i % live.len();
                    let entry = &mut live[index];
                    entry.ptr = heap.reallocate(Some(entry.ptr), size).unwrap();
                    entry.len = entry.len.min(size);
                }
                _ => {}
            }

            prop_assert!(heap.check_invariants().is_ok());
        }

        assert_disjoint(&heap, &live);
        for entry in &live {
            let bytes = &heap.bytes(entry.ptr).unwrap()[..entry.len];
            prop_assert!(bytes.iter().all(|&b| b == entry.fill));
        }

        for entry in live.drain(..) {
            heap.deallocate(entry.ptr).unwrap();
        }
        prop_assert_eq!(heap.block_count(), 0);
        prop_assert_eq!(heap.arena_size(), 0);
    }

    #[test]
    fn freed_block_is_reused_first(n in 8usize..1024, shrink in 0usize..1024) {
        let mut heap = heap();
        let _before = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        let freed = heap.allocate(n, DEFAULT_ALIGNMENT).unwrap();
        let _after = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();

        let start = freed.offset();
        let end = start + heap.usable_size(freed).unwrap();
        heap.deallocate(freed).unwrap();

        let m = n - shrink.min(n - 1);
        let reused = heap.allocate(m, DEFAULT_ALIGNMENT).unwrap();
        prop_assert!(reused.offset() >= start && reused.offset() < end);
    }

    #[test]
    fn realloc_shrink_keeps_pointer_and_prefix(n in 16usize..2048, m in 1usize..2048) {
        prop_assume!(m < n);
        let mut heap = heap();
        let ptr = heap.allocate(n, DEFAULT_ALIGNMENT).unwrap();
        for (i, byte) in heap.bytes_mut(ptr).unwrap().iter_mut().enumerate() {
            *byte = i as u8;
        }

        let same = heap.reallocate(Some(ptr), m).unwrap();
        prop_assert_eq!(same, ptr);
        let bytes = heap.bytes(same).unwrap();
        prop_assert!(bytes[..m].iter().enumerate().all(|(i, &b)| b == i as u8));
        prop_assert!(heap.check_invariants().is_ok());
    }
}

#[test]
fn repeated_same_size_churn_does_not_grow_arena() {
    let mut heap = heap();
    let _pin = heap.allocate(32, DEFAULT_ALIGNMENT).unwrap();
    let first = heap.allocate(256, DEFAULT_ALIGNMENT).unwrap();
    let _fence = heap.allocate(32, DEFAULT_ALIGNMENT).unwrap();
    heap.deallocate(first).unwrap();
    let arena = heap.arena_size();

    for _ in 0..10_000 {
        let ptr = heap.allocate(256, DEFAULT_ALIGNMENT).unwrap();
        assert_eq!(ptr, first);
        heap.deallocate(ptr).unwrap();
    }
    assert_eq!(heap.arena_size(), arena);
}

#[test]
fn realloc_growth_that_must_move_preserves_bytes() {
    let mut heap = heap();
    let ptr = heap.allocate(100, DEFAULT_ALIGNMENT).unwrap();
    let _blocker = heap.allocate(16, DEFAULT_ALIGNMENT).unwrap();
    let original: Vec<u8> = (0..heap.usable_size(ptr).unwrap()).map(|i| i as u8).collect();
    heap.bytes_mut(ptr).unwrap().copy_from_slice(&original);

    let moved = heap.reallocate(Some(ptr), 1000).unwrap();
    assert_ne!(moved, ptr);
    assert_eq!(&heap.bytes(moved).unwrap()[..original.len()], &original[..]);
    heap.check_invariants().unwrap();
}

#[test]
fn arena_tiles_exactly() {
    let mut heap = heap();
    let sizes = [8usize, 24, 100, 7, 512];
    let total: usize = sizes
        .iter()
        .map(|&s| HEADER_SIZE + s.next_multiple_of(DEFAULT_ALIGNMENT))
        .sum();
    for size in sizes {
        heap.allocate(size, DEFAULT_ALIGNMENT).unwrap();
    }
    assert_eq!(heap.arena_size(), total);
}

#[test]
fn exhausting_the_arena_reports_out_of_memory() {
    let mut heap = HeapAllocator::new(Arc::new(VirtualMemory::new(1 << 20)), 4096).unwrap();
    heap.allocate(4096 - HEADER_SIZE, DEFAULT_ALIGNMENT).unwrap();
    assert!(matches!(
        heap.allocate(8, DEFAULT_ALIGNMENT),
        Err(touch3d_core::MemoryError::OutOfMemory { .. })
    ));
    heap.check_invariants().unwrap();
}
