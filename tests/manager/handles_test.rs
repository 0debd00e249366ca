// Handle Allocator Tests
// Uniqueness and reuse rules under long random workloads

use applink_transport::manager::HandleAllocator;
use applink_transport::transport::{ConnectionHandle, TransportError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

#[test]
fn test_allocator_never_hands_out_a_live_handle() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut alloc = HandleAllocator::with_ceiling(64);
    let mut live: Vec<ConnectionHandle> = Vec::new();

    for _ in 0..10_000 {
        if live.is_empty() || rng.gen_bool(0.55) {
            match alloc.allocate() {
                Ok(handle) => {
                    assert_ne!(handle.as_u32(), 0);
                    assert!(!live.contains(&handle), "{} handed out twice", handle);
                    live.push(handle);
                }
                Err(e) => {
                    assert_eq!(e, TransportError::HandlesExhausted);
                    assert_eq!(live.len(), 64);
                }
            }
        } else {
            let handle = live.swap_remove(rng.gen_range(0..live.len()));
            assert_eq!(alloc.release(handle), Ok(()));
        }

        assert_eq!(alloc.outstanding(), live.len());
    }
}

#[test]
fn test_release_of_unknown_handle_fails() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut alloc = HandleAllocator::with_ceiling(1_000);
    let mut live = HashSet::new();

    for _ in 0..200 {
        live.insert(alloc.allocate().unwrap());
    }

    for _ in 0..200 {
        let target = ConnectionHandle::from_raw(rng.gen_range(1..=1_000));
        let expected = if live.remove(&target) {
            Ok(())
        } else {
            Err(TransportError::HandleNotAllocated(target))
        };
        assert_eq!(alloc.release(target), expected);
    }
}

#[test]
fn test_recently_released_handle_waits_for_wrap() {
    let mut alloc = HandleAllocator::with_ceiling(8);
    let handles: Vec<_> = (0..4).map(|_| alloc.allocate().unwrap()).collect();
    alloc.release(handles[0]).unwrap();

    let next: Vec<_> = (0..4).map(|_| alloc.allocate().unwrap().as_u32()).collect();

    assert_eq!(next, vec![5, 6, 7, 8]);
    assert_eq!(alloc.allocate().unwrap(), handles[0]);
}

#[test]
fn test_full_range_allocator_starts_at_one() {
    let mut alloc = HandleAllocator::default();
    assert_eq!(alloc.allocate().unwrap(), ConnectionHandle::from_raw(1));
}
