//! Tracking records are freed once their last handle goes away, whatever
//! happened to the target in between.

#![cfg(feature = "test-util")]

use frame_heap::test_util::live_records;
use frame_heap::{Arena, Handle};

#[test]
fn test_records_freed_after_release() {
    let id = {
        let mut arena = Arena::new();
        let frame = arena.add_frame();
        let a = arena.alloc(frame, 1u32).unwrap();
        let _b = a.clone();
        let _c = arena.alloc(frame, String::from("c")).unwrap();
        assert_eq!(live_records(arena.id()), 2);
        arena.id()
    };
    assert_eq!(live_records(id), 0);
}

#[test]
fn test_records_outlive_their_frame_until_dropped() {
    let mut arena = Arena::new();
    let frame = arena.add_frame();
    let h = arena.alloc(frame, 5u64).unwrap();

    arena.remove_frame(frame).unwrap();
    assert_eq!(live_records(arena.id()), 1);

    drop(h);
    assert_eq!(live_records(arena.id()), 0);
}

#[test]
fn test_untracked_slots_allocate_no_record() {
    let mut arena = Arena::new();
    let frame = arena.add_frame();
    arena.malloc(frame, 64).unwrap();
    assert_eq!(live_records(arena.id()), 0);

    let null = Handle::<u8>::null();
    let _copy = null.clone();
    assert_eq!(live_records(arena.id()), 0);
}

#[test]
fn test_detached_records_are_freed() {
    let arena = Arena::new();
    let h = arena.detach(vec![0u8; 32]);
    assert_eq!(live_records(arena.id()), 1);
    drop(h);
    assert_eq!(live_records(arena.id()), 0);
}

#[test]
fn test_records_released_on_other_threads_are_freed() {
    let mut arena = Arena::new();
    let frame = arena.add_frame();
    let shared: Vec<_> = (0..4u64)
        .map(|i| arena.alloc(frame, i).unwrap().share(&arena).unwrap())
        .collect();
    assert_eq!(live_records(arena.id()), 4);

    std::thread::scope(|s| {
        for handle in shared {
            s.spawn(move || drop(handle));
        }
    });
    assert_eq!(live_records(arena.id()), 4);

    assert_eq!(arena.drain_releases(), 4);
    assert_eq!(live_records(arena.id()), 0);
}

#[test]
fn test_queued_records_freed_with_the_arena() {
    let mut arena = Arena::new();
    let id = arena.id();
    let frame = arena.add_frame();
    let shared = arena.alloc(frame, 3u32).unwrap().share(&arena).unwrap();
    let detached = arena.detach(String::from("boxed")).share(&arena).unwrap();

    drop(arena);
    assert!(!shared.is_valid());
    assert!(detached.is_valid());
    assert_eq!(live_records(id), 2);

    std::thread::spawn(move || {
        drop(shared);
        drop(detached);
    })
    .join()
    .unwrap();
    assert_eq!(live_records(id), 0);
}
