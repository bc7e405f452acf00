//! Frame stack operations: push, pop, remove, trim, expand and shift.

use frame_heap::{Arena, ArenaConfig, ArenaError, Handle, Locator};

fn addr<T>(handle: &Handle<T>) -> usize {
    handle.resolve().unwrap().as_ptr() as usize
}

#[test]
fn test_new_frame_takes_the_free_tail() {
    let mut arena = Arena::with_capacity(1024);
    assert_eq!(arena.frame_count(), 0);
    assert_eq!(arena.topmost_frame(), None);

    let frame = arena.add_frame();
    let info = arena.frame_info(frame).unwrap();
    assert_eq!(info.base, arena.base_address());
    assert_eq!(info.len(), 1024);
    assert_eq!(info.used(), 0);
    assert!(info.topmost);
    assert_eq!(arena.available(), 0);
    assert_eq!(arena.topmost_frame(), Some(frame));
    assert_eq!(frame.arena_id(), arena.id());
}

#[test]
fn test_add_frame_trims_previous_topmost() {
    let mut arena = Arena::with_capacity(1024);
    let a = arena.add_frame();
    arena.alloc(a, 1u64).unwrap();
    let b = arena.add_frame();

    let a_info = arena.frame_info(a).unwrap();
    let b_info = arena.frame_info(b).unwrap();
    assert_eq!(a_info.len(), 48);
    assert!(!a_info.topmost);
    assert_eq!(b_info.base, a_info.end);
    assert_eq!(b_info.end, arena.base_address() + 1024);
    assert_eq!(arena.frames().collect::<Vec<_>>(), vec![a, b]);
    assert!(a.serial() < b.serial());
}

#[test]
fn test_remove_interior_frame_slides_upper_frames_down() {
    let mut arena = Arena::with_capacity(4096);
    let a = arena.add_frame();
    let ha = arena.alloc(a, 1u64).unwrap();
    let b = arena.add_frame();
    let hb = arena.alloc(b, [2u8; 16]).unwrap();
    let c = arena.add_frame();
    let hc = arena.alloc(c, 3u64).unwrap();

    let c_before = addr(&hc);
    arena.remove_frame(b).unwrap();

    assert!(!hb.is_valid());
    assert_eq!(arena.frame_count(), 2);
    assert_eq!(addr(&hc), c_before - 48);
    assert_eq!(*hc.get(&arena).unwrap(), 3);
    assert_eq!(*ha.get(&arena).unwrap(), 1);
    assert_eq!(
        arena.frame_info(c).unwrap().base,
        arena.frame_info(a).unwrap().end
    );
    assert_eq!(arena.top_address(), arena.base_address() + 4096 - 48);
    assert_eq!(arena.frame_info(b).err(), Some(ArenaError::UnknownFrame(b)));
}

#[test]
fn test_pop_frame() {
    let mut arena = Arena::new();
    assert!(!arena.pop_frame());

    let a = arena.add_frame();
    let b = arena.add_frame();
    let h = arena.alloc(b, String::from("top")).unwrap();

    assert!(arena.pop_frame());
    assert!(!h.is_valid());
    assert_eq!(arena.topmost_frame(), Some(a));
    assert_eq!(arena.metrics().frames_removed, 1);

    assert!(arena.pop_frame());
    assert_eq!(arena.top_address(), arena.base_address());
    assert_eq!(arena.used(), 0);
}

#[test]
fn test_scope_releases_its_frame() {
    let mut arena = Arena::new();
    let outer = arena.add_frame();

    let (value, escaped) = arena.scope(|arena, frame| {
        let h = arena.alloc(frame, 5i32).unwrap();
        let value = *h.get(arena).unwrap();
        (value, h)
    });

    assert_eq!(value, 5);
    assert!(!escaped.is_valid());
    assert_eq!(arena.frame_count(), 1);
    assert_eq!(arena.topmost_frame(), Some(outer));
}

#[test]
fn test_scope_tolerates_early_removal() {
    let mut arena = Arena::new();
    let removed = arena.scope(|arena, frame| arena.remove_frame(frame).is_ok());
    assert!(removed);
    assert_eq!(arena.frame_count(), 0);
}

#[test]
fn test_clear_frame_keeps_the_frame() {
    let mut arena = Arena::new();
    let frame = arena.add_frame();
    let handles: Vec<_> = (0..3u32).map(|i| arena.alloc(frame, i).unwrap()).collect();

    assert_eq!(arena.clear_frame(frame), Ok(3));
    assert!(handles.iter().all(|h| !h.is_valid()));

    let info = arena.frame_info(frame).unwrap();
    assert_eq!(info.used(), 0);
    assert_eq!(info.live_slots + info.free_slots, 0);

    let again = arena.alloc(frame, 9u32).unwrap();
    assert_eq!(*again.get(&arena).unwrap(), 9);
}

#[test]
fn test_trim_keeps_reserve() {
    let mut arena = Arena::with_capacity(1024);
    let frame = arena.add_frame();
    arena.alloc(frame, 1u64).unwrap();
    arena.set_trim_reserve(frame, 100).unwrap();

    assert!(arena.trim_frame(frame).unwrap());
    let info = arena.frame_info(frame).unwrap();
    assert_eq!(info.trim_reserve, 100);
    assert_eq!(info.available(), 112);
    assert_eq!(arena.available(), 1024 - 48 - 112);
    assert!(!arena.trim_frame(frame).unwrap());
}

#[test]
fn test_expand_pushes_upper_frames_to_the_end() {
    let mut arena = Arena::with_capacity(4096);
    let a = arena.add_frame();
    arena.alloc(a, 1u64).unwrap();
    let b = arena.add_frame();
    let hb = arena.alloc(b, 2u64).unwrap();

    // Nothing to gain while the top frame owns the tail.
    assert!(!arena.expand_frame(a).unwrap());

    assert!(arena.trim_frame(b).unwrap());
    let b_before = addr(&hb);
    assert!(arena.expand_frame(a).unwrap());

    let a_info = arena.frame_info(a).unwrap();
    let b_info = arena.frame_info(b).unwrap();
    assert_eq!(a_info.available(), 4000);
    assert_eq!(b_info.end, arena.base_address() + 4096);
    assert_eq!(b_info.base, a_info.end);
    assert_eq!(addr(&hb), b_before + 4000);
    assert_eq!(*hb.get(&arena).unwrap(), 2);
    assert_eq!(arena.available(), 0);

    let metrics = arena.metrics();
    assert_eq!(metrics.expands, 1);
    assert_eq!(metrics.shifts, 1);
}

#[test]
fn test_shift_above_reports_bytes_gained() {
    let mut arena = Arena::with_capacity(1024);
    let a = arena.add_frame();
    let b = arena.add_frame();
    assert_eq!(arena.shift_above(a), Ok(0));

    arena.trim_frame(b).unwrap();
    assert_eq!(arena.shift_above(a), Ok(1024));
    assert_eq!(arena.frame_info(b).unwrap().base, arena.base_address() + 1024);
    assert!(arena.frame_info(b).unwrap().is_empty());
}

#[test]
fn test_interior_malloc_shifts_upper_frames() {
    let mut arena = Arena::with_capacity(4096);
    let a = arena.add_frame();
    arena.alloc(a, 1u64).unwrap();
    let b = arena.add_frame();
    let hb = arena.alloc(b, 2u64).unwrap();
    arena.trim_frame(b).unwrap();

    let ptr = arena.malloc(a, 64).unwrap();
    assert_eq!(arena.metrics().relocations, 0);
    assert_eq!(arena.metrics().shifts, 1);
    assert!((ptr.as_ptr() as usize) < arena.frame_info(b).unwrap().base);
    assert_eq!(*hb.get(&arena).unwrap(), 2);
}

#[test]
fn test_interior_malloc_grows_when_tail_is_short() {
    let mut arena = Arena::with_capacity(1024);
    let a = arena.add_frame();
    let ha = arena.alloc(a, 1u64).unwrap();
    let b = arena.add_frame();
    let hb = arena.alloc(b, 2u64).unwrap();

    arena.malloc(a, 64).unwrap();
    assert_eq!(arena.capacity(), 2048);
    assert_eq!(arena.metrics().relocations, 1);
    assert_eq!(arena.metrics().shifts, 1);
    assert_eq!(
        arena.frame_info(a).unwrap().end,
        arena.frame_info(b).unwrap().base
    );
    assert_eq!(*ha.get(&arena).unwrap(), 1);
    assert_eq!(*hb.get(&arena).unwrap(), 2);
}

#[test]
fn test_slot_listing() {
    let mut arena = Arena::new();
    let frame = arena.add_frame();
    let kept = arena.alloc(frame, 1u32).unwrap();
    let gone = arena.alloc(frame, 2u32).unwrap();
    let raw = arena.malloc(frame, 20).unwrap();
    gone.destroy(&mut arena).unwrap();

    let slots = arena.slots(frame).unwrap();
    assert_eq!(slots.len(), 3);
    assert_eq!(slots[0].addr, addr(&kept));
    assert_eq!(slots[0].type_name, Some("u32"));
    assert!(slots[0].tracked && slots[0].in_use);
    assert!(!slots[1].in_use);
    assert_eq!(slots[2].addr, raw.as_ptr() as usize);
    assert_eq!(slots[2].size, 32);
    assert_eq!(slots[2].type_name, None);
    assert!(!slots[2].tracked);

    let info = arena.frame_info(frame).unwrap();
    assert_eq!((info.live_slots, info.free_slots), (2, 1));
}

#[test]
fn test_blank_frames_start_zeroed() {
    let config = ArenaConfig::new().initial_capacity(512).blank_frames(true);
    let mut arena = Arena::with_config(config).unwrap();
    let frame = arena.add_frame();
    let ptr = arena.malloc(frame, 64).unwrap();

    // SAFETY: the slot holds 64 bytes and nothing moved since `malloc`.
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
    assert!(bytes.iter().all(|&b| b == 0));
    assert_eq!(arena.blank_frame(frame), Ok(()));
}

#[test]
fn test_frames_of_other_arenas_are_unknown() {
    let mut first = Arena::new();
    let mut second = Arena::new();
    let frame = first.add_frame();
    second.add_frame();

    assert_eq!(second.malloc(frame, 8).err(), Some(ArenaError::UnknownFrame(frame)));
    assert_eq!(second.defrag(frame), Err(ArenaError::UnknownFrame(frame)));
    assert_eq!(second.trim_frame(frame), Err(ArenaError::UnknownFrame(frame)));
    assert_eq!(second.remove_frame(frame), Err(ArenaError::UnknownFrame(frame)));
}

#[test]
fn test_frame_ids_are_not_reused() {
    let mut arena = Arena::new();
    let first = arena.add_frame();
    arena.remove_frame(first).unwrap();
    let second = arena.add_frame();

    assert_ne!(first, second);
    assert_eq!(arena.clear_frame(first), Err(ArenaError::UnknownFrame(first)));
}

#[test]
fn test_frame_bounds_follow_the_arena_base() {
    let mut arena = Arena::with_capacity(256);
    let a = arena.add_frame();
    let _kept = arena.alloc(a, 1u64).unwrap();
    let b = arena.add_frame();
    let offset = arena.address_offset(arena.frame_info(b).unwrap().base);
    assert_eq!(offset, 48);

    let old_base = arena.base_address();
    arena.grow(4096).unwrap();
    assert_ne!(arena.base_address(), old_base);

    let info = arena.frame_info(b).unwrap();
    assert_eq!(arena.absolute_address(offset), info.base);
    assert_eq!(info.end, arena.top_address());
    assert_eq!(arena.address_offset(info.end), 256);
}
