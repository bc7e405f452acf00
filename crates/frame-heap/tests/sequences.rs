//! Seeded mixes of allocation and structural operations.
//!
//! After every step the frames must tile `[base, top)` without gaps, and
//! every live handle must resolve into its own frame and read back the value
//! it was created with.

use fastrand::Rng;
use frame_heap::{Arena, ArenaConfig, BackingKind, FrameId, GrowPolicy, Handle, SlotType};

const MAX_FRAMES: usize = 6;
const MAX_ENTRIES: usize = 120;
const MAX_GROW_CAPACITY: usize = 1 << 16;

enum Value {
    Word(Handle<u64>, u64),
    Block(Handle<[u64; 4]>, [u64; 4]),
    Text(Handle<String>, String),
    Raw(Handle<[u8; 48]>, u8),
}

impl Value {
    fn is_valid(&self) -> bool {
        match self {
            Self::Word(h, _) => h.is_valid(),
            Self::Block(h, _) => h.is_valid(),
            Self::Text(h, _) => h.is_valid(),
            Self::Raw(h, _) => h.is_valid(),
        }
    }

    fn address(&self) -> usize {
        match self {
            Self::Word(h, _) => h.resolve().unwrap().as_ptr() as usize,
            Self::Block(h, _) => h.resolve().unwrap().as_ptr() as usize,
            Self::Text(h, _) => h.resolve().unwrap().as_ptr() as usize,
            Self::Raw(h, _) => h.resolve().unwrap().as_ptr() as usize,
        }
    }

    fn check(&self, arena: &Arena) {
        match self {
            Self::Word(h, v) => assert_eq!(h.get(arena).unwrap(), v),
            Self::Block(h, v) => assert_eq!(h.get(arena).unwrap(), v),
            Self::Text(h, v) => assert_eq!(h.get(arena).unwrap(), v),
            Self::Raw(h, byte) => assert!(h.get(arena).unwrap().iter().all(|b| b == byte)),
        }
    }

    fn destroy(&self, arena: &mut Arena) -> bool {
        match self {
            Self::Word(h, _) => h.destroy(arena).unwrap(),
            Self::Block(h, _) => h.destroy(arena).unwrap(),
            Self::Text(h, _) => h.destroy(arena).unwrap(),
            Self::Raw(h, _) => h.destroy(arena).unwrap(),
        }
    }

    /// Untyped slots were bound without a copy callback.
    fn append(&self, arena: &mut Arena, frame: FrameId) -> Option<Self> {
        Some(match self {
            Self::Word(h, v) => Self::Word(arena.append(frame, h).unwrap(), *v),
            Self::Block(h, v) => Self::Block(arena.append(frame, h).unwrap(), *v),
            Self::Text(h, v) => Self::Text(arena.append(frame, h).unwrap(), v.clone()),
            Self::Raw(..) => return None,
        })
    }

    fn transplant(&self, arena: &mut Arena, frame: FrameId) {
        match self {
            Self::Word(h, _) => arena.transplant(frame, h).unwrap(),
            Self::Block(h, _) => arena.transplant(frame, h).unwrap(),
            Self::Text(h, _) => arena.transplant(frame, h).unwrap(),
            Self::Raw(h, _) => arena.transplant(frame, h).unwrap(),
        }
    }
}

struct Entry {
    frame: FrameId,
    value: Value,
}

struct Sequence {
    arena: Arena,
    entries: Vec<Entry>,
    rng: Rng,
    next: u64,
}

impl Sequence {
    fn new(config: ArenaConfig, seed: u64) -> Self {
        Self {
            arena: Arena::with_config(config).unwrap(),
            entries: Vec::new(),
            rng: Rng::with_seed(seed),
            next: 0,
        }
    }

    fn pick_frame(&mut self) -> FrameId {
        if self.arena.frame_count() == 0 {
            return self.arena.add_frame();
        }
        let index = self.rng.usize(..self.arena.frame_count());
        self.arena.frames().nth(index).unwrap()
    }

    fn step(&mut self) {
        let frame = self.pick_frame();
        match self.rng.u8(0..20) {
            0..=4 if self.entries.len() < MAX_ENTRIES => self.alloc(frame),
            5 if self.entries.len() < MAX_ENTRIES => self.malloc_bound(frame),
            // Doubling arenas would otherwise grow without bound.
            13 if self.arena.capacity() < MAX_GROW_CAPACITY => {
                let extra = self.rng.usize(0..2048);
                self.arena.grow(extra).unwrap();
            }
            0..=7 | 13 => self.drop_one(),
            8 => self.destroy_one(),
            9 => {
                self.arena.defrag(frame).unwrap();
            }
            10 => {
                self.arena.trim_frame(frame).unwrap();
            }
            11 => {
                self.arena.expand_frame(frame).unwrap();
            }
            12 => {
                self.arena.shift_above(frame).unwrap();
            }
            14 => {
                let trim_all = self.rng.bool();
                self.arena.shrink(trim_all);
            }
            15 if self.arena.frame_count() < MAX_FRAMES => {
                self.arena.add_frame();
            }
            15 | 16 => self.remove_frame(frame),
            17 => {
                self.arena.pack();
            }
            18 if self.entries.len() < MAX_ENTRIES => self.append(frame),
            _ => self.transplant(frame),
        }
        self.check();
    }

    fn alloc(&mut self, frame: FrameId) {
        let n = self.next;
        self.next += 1;
        let value = match self.rng.u8(0..3) {
            0 => Value::Word(self.arena.alloc_cloneable(frame, n).unwrap(), n),
            1 => {
                let block = [n, n + 1, n + 2, n + 3];
                Value::Block(self.arena.alloc_cloneable(frame, block).unwrap(), block)
            }
            _ => {
                let text = format!("entry-{n}");
                Value::Text(self.arena.alloc_cloneable(frame, text.clone()).unwrap(), text)
            }
        };
        self.entries.push(Entry { frame, value });
    }

    fn malloc_bound(&mut self, frame: FrameId) {
        let byte = u8::try_from(self.next % 251).unwrap();
        self.next += 1;
        let ptr = self.arena.malloc(frame, 48).unwrap();
        // SAFETY: the slot holds 48 bytes and nothing moved since `malloc`.
        unsafe { ptr.as_ptr().write_bytes(byte, 48) };
        // SAFETY: the payload now holds a valid `[u8; 48]`.
        let h = unsafe { self.arena.bind(ptr.cast::<[u8; 48]>(), SlotType::plain()) }.unwrap();
        self.entries.push(Entry {
            frame,
            value: Value::Raw(h, byte),
        });
    }

    fn take_random(&mut self) -> Option<Entry> {
        if self.entries.is_empty() {
            return None;
        }
        let index = self.rng.usize(..self.entries.len());
        Some(self.entries.swap_remove(index))
    }

    fn drop_one(&mut self) {
        drop(self.take_random());
    }

    fn destroy_one(&mut self) {
        if let Some(entry) = self.take_random() {
            assert!(entry.value.destroy(&mut self.arena));
            assert!(!entry.value.is_valid());
            assert!(!entry.value.destroy(&mut self.arena));
        }
    }

    fn remove_frame(&mut self, frame: FrameId) {
        self.arena.remove_frame(frame).unwrap();
        let (gone, kept): (Vec<_>, Vec<_>) = self.entries.drain(..).partition(|e| e.frame == frame);
        assert!(gone.iter().all(|e| !e.value.is_valid()));
        self.entries = kept;
    }

    fn append(&mut self, frame: FrameId) {
        if self.entries.is_empty() {
            return;
        }
        let index = self.rng.usize(..self.entries.len());
        if let Some(value) = self.entries[index].value.append(&mut self.arena, frame) {
            self.entries.push(Entry { frame, value });
        }
    }

    fn transplant(&mut self, frame: FrameId) {
        if self.entries.is_empty() {
            return;
        }
        let index = self.rng.usize(..self.entries.len());
        self.entries[index].value.transplant(&mut self.arena, frame);
        self.entries[index].frame = frame;
    }

    fn check(&self) {
        let arena = &self.arena;
        let mut cursor = arena.base_address();
        for frame in arena.frames() {
            let info = arena.frame_info(frame).unwrap();
            assert_eq!(info.base, cursor, "gap before frame {}", frame.serial());
            assert!(info.base <= info.top && info.top <= info.end);
            cursor = info.end;
        }
        assert_eq!(cursor, arena.top_address());
        assert!(arena.top_address() <= arena.base_address() + arena.capacity());

        for entry in &self.entries {
            entry.value.check(arena);
            let info = arena.frame_info(entry.frame).unwrap();
            let addr = entry.value.address();
            assert!(info.base < addr && addr <= info.top, "slot outside its frame");
        }
    }

    fn finish(mut self) {
        self.arena.pack();
        self.check();

        let frames: Vec<_> = self.arena.frames().collect();
        self.entries.clear();
        for frame in frames {
            let info = self.arena.frame_info(frame).unwrap();
            assert_eq!(info.live_slots + info.kept_slots, 0);
        }
        self.arena.pack();
        for frame in self.arena.frames() {
            assert_eq!(self.arena.frame_info(frame).unwrap().used(), 0);
        }
    }
}

fn run(config: ArenaConfig, seeds: std::ops::Range<u64>, steps: usize) {
    for seed in seeds {
        let mut sequence = Sequence::new(config.clone(), seed);
        for _ in 0..steps {
            sequence.step();
        }
        sequence.finish();
    }
}

#[test]
fn test_heap_sequences() {
    let config = ArenaConfig::new().initial_capacity(512).grow_rate(256);
    run(config, 0..8, 1500);
}

#[test]
fn test_heap_sequences_with_doubling_growth() {
    let config = ArenaConfig::new()
        .initial_capacity(256)
        .grow_policy(GrowPolicy::Doubling)
        .trim_reserve(64);
    run(config, 100..104, 1500);
}

#[test]
fn test_mapped_sequences() {
    let config = ArenaConfig::new()
        .initial_capacity(4096)
        .backing(BackingKind::Mapped);
    run(config, 200..204, 1500);
}
