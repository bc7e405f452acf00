//! Loom models of the tracking record protocol.
//!
//! The record keeps a reference count and a flag word. Teardown is claimed
//! with a compare-and-swap that sets `DYING` only while `VALID` is set, so
//! an explicit destroy and a last-handle release never both run a
//! finalizer.

use loom::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use loom::sync::{Arc, Mutex};

const VALID: u8 = 1;
const DYING: u8 = 1 << 1;

struct Record {
    refs: AtomicUsize,
    flags: AtomicU8,
    finalized: AtomicUsize,
}

impl Record {
    fn new(refs: usize) -> Self {
        Self {
            refs: AtomicUsize::new(refs),
            flags: AtomicU8::new(VALID),
            finalized: AtomicUsize::new(0),
        }
    }

    fn begin_teardown(&self) -> bool {
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |flags| {
                (flags & (VALID | DYING) == VALID).then_some(flags | DYING)
            })
            .is_ok()
    }

    fn teardown(&self) {
        self.finalized.fetch_add(1, Ordering::Relaxed);
        self.flags.fetch_and(!(VALID | DYING), Ordering::AcqRel);
    }

    fn destroy(&self) -> bool {
        if !self.begin_teardown() {
            return false;
        }
        self.teardown();
        true
    }

    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 && self.begin_teardown() {
            self.teardown();
        }
    }

    /// Release from a foreign thread. Returns whether it was the last
    /// reference, in which case the caller queues the record.
    fn release_shared(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn clone_shared(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }
}

/// Stand-in for the arena's release queue.
#[derive(Default)]
struct Queue {
    pending: Mutex<Vec<Arc<Record>>>,
}

impl Queue {
    fn push(&self, record: Arc<Record>) {
        self.pending.lock().unwrap().push(record);
    }

    fn drain(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for record in &pending {
            assert_eq!(record.refs.load(Ordering::Acquire), 0);
            if record.begin_teardown() {
                record.teardown();
            }
        }
        pending.len()
    }
}

/// An explicit destroy racing the last release finalizes exactly once.
#[test]
#[ignore = "loom test - run with cargo test --test loom_record --release -- --ignored"]
fn test_destroy_races_release() {
    loom::model(|| {
        let record = Arc::new(Record::new(2));

        let destroyer = loom::thread::spawn({
            let record = Arc::clone(&record);
            move || {
                let destroyed = record.destroy();
                record.release();
                destroyed
            }
        });

        let releaser = loom::thread::spawn({
            let record = Arc::clone(&record);
            move || record.release()
        });

        let destroyed = destroyer.join().unwrap();
        releaser.join().unwrap();

        assert_eq!(record.finalized.load(Ordering::Acquire), 1);
        assert_eq!(record.refs.load(Ordering::Acquire), 0);
        assert!(destroyed || record.flags.load(Ordering::Acquire) & VALID == 0);
    });
}

/// Two explicit destroys: exactly one of them wins.
#[test]
#[ignore = "loom test - run with cargo test --test loom_record --release -- --ignored"]
fn test_double_destroy_claims_once() {
    loom::model(|| {
        let record = Arc::new(Record::new(2));

        let first = loom::thread::spawn({
            let record = Arc::clone(&record);
            move || record.destroy()
        });
        let second = loom::thread::spawn({
            let record = Arc::clone(&record);
            move || record.destroy()
        });

        let wins = usize::from(first.join().unwrap()) + usize::from(second.join().unwrap());
        assert_eq!(wins, 1);
        assert_eq!(record.finalized.load(Ordering::Acquire), 1);
    });
}

/// Clones and drops on two threads leave the count balanced.
#[test]
#[ignore = "loom test - run with cargo test --test loom_record --release -- --ignored"]
fn test_clone_and_release_balance() {
    loom::model(|| {
        let record = Arc::new(Record::new(1));

        let cloner = loom::thread::spawn({
            let record = Arc::clone(&record);
            move || {
                record.refs.fetch_add(1, Ordering::Relaxed);
                record.release();
            }
        });

        cloner.join().unwrap();
        assert_eq!(record.refs.load(Ordering::Acquire), 1);
        assert_eq!(record.finalized.load(Ordering::Acquire), 0);

        record.release();
        assert_eq!(record.finalized.load(Ordering::Acquire), 1);
    });
}

/// A resolve racing a rebase sees either the old or the new address, never
/// a torn value.
#[test]
#[ignore = "loom test - run with cargo test --test loom_record --release -- --ignored"]
fn test_resolve_during_rebase() {
    loom::model(|| {
        let address = Arc::new(AtomicUsize::new(0x1000));

        let mover = loom::thread::spawn({
            let address = Arc::clone(&address);
            move || {
                address.fetch_sub(0x40, Ordering::AcqRel);
            }
        });

        let seen = address.load(Ordering::Acquire);
        mover.join().unwrap();

        assert!(seen == 0x1000 || seen == 0xFC0);
        assert_eq!(address.load(Ordering::Acquire), 0xFC0);
    });
}

/// Shared handles cloned and dropped on two threads: the last release is
/// queued exactly once, and only the owner finalizes.
#[test]
#[ignore = "loom test - run with cargo test --test loom_record --release -- --ignored"]
fn test_cross_thread_clone_and_release_queue_once() {
    loom::model(|| {
        let record = Arc::new(Record::new(2));
        let queue = Arc::new(Queue::default());

        let reader = loom::thread::spawn({
            let record = Arc::clone(&record);
            let queue = Arc::clone(&queue);
            move || {
                record.clone_shared();
                if record.release_shared() {
                    queue.push(Arc::clone(&record));
                }
                if record.release_shared() {
                    queue.push(record);
                }
            }
        });

        if record.release_shared() {
            queue.push(Arc::clone(&record));
        }
        reader.join().unwrap();

        assert_eq!(record.finalized.load(Ordering::Acquire), 0);
        assert_eq!(queue.drain(), 1);
        assert_eq!(record.finalized.load(Ordering::Acquire), 1);
        assert_eq!(queue.drain(), 0);
    });
}

/// An explicit destroy on the owner racing a foreign last release: the
/// queued record is reclaimed without a second finalize.
#[test]
#[ignore = "loom test - run with cargo test --test loom_record --release -- --ignored"]
fn test_destroy_races_foreign_release() {
    loom::model(|| {
        let record = Arc::new(Record::new(1));
        let queue = Arc::new(Queue::default());

        let reader = loom::thread::spawn({
            let record = Arc::clone(&record);
            let queue = Arc::clone(&queue);
            move || {
                if record.release_shared() {
                    queue.push(record);
                }
            }
        });

        let destroyed = record.destroy();
        reader.join().unwrap();

        assert!(destroyed);
        assert_eq!(queue.drain(), 1);
        assert_eq!(record.finalized.load(Ordering::Acquire), 1);
    });
}
