mod common;

use common::{boot, Record};
use keos::{
    interrupt,
    sync::{Condvar, Lock, Semaphore},
    thread::{self, ThreadBuilder, ThreadState, PRI_DEFAULT, PRI_MIN},
    timer,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

#[test]
fn down_blocks_until_up() {
    let sched = boot();
    let sema = Arc::new(Semaphore::new(0));
    let record = Record::new();
    let (s, r) = (sema.clone(), record.clone());
    let tid = thread::create("waiter", PRI_DEFAULT + 1, move || {
        r.push("down");
        s.down();
        r.push("woken");
    })
    .unwrap();
    assert_eq!(record.events(), ["down"]);
    assert_eq!(sched.snapshot(tid).unwrap().state, ThreadState::Blocked);
    assert_eq!(sema.waiters(), 1);
    sema.up();
    assert_eq!(record.events(), ["down", "woken"]);
    assert_eq!(sema.value(), 0);
    assert_eq!(sema.waiters(), 0);
}

#[test]
fn counter_tracks_ups_and_downs() {
    boot();
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    for initial in [0, 1, 5] {
        let sema = Semaphore::new(initial);
        let mut expected = initial;
        for _ in 0..1000 {
            match rng.gen_range(0..3) {
                0 => {
                    sema.up();
                    expected += 1;
                }
                1 if expected > 0 => {
                    sema.down();
                    expected -= 1;
                }
                _ => {
                    assert_eq!(sema.try_down(), expected > 0);
                    expected = expected.saturating_sub(1);
                }
            }
            assert_eq!(sema.value(), expected);
        }
    }
}

#[test]
fn waiters_wake_in_priority_order() {
    boot();
    thread::set_priority(PRI_MIN);
    let sema = Arc::new(Semaphore::new(0));
    let record = Record::new();
    for i in 0..10 {
        let priority = PRI_DEFAULT - (i + 3) % 10 - 1;
        let (s, r) = (sema.clone(), record.clone());
        thread::create("waiter", priority, move || {
            s.down();
            r.push(thread::get_priority());
        })
        .unwrap();
    }
    for _ in 0..10 {
        sema.up();
    }
    assert_eq!(record.events(), (21..=30).rev().collect::<Vec<_>>());
}

#[test]
fn lock_is_mutually_exclusive() {
    boot();
    let lock = Arc::new(Lock::new());
    let inside = Arc::new(AtomicBool::new(false));
    let counter = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let (lock, inside, counter) = (lock.clone(), inside.clone(), counter.clone());
            ThreadBuilder::new("worker")
                .spawn(move || {
                    for _ in 0..10 {
                        lock.acquire();
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        let v = counter.load(Ordering::SeqCst);
                        // Burn a time slice while holding the lock.
                        for _ in 0..4 {
                            timer::interrupt();
                        }
                        counter.store(v + 1, Ordering::SeqCst);
                        inside.store(false, Ordering::SeqCst);
                        lock.release();
                    }
                })
                .unwrap()
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join(), 0);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 40);
}

#[test]
fn try_acquire_never_blocks() {
    boot();
    let lock = Arc::new(Lock::new());
    assert!(lock.try_acquire());
    assert!(lock.held_by_current_thread());
    let record = Record::new();
    let (l, r) = (lock.clone(), record.clone());
    thread::create("contender", PRI_DEFAULT + 1, move || {
        r.push(l.try_acquire());
        r.push(l.held_by_current_thread());
    })
    .unwrap();
    assert_eq!(record.events(), [false, false]);
    assert_eq!(thread::get_priority(), PRI_DEFAULT);
    lock.release();
    assert!(!lock.held_by_current_thread());
    assert!(lock.try_acquire());
}

#[test]
#[should_panic(expected = "does not hold the lock")]
fn release_by_non_holder_panics() {
    boot();
    Lock::new().release();
}

#[test]
#[should_panic(expected = "already holds")]
fn recursive_acquire_panics() {
    boot();
    let lock = Lock::new();
    lock.acquire();
    lock.acquire();
}

#[test]
#[should_panic(expected = "that does not hold the lock")]
fn release_from_other_thread_halts() {
    boot();
    let lock = Arc::new(Lock::new());
    lock.acquire();
    let l = lock.clone();
    thread::create("thief", PRI_DEFAULT + 1, move || l.release()).unwrap();
}

#[test]
fn condvar_signals_highest_priority_waiter() {
    boot();
    thread::set_priority(PRI_MIN);
    let lock = Arc::new(Lock::new());
    let cond = Arc::new(Condvar::new());
    let record = Record::new();
    for i in 0..10 {
        let priority = PRI_DEFAULT - (i + 7) % 10 - 1;
        let (lock, cond, record) = (lock.clone(), cond.clone(), record.clone());
        thread::create("waiter", priority, move || {
            lock.acquire();
            cond.wait(&lock);
            assert!(lock.held_by_current_thread());
            record.push(priority);
            lock.release();
        })
        .unwrap();
    }
    for _ in 0..10 {
        lock.acquire();
        cond.signal(&lock);
        lock.release();
    }
    assert_eq!(record.events(), (21..=30).rev().collect::<Vec<_>>());
}

#[test]
fn extra_signals_are_noops() {
    boot();
    let lock = Arc::new(Lock::new());
    let cond = Arc::new(Condvar::new());
    lock.acquire();
    for _ in 0..3 {
        cond.signal(&lock);
    }
    lock.release();

    let record = Record::new();
    let (l, c, r) = (lock.clone(), cond.clone(), record.clone());
    let handle = ThreadBuilder::new("waiter")
        .priority(PRI_DEFAULT + 1)
        .spawn(move || {
            l.acquire();
            c.wait(&l);
            r.push(l.held_by_current_thread());
            l.release();
        })
        .unwrap();
    assert!(record.events().is_empty());
    lock.acquire();
    cond.signal(&lock);
    cond.signal(&lock);
    // The waiter needs the lock back before it can return.
    assert!(record.events().is_empty());
    lock.release();
    assert_eq!(record.events(), [true]);
    assert_eq!(handle.join(), 0);
}

#[test]
fn broadcast_wakes_everyone() {
    boot();
    let lock = Arc::new(Lock::new());
    let cond = Arc::new(Condvar::new());
    let ready = Arc::new(AtomicBool::new(false));
    let tids: Vec<_> = (0..5)
        .map(|_| {
            let (lock, cond, ready) = (lock.clone(), cond.clone(), ready.clone());
            ThreadBuilder::new("waiter")
                .priority(PRI_DEFAULT + 1)
                .spawn(move || {
                    lock.acquire();
                    while !ready.load(Ordering::SeqCst) {
                        cond.wait(&lock);
                    }
                    lock.release();
                })
                .map(|handle| handle.tid())
                .unwrap()
        })
        .collect();
    lock.acquire();
    ready.store(true, Ordering::SeqCst);
    cond.broadcast(&lock);
    lock.release();
    let sched = keos::scheduler();
    for tid in tids {
        assert!(sched.snapshot(tid).is_none());
    }
}

const TEST_VECTOR: usize = 0x21;

#[test]
fn up_from_handler_preempts_on_return() {
    boot();
    let sema = Arc::new(Semaphore::new(0));
    let record = Record::new();
    let (s, r) = (sema.clone(), record.clone());
    thread::create("waiter", PRI_DEFAULT + 1, move || {
        s.down();
        r.push("woken");
    })
    .unwrap();

    let (s, r) = (sema.clone(), record.clone());
    interrupt::register(TEST_VECTOR, move || {
        assert!(interrupt::in_interrupt());
        s.up();
        // The waiter runs only after the handler returns.
        r.push("handler");
    });
    record.push("before");
    interrupt::raise(TEST_VECTOR);
    record.push("after");
    assert_eq!(record.events(), ["before", "handler", "woken", "after"]);
    assert_eq!(sema.value(), 0);
    assert!(!interrupt::in_interrupt());
}

#[test]
fn handler_can_request_a_yield() {
    boot();
    let record = Record::new();
    let r = record.clone();
    thread::create("peer", PRI_DEFAULT, move || r.push("peer")).unwrap();
    interrupt::register(TEST_VECTOR, interrupt::yield_on_return);
    interrupt::raise(TEST_VECTOR);
    record.push("main");
    assert_eq!(record.events(), ["peer", "main"]);
}

fn raise_with(handler: impl Fn() + Send + Sync + 'static) {
    boot();
    interrupt::register(TEST_VECTOR, handler);
    interrupt::raise(TEST_VECTOR);
}

#[test]
#[should_panic(expected = "Semaphore::down inside an interrupt handler")]
fn down_in_handler_panics() {
    raise_with(|| Semaphore::new(1).down());
}

#[test]
#[should_panic(expected = "Lock::acquire inside an interrupt handler")]
fn acquire_in_handler_panics() {
    raise_with(|| Lock::new().acquire());
}

#[test]
#[should_panic(expected = "Condvar::wait inside an interrupt handler")]
fn wait_in_handler_panics() {
    raise_with(|| Condvar::new().wait(&Lock::new()));
}

#[test]
#[should_panic(expected = "Unknown interrupt")]
fn unregistered_vector_panics() {
    boot();
    interrupt::raise(TEST_VECTOR);
}

#[test]
#[should_panic(expected = "exits while holding a lock")]
fn exiting_with_a_held_lock_halts() {
    boot();
    let lock = Arc::new(Lock::new());
    let l = lock.clone();
    thread::create("leaky", PRI_DEFAULT + 1, move || l.acquire()).unwrap();
}
