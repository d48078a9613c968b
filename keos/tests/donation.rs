mod common;

use common::{boot, Record};
use keos::{
    sync::Lock,
    thread::{self, ThreadBuilder, PRI_DEFAULT},
};
use std::sync::Arc;

#[test]
fn waiters_donate_to_holder() {
    boot();
    let lock = Arc::new(Lock::new());
    let record = Record::new();
    lock.acquire();
    for (name, priority) in [("acquire1", PRI_DEFAULT + 1), ("acquire2", PRI_DEFAULT + 2)] {
        let (l, r) = (lock.clone(), record.clone());
        thread::create(name, priority, move || {
            l.acquire();
            r.push(thread::current_name());
            l.release();
        })
        .unwrap();
        assert_eq!(thread::get_priority(), priority);
    }
    assert!(record.events().is_empty());
    lock.release();
    assert_eq!(record.events(), ["acquire2", "acquire1"]);
    assert_eq!(thread::get_priority(), PRI_DEFAULT);
}

#[test]
fn donation_is_transitive() {
    let sched = boot();
    let a = Arc::new(Lock::new());
    let b = Arc::new(Lock::new());
    let record = Record::new();
    a.acquire();

    let (la, lb, r) = (a.clone(), b.clone(), record.clone());
    let medium = thread::create("medium", PRI_DEFAULT + 1, move || {
        lb.acquire();
        la.acquire();
        r.push("medium got a");
        la.release();
        lb.release();
        r.push("medium done");
    })
    .unwrap();
    assert_eq!(thread::get_priority(), PRI_DEFAULT + 1);

    let (lb, r) = (b.clone(), record.clone());
    thread::create("high", PRI_DEFAULT + 2, move || {
        lb.acquire();
        r.push("high got b");
        lb.release();
    })
    .unwrap();
    assert_eq!(thread::get_priority(), PRI_DEFAULT + 2);
    let info = sched.snapshot(medium).unwrap();
    assert_eq!(info.priority, PRI_DEFAULT + 2);
    assert_eq!(info.base_priority, PRI_DEFAULT + 1);

    a.release();
    assert_eq!(
        record.events(),
        ["medium got a", "high got b", "medium done"]
    );
    assert_eq!(thread::get_priority(), PRI_DEFAULT);
}

fn multiple_locks(release_a_first: bool) {
    boot();
    let a = Arc::new(Lock::new());
    let b = Arc::new(Lock::new());
    let record = Record::new();
    a.acquire();
    b.acquire();
    for (name, priority, lock) in [
        ("a", PRI_DEFAULT + 1, a.clone()),
        ("b", PRI_DEFAULT + 2, b.clone()),
    ] {
        let r = record.clone();
        thread::create(name, priority, move || {
            lock.acquire();
            r.push(thread::current_name());
            lock.release();
        })
        .unwrap();
    }
    assert_eq!(thread::get_priority(), PRI_DEFAULT + 2);

    if release_a_first {
        a.release();
        // "b" still donates through the other lock.
        assert_eq!(thread::get_priority(), PRI_DEFAULT + 2);
        assert!(record.events().is_empty());
        b.release();
    } else {
        b.release();
        assert_eq!(record.events(), ["b"]);
        assert_eq!(thread::get_priority(), PRI_DEFAULT + 1);
        a.release();
    }
    assert_eq!(record.events(), ["b", "a"]);
    assert_eq!(thread::get_priority(), PRI_DEFAULT);
}

#[test]
fn multiple_donations_released_in_order() {
    multiple_locks(false);
}

#[test]
fn multiple_donations_released_out_of_order() {
    multiple_locks(true);
}

#[test]
fn lowering_base_priority_keeps_donation() {
    boot();
    let lock = Arc::new(Lock::new());
    let record = Record::new();
    lock.acquire();
    let (l, r) = (lock.clone(), record.clone());
    thread::create("acquire", PRI_DEFAULT + 10, move || {
        l.acquire();
        r.push("acquired");
        l.release();
    })
    .unwrap();
    assert_eq!(thread::get_priority(), PRI_DEFAULT + 10);
    thread::set_priority(PRI_DEFAULT - 10);
    assert_eq!(thread::get_priority(), PRI_DEFAULT + 10);
    assert!(record.events().is_empty());
    lock.release();
    assert_eq!(record.events(), ["acquired"]);
    assert_eq!(thread::get_priority(), PRI_DEFAULT - 10);
}

#[test]
fn donation_chain_is_bounded() {
    let sched = boot();
    let locks: Arc<Vec<Lock>> = Arc::new((0..=10).map(|_| Lock::new()).collect());
    locks[0].acquire();
    let mut handles = Vec::new();
    for i in 1..=10 {
        let locks = locks.clone();
        let handle = ThreadBuilder::new(format!("chain{}", i))
            .priority(PRI_DEFAULT + i as i32)
            .spawn(move || {
                locks[i].acquire();
                locks[i - 1].acquire();
                locks[i - 1].release();
                locks[i].release();
            })
            .unwrap();
        handles.push(handle);
    }
    // Each waiter reaches eight holders down the chain.
    assert_eq!(thread::get_priority(), PRI_DEFAULT + 8);
    let priority_of = |i: usize| sched.snapshot(handles[i - 1].tid()).unwrap().priority;
    assert_eq!(priority_of(1), PRI_DEFAULT + 9);
    assert_eq!(priority_of(2), PRI_DEFAULT + 10);
    assert_eq!(priority_of(9), PRI_DEFAULT + 10);

    locks[0].release();
    assert_eq!(thread::get_priority(), PRI_DEFAULT);
    for handle in handles {
        assert_eq!(handle.join(), 0);
    }
}
