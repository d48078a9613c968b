mod common;

use common::{boot, boot_with};
use keos::{
    thread::{self, ThreadBuilder, ThreadState, PRI_DEFAULT, PRI_MIN},
    Config, KernelError,
};

#[test]
fn join_returns_exit_status() {
    boot();
    let normal = ThreadBuilder::new("normal").spawn(|| ()).unwrap();
    let exited = ThreadBuilder::new("exited")
        .spawn(|| {
            thread::exit(3);
        })
        .unwrap();
    assert_eq!(exited.join(), 3);
    assert_eq!(normal.join(), 0);
}

#[test]
fn initial_thread_is_main() {
    let sched = boot();
    assert_eq!(thread::current_name(), "main");
    assert_eq!(thread::current_tid(), sched.current());
    assert_eq!(thread::get_priority(), PRI_DEFAULT);
    assert!(sched.idle().is_some());
    assert_ne!(sched.idle(), Some(sched.current()));
    let info = sched.snapshot(sched.current()).unwrap();
    assert_eq!(info.state, ThreadState::Running);
    assert_eq!(info.nice, 0);
}

#[test]
fn names_are_truncated() {
    let sched = boot();
    let tid = thread::create("a-very-long-thread-name", PRI_MIN, || ()).unwrap();
    let info = sched.snapshot(tid).unwrap();
    assert_eq!(info.name, "a-very-long-thr");
    assert_eq!(info.state, ThreadState::Ready);
    assert_eq!(sched.ready_threads(), [tid]);
}

#[test]
fn thread_table_is_bounded() {
    boot_with(Config::default().max_threads(4));
    // main and idle take two slots.
    for _ in 0..2 {
        thread::create("filler", PRI_MIN, || ()).unwrap();
    }
    assert_eq!(
        thread::create("overflow", PRI_MIN, || ()),
        Err(KernelError::OutOfMemory)
    );
}

#[test]
fn dead_threads_are_reclaimed() {
    let sched = boot_with(Config::default().max_threads(8));
    for i in 0..100 {
        let handle = ThreadBuilder::new("short")
            .priority(PRI_DEFAULT + 1)
            .spawn(move || {
                thread::exit(i % 5);
            })
            .unwrap();
        assert!(sched.snapshot(handle.tid()).is_none());
        assert_eq!(handle.join(), i % 5);
    }
}

#[test]
#[should_panic(expected = "the initial thread cannot exit")]
fn initial_thread_cannot_exit() {
    boot();
    thread::exit(0);
}

#[test]
#[should_panic(expected = "kernel halted: boom")]
fn panicking_thread_halts_kernel() {
    boot();
    thread::create("panicky", PRI_DEFAULT + 1, || panic!("boom")).unwrap();
}

#[test]
fn kernels_are_independent() {
    let sched = boot();
    let other = std::thread::spawn(|| {
        let sched = boot();
        thread::set_priority(PRI_MIN);
        sched as *const _ as usize
    })
    .join()
    .unwrap();
    assert_ne!(sched as *const _ as usize, other);
    assert_eq!(thread::get_priority(), PRI_DEFAULT);
}
