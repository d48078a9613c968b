//! A thread, abstraction of a cpu core.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with their
//! own stack and local state. Exactly one of them runs at any instant; the
//! [`scheduler`] picks the ready thread with the highest effective priority,
//! and the idle thread when none is ready.
//!
//! A thread is [`Running`], [`Ready`], [`Blocked`] or [`Dying`]. It leaves
//! the CPU when it blocks on a semaphore, lock or condition variable, sleeps,
//! yields, exits, or when its time slice expires and an equal or higher
//! priority thread is waiting.
//!
//! ## Priorities
//!
//! Priorities range from [`PRI_MIN`] to [`PRI_MAX`]. A thread's effective
//! priority is its base priority raised by the donations of the threads that
//! wait on locks it holds (see [`Lock`]). With the feedback queue scheduler
//! enabled, priorities are computed by the kernel instead (see [`mlfqs`]).
//!
//! [`scheduler`]: scheduler::scheduler
//! [`Running`]: ThreadState::Running
//! [`Ready`]: ThreadState::Ready
//! [`Blocked`]: ThreadState::Blocked
//! [`Dying`]: ThreadState::Dying
//! [`Lock`]: crate::sync::Lock
pub mod mlfqs;
pub mod scheduler;

use crate::{sync::LockId, sync::Semaphore, KernelError};
use abyss::switch::Context;
use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use core::{
    any::Any,
    fmt,
    sync::atomic::{AtomicI32, Ordering},
};
use mlfqs::{Fixed, NICE_DEFAULT, NICE_MAX, NICE_MIN};
use scheduler::scheduler;

/// Lowest priority.
pub const PRI_MIN: i32 = 0;
/// Default priority.
pub const PRI_DEFAULT: i32 = 31;
/// Highest priority.
pub const PRI_MAX: i32 = 63;
/// Thread magic to detect stack overflow.
pub const THREAD_MAGIC: usize = 0xdeadbeefcafebabe;
/// Longest thread name kept, in bytes.
pub const MAX_NAME_LEN: usize = 15;

/// Thread identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub(crate) u64);

impl Tid {
    /// Cast into u64.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Thread is running.
    Running,
    /// Thread is runnable and sits on the ready queue.
    Ready,
    /// Thread waits for an event: a semaphore, a lock, a condition or the
    /// timer.
    Blocked,
    /// Thread is exiting and will be reclaimed.
    Dying,
}

/// The one queue a thread may sit on.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum Location {
    Detached,
    Ready,
    Sleeping,
    Waiting,
}

/// Hooks of the process layer attached to a thread.
///
/// The hooks run on the thread they belong to, with the kernel fully
/// usable. While a hook runs, [`Thread::task`] of that thread is `None`.
/// A panicking hook halts the kernel.
pub trait Task: Send {
    /// Called every time the thread is switched in, to activate its address
    /// space.
    fn activate(&self) {}

    /// Called when the thread exits, before it is marked dying. May block.
    fn exit(&mut self, _status: i32) {}

    /// Whether the thread runs a user program. Asked once when the thread is
    /// created, and used for tick accounting.
    fn has_address_space(&self) -> bool {
        false
    }
}

/// Unwind payload of [`exit`].
pub(crate) struct ThreadExit(pub(crate) i32);

/// Where the exit status of a thread is published for its [`JoinHandle`].
pub(crate) struct ExitSlot {
    done: Semaphore,
    status: AtomicI32,
}

impl ExitSlot {
    pub(crate) fn new() -> Self {
        Self {
            done: Semaphore::new(0),
            status: AtomicI32::new(0),
        }
    }

    pub(crate) fn publish(&self, status: i32) {
        self.status.store(status, Ordering::SeqCst);
        self.done.up();
    }
}

/// An thread abstraction.
pub struct Thread {
    pub(crate) tid: Tid,
    pub(crate) name: String,
    pub(crate) state: ThreadState,
    /// Effective priority.
    pub(crate) priority: i32,
    pub(crate) base_priority: i32,
    pub(crate) wakeup_tick: i64,
    /// Threads that wait on a lock this thread holds.
    pub(crate) donors: Vec<Tid>,
    /// The lock this thread waits on.
    pub(crate) waiting_on: Option<LockId>,
    pub(crate) nice: i32,
    pub(crate) recent_cpu: Fixed,
    pub(crate) location: Location,
    pub(crate) context: Context,
    pub(crate) task: Option<Box<dyn Task>>,
    /// Ticks of this thread count as user ticks.
    pub(crate) user: bool,
    pub(crate) exit: Arc<ExitSlot>,
    host: Option<std::thread::JoinHandle<()>>,
    magic: usize,
}

impl Thread {
    pub(crate) fn new(
        tid: Tid,
        name: &str,
        priority: i32,
        context: Context,
        host: Option<std::thread::JoinHandle<()>>,
        exit: Arc<ExitSlot>,
    ) -> Box<Self> {
        Box::new(Self {
            tid,
            name: truncate_name(name),
            state: ThreadState::Blocked,
            priority,
            base_priority: priority,
            wakeup_tick: 0,
            donors: Vec::new(),
            waiting_on: None,
            nice: NICE_DEFAULT,
            recent_cpu: Fixed::ZERO,
            location: Location::Detached,
            context,
            task: None,
            user: false,
            exit,
            host,
            magic: THREAD_MAGIC,
        })
    }

    pub(crate) fn check_magic(&self) {
        if self.magic != THREAD_MAGIC {
            panic!(
                "Stack overflow detected! Thread {} `{}` is corrupted.",
                self.tid, self.name
            )
        }
    }

    /// Id of the thread.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Name of the thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The process-layer hooks attached to this thread.
    pub fn task(&self) -> Option<&dyn Task> {
        self.task.as_deref()
    }

    /// The process-layer hooks attached to this thread.
    pub fn task_mut(&mut self) -> Option<&mut (dyn Task + 'static)> {
        self.task.as_deref_mut()
    }

    pub(crate) fn info(&self) -> ThreadInfo {
        ThreadInfo {
            tid: self.tid,
            name: self.name.clone(),
            state: self.state,
            priority: self.priority,
            base_priority: self.base_priority,
            nice: self.nice,
            recent_cpu: (self.recent_cpu * 100).round(),
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // The host thread is the stack of this thread.
        if let Some(host) = self.host.take() {
            let _ = host.join();
        }
    }
}

fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        String::from(*msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        String::from("Box<dyn Any>")
    }
}

/// A snapshot of a thread's scheduling fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Id of the thread.
    pub tid: Tid,
    /// Name of the thread.
    pub name: String,
    /// State of the thread.
    pub state: ThreadState,
    /// Effective priority.
    pub priority: i32,
    /// Priority set by the thread itself.
    pub base_priority: i32,
    /// Niceness.
    pub nice: i32,
    /// Recent CPU usage, times 100.
    pub recent_cpu: i64,
}

/// A handle to join thread.
pub struct JoinHandle {
    tid: Tid,
    exit: Arc<ExitSlot>,
}

impl JoinHandle {
    /// Id of the underlying thread.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Join this handle and returns exit code.
    pub fn join(self) -> i32 {
        self.exit.done.down();
        self.exit.status.load(Ordering::SeqCst)
    }
}

/// A struct to build a new thread.
pub struct ThreadBuilder {
    name: String,
    priority: i32,
    task: Option<Box<dyn Task>>,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new<I>(name: I) -> Self
    where
        String: From<I>,
    {
        Self {
            name: String::from(name),
            priority: PRI_DEFAULT,
            task: None,
        }
    }

    /// Set the priority of the new thread. Defaults to [`PRI_DEFAULT`].
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attach process-layer hooks to the new thread.
    pub fn attach_task(mut self, task: impl Task + 'static) -> Self {
        self.task = Some(Box::new(task));
        self
    }

    /// Spawn the thread.
    ///
    /// The thread is ready when this returns, and has already run if it
    /// outranks the caller.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::OutOfMemory`] when the kernel cannot hold
    /// another thread.
    pub fn spawn<F: FnOnce() + Send + 'static>(
        self,
        thread_fn: F,
    ) -> Result<JoinHandle, KernelError> {
        let (tid, exit) =
            scheduler().spawn(&self.name, self.priority, self.task, Box::new(thread_fn))?;
        Ok(JoinHandle { tid, exit })
    }
}

/// Create a thread named `name` running `thread_fn` at `priority`.
pub fn create<F: FnOnce() + Send + 'static>(
    name: &str,
    priority: i32,
    thread_fn: F,
) -> Result<Tid, KernelError> {
    ThreadBuilder::new(name)
        .priority(priority)
        .spawn(thread_fn)
        .map(|handle| handle.tid())
}

/// Run a function `f` with current thread as an argument.
///
/// Interrupts are off while `f` runs; it must not call back into the
/// scheduler.
pub fn with_current<R>(f: impl FnOnce(&mut Thread) -> R) -> R {
    scheduler().with_state(|s| f(s.current_mut()))
}

/// Id of the running thread.
pub fn current_tid() -> Tid {
    scheduler().current()
}

/// Name of the running thread.
pub fn current_name() -> String {
    with_current(|th| th.name.clone())
}

/// Block the running thread until [`unblock`] is called on it.
///
/// Interrupts must be off; they are still off when this returns.
pub fn block() {
    scheduler().block_current();
}

/// Make blocked thread `tid` ready to run. Does not preempt the running
/// thread.
pub fn unblock(tid: Tid) {
    scheduler().unblock(tid);
}

/// Give up the CPU. The running thread stays ready and may be picked again
/// right away.
pub fn yield_now() {
    scheduler().yield_current();
}

/// Exit the running thread with `exit_code`.
///
/// The initial thread cannot exit.
pub fn exit(exit_code: i32) -> ! {
    assert!(!scheduler().is_initial(), "the initial thread cannot exit");
    std::panic::resume_unwind(Box::new(ThreadExit(exit_code)))
}

/// Sleep until timer tick `wakeup_tick`.
pub fn sleep_until(wakeup_tick: i64) {
    scheduler().sleep_until(wakeup_tick);
}

/// Set the base priority of the running thread.
///
/// Ignored under the feedback queue scheduler.
pub fn set_priority(priority: i32) {
    assert!(
        (PRI_MIN..=PRI_MAX).contains(&priority),
        "priority {} out of range",
        priority
    );
    let sched = scheduler();
    if sched.config().mlfqs {
        return;
    }
    sched.with_state(|s| {
        let tid = s.current;
        s.current_mut().base_priority = priority;
        s.refresh_priority(tid);
    });
    sched.preempt();
}

/// Effective priority of the running thread.
pub fn get_priority() -> i32 {
    with_current(|th| th.priority)
}

/// Set the niceness of the running thread, clamped to
/// [`NICE_MIN`]..=[`NICE_MAX`].
pub fn set_nice(nice: i32) {
    let nice = nice.clamp(NICE_MIN, NICE_MAX);
    let sched = scheduler();
    let mlfqs = sched.config().mlfqs;
    sched.with_state(|s| {
        let tid = s.current;
        s.current_mut().nice = nice;
        if mlfqs {
            s.mlfqs_refresh(tid);
        }
    });
    sched.preempt();
}

/// Niceness of the running thread.
pub fn get_nice() -> i32 {
    with_current(|th| th.nice)
}

/// Recent CPU usage of the running thread, times 100.
pub fn get_recent_cpu() -> i32 {
    with_current(|th| (th.recent_cpu * 100).round() as i32)
}

/// System load average, times 100.
pub fn get_load_avg() -> i32 {
    (scheduler().load_avg() * 100).round() as i32
}
