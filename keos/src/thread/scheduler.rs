//! Thread scheduler
//!
//! The scheduler owns every thread control block of the kernel and all the
//! queues they move between: the ready queue, the sleep set, and (by id) the
//! wait queues of the semaphores. Its state lives in an [`IntrCell`], so it is
//! only ever touched with interrupts off; on a single CPU that is all the mutual
//! exclusion it needs.
//!
//! The ready queue is kept sorted by descending effective priority. Insertion
//! is stable, so threads of equal priority run in FIFO order, and a periodic
//! time slice rotates among them. When nothing is ready the idle thread runs.
//!
//! A scheduler is bound to each host thread that executes kernel code; reach it
//! with [`scheduler`].

use super::{
    mlfqs::{self, Fixed, PRIORITY_INTERVAL},
    panic_message, ExitSlot, Location, Thread, ThreadExit, ThreadInfo, ThreadState, Tid, PRI_MIN,
};
use crate::{
    interrupt::{Handlers, TIMER_VECTOR},
    sync::LockId,
    Config, KernelError,
};
use abyss::{
    interrupt::{InterruptGate, InterruptGuard, InterruptState, IntrCell},
    switch::{Context, Halted, Machine},
};
use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    string::String,
    sync::Arc,
    vec::Vec,
};
use core::{cell::Cell, cmp::Reverse};
use crossbeam_queue::SegQueue;
use std::panic::{self, AssertUnwindSafe};

std::thread_local! {
    static SCHEDULER: Cell<Option<&'static Scheduler>> = const { Cell::new(None) };
}

/// Get the reference of the scheduler running on this thread.
pub fn scheduler() -> &'static Scheduler {
    SCHEDULER
        .with(Cell::get)
        .unwrap_or_else(|| panic!("KeOS is not booted on this thread"))
}

pub(crate) fn bind(sched: &'static Scheduler) {
    SCHEDULER.with(|s| s.set(Some(sched)));
}

/// Tick accounting of the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Ticks spent in the idle thread.
    pub idle_ticks: u64,
    /// Ticks spent in kernel threads.
    pub kernel_ticks: u64,
    /// Ticks spent in threads that own an address space.
    pub user_ticks: u64,
}

/// Every live thread control block, by id.
pub(crate) struct Registry {
    threads: BTreeMap<Tid, Box<Thread>>,
}

impl Registry {
    pub(crate) fn get(&self, tid: Tid) -> &Thread {
        self.threads
            .get(&tid)
            .map(Box::as_ref)
            .unwrap_or_else(|| panic!("no such thread: {}", tid))
    }

    pub(crate) fn get_mut(&mut self, tid: Tid) -> &mut Thread {
        self.threads
            .get_mut(&tid)
            .map(Box::as_mut)
            .unwrap_or_else(|| panic!("no such thread: {}", tid))
    }

    pub(crate) fn priority(&self, tid: Tid) -> i32 {
        self.get(tid).priority
    }

    pub(crate) fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values().map(Box::as_ref)
    }

    fn len(&self) -> usize {
        self.threads.len()
    }

    fn insert(&mut self, th: Box<Thread>) {
        let prev = self.threads.insert(th.tid, th);
        assert!(prev.is_none(), "thread id reused");
    }

    /// Insert `item` behind every entry of at least its priority.
    pub(crate) fn insert_ordered<T>(
        &self,
        queue: &mut VecDeque<T>,
        item: T,
        tid_of: impl Fn(&T) -> Tid,
    ) {
        let priority = self.priority(tid_of(&item));
        let pos = queue
            .iter()
            .position(|other| self.priority(tid_of(other)) < priority)
            .unwrap_or(queue.len());
        queue.insert(pos, item);
    }

    /// Stable re-sort by current effective priority.
    pub(crate) fn sort<T>(&self, queue: &mut VecDeque<T>, tid_of: impl Fn(&T) -> Tid) {
        queue
            .make_contiguous()
            .sort_by_key(|item| Reverse(self.priority(tid_of(item))));
    }
}

/// The mutable state of the scheduler.
pub(crate) struct State {
    pub(crate) registry: Registry,
    pub(crate) current: Tid,
    pub(crate) holders: BTreeMap<LockId, Tid>,
    ready: VecDeque<Tid>,
    sleepers: Vec<Tid>,
    next_wakeup: i64,
    idle: Option<Tid>,
    initial: Tid,
    thread_ticks: u32,
    ticks: i64,
    stats: Stats,
    load_avg: Fixed,
    next_tid: u64,
}

impl State {
    pub(crate) fn current(&self) -> &Thread {
        let th = self.registry.get(self.current);
        th.check_magic();
        th
    }

    pub(crate) fn current_mut(&mut self) -> &mut Thread {
        let th = self.registry.get_mut(self.current);
        th.check_magic();
        th
    }

    pub(crate) fn is_idle(&self, tid: Tid) -> bool {
        self.idle == Some(tid)
    }

    fn alloc_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        tid
    }

    fn push_ready(&mut self, tid: Tid) {
        let th = self.registry.get_mut(tid);
        assert_eq!(
            th.location,
            Location::Detached,
            "thread {} is already queued",
            tid
        );
        th.location = Location::Ready;
        self.registry.insert_ordered(&mut self.ready, tid, |t| *t);
    }

    /// Make a blocked thread ready. Does not preempt the caller.
    pub(crate) fn unblock(&mut self, tid: Tid) {
        let th = self.registry.get_mut(tid);
        assert_eq!(
            th.state,
            ThreadState::Blocked,
            "unblock of thread {} that is not blocked",
            tid
        );
        th.state = ThreadState::Ready;
        self.push_ready(tid);
    }

    /// Put the current thread on a wait queue, ordered by priority.
    pub(crate) fn enqueue_current(&mut self, queue: &mut VecDeque<Tid>) {
        let tid = self.current;
        let th = self.current_mut();
        assert_eq!(
            th.location,
            Location::Detached,
            "thread {} is already queued",
            tid
        );
        th.location = Location::Waiting;
        self.registry.insert_ordered(queue, tid, |t| *t);
    }

    /// Take the highest priority thread off a wait queue.
    pub(crate) fn dequeue_waiter(&mut self, queue: &mut VecDeque<Tid>) -> Option<Tid> {
        self.registry.sort(queue, |t| *t);
        let tid = queue.pop_front()?;
        self.registry.get_mut(tid).location = Location::Detached;
        Some(tid)
    }

    fn next_to_run(&mut self) -> Tid {
        match self.ready.pop_front() {
            Some(tid) => {
                self.registry.get_mut(tid).location = Location::Detached;
                tid
            }
            None => self.idle.unwrap_or_else(|| panic!("no thread to run")),
        }
    }

    /// Whether the head of the ready queue should take the CPU.
    ///
    /// Ties do not preempt, except that anything preempts the idle thread.
    fn should_preempt(&self) -> bool {
        match self.ready.front() {
            None => false,
            Some(&next) => {
                self.is_idle(self.current)
                    || self.registry.priority(next) > self.registry.priority(self.current)
            }
        }
    }

    /// Set the effective priority of `tid`, moving it within the ready queue.
    pub(crate) fn set_effective(&mut self, tid: Tid, priority: i32) {
        let th = self.registry.get_mut(tid);
        if th.priority == priority {
            return;
        }
        th.priority = priority;
        if th.location == Location::Ready {
            self.ready.retain(|t| *t != tid);
            self.registry.insert_ordered(&mut self.ready, tid, |t| *t);
        }
    }

    /// Recompute the effective priority of `tid` from its base and donors.
    pub(crate) fn refresh_priority(&mut self, tid: Tid) {
        let th = self.registry.get(tid);
        let priority = th
            .donors
            .iter()
            .map(|donor| self.registry.priority(*donor))
            .fold(th.base_priority, i32::max);
        self.set_effective(tid, priority);
    }

    /// Pick the next thread after the current one stops running with
    /// `status`. Returns the contexts to switch between, and the control
    /// block of the current thread if it is dying.
    fn schedule(&mut self, status: ThreadState) -> Option<(Context, Context, Option<Box<Thread>>)> {
        let cur = self.current;
        let th = self.current_mut();
        assert_eq!(th.state, ThreadState::Running);
        th.state = status;
        self.thread_ticks = 0;

        let next = self.next_to_run();
        if next == cur {
            self.current_mut().state = ThreadState::Running;
            return None;
        }
        let from = self.registry.get(cur).context;
        let to = {
            let th = self.registry.get_mut(next);
            th.state = ThreadState::Running;
            th.context
        };
        self.current = next;
        let dead = if status == ThreadState::Dying {
            self.registry.threads.remove(&cur)
        } else {
            None
        };
        log::trace!("switch {} -> {}", cur, next);
        Some((from, to, dead))
    }

    fn sleep_current(&mut self, wakeup_tick: i64) {
        let tid = self.current;
        assert!(!self.is_idle(tid), "the idle thread cannot sleep");
        let th = self.current_mut();
        assert_eq!(
            th.location,
            Location::Detached,
            "thread {} is already queued",
            tid
        );
        th.wakeup_tick = wakeup_tick;
        th.location = Location::Sleeping;
        self.next_wakeup = self.next_wakeup.min(wakeup_tick);
        self.sleepers.push(tid);
    }

    /// Wake every sleeper that is due and recompute the watermark from the
    /// rest.
    fn wake_sleepers(&mut self) {
        let now = self.ticks;
        let mut next_wakeup = i64::MAX;
        let mut due = Vec::new();
        let registry = &self.registry;
        self.sleepers.retain(|&tid| {
            let wakeup_tick = registry.get(tid).wakeup_tick;
            if wakeup_tick <= now {
                due.push(tid);
                false
            } else {
                next_wakeup = next_wakeup.min(wakeup_tick);
                true
            }
        });
        self.next_wakeup = next_wakeup;
        for tid in due {
            self.registry.get_mut(tid).location = Location::Detached;
            self.unblock(tid);
        }
    }

    fn account_tick(&mut self) {
        let user = self.current().user;
        if self.is_idle(self.current) {
            self.stats.idle_ticks += 1;
        } else if user {
            self.stats.user_ticks += 1;
        } else {
            self.stats.kernel_ticks += 1;
        }
    }

    /// Recompute the feedback queue priority of `tid`.
    pub(crate) fn mlfqs_refresh(&mut self, tid: Tid) {
        let th = self.registry.get_mut(tid);
        let priority = mlfqs::priority(th.recent_cpu, th.nice);
        th.base_priority = priority;
        self.set_effective(tid, priority);
    }

    fn mlfqs_tick(&mut self, timer_freq: i64) {
        let cur = self.current;
        let running = !self.is_idle(cur);
        if running {
            let th = self.current_mut();
            th.recent_cpu = th.recent_cpu + Fixed::from_int(1);
        }

        if self.ticks % timer_freq == 0 {
            let ready = self.ready.len() + usize::from(running);
            self.load_avg = mlfqs::load_avg(self.load_avg, ready);
            let (load_avg, idle) = (self.load_avg, self.idle);
            for th in self.registry.threads.values_mut() {
                if Some(th.tid) != idle {
                    th.recent_cpu = mlfqs::decay(th.recent_cpu, load_avg, th.nice);
                }
            }
        }

        if self.ticks % PRIORITY_INTERVAL == 0 {
            let tids: Vec<Tid> = self
                .registry
                .threads
                .keys()
                .copied()
                .filter(|tid| !self.is_idle(*tid))
                .collect();
            for tid in tids {
                self.mlfqs_refresh(tid);
            }
        }
    }
}

/// The scheduler of a kernel instance.
pub struct Scheduler {
    pub(crate) gate: InterruptGate,
    pub(crate) machine: Arc<Machine>,
    pub(crate) handlers: Handlers,
    state: IntrCell<State>,
    /// Control blocks of dead threads, reclaimed by the next thread to run.
    graveyard: SegQueue<Box<Thread>>,
    config: Config,
}

impl Scheduler {
    pub(crate) fn new(config: Config, machine: Arc<Machine>, context: Context) -> Self {
        let initial = Tid(1);
        let mut main = Thread::new(
            initial,
            "main",
            super::PRI_DEFAULT,
            context,
            None,
            Arc::new(ExitSlot::new()),
        );
        main.state = ThreadState::Running;
        if config.mlfqs {
            main.base_priority = mlfqs::priority(main.recent_cpu, main.nice);
            main.priority = main.base_priority;
        }
        let mut registry = Registry {
            threads: BTreeMap::new(),
        };
        registry.insert(main);
        Self {
            gate: InterruptGate::new(),
            machine,
            handlers: Handlers::new(),
            state: IntrCell::new(State {
                registry,
                current: initial,
                holders: BTreeMap::new(),
                ready: VecDeque::new(),
                sleepers: Vec::new(),
                next_wakeup: i64::MAX,
                idle: None,
                initial,
                thread_ticks: 0,
                ticks: 0,
                stats: Stats::default(),
                load_avg: Fixed::ZERO,
                next_tid: initial.0 + 1,
            }),
            graveyard: SegQueue::new(),
            config,
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        self.state.with(&self.gate, f)
    }

    /// The configuration this kernel booted with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of timer ticks since boot.
    pub fn ticks(&self) -> i64 {
        self.with_state(|s| s.ticks)
    }

    /// Tick accounting since boot.
    pub fn stats(&self) -> Stats {
        self.with_state(|s| s.stats)
    }

    /// Print the tick accounting on the console.
    pub fn print_stats(&self) {
        let stats = self.stats();
        abyss::println!(
            "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
            stats.idle_ticks,
            stats.kernel_ticks,
            stats.user_ticks
        );
    }

    /// Id of the running thread.
    pub fn current(&self) -> Tid {
        self.with_state(|s| s.current().tid)
    }

    /// Id of the idle thread.
    pub fn idle(&self) -> Option<Tid> {
        self.with_state(|s| s.idle)
    }

    /// Observe a live thread.
    pub fn snapshot(&self, tid: Tid) -> Option<ThreadInfo> {
        self.with_state(|s| s.registry.threads.get(&tid).map(|th| th.info()))
    }

    /// Ids of the ready threads, in the order they will run.
    pub fn ready_threads(&self) -> Vec<Tid> {
        self.with_state(|s| s.ready.iter().copied().collect())
    }

    /// System load average, 17.14 fixed point.
    pub(crate) fn load_avg(&self) -> Fixed {
        self.with_state(|s| s.load_avg)
    }

    pub(crate) fn is_initial(&self) -> bool {
        self.with_state(|s| s.current == s.initial)
    }

    /// Create a thread and make it ready.
    pub(crate) fn spawn(
        &'static self,
        name: &str,
        priority: i32,
        task: Option<Box<dyn super::Task>>,
        thread_fn: Box<dyn FnOnce() + Send>,
    ) -> Result<(Tid, Arc<ExitSlot>), KernelError> {
        assert!(
            (PRI_MIN..=super::PRI_MAX).contains(&priority),
            "priority {} out of range",
            priority
        );
        let _guard = InterruptGuard::new(&self.gate);
        let tid = self
            .with_state(|s| (s.registry.len() < self.config.max_threads).then(|| s.alloc_tid()))
            .ok_or_else(|| {
                log::warn!("cannot create thread `{}`: too many threads", name);
                KernelError::OutOfMemory
            })?;
        let (context, host) = self
            .machine
            .spawn(name, move || thread_entry(self, thread_fn))
            .map_err(|e| {
                log::warn!("cannot create thread `{}`: {}", name, e);
                KernelError::OutOfMemory
            })?;
        let exit = Arc::new(ExitSlot::new());
        let mlfqs = self.config.mlfqs;
        let user = matches!(&task, Some(task) if task.has_address_space());
        self.with_state(|s| {
            let parent = s.current();
            let (nice, recent_cpu) = (parent.nice, parent.recent_cpu);
            let mut th = Thread::new(tid, name, priority, context, Some(host), exit.clone());
            th.task = task;
            th.user = user;
            th.nice = nice;
            th.recent_cpu = recent_cpu;
            if mlfqs {
                th.base_priority = mlfqs::priority(recent_cpu, nice);
                th.priority = th.base_priority;
            }
            s.registry.insert(th);
            s.unblock(tid);
        });
        log::debug!("thread {} `{}` created", tid, name);
        self.preempt();
        Ok((tid, exit))
    }

    /// Create the idle thread. It runs only when nothing else is ready and is
    /// never put on the ready queue.
    pub(crate) fn start_idle(&'static self) -> Result<(), KernelError> {
        let tid = self.with_state(|s| s.alloc_tid());
        let (context, host) = self
            .machine
            .spawn("idle", move || {
                thread_entry(self, Box::new(move || self.idle_loop()))
            })
            .map_err(|_| KernelError::OutOfMemory)?;
        self.with_state(|s| {
            s.registry.insert(Thread::new(
                tid,
                "idle",
                PRI_MIN,
                context,
                Some(host),
                Arc::new(ExitSlot::new()),
            ));
            s.idle = Some(tid);
        });
        Ok(())
    }

    fn idle_loop(&self) {
        loop {
            {
                let _guard = InterruptGuard::new(&self.gate);
                self.block_current();
            }
            self.wait_for_interrupt();
        }
    }

    /// The idle thread halts the CPU here until the next interrupt. The only
    /// interrupt source of the machine is the timer, so halting delivers the
    /// next tick right away.
    fn wait_for_interrupt(&self) {
        let stuck = self.with_state(|s| s.ready.is_empty() && s.sleepers.is_empty());
        if stuck {
            self.halt(String::from("deadlock: every thread is blocked"));
        }
        crate::interrupt::raise(TIMER_VECTOR);
    }

    /// Stop the machine after a fatal error on the running thread.
    pub(crate) fn halt(&self, reason: String) -> ! {
        log::error!("kernel halted: {}", reason);
        let context = self.with_state(|s| s.current().context);
        self.machine.halt(&context, reason)
    }

    /// Make a blocked thread ready. Does not preempt the caller.
    pub(crate) fn unblock(&self, tid: Tid) {
        self.with_state(|s| s.unblock(tid));
    }

    /// Block the running thread until somebody unblocks it.
    pub(crate) fn block_current(&self) {
        assert!(
            !self.gate.in_interrupt(),
            "thread blocked inside an interrupt handler"
        );
        assert_eq!(
            self.gate.current(),
            InterruptState::Off,
            "thread blocked with interrupts on"
        );
        self.switch_away(ThreadState::Blocked);
    }

    /// Give up the CPU, staying runnable.
    pub(crate) fn yield_current(&self) {
        assert!(
            !self.gate.in_interrupt(),
            "thread yielded inside an interrupt handler"
        );
        let _guard = InterruptGuard::new(&self.gate);
        self.with_state(|s| {
            let cur = s.current;
            if !s.is_idle(cur) {
                s.push_ready(cur);
            }
        });
        self.switch_away(ThreadState::Ready);
    }

    /// Yield if a ready thread outranks the running one. Inside an interrupt
    /// handler the yield is deferred until the handler returns.
    pub(crate) fn preempt(&self) {
        let _guard = InterruptGuard::new(&self.gate);
        if self.with_state(|s| s.should_preempt()) {
            if self.gate.in_interrupt() {
                self.gate.request_yield_on_return();
            } else {
                self.yield_current();
            }
        }
    }

    fn switch_away(&self, status: ThreadState) {
        if let Some((from, to, _)) = self.with_state(|s| s.schedule(status)) {
            self.machine.switch(&from, &to);
            self.finish_switch();
        }
    }

    /// Runs on the incoming thread right after every switch.
    fn finish_switch(&self) {
        while let Some(dead) = self.graveyard.pop() {
            log::debug!("thread {} `{}` reclaimed", dead.tid, dead.name);
            drop(dead);
        }
        // The hook may call back into the kernel, so it runs outside the state
        // cell.
        let task = self.with_state(|s| s.current_mut().task.take());
        if let Some(task) = task {
            task.activate();
            self.with_state(|s| s.current_mut().task = Some(task));
        }
    }

    /// Run the exit hook of the running thread and publish its status to the
    /// joiner. May block.
    fn retire_current(&self, status: i32) {
        let task = self.with_state(|s| s.current_mut().task.take());
        if let Some(mut task) = task {
            task.exit(status);
        }
        let (tid, exit) = self.with_state(|s| {
            let th = s.current();
            let tid = th.tid;
            assert!(
                !s.holders.values().any(|holder| *holder == tid),
                "thread {} `{}` exits while holding a lock",
                tid,
                th.name
            );
            (tid, th.exit.clone())
        });
        exit.publish(status);
        log::debug!("thread {} exits with {}", tid, status);
    }

    /// Tear down the running thread. The caller's host thread must return
    /// without touching the kernel afterwards.
    fn exit_current(&self) {
        self.gate.disable();
        let plan = self.with_state(|s| s.schedule(ThreadState::Dying));
        if let Some((_, to, dead)) = plan {
            if let Some(dead) = dead {
                self.graveyard.push(dead);
            }
            self.machine.exit_to(&to);
        }
    }

    /// Put the running thread to sleep until tick `wakeup_tick`.
    pub(crate) fn sleep_until(&self, wakeup_tick: i64) {
        assert!(
            !self.gate.in_interrupt(),
            "thread slept inside an interrupt handler"
        );
        let _guard = InterruptGuard::new(&self.gate);
        self.with_state(|s| s.sleep_current(wakeup_tick));
        self.block_current();
    }

    /// The timer interrupt handler.
    pub(crate) fn tick(&self) {
        let mlfqs = self.config.mlfqs;
        let time_slice = self.config.time_slice;
        let timer_freq = self.config.timer_freq as i64;
        let yield_on_return = self.with_state(|s| {
            s.ticks += 1;
            s.account_tick();
            if mlfqs {
                s.mlfqs_tick(timer_freq);
            }
            s.thread_ticks += 1;
            let expired = s.thread_ticks >= time_slice;
            if s.ticks >= s.next_wakeup {
                s.wake_sleepers();
            }
            expired || s.should_preempt()
        });
        if yield_on_return {
            self.gate.request_yield_on_return();
        }
    }
}

/// The first code every spawned thread runs on its own host thread.
fn thread_entry(sched: &'static Scheduler, thread_fn: Box<dyn FnOnce() + Send>) {
    bind(sched);
    let status = run_or_halt(sched, move || {
        sched.finish_switch();
        sched.gate.enable();
        thread_fn();
        0
    });
    run_or_halt(sched, || {
        sched.retire_current(status);
        status
    });
    sched.exit_current();
}

/// Run `f` on the running thread. [`exit`] unwinds to here with its status;
/// any other panic halts the machine.
///
/// [`exit`]: super::exit
fn run_or_halt(sched: &Scheduler, f: impl FnOnce() -> i32) -> i32 {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(status) => status,
        Err(payload) => match payload.downcast::<ThreadExit>() {
            Ok(exit) => exit.0,
            Err(payload) if payload.is::<Halted>() => panic::resume_unwind(payload),
            Err(payload) => sched.halt(panic_message(&*payload)),
        },
    }
}
