//! Interrupt management.
//!
//! External interrupts arrive through [`raise`]. The handler runs with
//! interrupts off and must not block; if it wants the interrupted thread to
//! give up the CPU it calls [`yield_on_return`], and the yield happens once
//! the handler is done.
use crate::thread::scheduler::scheduler;
use abyss::interrupt::{InterruptGuard, InterruptState};
use alloc::sync::Arc;
use spin_lock::SpinLock;

/// Vector of the periodic timer interrupt.
pub const TIMER_VECTOR: usize = 0x20;

/// First vector of the external interrupts.
const FIRST_VECTOR: usize = 0x20;

/// Number of external interrupt vectors.
pub(crate) const NR_VECTORS: usize = 0x100 - FIRST_VECTOR;

pub(crate) type Handler = Arc<dyn Fn() + Send + Sync>;

/// Interrupt handler table of a machine.
pub(crate) struct Handlers([SpinLock<Option<Handler>>; NR_VECTORS]);

impl Handlers {
    pub(crate) fn new() -> Self {
        const INIT: SpinLock<Option<Handler>> = SpinLock::new(None);
        Self([INIT; NR_VECTORS])
    }

    fn get(&self, vec: usize) -> Option<Handler> {
        vec.checked_sub(FIRST_VECTOR)
            .and_then(|idx| self.0.get(idx))
            .and_then(|slot| slot.lock().clone())
    }
}

/// Register interrupt handler
pub fn register(vec: usize, handler: impl Fn() + Send + Sync + 'static) {
    let slot = vec
        .checked_sub(FIRST_VECTOR)
        .and_then(|idx| scheduler().handlers.0.get(idx))
        .unwrap_or_else(|| panic!("Invalid interrupt vector #{:#x}", vec));
    *slot.lock() = Some(Arc::new(handler));
}

/// Deliver external interrupt `vec` to the running thread.
pub fn raise(vec: usize) {
    let sched = scheduler();
    let handler = sched
        .handlers
        .get(vec)
        .unwrap_or_else(|| panic!("Unknown interrupt #{:#x}", vec));
    assert_eq!(
        sched.gate.current(),
        InterruptState::On,
        "interrupt #{:#x} raised while interrupts are off",
        vec
    );
    let _guard = InterruptGuard::new(&sched.gate);
    sched.gate.enter_interrupt();
    handler();
    if sched.gate.leave_interrupt() {
        crate::thread::yield_now();
    }
}

/// Disable interrupts until the returned guard is dropped.
pub fn disable() -> InterruptGuard<'static> {
    InterruptGuard::new(&scheduler().gate)
}

/// Read the current interrupt state.
pub fn state() -> InterruptState {
    scheduler().gate.current()
}

/// Set the interrupt state, returning the previous one.
pub fn set_state(state: InterruptState) -> InterruptState {
    scheduler().gate.set(state)
}

/// Turn interrupts on, returning the previous state.
pub fn enable() -> InterruptState {
    scheduler().gate.enable()
}

/// Returns true while an external interrupt handler is running.
pub fn in_interrupt() -> bool {
    scheduler().gate.in_interrupt()
}

/// Make the interrupted thread yield when the running handler returns.
///
/// May only be called from an interrupt handler.
pub fn yield_on_return() {
    scheduler().gate.request_yield_on_return();
}
