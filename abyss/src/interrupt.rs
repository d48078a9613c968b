//! Interrupt
//!
//! A uniprocessor kernel gets mutual exclusion by turning interrupts off: while
//! they are off nothing can preempt the running thread. [`InterruptGate`] is
//! the CPU's interrupt enable flag plus the little state the kernel keeps about
//! the interrupt currently being handled.
use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Enumeration for representing interrupt state
#[derive(PartialEq, Eq, Debug, Clone, Copy, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum InterruptState {
    /// Interrupt is off.
    Off = 0,
    /// Interrupt is on.
    On = 1,
}

bitflags! {
    /// Per-CPU flags tracked next to the interrupt state.
    pub struct CpuFlags: u8 {
        /// The CPU is executing an external interrupt handler.
        const IN_INTERRUPT = 1 << 0;
        /// The running thread yields when the current handler returns.
        const YIELD_ON_RETURN = 1 << 1;
    }
}

/// The interrupt enable flag of the (single) CPU.
pub struct InterruptGate {
    state: AtomicU8,
    flags: AtomicU8,
}

impl InterruptGate {
    /// Create a gate with interrupts off, as the CPU is at reset.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(InterruptState::Off as u8),
            flags: AtomicU8::new(0),
        }
    }

    /// Read the current interrupt state.
    pub fn current(&self) -> InterruptState {
        let raw = self.state.load(Ordering::SeqCst);
        InterruptState::try_from(raw)
            .unwrap_or_else(|_| panic!("corrupted interrupt state: {raw:#x}"))
    }

    /// Set the interrupt state and return the previous one.
    pub fn set(&self, state: InterruptState) -> InterruptState {
        let raw = self.state.swap(state.into(), Ordering::SeqCst);
        InterruptState::try_from(raw)
            .unwrap_or_else(|_| panic!("corrupted interrupt state: {raw:#x}"))
    }

    /// Turn interrupts on, returning the previous state.
    ///
    /// Enabling interrupts from inside a handler is a bug.
    pub fn enable(&self) -> InterruptState {
        assert!(
            !self.in_interrupt(),
            "interrupts enabled inside an interrupt handler"
        );
        self.set(InterruptState::On)
    }

    /// Turn interrupts off, returning the previous state.
    pub fn disable(&self) -> InterruptState {
        self.set(InterruptState::Off)
    }

    fn flags(&self) -> CpuFlags {
        CpuFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Returns true while an external interrupt handler is running.
    pub fn in_interrupt(&self) -> bool {
        self.flags().contains(CpuFlags::IN_INTERRUPT)
    }

    /// Mark the start of an external interrupt handler.
    ///
    /// Interrupts must already be off and handlers do not nest.
    pub fn enter_interrupt(&self) {
        assert_eq!(self.current(), InterruptState::Off);
        let prev = self
            .flags
            .fetch_or(CpuFlags::IN_INTERRUPT.bits(), Ordering::SeqCst);
        assert!(
            !CpuFlags::from_bits_truncate(prev).contains(CpuFlags::IN_INTERRUPT),
            "nested external interrupt"
        );
    }

    /// Mark the end of an external interrupt handler, returning whether the
    /// handler asked the interrupted thread to yield.
    pub fn leave_interrupt(&self) -> bool {
        let mask = CpuFlags::IN_INTERRUPT | CpuFlags::YIELD_ON_RETURN;
        let prev = self.flags.fetch_and(!mask.bits(), Ordering::SeqCst);
        CpuFlags::from_bits_truncate(prev).contains(CpuFlags::YIELD_ON_RETURN)
    }

    /// Ask the interrupted thread to yield once the current handler returns.
    pub fn request_yield_on_return(&self) {
        assert!(
            self.in_interrupt(),
            "yield_on_return outside interrupt context"
        );
        self.flags
            .fetch_or(CpuFlags::YIELD_ON_RETURN.bits(), Ordering::SeqCst);
    }
}

impl Default for InterruptGate {
    fn default() -> Self {
        Self::new()
    }
}

/// An RAII implementation of an interrupt disable. When this structure is
/// dropped (falls out of scope), the interrupt will be recovered into state on
/// creation of this struct. Therefore, you must drop guards in reverse of
/// creation order.
///
/// This structure is created by the [`new`].
///
/// [`new`]: InterruptGuard::new
pub struct InterruptGuard<'a> {
    gate: &'a InterruptGate,
    state: InterruptState,
}

impl<'a> InterruptGuard<'a> {
    /// Create a new InterruptGuard.
    pub fn new(gate: &'a InterruptGate) -> Self {
        let state = gate.disable();
        Self { gate, state }
    }

    /// The interrupt state that will be restored on drop.
    pub fn saved(&self) -> InterruptState {
        self.state
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        self.gate.set(self.state);
    }
}

/// Data that is only ever touched with interrupts off.
///
/// This is the uniprocessor counterpart of a lock: [`with`] turns interrupts
/// off for the duration of the closure, so no other thread can observe the data
/// half-updated. Re-entering the same cell from inside the closure is a bug and
/// panics.
///
/// The closure must not block or switch threads.
///
/// [`with`]: IntrCell::with
pub struct IntrCell<T> {
    busy: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: `busy` plus disabled interrupts give exclusive access to `data`.
unsafe impl<T: Send> Send for IntrCell<T> {}
unsafe impl<T: Send> Sync for IntrCell<T> {}

struct Borrow<'a>(&'a AtomicBool);

impl Drop for Borrow<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T> IntrCell<T> {
    /// Wrap `data`.
    pub const fn new(data: T) -> Self {
        Self {
            busy: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Run `f` on the data with interrupts disabled on `gate`.
    pub fn with<R>(&self, gate: &InterruptGate, f: impl FnOnce(&mut T) -> R) -> R {
        let _guard = InterruptGuard::new(gate);
        assert!(
            !self.busy.swap(true, Ordering::Acquire),
            "IntrCell borrowed twice"
        );
        let _borrow = Borrow(&self.busy);
        // SAFETY: `busy` was clear, so this is the only reference.
        f(unsafe { &mut *self.data.get() })
    }

    /// Consumes this cell, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}
