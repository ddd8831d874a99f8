//! Interrupt context on a hosted target.
//!
//! A handler runs on whatever thread raised it, inside [`isr`]. While any
//! handler is running the global interrupt mask is held, so a task that enters
//! [`free`] can never observe a handler halfway through, and vice versa.
//! Handlers do not nest.

use std::cell::Cell;
use std::sync::{Mutex, MutexGuard};
use std::thread;

use once_cell::sync::Lazy;

static IRQ_MASK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
    static IN_ISR: Cell<bool> = const { Cell::new(false) };
    static YIELD_PENDING: Cell<bool> = const { Cell::new(false) };
}

struct MaskGuard {
    _lock: Option<MutexGuard<'static, ()>>,
}

impl MaskGuard {
    fn enter() -> Self {
        let outer = DEPTH.with(|d| {
            let depth = d.get();
            d.set(depth + 1);
            depth == 0
        });
        let lock = outer.then(|| {
            // A panic inside a critical section poisons the mask; the data is ()
            // so the lock is still usable.
            IRQ_MASK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        });
        Self { _lock: lock }
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Marks the current thread as running a handler until dropped, unwinding included.
struct HandlerGuard;

impl HandlerGuard {
    fn enter() -> Self {
        IN_ISR.with(|c| c.set(true));
        Self
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        IN_ISR.with(|c| c.set(false));
    }
}

/// Run `f` with interrupts masked. Re-entrant on the same thread.
pub fn free<R>(f: impl FnOnce() -> R) -> R {
    let _mask = MaskGuard::enter();
    f()
}

/// Run `f` as an interrupt handler.
///
/// A reschedule requested by the handler (see [`request_yield`]) is honoured
/// once the mask is released, before returning to the interrupted code.
pub fn isr<R>(f: impl FnOnce() -> R) -> R {
    let result = {
        let _mask = MaskGuard::enter();
        let _handler = HandlerGuard::enter();
        f()
    };
    if YIELD_PENDING.with(|c| c.replace(false)) {
        thread::yield_now();
    }
    result
}

pub fn in_interrupt() -> bool {
    IN_ISR.with(Cell::get)
}

/// Ask for a context switch on handler exit: a higher priority task was woken.
pub fn request_yield() {
    YIELD_PENDING.with(|c| c.set(true));
}
