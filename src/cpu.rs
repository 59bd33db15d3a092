//! Hart identity for the hosted kernel core.
//!
//! One OS thread models one hart. A thread registers which hart it is with
//! [`set_hart`]; threads sharing the same lock must model distinct harts,
//! exactly as two physical cores never share a CPU id.
//!
//! `push_off`/`pop_off` are the interrupt-disable brackets of a real
//! kernel, reduced to what still matters on a host: a nesting depth that
//! pins the hart identity for the duration of a critical section. Reading
//! the hart id outside such a bracket would be meaningless in the real
//! kernel (the thread could migrate mid-read), so [`cpu_id`] insists on it.

use std::cell::Cell;

use crate::consts::NCPU;

thread_local! {
    static HART: Cell<usize> = Cell::new(0);
    static NOFF: Cell<u32> = Cell::new(0);
}

/// Register the calling thread as hart `id`.
pub fn set_hart(id: usize) {
    if id >= NCPU {
        panic!("set_hart: hart {} out of range", id);
    }
    HART.with(|h| h.set(id));
}

/// Enter a no-preemption section. Nests.
pub fn push_off() {
    NOFF.with(|n| n.set(n.get() + 1));
}

/// Leave a no-preemption section.
pub fn pop_off() {
    NOFF.with(|n| {
        if n.get() == 0 {
            panic!("pop_off");
        }
        n.set(n.get() - 1);
    });
}

/// Id of the hart this thread models.
///
/// Only meaningful between `push_off` and `pop_off`; panics otherwise.
pub fn cpu_id() -> usize {
    NOFF.with(|n| {
        if n.get() == 0 {
            panic!("cpu_id: preemption not disabled");
        }
    });
    HART.with(|h| h.get())
}
