//! The memory core of a teaching kernel, hosted: a sharded disk-block
//! buffer cache, a buddy allocator, and a per-CPU page allocator.
//!
//! Everything runs on an ordinary host for testing. One OS thread models
//! one hart (see [`cpu`]); raw memory regions are supplied by the caller.
//! Invariant violations halt with a panic, resource exhaustion is a null
//! return, exactly as in the kernel these pieces come from.

#![warn(rust_2018_idioms)]

pub mod bio;
pub mod consts;
pub mod cpu;
pub mod mm;
pub mod sleeplock;
pub mod spinlock;
