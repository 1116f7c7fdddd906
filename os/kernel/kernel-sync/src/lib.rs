//! # Kernel synchronization primitives
//!
//! Only what the DMA layer needs from interrupt or atomic context:
//!
//! - [`SpinLock`]: a busy-waiting lock that never sleeps, for short critical
//!   sections such as free-list manipulation.
//! - [`PublishOnce`]: a cell written at most once and read lock-free afterwards,
//!   for per-device state fixed at attach time.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod publish_once;
mod spin_lock;

pub use publish_once::PublishOnce;
pub use spin_lock::{SpinLock, SpinLockGuard};
