// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

//! A mutual-exclusion primitive that costs one pointer-sized word when idle.
//!
//! Most mutexes in a large program spend almost all of their life unlocked
//! and uncontended, yet a conventional OS mutex reserves room for a wait
//! queue, an owner field, and assorted bookkeeping up front. [`SkinnyMutex`]
//! instead stores only a single atomic pointer. The first time a second
//! thread actually contends for the lock, the mutex allocates a heap-backed
//! control block holding a real host mutex and condition variable, and
//! routes through it until contention subsides, at which point the
//! allocation is freed and the mutex shrinks back to its idle, one-word
//! footprint.
//!
//! ```
//! use skinny_mutex::SkinnyMutex;
//!
//! static COUNTER_LOCK: SkinnyMutex = SkinnyMutex::const_new();
//!
//! COUNTER_LOCK.lock().unwrap();
//! // ... touch data protected by COUNTER_LOCK ...
//! COUNTER_LOCK.unlock().unwrap();
//! ```
//!
//! See [`condvar`] for the condition-variable bridge.

mod cancel;
pub mod condvar;
mod error;
mod fat;
mod mutex;
mod sync;
mod word;

pub use condvar::Condvar;
pub use error::{Error, Result};
pub use mutex::SkinnyMutex;

/// Number of heap-backed fat states currently allocated but not yet freed.
///
/// Debug-only diagnostic: every contended mutex that quiesces back down to
/// `NULL` should eventually bring this back to zero. Always `0` in release
/// builds, where the counter isn't tracked at all.
#[cfg(debug_assertions)]
pub fn debug_live_fat_states() -> usize {
    fat::live_allocations()
}

// The whole point of this crate: the public handle must never grow past one
// pointer-sized word, no matter what gets added behind the fat pointer.
static_assertions::assert_eq_size!(SkinnyMutex, usize);
