//! Atomic primitives used by the state machine, routed through loom's shadow
//! atomics under `cfg(loom)` so the interleavings in [`crate::mutex`] can be
//! exhaustively model-checked instead of merely exercised by a handful of
//! threads. Mirrors the same `cfg(loom)` indirection used by the `vasi-sync`
//! crate elsewhere in this source tree.

#[cfg(not(loom))]
pub use std::sync::atomic::{AtomicPtr, Ordering};

#[cfg(loom)]
pub use loom::sync::atomic::{AtomicPtr, Ordering};
