//! The single atomic word a [`crate::SkinnyMutex`] is made of.
//!
//! The word never holds more than a bare pointer. Two of its possible values
//! are not real allocations at all: `NULL` (the all-zero bit pattern) means
//! unlocked, and [`held_nofat_sentinel`] (the address of a library-private
//! byte that is never boxed, so no [`FatState`] allocation could ever land
//! there) means locked-with-no-waiters. Any other value is read as a pointer
//! to a heap-allocated [`FatState`].

use crate::fat::FatState;
use crate::sync::{AtomicPtr, Ordering};
use std::ptr;

/// Address of this byte doubles as the `HELD_NOFAT` sentinel. It is never
/// boxed, so its address can never coincide with a live `FatState` pointer.
static HELD_NOFAT_BYTE: u8 = 0;

fn held_nofat_sentinel() -> *mut FatState {
    (&HELD_NOFAT_BYTE as *const u8).cast_mut().cast()
}

/// A decoded view of the word. See the module docs for what each variant
/// means on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WordState {
    /// Unlocked, no fat state attached.
    Null,
    /// Locked, no other thread has ever contended for this epoch.
    HeldNoFat,
    /// Fat state attached; its own fields say whether the mutex is held.
    Fat(*mut FatState),
}

impl WordState {
    fn encode(self) -> *mut FatState {
        match self {
            WordState::Null => ptr::null_mut(),
            WordState::HeldNoFat => held_nofat_sentinel(),
            WordState::Fat(p) => p,
        }
    }

    fn decode(raw: *mut FatState) -> Self {
        if raw.is_null() {
            WordState::Null
        } else if raw == held_nofat_sentinel() {
            WordState::HeldNoFat
        } else {
            WordState::Fat(raw)
        }
    }
}

/// The mutex's single pointer-sized cell.
pub struct Word(AtomicPtr<FatState>);

impl Word {
    pub const fn new() -> Self {
        Word(AtomicPtr::new(ptr::null_mut()))
    }

    pub fn load(&self, order: Ordering) -> WordState {
        WordState::decode(self.0.load(order))
    }

    /// Compare-and-swap phrased in terms of decoded states. `current` must be
    /// an exact value previously observed via [`Word::load`] (or another CAS
    /// result) — this is a thin wrapper, not a retry loop.
    pub fn compare_exchange(
        &self,
        current: WordState,
        new: WordState,
        success: Ordering,
        failure: Ordering,
    ) -> Result<WordState, WordState> {
        self.0
            .compare_exchange(current.encode(), new.encode(), success, failure)
            .map(WordState::decode)
            .map_err(WordState::decode)
    }
}


/// Exhaustive interleaving check for the word's own CAS transitions,
/// deliberately scoped to exclude `FatState` — its slow path makes real
/// blocking `libc` calls that `loom` cannot interleave, so only the
/// lock-free word itself is model-checked here. Grounded on the sibling
/// `vasi-sync` crate's own `loom`-gated test modules.
#[cfg(loom)]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn two_racing_attaches_only_one_wins() {
        loom::model(|| {
            let word = Arc::new(Word::new());
            let word2 = Arc::clone(&word);

            let t = thread::spawn(move || {
                word2.compare_exchange(
                    WordState::Null,
                    WordState::HeldNoFat,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
            });

            let main_result = word.compare_exchange(
                WordState::Null,
                WordState::HeldNoFat,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            let worker_result = t.join().unwrap();

            let wins = [main_result, worker_result]
                .into_iter()
                .filter(|r| r.is_ok())
                .count();
            assert_eq!(wins, 1, "exactly one racing attach must win");
            assert_eq!(word.load(Ordering::Acquire), WordState::HeldNoFat);
        });
    }
}
