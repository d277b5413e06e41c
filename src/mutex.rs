//! The single-word state machine: `init`/`destroy` (via construction/`Drop`),
//! `lock`, `trylock`, `unlock`.

use crate::cancel::DeferCancellation;
use crate::error::Result;
use crate::fat::FatState;
use crate::sync::Ordering;
use crate::word::{Word, WordState};
use crate::Error;

/// A mutual-exclusion lock that costs one pointer-sized word while
/// uncontended.
///
/// See the [crate-level docs](crate) for the attach/detach design. A
/// `SkinnyMutex` does not wrap a value the way [`std::sync::Mutex`] does —
/// like the host `pthread_mutex_t` it is built from, it only guards access
/// to data the caller associates with it out of band.
pub struct SkinnyMutex {
    word: Word,
}

// SAFETY: every field reachable from the word is internally synchronized,
// either by the word's own atomics or by a fat state's `inner`.
unsafe impl Send for SkinnyMutex {}
unsafe impl Sync for SkinnyMutex {}

impl Default for SkinnyMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl SkinnyMutex {
    /// Builds an unlocked mutex. Usable in a `const` context, so a
    /// file-scope `static SKINNY: SkinnyMutex = SkinnyMutex::const_new();`
    /// needs no runtime initializer — the all-zero word it starts from is
    /// already a valid unlocked mutex.
    pub const fn const_new() -> Self {
        Self { word: Word::new() }
    }

    pub fn new() -> Self {
        Self::const_new()
    }

    pub(crate) fn word(&self) -> &Word {
        &self.word
    }

    /// Acquires the mutex, blocking the calling thread if necessary.
    ///
    /// Not a cancellation point: a cancellation request delivered while this
    /// call is blocked is deferred until the call returns.
    ///
    /// The only failure is running out of memory while attaching fat state
    /// to a newly-contended mutex; the mutex's state is unchanged on
    /// failure.
    pub fn lock(&self) -> Result<()> {
        // Defer cancellation for the whole call, even the fast path: a
        // cancellation delivered between the fast-path CAS succeeding and
        // this function returning must not look any different to the
        // caller than one delivered a moment earlier or later.
        let _defer = DeferCancellation::new();
        loop {
            match self.word.compare_exchange(
                WordState::Null,
                WordState::HeldNoFat,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(WordState::Null) => continue,
                Err(WordState::HeldNoFat) => {
                    if self.attach_and_wait()? {
                        return Ok(());
                    }
                    // CAS lost the attach race; word changed, restart.
                }
                Err(WordState::Fat(ptr)) => {
                    // SAFETY: `ptr` was just read from the word. A fat
                    // pointer is only ever cleared from the word by an
                    // unlock that holds `inner` first (see `unlock`'s
                    // detach path), so any thread that is about to take
                    // `inner` here is racing that detach under the same
                    // rule the detach path documents: taking `inner` and
                    // finding the fat state has already been vacated by the
                    // word (checked below) means we must restart instead of
                    // touching now-stale fields.
                    let fat = unsafe { &*ptr };
                    let guard = fat.lock_inner();
                    if self.word.load(Ordering::Acquire) != WordState::Fat(ptr) {
                        drop(guard);
                        continue;
                    }
                    guard.inc_waiters();
                    guard.wait_while_held();
                    guard.set_held(true);
                    guard.dec_waiters();
                    return Ok(());
                }
            }
        }
    }

    /// Attempts to transition `HELD_NOFAT` into a freshly attached fat
    /// state and then waits on it as the first waiter. Returns `Ok(true)`
    /// once ownership has been handed to the caller, `Ok(false)` if the CAS
    /// lost the race and the caller should reload the word and retry.
    fn attach_and_wait(&self) -> Result<bool> {
        let raw = FatState::allocate(true, 1)?;
        match self.word.compare_exchange(
            WordState::HeldNoFat,
            WordState::Fat(raw),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                log::trace!("lock attached a fat state to a contended mutex");
                // SAFETY: we just installed `raw` into the word; it is
                // reachable and not yet shared with any other waiter.
                let fat = unsafe { &*raw };
                let guard = fat.lock_inner();
                guard.wait_while_held();
                guard.set_held(true);
                guard.dec_waiters();
                Ok(true)
            }
            Err(_) => {
                // SAFETY: `raw` was never published to the word, so no
                // other thread can have observed or locked it.
                unsafe { FatState::free(raw) };
                Ok(false)
            }
        }
    }

    /// Attempts to acquire the mutex without blocking.
    ///
    /// Never allocates and never blocks beyond the bounded time it takes to
    /// lock a fat state's `inner`.
    pub fn trylock(&self) -> Result<()> {
        match self.word.compare_exchange(
            WordState::Null,
            WordState::HeldNoFat,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => return Ok(()),
            Err(_) => {}
        }
        match self.word.load(Ordering::Acquire) {
            WordState::Null | WordState::HeldNoFat => Err(Error::Busy),
            WordState::Fat(ptr) => {
                // SAFETY: see the comment in `lock`'s fat-pointer arm.
                let fat = unsafe { &*ptr };
                let guard = fat.lock_inner();
                if self.word.load(Ordering::Acquire) != WordState::Fat(ptr) {
                    return Err(Error::Busy);
                }
                if guard.held() {
                    Err(Error::Busy)
                } else {
                    guard.set_held(true);
                    Ok(())
                }
            }
        }
    }

    /// Releases the mutex. Fails with [`Error::NotHeld`] if the calling
    /// thread does not currently hold it — callers are trusted on this
    /// point the same way `pthread_mutex_unlock` trusts its caller; this
    /// crate does not track ownership by thread id.
    pub fn unlock(&self) -> Result<()> {
        match self.word.compare_exchange(
            WordState::HeldNoFat,
            WordState::Null,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => return Ok(()),
            Err(_) => {}
        }
        match self.word.load(Ordering::Acquire) {
            WordState::Null => Err(Error::NotHeld),
            WordState::HeldNoFat => {
                // Lost a race against a concurrent attach; the word is no
                // longer `HELD_NOFAT` by the time we looked again, so fall
                // through to the general fat-pointer handling by reloading.
                self.unlock_fat_or_retry()
            }
            WordState::Fat(_) => self.unlock_fat_or_retry(),
        }
    }

    fn unlock_fat_or_retry(&self) -> Result<()> {
        loop {
            match self.word.load(Ordering::Acquire) {
                WordState::Null => return Err(Error::NotHeld),
                WordState::HeldNoFat => {
                    match self.word.compare_exchange(
                        WordState::HeldNoFat,
                        WordState::Null,
                        Ordering::Release,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Ok(()),
                        Err(_) => continue,
                    }
                }
                WordState::Fat(ptr) => {
                    // SAFETY: see the comment in `lock`'s fat-pointer arm;
                    // the detach CAS below is what makes this sound.
                    let fat = unsafe { &*ptr };
                    let guard = fat.lock_inner();
                    if self.word.load(Ordering::Acquire) != WordState::Fat(ptr) {
                        drop(guard);
                        continue;
                    }
                    if !guard.held() {
                        return Err(Error::NotHeld);
                    }
                    guard.set_held(false);
                    if guard.waiters() > 0 {
                        guard.signal_handoff();
                        return Ok(());
                    }
                    // No waiters: attempt to detach while still holding
                    // `inner`, per the documented rule that a contender
                    // always takes `inner` before registering as a waiter.
                    match self.word.compare_exchange(
                        WordState::Fat(ptr),
                        WordState::Null,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            log::trace!("unlock detached and freed an idle fat state");
                            drop(guard);
                            // SAFETY: the word no longer points at `ptr`, so
                            // no new thread can observe it; any thread that
                            // already observed it before this CAS will, on
                            // taking `inner`, find the word changed and
                            // restart rather than touch the freed state.
                            unsafe { FatState::free(ptr) };
                            return Ok(());
                        }
                        Err(_) => {
                            // A new contender raced in and reattached
                            // before we could detach; the fat state stays
                            // alive and is now that contender's problem.
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

impl Drop for SkinnyMutex {
    fn drop(&mut self) {
        match self.word.load(Ordering::Acquire) {
            WordState::Null => {}
            state => {
                debug_assert!(
                    false,
                    "dropping a SkinnyMutex that is still locked or contended"
                );
                // In release builds we cannot safely free a fat state that
                // some other thread might still be blocked on, so we leak
                // it rather than risk a use-after-free; see DESIGN.md.
                let _ = state;
            }
        }
    }
}
