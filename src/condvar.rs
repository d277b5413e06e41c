//! `cond_wait` / `cond_timedwait`: bridges a caller-supplied host condition
//! variable to a [`SkinnyMutex`], atomically releasing the mutex and
//! sleeping, then reacquiring on wakeup, timeout, or cancellation.

use std::os::raw::c_void;
use std::ptr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::abort_on_fatal_host_error;
use crate::fat::{FatState, InnerGuard};
use crate::sync::Ordering;
use crate::word::WordState;
use crate::{Error, Result, SkinnyMutex};

/// Declared `"C-unwind"` rather than plain `"C"`: a `pthread_cancel`
/// delivered while blocked inside one of these calls forces an unwind back
/// through this call site, and the compiler needs to know that to emit a
/// landing pad here instead of assuming the call can never unwind.
///
/// The reacquire bookkeeping itself does not depend on that unwind, though —
/// see [`cond_wait_cleanup`], which the shim runs as a plain POSIX
/// cancellation cleanup handler before any unwinding starts.
extern "C-unwind" {
    fn skinny_cond_wait_shim(
        cond: *mut libc::pthread_cond_t,
        mutex: *mut libc::pthread_mutex_t,
        cleanup: extern "C" fn(*mut c_void),
        arg: *mut c_void,
    ) -> libc::c_int;

    fn skinny_cond_timedwait_shim(
        cond: *mut libc::pthread_cond_t,
        mutex: *mut libc::pthread_mutex_t,
        abstime: *const libc::timespec,
        cleanup: extern "C" fn(*mut c_void),
        arg: *mut c_void,
    ) -> libc::c_int;
}

/// Run by the host pthread implementation as an ordinary function-pointer
/// call from inside `skinny_cond_wait_shim`/`skinny_cond_timedwait_shim`'s
/// `pthread_cleanup_push`, if (and only if) the waiting thread is cancelled.
///
/// POSIX guarantees the wait's mutex argument (here, `fat`'s `inner`) is
/// already relocked before any cleanup handler runs, so marking the mutex
/// held again is all a cancelled waiter leaves for whoever unwinds through
/// it next — the same state a normal return from `wait`/`timedwait` leaves.
extern "C" fn cond_wait_cleanup(arg: *mut c_void) {
    // SAFETY: `arg` is the `*const FatState` passed in by `wait`/`timedwait`
    // below, cast back to its original type; `inner` is locked per the
    // contract documented above.
    let fat = unsafe { &*arg.cast::<FatState>() };
    let guard = unsafe { InnerGuard::already_locked(fat) };
    guard.set_held(true);
}

/// A thin wrapper around a host `pthread_cond_t`.
///
/// Unlike [`SkinnyMutex`], a `Condvar` is ordinary, always-fat state: the
/// one-word budget this crate is built around applies to the mutex, not to
/// every synchronization primitive built on top of it.
pub struct Condvar {
    raw: std::cell::UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: all access to `raw` goes through libc calls that are themselves
// safe to call concurrently per POSIX; the crate never reads the value
// through any other path.
unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    pub fn new() -> Self {
        let mut raw = libc::PTHREAD_COND_INITIALIZER;
        // SAFETY: `&mut raw` is freshly stack-allocated and not yet shared.
        let rc = unsafe { libc::pthread_cond_init(&mut raw, ptr::null()) };
        abort_on_fatal_host_error(rc, "pthread_cond_init");
        Self {
            raw: std::cell::UnsafeCell::new(raw),
        }
    }

    fn raw_ptr(&self) -> *mut libc::pthread_cond_t {
        self.raw.get()
    }

    /// Wakes one thread blocked in [`Condvar::wait`] or
    /// [`Condvar::timedwait`] on this condition variable.
    pub fn signal(&self) {
        // SAFETY: `raw` is a valid, initialized condition variable for the
        // lifetime of `self`.
        let rc = unsafe { libc::pthread_cond_signal(self.raw_ptr()) };
        abort_on_fatal_host_error(rc, "pthread_cond_signal");
    }

    /// Wakes every thread blocked in [`Condvar::wait`] or
    /// [`Condvar::timedwait`] on this condition variable.
    pub fn broadcast(&self) {
        // SAFETY: as above.
        let rc = unsafe { libc::pthread_cond_broadcast(self.raw_ptr()) };
        abort_on_fatal_host_error(rc, "pthread_cond_broadcast");
    }

    /// Atomically releases `mutex` (which the caller must hold) and blocks
    /// on this condition variable until signaled, reacquiring `mutex`
    /// before returning.
    ///
    /// This is a cancellation point: a cancellation request delivered while
    /// blocked here tears the call down, but not before `mutex` has been
    /// put back in a held, consistent state for whatever cleanup handler
    /// runs next.
    pub fn wait(&self, mutex: &SkinnyMutex) -> Result<()> {
        let fat = ensure_fat(mutex)?;
        let guard = fat.lock_inner();
        guard.set_held(false);
        if guard.waiters() > 0 {
            guard.signal_handoff();
        }
        std::mem::forget(guard);
        // SAFETY: `inner` is currently locked (the `InnerGuard` above was
        // forgotten, not dropped, specifically to hand that lock to this
        // call without releasing it first); the shim atomically drops
        // `inner` and sleeps, relocking it before returning normally, before
        // running `cond_wait_cleanup` on cancellation, or both. `fat` outlives
        // the call because the caller holds the mutex through it.
        let rc = unsafe {
            skinny_cond_wait_shim(
                self.raw_ptr(),
                fat.inner_ptr(),
                cond_wait_cleanup,
                (fat as *const FatState).cast_mut().cast(),
            )
        };
        abort_on_fatal_host_error(rc, "pthread_cond_wait");
        // SAFETY: the host call above returned normally, so `inner` is
        // locked again.
        let guard = unsafe { InnerGuard::already_locked(fat) };
        guard.wait_while_held();
        guard.set_held(true);
        Ok(())
    }

    /// As [`Condvar::wait`], but returns [`Error::TimedOut`] if `deadline`
    /// (an absolute point in wall-clock time) passes before being signaled.
    pub fn timedwait(&self, mutex: &SkinnyMutex, deadline: SystemTime) -> Result<()> {
        let fat = ensure_fat(mutex)?;
        let guard = fat.lock_inner();
        guard.set_held(false);
        if guard.waiters() > 0 {
            guard.signal_handoff();
        }
        let ts = to_timespec(deadline);
        std::mem::forget(guard);
        // SAFETY: see `wait`; the timed variant carries the same
        // relock-before-return/cleanup guarantee.
        let rc = unsafe {
            skinny_cond_timedwait_shim(
                self.raw_ptr(),
                fat.inner_ptr(),
                &ts,
                cond_wait_cleanup,
                (fat as *const FatState).cast_mut().cast(),
            )
        };
        if rc != 0 && rc != libc::ETIMEDOUT {
            abort_on_fatal_host_error(rc, "pthread_cond_timedwait");
        }
        // SAFETY: both the signaled and the ETIMEDOUT return paths relock
        // `inner` before returning.
        let guard = unsafe { InnerGuard::already_locked(fat) };
        guard.wait_while_held();
        guard.set_held(true);
        if rc == libc::ETIMEDOUT {
            Err(Error::TimedOut)
        } else {
            Ok(())
        }
    }
}

impl Drop for Condvar {
    fn drop(&mut self) {
        // SAFETY: `raw` is a valid condition variable with no thread
        // blocked on it (a correct caller never drops a `Condvar` while it
        // is in use).
        let rc = unsafe { libc::pthread_cond_destroy(self.raw_ptr()) };
        abort_on_fatal_host_error(rc, "pthread_cond_destroy");
    }
}

/// Converts an absolute `SystemTime` deadline to the `timespec` form
/// `pthread_cond_timedwait` expects.
fn to_timespec(deadline: SystemTime) -> libc::timespec {
    let since_epoch = deadline
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    libc::timespec {
        tv_sec: since_epoch.as_secs() as libc::time_t,
        tv_nsec: since_epoch.subsec_nanos() as libc::c_long,
    }
}

/// Upgrades `mutex` to a fat state if it is currently `HELD_NOFAT`, per the
/// condition bridge's mandatory-upgrade rule: a caller-supplied condition
/// variable needs a stable host mutex to wait against, and only a fat
/// state's `inner` qualifies.
fn ensure_fat(mutex: &SkinnyMutex) -> Result<&FatState> {
    loop {
        match mutex.word().load(Ordering::Acquire) {
            WordState::Null => unreachable!(
                "cond_wait/cond_timedwait require the caller to already hold the mutex"
            ),
            WordState::Fat(ptr) => {
                // SAFETY: a fat pointer observed in the word stays valid
                // for as long as the caller holds the mutex through it,
                // which is a precondition of this function.
                return Ok(unsafe { &*ptr });
            }
            WordState::HeldNoFat => {
                let raw = FatState::allocate(true, 0)?;
                match mutex.word().compare_exchange(
                    WordState::HeldNoFat,
                    WordState::Fat(raw),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        log::trace!("cond_wait upgraded HELD_NOFAT to a fat state");
                        // SAFETY: just installed, not yet shared.
                        return Ok(unsafe { &*raw });
                    }
                    Err(_) => {
                        // No other thread can change `HELD_NOFAT` out from
                        // under its owner, so losing this race only
                        // happens if another thread raced the same
                        // upgrade; free our redundant allocation and
                        // retry, which will observe the winner's fat
                        // pointer.
                        unsafe { FatState::free(raw) };
                    }
                }
            }
        }
    }
}
