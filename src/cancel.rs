//! Bridges between POSIX thread cancellation and the fat-state bookkeeping
//! in [`crate::fat`].
//!
//! [`SkinnyMutex::lock`](crate::SkinnyMutex::lock) is not a cancellation
//! point: a thread blocked on it must not simply vanish mid-handoff and
//! leave `held`/`waiters` inconsistent for whoever it was contending with.
//! [`DeferCancellation`] covers that by disabling cancellation for the
//! duration of the blocking call.
//!
//! [`Condvar::wait`](crate::condvar::Condvar::wait) and
//! [`Condvar::timedwait`](crate::condvar::Condvar::timedwait) are the
//! opposite: they must stay real cancellation points, but a cancelled waiter
//! still has to leave the mutex held on the way out, the same way a normal
//! return from `pthread_cond_wait` would. That half is handled in
//! [`crate::condvar`] itself, through a small C shim that runs the reacquire
//! bookkeeping as a POSIX cancellation cleanup handler (a plain function
//! call the host pthread implementation makes before any unwinding starts),
//! rather than through Rust `Drop` glue racing a foreign unwind.

use std::ptr;

use crate::error::abort_on_fatal_host_error;

// The `libc` crate does not bind `pthread_setcancelstate`/`PTHREAD_CANCEL_*`
// for this target, even though the host pthread implementation provides
// them. Declare them directly; they link against the same libc the rest of
// the `libc` crate already links against.
mod ffi {
    pub const PTHREAD_CANCEL_ENABLE: libc::c_int = 0;
    pub const PTHREAD_CANCEL_DISABLE: libc::c_int = 1;

    extern "C" {
        pub fn pthread_setcancelstate(state: libc::c_int, oldstate: *mut libc::c_int) -> libc::c_int;
    }
}

/// Disables thread cancellation for its lifetime, restoring whatever state
/// the calling thread had on construction once dropped.
pub struct DeferCancellation {
    old_state: i32,
}

impl DeferCancellation {
    pub fn new() -> Self {
        let mut old_state = 0;
        // SAFETY: `&mut old_state` is a valid out-param for the duration of
        // this call.
        let rc =
            unsafe { ffi::pthread_setcancelstate(ffi::PTHREAD_CANCEL_DISABLE, &mut old_state) };
        abort_on_fatal_host_error(rc, "pthread_setcancelstate(disable)");
        Self { old_state }
    }
}

impl Drop for DeferCancellation {
    fn drop(&mut self) {
        // SAFETY: `old_state` was filled in by a prior successful
        // `pthread_setcancelstate` call and is one of its valid enable
        // values.
        let rc = unsafe { ffi::pthread_setcancelstate(self.old_state, ptr::null_mut()) };
        abort_on_fatal_host_error(rc, "pthread_setcancelstate(restore)");
    }
}
