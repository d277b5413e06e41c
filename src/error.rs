use std::fmt;

/// The only user-visible failure modes of a [`crate::SkinnyMutex`] operation.
///
/// Anything the host threading library reports that doesn't map to one of
/// these is a programming error or a broken host library, not something a
/// caller can meaningfully recover from; see [`abort_on_fatal_host_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// `trylock` found the mutex already held.
    Busy,
    /// `unlock` was called on a mutex the caller doesn't hold.
    NotHeld,
    /// `cond_timedwait` reached its deadline before being signaled.
    TimedOut,
    /// The allocator could not produce a new fat-state control block.
    OutOfMemory,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Busy => "mutex is locked by another thread",
            Error::NotHeld => "mutex is not held by the calling thread",
            Error::TimedOut => "timed wait deadline elapsed",
            Error::OutOfMemory => "failed to allocate fat state for a contended mutex",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

pub type Result<T = ()> = std::result::Result<T, Error>;

/// Treats a nonzero return code from a `libc::pthread_*` call as fatal.
///
/// Every `pthread_*` call this crate makes either cannot fail under the
/// arguments we pass (e.g. `pthread_mutex_lock` on a mutex we initialized
/// ourselves with default attributes) or has its one documented failure mode
/// handled explicitly by the caller before this function would ever see it
/// (e.g. `ETIMEDOUT` from `pthread_cond_timedwait`). Anything else reaching
/// here means the host threading library is in a state this crate's state
/// machine was not designed to reason about, so it logs for context and
/// aborts rather than silently corrupting the mutex.
pub(crate) fn abort_on_fatal_host_error(rc: i32, what: &'static str) {
    if rc != 0 {
        log::warn!("host threading call {what} returned unexpected code {rc}; aborting");
        panic!("fatal error from host threading library in {what}: {rc}");
    }
}
