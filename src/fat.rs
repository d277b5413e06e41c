//! Heap-backed state a [`crate::SkinnyMutex`] attaches only once it is
//! actually contended.
//!
//! A [`FatState`] bundles a real host mutex (`inner`), a waiter count, a
//! `held` flag, and a host condition variable used purely for lock handoff
//! between the unlocker and whichever waiter it wakes. Every field other than
//! `inner` itself may only be touched while `inner` is locked; [`InnerGuard`]
//! is the only way to reach them, so that rule is enforced by the type rather
//! than by convention.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::UnsafeCell;
use std::ptr;
#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};

use crate::error::abort_on_fatal_host_error;

/// Debug-only counter of outstanding `FatState::allocate`/`free` pairs, so
/// an integration test can assert every attach eventually detaches instead
/// of only spot-checking a single mutex's word.
#[cfg(debug_assertions)]
static LIVE_ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

/// Number of `FatState` allocations made but not yet freed. Only tracked in
/// debug builds; zero cost (and always zero) otherwise.
#[cfg(debug_assertions)]
pub(crate) fn live_allocations() -> usize {
    LIVE_ALLOCATIONS.load(StdOrdering::SeqCst)
}

pub struct FatState {
    inner: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
    held: UnsafeCell<bool>,
    waiters: UnsafeCell<u32>,
}

// SAFETY: all access to the non-`inner` fields is mediated by `InnerGuard`,
// which requires holding `inner` (a real pthread mutex) first.
unsafe impl Send for FatState {}
unsafe impl Sync for FatState {}

impl FatState {
    /// Allocates a new fat state with the given initial `held`/`waiters`
    /// values. Returns `Error::OutOfMemory` rather than aborting the process,
    /// unlike `Box::new`, since a caller contending on an idle mutex is not
    /// in a good position to have the whole process torn down by an
    /// allocator failure.
    pub fn allocate(held: bool, waiters: u32) -> crate::Result<*mut FatState> {
        let layout = Layout::new::<FatState>();
        // SAFETY: `layout` is non-zero-sized.
        let raw = unsafe { alloc(layout) }.cast::<FatState>();
        if raw.is_null() {
            return Err(crate::Error::OutOfMemory);
        }
        // SAFETY: `raw` was just allocated with the layout of `FatState` and
        // is not yet aliased; `addr_of_mut!` lets us initialize fields
        // in place without materializing a `&mut FatState` over
        // not-yet-initialized memory.
        unsafe {
            let mutex_ptr = ptr::addr_of_mut!((*raw).inner).cast::<libc::pthread_mutex_t>();
            mutex_ptr.write(libc::PTHREAD_MUTEX_INITIALIZER);
            let rc = libc::pthread_mutex_init(mutex_ptr, ptr::null());
            abort_on_fatal_host_error(rc, "pthread_mutex_init");

            let cond_ptr = ptr::addr_of_mut!((*raw).cond).cast::<libc::pthread_cond_t>();
            cond_ptr.write(libc::PTHREAD_COND_INITIALIZER);
            let rc = libc::pthread_cond_init(cond_ptr, ptr::null());
            abort_on_fatal_host_error(rc, "pthread_cond_init");

            ptr::addr_of_mut!((*raw).held).write(UnsafeCell::new(held));
            ptr::addr_of_mut!((*raw).waiters).write(UnsafeCell::new(waiters));
        }
        #[cfg(debug_assertions)]
        LIVE_ALLOCATIONS.fetch_add(1, StdOrdering::SeqCst);
        Ok(raw)
    }

    /// Destroys the host mutex and condition variable and frees the
    /// allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`FatState::allocate`], must not still be
    /// reachable through a mutex's word, and no other thread may hold
    /// (or be about to take) `inner`.
    pub unsafe fn free(ptr: *mut FatState) {
        // SAFETY: caller guarantees exclusive, valid access to `*ptr`.
        unsafe {
            let mutex_ptr = ptr::addr_of_mut!((*ptr).inner).cast::<libc::pthread_mutex_t>();
            let rc = libc::pthread_mutex_destroy(mutex_ptr);
            abort_on_fatal_host_error(rc, "pthread_mutex_destroy");

            let cond_ptr = ptr::addr_of_mut!((*ptr).cond).cast::<libc::pthread_cond_t>();
            let rc = libc::pthread_cond_destroy(cond_ptr);
            abort_on_fatal_host_error(rc, "pthread_cond_destroy");

            dealloc(ptr.cast::<u8>(), Layout::new::<FatState>());
        }
        #[cfg(debug_assertions)]
        LIVE_ALLOCATIONS.fetch_sub(1, StdOrdering::SeqCst);
    }

    /// Locks `inner` and returns a guard through which the protected fields
    /// can be read and written.
    pub fn lock_inner(&self) -> InnerGuard<'_> {
        // SAFETY: `self.inner` was initialized by `allocate` and outlives
        // this call by construction of the mutex state machine.
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        abort_on_fatal_host_error(rc, "pthread_mutex_lock");
        InnerGuard { fat: self }
    }

    /// Raw pointer to `inner`, for passing to a host `pthread_cond_wait`
    /// bridging a caller-supplied condition variable (see
    /// [`crate::condvar`]). Callers must already hold `inner`, which they can
    /// only have done via [`FatState::lock_inner`].
    pub(crate) fn inner_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }
}

/// Proof that `inner` is locked, through which `held`, `waiters`, and the
/// handoff `cond` may be touched. Unlocks `inner` on drop.
pub struct InnerGuard<'a> {
    fat: &'a FatState,
}

impl<'a> InnerGuard<'a> {
    /// Wraps a fat state's `inner` as already locked by the calling thread,
    /// without issuing a redundant `pthread_mutex_lock` call.
    ///
    /// # Safety
    ///
    /// The calling thread must already hold `inner`. The only legitimate
    /// caller is the cancellation bridge in [`crate::cancel`], which relies
    /// on glibc's guarantee that `pthread_cond_wait` relocks its mutex
    /// argument before a cancellation request unwinds the waiting thread.
    pub(crate) unsafe fn already_locked(fat: &'a FatState) -> Self {
        Self { fat }
    }

    pub fn held(&self) -> bool {
        // SAFETY: `inner` is locked for the lifetime of this guard.
        unsafe { *self.fat.held.get() }
    }

    pub fn set_held(&self, held: bool) {
        // SAFETY: `inner` is locked for the lifetime of this guard.
        unsafe { *self.fat.held.get() = held };
    }

    pub fn waiters(&self) -> u32 {
        // SAFETY: `inner` is locked for the lifetime of this guard.
        unsafe { *self.fat.waiters.get() }
    }

    pub fn inc_waiters(&self) {
        // SAFETY: `inner` is locked for the lifetime of this guard.
        unsafe {
            let w = self.fat.waiters.get();
            *w = (*w).checked_add(1).expect("waiters count overflowed");
        }
    }

    pub fn dec_waiters(&self) {
        // SAFETY: `inner` is locked for the lifetime of this guard.
        unsafe {
            let w = self.fat.waiters.get();
            *w = (*w).checked_sub(1).expect("waiters count underflowed");
        }
    }

    /// Wakes one thread parked in [`InnerGuard::wait_while_held`].
    pub fn signal_handoff(&self) {
        // SAFETY: `inner` is locked, so `cond` cannot be concurrently
        // destroyed out from under us.
        let rc = unsafe { libc::pthread_cond_signal(self.fat.cond.get()) };
        abort_on_fatal_host_error(rc, "pthread_cond_signal");
    }

    /// Blocks on the fat state's own handoff `cond` until `held` is false,
    /// releasing and reacquiring `inner` around each wait the same way a
    /// normal `pthread_cond_wait` loop would.
    pub fn wait_while_held(&self) {
        while self.held() {
            // SAFETY: `inner` is locked (this guard exists), and `cond`
            // belongs to the same fat state, so this pairing is valid.
            let rc =
                unsafe { libc::pthread_cond_wait(self.fat.cond.get(), self.fat.inner_ptr()) };
            abort_on_fatal_host_error(rc, "pthread_cond_wait (handoff)");
        }
    }

    pub(crate) fn fat(&self) -> &'a FatState {
        self.fat
    }
}

impl Drop for InnerGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard is the proof that `inner` is locked by us.
        let rc = unsafe { libc::pthread_mutex_unlock(self.fat.inner.get()) };
        abort_on_fatal_host_error(rc, "pthread_mutex_unlock");
    }
}
