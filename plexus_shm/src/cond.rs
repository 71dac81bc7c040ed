//! POSIX condition variable shared among multiple processes.
//!
//! Like [`SharedMutex`](crate::mutex::SharedMutex), a condition
//! variable needs the `PTHREAD_PROCESS_SHARED` attribute before it may
//! live in a mapping used by several processes. Creation and
//! destruction belong to exactly one process; everyone else only
//! waits and notifies.
//!
//! [`SharedCond::wait`] takes the mutex guard by reference: the guard
//! is proof that the calling thread holds the associated shared mutex,
//! which the pthread wait protocol requires.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;

use crate::error::DomainError;
use crate::mutex::{sync_check, SharedMutexGuard};

/// Process-shared condition variable.
#[repr(C)]
pub struct SharedCond {
    cond: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: all access to the inner pthread object goes through the
// pthread API, which is safe to drive concurrently.
unsafe impl Sync for SharedCond {}

impl SharedCond {
    /// Initialize a condition variable in place inside a shared
    /// mapping.
    ///
    /// # Safety
    ///
    /// `this` must be valid for writes, properly aligned, and not yet
    /// initialized (or destroyed since). One process only.
    pub unsafe fn init(this: *mut SharedCond) -> Result<(), DomainError> {
        let mut attr: libc::pthread_condattr_t = mem::zeroed();
        sync_check(
            "pthread_condattr_init",
            libc::pthread_condattr_init(&mut attr),
        )?;
        let result = (|| {
            sync_check(
                "pthread_condattr_setpshared",
                libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
            )?;
            sync_check(
                "pthread_cond_init",
                libc::pthread_cond_init(UnsafeCell::raw_get(ptr::addr_of!((*this).cond)), &attr),
            )
        })();
        libc::pthread_condattr_destroy(&mut attr);
        result
    }

    /// Destroy a condition variable previously set up with
    /// [`init`](Self::init).
    ///
    /// # Safety
    ///
    /// One process only; no participant may use it afterwards.
    pub unsafe fn destroy(this: *mut SharedCond) {
        let _ = libc::pthread_cond_destroy(UnsafeCell::raw_get(ptr::addr_of!((*this).cond)));
    }

    /// Atomically release the guarded mutex and wait for a
    /// notification; the mutex is re-held when this returns.
    ///
    /// Spurious wakeups are possible; callers re-check their predicate
    /// in a loop.
    pub fn wait(&self, guard: &mut SharedMutexGuard<'_>) -> Result<(), DomainError> {
        sync_check("pthread_cond_wait", unsafe {
            libc::pthread_cond_wait(self.cond.get(), guard.mutex_raw())
        })
    }

    /// Wake one waiter, if any.
    pub fn notify_one(&self) -> Result<(), DomainError> {
        sync_check("pthread_cond_signal", unsafe {
            libc::pthread_cond_signal(self.cond.get())
        })
    }

    /// Wake every waiter.
    pub fn notify_all(&self) -> Result<(), DomainError> {
        sync_check("pthread_cond_broadcast", unsafe {
            libc::pthread_cond_broadcast(self.cond.get())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::SharedMutex;
    use std::mem::MaybeUninit;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn wait_wakes_on_notify() {
        // a mutex/cv pair on the heap behaves like one in a mapping
        let mut mslot: Box<MaybeUninit<SharedMutex>> = Box::new(MaybeUninit::uninit());
        let mut cslot: Box<MaybeUninit<SharedCond>> = Box::new(MaybeUninit::uninit());
        let mutex = mslot.as_mut_ptr();
        let cond = cslot.as_mut_ptr();
        static GO: AtomicBool = AtomicBool::new(false);

        unsafe {
            SharedMutex::init(mutex, None).unwrap();
            SharedCond::init(cond).unwrap();

            let mutex_ref: &'static SharedMutex = &*(mutex as *const SharedMutex);
            let cond_ref: &'static SharedCond = &*(cond as *const SharedCond);

            let waiter = std::thread::spawn(move || {
                let mut guard = mutex_ref.lock().unwrap();
                while !GO.load(Ordering::SeqCst) {
                    cond_ref.wait(&mut guard).unwrap();
                }
            });

            std::thread::sleep(std::time::Duration::from_millis(50));
            {
                let _guard = mutex_ref.lock().unwrap();
                GO.store(true, Ordering::SeqCst);
                cond_ref.notify_all().unwrap();
            }
            waiter.join().unwrap();

            SharedCond::destroy(cond);
            SharedMutex::destroy(mutex);
        }
    }
}
