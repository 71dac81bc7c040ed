//! POSIX mutex shared among multiple processes.
//!
//! By default POSIX mutexes must not be shared across processes; the
//! `PTHREAD_PROCESS_SHARED` attribute makes it legal to place one in a
//! shared mapping. The mutex here is additionally *robust*: if a
//! holder dies inside its critical section, the next locker observes
//! `EOWNERDEAD`, marks the state consistent, and proceeds.
//!
//! A [`SharedMutex`] may carry a signal mask. If it does, the mask is
//! applied atomically with every acquisition and the previous mask is
//! restored at release, so a holder cannot be preempted by a signal
//! whose handler might try to re-enter the same mutex. The previous
//! mask lives in the returned [`SharedMutexGuard`], not in the shared
//! object, so nested locks by the same thread compose.
//!
//! [`SharedMutex::init`] and [`SharedMutex::destroy`] must be called
//! by exactly one process, the one that owns the shared mapping's
//! lifecycle; all other participants only ever lock.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem;
use std::ptr;

use nix::errno::Errno;

use crate::error::DomainError;

/// Map a pthread return code onto the domain error type.
pub(crate) fn sync_check(op: &'static str, rc: libc::c_int) -> Result<(), DomainError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(DomainError::Sync {
            op,
            source: Errno::from_raw(rc),
        })
    }
}

/// Process-shared robust mutex with an optional coupled signal mask.
///
/// Lives inside a shared mapping at a stable, properly aligned
/// location. The wrapped pthread object is only ever accessed through
/// raw pointers, never moved.
#[repr(C)]
pub struct SharedMutex {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    /// True if `sigmask` is applied around every critical section.
    block_signals: bool,
    sigmask: libc::sigset_t,
}

// SAFETY: all access to the inner pthread object goes through the
// pthread API, which serializes across threads and processes.
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialize a mutex in place inside a shared mapping.
    ///
    /// With `sigmask` present, every later lock blocks those signals
    /// for the duration of the critical section.
    ///
    /// # Safety
    ///
    /// `this` must be valid for writes, properly aligned, and not yet
    /// initialized (or destroyed since). One process only.
    pub unsafe fn init(
        this: *mut SharedMutex,
        sigmask: Option<&libc::sigset_t>,
    ) -> Result<(), DomainError> {
        let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
        sync_check(
            "pthread_mutexattr_init",
            libc::pthread_mutexattr_init(&mut attr),
        )?;
        let result = (|| {
            sync_check(
                "pthread_mutexattr_setpshared",
                libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
            )?;
            sync_check(
                "pthread_mutexattr_setrobust",
                libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST),
            )?;
            sync_check(
                "pthread_mutex_init",
                libc::pthread_mutex_init(UnsafeCell::raw_get(ptr::addr_of!((*this).mutex)), &attr),
            )
        })();
        libc::pthread_mutexattr_destroy(&mut attr);
        result?;
        match sigmask {
            Some(set) => {
                ptr::addr_of_mut!((*this).block_signals).write(true);
                ptr::addr_of_mut!((*this).sigmask).write(*set);
            }
            None => {
                ptr::addr_of_mut!((*this).block_signals).write(false);
                ptr::addr_of_mut!((*this).sigmask).write(mem::zeroed());
            }
        }
        Ok(())
    }

    /// Destroy a mutex previously set up with [`init`](Self::init).
    ///
    /// # Safety
    ///
    /// One process only; no participant may use the mutex afterwards.
    pub unsafe fn destroy(this: *mut SharedMutex) {
        let _ = libc::pthread_mutex_destroy(UnsafeCell::raw_get(ptr::addr_of!((*this).mutex)));
    }

    /// Acquire the mutex, applying the configured signal mask
    /// atomically with the acquisition.
    ///
    /// Recovers the state of a holder that died inside its critical
    /// section (robust-mutex `EOWNERDEAD`).
    pub fn lock(&self) -> Result<SharedMutexGuard<'_>, DomainError> {
        let mut old: libc::sigset_t = unsafe { mem::zeroed() };
        if self.block_signals {
            sync_check("pthread_sigmask", unsafe {
                libc::pthread_sigmask(libc::SIG_BLOCK, &self.sigmask, &mut old)
            })?;
        }
        let mut rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        if rc == libc::EOWNERDEAD {
            // the previous holder crashed; the protected state is what
            // it is, mark it usable again
            rc = unsafe { libc::pthread_mutex_consistent(self.mutex.get()) };
        }
        if rc != 0 {
            if self.block_signals {
                unsafe {
                    libc::pthread_sigmask(libc::SIG_SETMASK, &old, ptr::null_mut());
                }
            }
            return Err(DomainError::Sync {
                op: "pthread_mutex_lock",
                source: Errno::from_raw(rc),
            });
        }
        Ok(SharedMutexGuard {
            mutex: self,
            old_mask: self.block_signals.then_some(old),
            _not_send: PhantomData,
        })
    }

    pub(crate) fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.get()
    }
}

/// Holds the mutex, and the signal mask that was in effect before the
/// acquisition. Dropping unlocks and restores the mask, in that order.
pub struct SharedMutexGuard<'m> {
    mutex: &'m SharedMutex,
    old_mask: Option<libc::sigset_t>,
    // pthread mutexes must be released on the locking thread
    _not_send: PhantomData<*mut ()>,
}

impl SharedMutexGuard<'_> {
    pub(crate) fn mutex_raw(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.raw()
    }
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::pthread_mutex_unlock(self.mutex.raw());
            if let Some(old) = &self.old_mask {
                let _ = libc::pthread_sigmask(libc::SIG_SETMASK, old, ptr::null_mut());
            }
        }
    }
}
