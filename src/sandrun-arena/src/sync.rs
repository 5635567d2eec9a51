//! Process-shared mutex and counting semaphore, built directly on the POSIX
//! primitives so they can live inside an [`crate::Arena`] and be acquired
//! from any process that has the region mapped.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::time::Duration;

use sandrun_common::RomaError;

/// A `pthread_mutex_t` configured with `PTHREAD_PROCESS_SHARED`.
///
/// Must be placed at a stable address inside shared memory and initialized
/// exactly once, by whichever process creates the arena, before any other
/// process touches it.
#[repr(C)]
pub struct ProcessMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for ProcessMutex {}
unsafe impl Sync for ProcessMutex {}

impl ProcessMutex {
    /// Initialize a `ProcessMutex` in place at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid, aligned, writable memory for the lifetime of the
    /// mutex, shared across every process that will lock it. Must be called
    /// exactly once per mutex, before any process locks it.
    pub unsafe fn init_in_place(ptr: *mut Self, recursive: bool) -> Result<(), RomaError> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let mut attr = attr.assume_init();
        check(libc::pthread_mutexattr_setpshared(
            &mut attr,
            libc::PTHREAD_PROCESS_SHARED,
        ))?;
        if recursive {
            check(libc::pthread_mutexattr_settype(
                &mut attr,
                libc::PTHREAD_MUTEX_RECURSIVE,
            ))?;
        }
        let mutex_ptr = UnsafeCell::raw_get(std::ptr::addr_of!((*ptr).inner));
        check(libc::pthread_mutex_init(mutex_ptr, &attr))?;
        libc::pthread_mutexattr_destroy(&mut attr);
        Ok(())
    }

    /// Block until the mutex is acquired.
    pub fn lock(&self) -> MutexGuard<'_> {
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        assert_eq!(rc, 0, "pthread_mutex_lock failed: {rc}");
        MutexGuard { mutex: self }
    }

    fn unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        assert_eq!(rc, 0, "pthread_mutex_unlock failed: {rc}");
    }
}

/// RAII guard releasing a [`ProcessMutex`] on drop.
pub struct MutexGuard<'a> {
    mutex: &'a ProcessMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// A POSIX counting semaphore configured for cross-process use
/// (`sem_init(.., pshared = 1, ..)`).
#[repr(C)]
pub struct ProcessSemaphore {
    inner: UnsafeCell<libc::sem_t>,
}

unsafe impl Send for ProcessSemaphore {}
unsafe impl Sync for ProcessSemaphore {}

impl ProcessSemaphore {
    /// Initialize a `ProcessSemaphore` in place at `ptr` with `initial` value.
    ///
    /// # Safety
    ///
    /// Same contract as [`ProcessMutex::init_in_place`].
    pub unsafe fn init_in_place(ptr: *mut Self, initial: u32) -> Result<(), RomaError> {
        let sem_ptr = UnsafeCell::raw_get(std::ptr::addr_of!((*ptr).inner));
        let rc = libc::sem_init(sem_ptr, 1, initial);
        if rc != 0 {
            return Err(RomaError::Other(format!(
                "sem_init failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Block until a unit is available, then consume it.
    pub fn wait(&self) {
        loop {
            let rc = unsafe { libc::sem_wait(self.inner.get()) };
            if rc == 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                panic!("sem_wait failed: {err}");
            }
        }
    }

    /// Block up to `timeout`, returning `false` on expiry.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline = now_plus(timeout);
        loop {
            let rc = unsafe { libc::sem_timedwait(self.inner.get(), &deadline) };
            if rc == 0 {
                return true;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return false,
                _ => panic!("sem_timedwait failed: {err}"),
            }
        }
    }

    /// Consume a unit without blocking; `false` iff none were available.
    pub fn try_wait(&self) -> bool {
        let rc = unsafe { libc::sem_trywait(self.inner.get()) };
        rc == 0
    }

    /// Produce one unit, waking at most one waiter.
    pub fn post(&self) {
        let rc = unsafe { libc::sem_post(self.inner.get()) };
        assert_eq!(rc, 0, "sem_post failed: {rc}");
    }
}

fn now_plus(d: Duration) -> libc::timespec {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, ts.as_mut_ptr());
    }
    let mut ts = unsafe { ts.assume_init() };
    ts.tv_sec += d.as_secs() as libc::time_t;
    ts.tv_nsec += d.subsec_nanos() as libc::c_long;
    if ts.tv_nsec >= 1_000_000_000 {
        ts.tv_nsec -= 1_000_000_000;
        ts.tv_sec += 1;
    }
    ts
}

fn check(rc: libc::c_int) -> Result<(), RomaError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(RomaError::Other(format!(
            "pthread call failed: {}",
            std::io::Error::from_raw_os_error(rc)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    unsafe fn alloc_boxed<T>() -> (*mut T, Layout) {
        let layout = Layout::new::<T>();
        let ptr = alloc_zeroed(layout) as *mut T;
        (ptr, layout)
    }

    #[test]
    fn mutex_excludes_concurrent_access() {
        unsafe {
            let (ptr, layout) = alloc_boxed::<ProcessMutex>();
            ProcessMutex::init_in_place(ptr, false).unwrap();
            let mutex = &*ptr;
            let guard = mutex.lock();
            drop(guard);
            let guard2 = mutex.lock();
            drop(guard2);
            dealloc(ptr as *mut u8, layout);
        }
    }

    #[test]
    fn semaphore_wait_and_post() {
        unsafe {
            let (ptr, layout) = alloc_boxed::<ProcessSemaphore>();
            ProcessSemaphore::init_in_place(ptr, 1).unwrap();
            let sem = &*ptr;
            assert!(sem.try_wait());
            assert!(!sem.try_wait());
            sem.post();
            assert!(sem.try_wait());
            dealloc(ptr as *mut u8, layout);
        }
    }

    #[test]
    fn semaphore_timed_wait_expires() {
        unsafe {
            let (ptr, layout) = alloc_boxed::<ProcessSemaphore>();
            ProcessSemaphore::init_in_place(ptr, 0).unwrap();
            let sem = &*ptr;
            assert!(!sem.timed_wait(Duration::from_millis(20)));
            dealloc(ptr as *mut u8, layout);
        }
    }
}
