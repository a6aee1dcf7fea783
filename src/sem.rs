//! Loop-control semaphore
//!
//! Thin wrapper over a process-private POSIX semaphore. `post` is
//! async-signal-safe, which is the whole point: the capture-completion
//! context and the signal handlers wake the main loop through it, and the
//! post/wait pair is the one release/acquire edge between those contexts
//! and the loop.

use std::cell::UnsafeCell;
use std::io;

pub struct Semaphore {
    // Boxed so the sem_t address stays stable for the process lifetime.
    inner: Box<UnsafeCell<libc::sem_t>>,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Creates a process-private semaphore with an initial value of zero.
    pub fn new() -> io::Result<Self> {
        let inner: Box<UnsafeCell<libc::sem_t>> =
            Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }));
        if unsafe { libc::sem_init(inner.get(), 0, 0) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Semaphore { inner })
    }

    /// Raw pointer for signal-handler use. Stable until drop.
    pub fn as_ptr(&self) -> *mut libc::sem_t {
        self.inner.get()
    }

    /// Increments the counter, waking one waiter. Async-signal-safe.
    pub fn post(&self) {
        unsafe { libc::sem_post(self.inner.get()) };
    }

    /// Blocks until the counter is positive, then decrements it.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.inner.get()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Current counter value.
    pub fn value(&self) -> i32 {
        let mut value = 0;
        unsafe { libc::sem_getvalue(self.inner.get(), &mut value) };
        value
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_destroy(self.inner.get()) };
    }
}
