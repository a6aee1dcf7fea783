//! Real-time scheduling setup for the recording process
//!
//! The process is pinned to one core so the scheduler never migrates it,
//! and runs SCHED_FIFO at maximum priority so lower-priority work is
//! preempted the moment a capture signal arrives or the loop semaphore is
//! posted. Signal handlers then execute on the same core while the main
//! thread blocks in `sem_wait` or a stream write.

use std::io;

/// Pins the calling process to `core`.
pub fn pin_to_core(core: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Switches the calling process to SCHED_FIFO at maximum priority.
pub fn set_fifo_max_priority() -> io::Result<()> {
    unsafe {
        let priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if priority < 0 {
            return Err(io::Error::last_os_error());
        }
        let param = libc::sched_param {
            sched_priority: priority,
        };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
