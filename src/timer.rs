//! Wall-clock capture timer
//!
//! A POSIX per-process timer on CLOCK_REALTIME that delivers a single-shot
//! signal at an absolute nanosecond timestamp. Frame capture across the
//! fleet is synchronized by PTP-disciplined system clocks: every node
//! receives the same base timestamp and arms this timer at base + k * period,
//! so all sensors expose within microseconds of each other.

use std::io;
use std::ptr;

pub const NS_PER_S: i64 = 1_000_000_000;

pub struct CaptureTimer {
    id: libc::timer_t,
}

// timer_settime/timer_delete are callable from any context in this process.
unsafe impl Send for CaptureTimer {}

impl CaptureTimer {
    /// Creates a CLOCK_REALTIME timer delivering `signo` on expiry.
    pub fn new(signo: libc::c_int) -> io::Result<Self> {
        let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_SIGNAL;
        sev.sigev_signo = signo;

        let mut id: libc::timer_t = ptr::null_mut();
        if unsafe { libc::timer_create(libc::CLOCK_REALTIME, &mut sev, &mut id) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(CaptureTimer { id })
    }

    /// Arms a single shot at the absolute wall-clock time `target_ns`
    /// (nanoseconds since the unix epoch).
    pub fn arm(&self, target_ns: i64) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_value: libc::timespec {
                tv_sec: (target_ns / NS_PER_S) as libc::time_t,
                tv_nsec: (target_ns % NS_PER_S) as libc::c_long,
            },
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };
        if unsafe { libc::timer_settime(self.id, libc::TIMER_ABSTIME, &spec, ptr::null_mut()) } != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Cancels any pending expiry.
    pub fn disarm(&self) {
        let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        unsafe { libc::timer_settime(self.id, 0, &spec, ptr::null_mut()) };
    }
}

impl Drop for CaptureTimer {
    fn drop(&mut self) {
        unsafe { libc::timer_delete(self.id) };
    }
}

/// Current CLOCK_REALTIME in nanoseconds since the epoch.
pub fn realtime_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts.tv_sec as i64 * NS_PER_S + ts.tv_nsec as i64
}

/// Advances `target` past `now` in whole periods.
///
/// When the node receives its base timestamp late, or the loop stalls for
/// longer than a frame period, the next capture target may already be in
/// the past; arming the timer for it would fire immediately and bunch
/// captures instead of keeping the fleet-wide cadence. Skipping whole
/// periods keeps every expiry on the shared grid base + k * period.
pub fn catch_up(target: i64, period: i64, now: i64) -> i64 {
    if target > now {
        return target;
    }
    let behind = (now - target) / period + 1;
    target + behind * period
}
