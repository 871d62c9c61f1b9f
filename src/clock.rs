//! Time sources for the runtime.
//!
//! `utime` is the microsecond clock everything else is built on; it can be
//! replaced wholesale before any fiber exists (e.g. with a TSC-based
//! reader). The second-granularity wall clock can additionally be cached,
//! refreshed about once a second by the scheduler's clock check, which makes
//! `time` nearly free for logging-heavy servers.

use std::cell::Cell;
use std::mem;
use std::ptr;

use crate::error::{Error, Result};
use crate::sched;
use crate::Utime;

thread_local! {
    static UTIME_FN: Cell<Option<fn() -> Utime>> = Cell::new(None);
    static CURR_TIME: Cell<libc::time_t> = Cell::new(0);
    static LAST_TSET: Cell<Utime> = Cell::new(0);
}

/// Current time in microseconds since the epoch.
pub fn utime() -> Utime {
    match UTIME_FN.with(|f| f.get()) {
        Some(f) => f(),
        None => unsafe {
            let mut tv: libc::timeval = mem::zeroed();
            libc::gettimeofday(&mut tv, ptr::null_mut());
            tv.tv_sec as Utime * 1_000_000 + tv.tv_usec as Utime
        },
    }
}

/// Replace the microsecond clock. Only allowed while no fiber is active.
pub fn set_utime_function(f: fn() -> Utime) -> Result<()> {
    if sched::active_count() != 0 {
        return Err(Error::Invalid);
    }
    UTIME_FN.with(|c| c.set(Some(f)));
    Ok(())
}

/// The scheduler's cached microsecond clock: the value of [`utime`] at the
/// last clock check. Cheap, monotonically non-decreasing.
pub fn utime_last_clock() -> Utime {
    sched::vp().last_clock
}

/// Current time in seconds; served from the time cache when it is on.
pub fn time() -> libc::time_t {
    let cached = CURR_TIME.with(|c| c.get());
    if cached != 0 {
        return cached;
    }
    unsafe { libc::time(ptr::null_mut()) }
}

/// Toggle the seconds cache; returns the previous state.
pub fn timecache_set(on: bool) -> bool {
    let wason = CURR_TIME.with(|c| c.get()) != 0;
    if on {
        CURR_TIME.with(|c| c.set(unsafe { libc::time(ptr::null_mut()) }));
        LAST_TSET.with(|c| c.set(utime()));
    } else {
        CURR_TIME.with(|c| c.set(0));
    }
    wason
}

/// Refresh the seconds cache if it is on and stale; driven by the
/// scheduler's clock check (at least 999 ms between refreshes).
pub(crate) fn timecache_tick(now: Utime) {
    if CURR_TIME.with(|c| c.get()) == 0 {
        return;
    }
    if now.saturating_sub(LAST_TSET.with(|c| c.get())) > 999_000 {
        CURR_TIME.with(|c| c.set(unsafe { libc::time(ptr::null_mut()) }));
        LAST_TSET.with(|c| c.set(now));
    }
}
