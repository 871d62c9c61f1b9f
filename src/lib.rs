//! Cooperative user-space threads ("fibers") multiplexed onto a single OS
//! thread.
//!
//! Application code writes synchronous-looking I/O against a blocking-style
//! API; under the covers every potentially blocking call suspends the calling
//! fiber, yields to a scheduler and resumes when the awaited event fires.
//! The runtime is built for network servers that need tens of thousands of
//! logically concurrent activities without paying the per-kernel-thread cost.
//!
//! Everything runs on the OS thread that called [`init`]: there is no
//! preemption, no work stealing and no cross-thread scheduling, so the
//! runtime's data structures need no synchronization and fiber handles are
//! neither `Send` nor `Sync`.
//!
//! ```no_run
//! use strand::fiber;
//!
//! strand::init().unwrap();
//! let jh = fiber::start(|| 2 + 2);
//! assert_eq!(jh.join().unwrap(), 4);
//! ```
#[macro_use]
extern crate bitflags;

pub mod clock;
pub mod coio;
pub mod error;
pub mod fiber;
pub mod tls;

mod context;
mod event;
mod list;
mod sched;
mod sleepq;
mod stack;

pub use error::{Error, Result};

/// Absolute or relative time in microseconds.
pub type Utime = u64;

/// Block until the awaited condition holds (or the fiber is interrupted).
pub const NO_TIMEOUT: Utime = u64::MAX;

/// Do not block; return immediately if the condition does not already hold.
pub const NO_WAIT: Utime = 0;

/// Initialize the runtime on the current OS thread.
///
/// Ignores `SIGPIPE`, raises the open-file soft limit to the hard limit,
/// creates the event system and the scheduler, and registers the calling
/// thread of execution as the primordial fiber. Idempotent: repeated calls
/// on an initialized thread are no-ops.
///
/// Every other operation in this crate requires a prior `init` on the same
/// OS thread.
pub fn init() -> Result<()> {
    sched::init()
}

/// The open-file limit the runtime established at [`init`], or 0 when
/// unknown.
pub fn fd_limit() -> usize {
    coio::os_fd_limit()
}

/// Toggle randomisation of fiber stack placement.
///
/// When on, every newly mapped stack is shifted by a random 16-byte-aligned
/// offset of less than one page, which spreads hot stack frames across cache
/// sets. Returns the previous state. Stacks already on the free list keep
/// their placement.
pub fn randomize_stacks(on: bool) -> bool {
    stack::randomize(on)
}
