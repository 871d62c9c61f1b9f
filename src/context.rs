//! Machine context save/restore for one fiber.
//!
//! Built on the portable `ucontext` family. Exactly three operations are
//! needed: bind a fresh context to a stack and an entry point, swap from a
//! fiber into the scheduler, and swap from the scheduler into a fiber; both
//! swaps are expressed by [`Context::swap`].

use std::mem;
use std::ptr;

pub(crate) struct Context {
    inner: libc::ucontext_t,
}

impl Context {
    pub fn new() -> Self {
        Context {
            inner: unsafe { mem::zeroed() },
        }
    }

    /// Bind this context to the stack `[sp, sp + len)` and arrange for
    /// `entry` to run on the first swap into it. When `entry` ever returns,
    /// control falls through to `link` (never expected here: fiber entries
    /// terminate through the exit path, the scheduler exits the process).
    pub unsafe fn init(&mut self, sp: *mut u8, len: usize, link: *mut Context, entry: extern "C" fn()) {
        libc::getcontext(&mut self.inner);
        self.inner.uc_stack.ss_sp = sp as *mut libc::c_void;
        self.inner.uc_stack.ss_size = len;
        self.inner.uc_link = if link.is_null() {
            ptr::null_mut()
        } else {
            &mut (*link).inner
        };
        libc::makecontext(&mut self.inner, entry, 0);
    }

    /// Save the running state into `from` and resume `to`. Returns when a
    /// later swap targets `from` again.
    pub unsafe fn swap(from: *mut Context, to: *mut Context) {
        libc::swapcontext(&mut (*from).inner, &mut (*to).inner);
    }
}
