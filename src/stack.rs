//! Fiber stack arena.
//!
//! Stacks are mmap'd regions with a guard page ("redzone") protected against
//! all access on either side of the usable span, so an overflow faults
//! synchronously instead of corrupting a neighbour. Freed stacks go on a
//! per-thread free list and are handed out again first-fit; regions are never
//! returned to the OS. The fiber control block is carved out of the low end
//! of the usable span by the scheduler, so one mapping covers both the stack
//! and its bookkeeping.

use std::cell::RefCell;
use std::io;
use std::ptr;

use crate::error::{Error, Result};

pub(crate) struct Stack {
    vaddr: *mut u8,
    vaddr_size: usize,
    pub stk_size: usize,
    pub bottom: *mut u8,
    pub top: *mut u8,
}

struct Pool {
    free: Vec<Box<Stack>>,
    randomize: bool,
}

thread_local! {
    static POOL: RefCell<Pool> = RefCell::new(Pool {
        free: Vec::new(),
        randomize: false,
    });
}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Hand out a stack with a usable span of at least `stk_size` bytes
/// (`stk_size` must already be page-aligned). Reuses the first free stack
/// that is large enough, otherwise maps a fresh region.
pub(crate) fn alloc(stk_size: usize) -> Result<*mut Stack> {
    POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        if let Some(i) = pool.free.iter().position(|s| s.stk_size >= stk_size) {
            let stack = pool.free.remove(i);
            return Ok(Box::into_raw(stack));
        }

        let redzone = page_size();
        let extra = if pool.randomize { redzone } else { 0 };
        let vaddr_size = stk_size + 2 * redzone + extra;
        let vaddr = map_segment(vaddr_size, redzone)?;

        let mut bottom = unsafe { vaddr.add(redzone) };
        let mut top = unsafe { bottom.add(stk_size) };
        if extra != 0 {
            let offset = (rand::random::<usize>() % extra) & !0xf;
            bottom = unsafe { bottom.add(offset) };
            top = unsafe { top.add(offset) };
        }

        Ok(Box::into_raw(Box::new(Stack {
            vaddr,
            vaddr_size,
            stk_size,
            bottom,
            top,
        })))
    })
}

/// Return a stack to the free list. The mapping stays alive for reuse.
pub(crate) unsafe fn free(stack: *mut Stack) {
    if stack.is_null() {
        return;
    }
    POOL.with(|pool| pool.borrow_mut().free.push(Box::from_raw(stack)));
}

pub(crate) fn randomize(on: bool) -> bool {
    POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        let wason = pool.randomize;
        pool.randomize = on;
        wason
    })
}

fn map_segment(size: usize, redzone: usize) -> Result<*mut u8> {
    unsafe {
        let vaddr = libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if vaddr == libc::MAP_FAILED {
            return Err(Error::last_os());
        }
        if libc::mprotect(vaddr, redzone, libc::PROT_NONE) < 0
            || libc::mprotect(
                (vaddr as *mut u8).add(size - redzone) as *mut libc::c_void,
                redzone,
                libc::PROT_NONE,
            ) < 0
        {
            let err = io::Error::last_os_error();
            libc::munmap(vaddr, size);
            return Err(Error::Io(err));
        }
        Ok(vaddr as *mut u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_and_guards() {
        let size = 4 * page_size();
        let stack = alloc(size).unwrap();
        unsafe {
            assert_eq!((*stack).top as usize - (*stack).bottom as usize, size);
            assert_eq!((*stack).bottom as usize % 16, 0);
            // The span is usable end to end.
            ptr::write_bytes((*stack).bottom, 0xa5, size);
            free(stack);
        }
    }

    #[test]
    fn first_fit_reuse() {
        let small = 2 * page_size();
        let big = 8 * page_size();
        let a = alloc(big).unwrap();
        unsafe { free(a) };
        // A smaller request must pick up the freed larger stack.
        let b = alloc(small).unwrap();
        assert_eq!(a, b);
        unsafe {
            assert!((*b).stk_size >= small);
            free(b);
        }
    }

    #[test]
    fn randomized_offset_is_quantized() {
        let prev = randomize(true);
        let size = 2 * page_size();
        let stack = alloc(size).unwrap();
        unsafe {
            let offset = (*stack).bottom as usize - ((*stack).vaddr as usize + page_size());
            assert!(offset < page_size());
            assert_eq!(offset % 16, 0);
            free(stack);
        }
        randomize(prev);
    }
}
