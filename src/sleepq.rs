//! Min-heap of sleeping fibers, keyed by absolute wake-up time.
//!
//! The heap is tree-shaped rather than array-backed: every fiber control
//! block carries its own left/right child pointers and a 1-based heap index,
//! and the heap itself is just a root pointer plus a size. The position of
//! the i-th element is encoded by the binary representation of i: reading
//! the bits after the leading one from most to least significant, 0 selects
//! the left child and 1 the right child. This gives O(log n) insert and
//! remove with no auxiliary storage and, unlike an array, never moves or
//! invalidates control blocks.

use std::ptr;

use crate::sched::{Cb, Flags};
use crate::Utime;

pub(crate) struct SleepHeap {
    pub root: *mut Cb,
    pub size: usize,
}

impl SleepHeap {
    pub fn new() -> Self {
        SleepHeap {
            root: ptr::null_mut(),
            size: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    /// Schedule `fiber` to wake at the absolute time `due`.
    pub unsafe fn add(&mut self, fiber: *mut Cb, due: Utime) {
        debug_assert!(!(*fiber).flags.contains(Flags::ON_SLEEPQ));
        (*fiber).due = due;
        (*fiber).flags.insert(Flags::ON_SLEEPQ);
        self.size += 1;
        (*fiber).heap_index = self.size;
        self.place(fiber);
    }

    /// Detach `fiber` from the heap. The caller must have checked the
    /// `ON_SLEEPQ` flag; removal of a fiber that is not on the heap would
    /// corrupt the tree.
    pub unsafe fn remove(&mut self, fiber: *mut Cb) {
        debug_assert!((*fiber).flags.contains(Flags::ON_SLEEPQ));
        self.delete(fiber);
        (*fiber).flags.remove(Flags::ON_SLEEPQ);
    }

    /// Thread `fiber` into the tree along the path encoded by its
    /// `heap_index`. Walking down, whenever the descending element is due
    /// earlier than the node in the way, the two swap roles and the evicted
    /// node carries on down the remainder of the path. Returns the slot the
    /// final element was stored into.
    unsafe fn place(&mut self, fiber: *mut Cb) -> *mut *mut Cb {
        let target = (*fiber).heap_index;
        let mut s = target;
        let mut bits = 0usize;
        while s != 0 {
            s >>= 1;
            bits += 1;
        }

        let mut fiber = fiber;
        let mut p: *mut *mut Cb = &mut self.root;
        let mut index: usize = 1;
        let mut bit = bits as isize - 2;
        while bit >= 0 {
            if (*fiber).due < (**p).due {
                let evicted = *p;
                (*fiber).left = (*evicted).left;
                (*fiber).right = (*evicted).right;
                *p = fiber;
                (*fiber).heap_index = index;
                fiber = evicted;
            }
            index <<= 1;
            if target & (1 << bit) != 0 {
                p = &mut (**p).right;
                index |= 1;
            } else {
                p = &mut (**p).left;
            }
            bit -= 1;
        }
        (*fiber).heap_index = index;
        *p = fiber;
        (*fiber).left = ptr::null_mut();
        (*fiber).right = ptr::null_mut();
        p
    }

    unsafe fn delete(&mut self, fiber: *mut Cb) {
        // Find and unlink the last element (path = size's bits).
        let mut s = self.size;
        let mut bits = 0usize;
        while s != 0 {
            s >>= 1;
            bits += 1;
        }
        let mut p: *mut *mut Cb = &mut self.root;
        let mut bit = bits as isize - 2;
        while bit >= 0 {
            if self.size & (1 << bit) != 0 {
                p = &mut (**p).right;
            } else {
                p = &mut (**p).left;
            }
            bit -= 1;
        }
        let last = *p;
        *p = ptr::null_mut();
        self.size -= 1;

        if last != fiber {
            // Install the unlinked last element in place of the one being
            // deleted, then sift it down to restore the heap invariant.
            (*last).heap_index = (*fiber).heap_index;
            let mut p = self.place(last);
            let node = *p;
            (*node).left = (*fiber).left;
            (*node).right = (*fiber).right;
            loop {
                let node = *p;
                let younger = if (*node).left.is_null() {
                    break;
                } else if (*node).right.is_null() {
                    (*node).left
                } else if (*(*node).left).due < (*(*node).right).due {
                    (*node).left
                } else {
                    (*node).right
                };
                if (*node).due <= (*younger).due {
                    break;
                }
                let yl = (*younger).left;
                let yr = (*younger).right;
                *p = younger;
                if younger == (*node).left {
                    (*younger).left = node;
                    (*younger).right = (*node).right;
                    p = &mut (*younger).left;
                } else {
                    (*younger).left = (*node).left;
                    (*younger).right = node;
                    p = &mut (*younger).right;
                }
                (*node).left = yl;
                (*node).right = yr;
                let tmp = (*node).heap_index;
                (*node).heap_index = (*younger).heap_index;
                (*younger).heap_index = tmp;
            }
        }
        (*fiber).left = ptr::null_mut();
        (*fiber).right = ptr::null_mut();
    }
}
