//! Fiber-local storage.
//!
//! Keys are allocated from one table shared by all fibers of the runtime,
//! and each fiber carries a fixed vector of value slots inside its control
//! block. A key's destructor is global to the key, not per fiber; at fiber
//! exit the destructors run in key order.

use std::cell::RefCell;
use std::os::raw::c_void;

use crate::error::{Error, Result};
use crate::sched::{self, Cb};

/// Most keys a runtime instance can hand out.
pub const KEYS_MAX: usize = 16;

pub type Key = usize;

pub type Destructor = fn(*mut c_void);

struct KeyTable {
    destructors: [Option<Destructor>; KEYS_MAX],
    key_max: usize,
}

thread_local! {
    static KEYS: RefCell<KeyTable> = RefCell::new(KeyTable {
        destructors: [None; KEYS_MAX],
        key_max: 0,
    });
}

/// Allocate a key usable with [`set_specific`] / [`get_specific`] across all
/// fibers. Fails once the table is exhausted.
pub fn key_create(destructor: Option<Destructor>) -> Result<Key> {
    KEYS.with(|keys| {
        let mut keys = keys.borrow_mut();
        if keys.key_max >= KEYS_MAX {
            return Err(Error::Invalid);
        }
        let key = keys.key_max;
        keys.key_max += 1;
        keys.destructors[key] = destructor;
        Ok(key)
    })
}

pub fn key_limit() -> usize {
    KEYS_MAX
}

/// Bind `value` to `key` in the current fiber. A previously bound value is
/// destroyed first.
pub fn set_specific(key: Key, value: *mut c_void) -> Result<()> {
    if key >= KEYS_MAX {
        return Err(Error::Invalid);
    }
    let me = sched::current();
    unsafe {
        let old = (*me).private_data[key];
        if value != old {
            if !old.is_null() {
                if let Some(dtor) = destructor_of(key) {
                    dtor(old);
                }
            }
            (*me).private_data[key] = value;
        }
    }
    Ok(())
}

/// The current fiber's value for `key`, or null when unset or the key was
/// never created.
pub fn get_specific(key: Key) -> *mut c_void {
    let created = KEYS.with(|keys| key < keys.borrow().key_max);
    if !created {
        return std::ptr::null_mut();
    }
    unsafe { (*sched::current()).private_data[key] }
}

fn destructor_of(key: Key) -> Option<Destructor> {
    KEYS.with(|keys| keys.borrow().destructors[key])
}

/// Run the destructors of every bound slot, in key order. Called on the
/// fiber exit path.
pub(crate) unsafe fn cleanup(fiber: *mut Cb) {
    let key_max = KEYS.with(|keys| keys.borrow().key_max);
    for key in 0..key_max {
        let value = (*fiber).private_data[key];
        if !value.is_null() {
            if let Some(dtor) = destructor_of(key) {
                dtor(value);
            }
            (*fiber).private_data[key] = std::ptr::null_mut();
        }
    }
}
