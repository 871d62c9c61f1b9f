//! Cooperative multitasking module.
//!
//! With the fiber module, you can:
//! - create, run and manage [fibers](struct.Fiber.html),
//! - use synchronization mechanisms built for fibers: a [`Cond`] similar to
//!   the operating-system `pthread_cond_wait()` plus `pthread_cond_signal()`
//!   pair, and a [`Mutex`] whose unlock hands ownership directly to the
//!   first waiter.
//!
//! A fiber is a set of instructions executed with cooperative multitasking:
//! it owns a stack and runs until it performs a blocking operation, at which
//! point the scheduler runs another fiber. Nothing here preempts a fiber;
//! a fiber that never blocks starves the rest of the runtime.
//!
//! Fibers are created runnable and scheduled in strict FIFO order. A
//! joinable fiber ends as a *zombie* until some other fiber picks up its
//! result with [`JoinHandle::join`]; a detached fiber is reclaimed the
//! moment its function returns.
//!
//! There is no cancellation beyond [`Fiber::interrupt`], which makes the
//! target's next (or current) blocking call fail with
//! [`Error::Interrupted`].
//!
//! Example:
//! ```no_run
//! use strand::fiber;
//!
//! strand::init().unwrap();
//! let jh = fiber::start(|| {
//!     println!("I'm a fiber");
//!     69
//! });
//! println!("Fiber started");
//! assert_eq!(jh.join().unwrap(), 69);
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::os::raw::c_void;
use std::ptr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::sched::{self, Cb, CondInner, Flags, MutexInner};
use crate::{Utime, NO_TIMEOUT};

/// A copyable handle to a fiber.
///
/// The handle stays valid while the fiber has not finished its final
/// teardown; using a handle of a reclaimed fiber is as wrong as using a
/// stale thread id.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fiber {
    cb: *mut Cb,
}

impl Fiber {
    /// Make the fiber's next (or current) blocking call fail with
    /// [`Error::Interrupted`].
    ///
    /// The interrupt is a sticky bit: delivered to a fiber that is not
    /// blocked, it stays pending until the fiber blocks next. Delivered to a
    /// blocked fiber, it wakes the fiber immediately. Zombies are not
    /// interruptible.
    pub fn interrupt(&self) {
        sched::interrupt(self.cb);
    }

    pub fn is_current(&self) -> bool {
        self.cb == sched::current()
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Fiber").finish_non_exhaustive()
    }
}

/// The handle of the calling fiber.
pub fn current() -> Fiber {
    Fiber {
        cb: sched::current(),
    }
}

/// Whether the current fiber has a pending interrupt. Peeks only; the bit is
/// consumed by the next blocking call, not by this function.
pub fn is_interrupted() -> bool {
    unsafe { (*sched::current()).flags.contains(Flags::INTERRUPT) }
}

/// Fiber attributes container.
#[derive(Debug, Clone)]
pub struct FiberAttr {
    stack_size: usize,
}

impl FiberAttr {
    /// Attributes with the default parameters (128 KiB stack).
    pub fn new() -> Self {
        FiberAttr {
            stack_size: sched::DEFAULT_STACK_SIZE,
        }
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Set the stack size for fibers created with these attributes. The
    /// value is rounded up to a whole number of pages at creation.
    pub fn set_stack_size(&mut self, stack_size: usize) -> Result<()> {
        if stack_size == 0 {
            return Err(Error::Invalid);
        }
        self.stack_size = stack_size;
        Ok(())
    }
}

impl Default for FiberAttr {
    fn default() -> Self {
        Self::new()
    }
}

/// Fiber factory, which can be used in order to configure the properties of
/// a new fiber.
///
/// Methods can be chained on it in order to configure it; currently the
/// stack size and joinability are configurable. [`Builder::start`] creates a
/// joinable fiber and hands back its [`JoinHandle`];
/// [`Builder::start_detached`] creates a fire-and-forget fiber.
#[derive(Debug, Default)]
pub struct Builder {
    attr: Option<FiberAttr>,
}

impl Builder {
    pub fn new() -> Self {
        Builder { attr: None }
    }

    /// Size of the stack (in bytes) for the new fiber.
    pub fn stack_size(mut self, stack_size: usize) -> Result<Self> {
        let mut attr = self.attr.take().unwrap_or_default();
        attr.set_stack_size(stack_size)?;
        self.attr = Some(attr);
        Ok(self)
    }

    /// Spawn a joinable fiber running `f`. The new fiber is enqueued
    /// runnable immediately; the caller keeps running until it blocks.
    pub fn start<F, T>(self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let start: sched::StartFn =
            Box::new(move || Box::into_raw(Box::new(f())) as *mut c_void);
        let cb = sched::create(start, true, self.requested_stack())?;
        Ok(JoinHandle {
            fiber: Fiber { cb },
            marker: PhantomData,
        })
    }

    /// Spawn a detached fiber running `f`; its result is dropped when the
    /// fiber finishes.
    pub fn start_detached<F, T>(self, f: F) -> Result<Fiber>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let start: sched::StartFn = Box::new(move || {
            drop(f());
            ptr::null_mut()
        });
        let cb = sched::create(start, false, self.requested_stack())?;
        Ok(Fiber { cb })
    }

    fn requested_stack(&self) -> usize {
        self.attr.as_ref().map(|a| a.stack_size).unwrap_or(0)
    }
}

/// An owned permission to join on a fiber (block on its termination) and
/// take its result.
pub struct JoinHandle<T> {
    fiber: Fiber,
    marker: PhantomData<T>,
}

impl<T> JoinHandle<T> {
    /// A plain [`Fiber`] handle for this fiber (e.g. to interrupt it).
    pub fn handle(&self) -> Fiber {
        self.fiber
    }

    /// Block the calling fiber until this fiber is dead, then take its
    /// result.
    ///
    /// Fails with [`Error::Invalid`] when joining from the fiber itself or
    /// when another fiber is already joining the target. Propagates
    /// [`Error::Interrupted`] when the *caller* is interrupted while
    /// waiting.
    pub fn join(self) -> Result<T> {
        let retval = sched::join(self.fiber.cb)?;
        if retval.is_null() {
            return Err(Error::Invalid);
        }
        Ok(*unsafe { Box::from_raw(retval as *mut T) })
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JoinHandle").finish_non_exhaustive()
    }
}

/// Spawn a joinable fiber with default attributes.
///
/// Panics on resource exhaustion (stack allocation failure); use
/// [`Builder::start`] to handle that case.
pub fn start<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    Builder::new().start(f).unwrap()
}

/// Spawn a detached fiber with default attributes.
pub fn start_detached<F, T>(f: F) -> Fiber
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    Builder::new().start_detached(f).unwrap()
}

/// Terminate the calling fiber with an untyped result.
///
/// Equivalent to returning from the fiber function, except the raw pointer
/// is handed to the joiner verbatim.
///
/// # Safety
///
/// The joiner of a fiber spawned through [`Builder::start`] interprets the
/// value as a `Box<T>`; calling `exit` inside such a fiber with anything
/// else is undefined behaviour. Safe to use with fibers whose joiner expects
/// a raw pointer, or with detached fibers.
pub unsafe fn exit(retval: *mut c_void) -> ! {
    sched::exit_fiber(retval)
}

/// Put the current fiber to sleep for at least `usecs` microseconds.
///
/// With [`NO_TIMEOUT`] the fiber is suspended indefinitely and only an
/// interrupt wakes it (the call then fails with [`Error::Interrupted`]).
pub fn usleep(usecs: Utime) -> Result<()> {
    sched::usleep(usecs)
}

/// Put the current fiber to sleep for at least the given duration.
pub fn sleep(how_long: Duration) -> Result<()> {
    sched::usleep(how_long.as_micros() as Utime)
}

/// Yield control to the scheduler; the fiber is re-enqueued at the tail of
/// the run queue and resumes after everything currently runnable has run.
pub fn yield_now() {
    sched::yield_now();
}

/// Conditional variable for cooperative multitasking (fibers).
///
/// A cond (short for "condition variable") is a synchronization primitive
/// that allows fibers to yield until some predicate is satisfied. Fiber
/// conditions have two basic operations, [`Cond::wait`] and
/// [`Cond::signal`]: `wait` suspends execution of the fiber (i.e. yields)
/// until `signal` is called.
///
/// Unlike `pthread_cond`, a [`Cond`] does not require a mutex around the
/// predicate: checking the predicate and calling `wait` cannot be
/// interleaved with another fiber as long as no blocking call separates
/// them. The waking fiber in turn must change the predicate without
/// suspending between the change and the signal.
///
/// Waiters queue in FIFO order; `signal` wakes the first, `broadcast` wakes
/// them all.
pub struct Cond {
    inner: *mut CondInner,
}

impl Cond {
    /// Instantiate a new fiber cond object.
    pub fn new() -> Self {
        Cond {
            inner: CondInner::alloc(),
        }
    }

    /// Wake one fiber waiting for the cond. Does nothing if no one is
    /// waiting. Does not yield.
    pub fn signal(&self) {
        unsafe { sched::cond_signal(self.inner, false) }
    }

    /// Wake up all fibers waiting for the cond. Does not yield.
    pub fn broadcast(&self) {
        unsafe { sched::cond_signal(self.inner, true) }
    }

    /// Suspend the calling fiber until the cond is signalled.
    pub fn wait(&self) -> Result<()> {
        unsafe { sched::cond_timedwait(self.inner, NO_TIMEOUT) }
    }

    /// Suspend the calling fiber until the cond is signalled or `timeout`
    /// microseconds pass, whichever comes first.
    ///
    /// Fails with [`Error::TimedOut`] on the deadline and with
    /// [`Error::Interrupted`] on an interrupt; an interrupt wins when both
    /// apply.
    pub fn timedwait(&self, timeout: Utime) -> Result<()> {
        unsafe { sched::cond_timedwait(self.inner, timeout) }
    }

    /// Destroy the cond. Fails with [`Error::Busy`] while fibers are
    /// waiting on it; the storage is leaked in that case, since the waiters
    /// still reference it.
    pub fn destroy(self) -> Result<()> {
        unsafe {
            if !(*self.inner).wait_q.is_empty() {
                std::mem::forget(self);
                return Err(Error::Busy);
            }
        }
        Ok(())
    }
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Cond {
    fn drop(&mut self) {
        unsafe {
            if (*self.inner).wait_q.is_empty() {
                CondInner::free(self.inner);
            } else {
                log::warn!("condition variable dropped with waiters, leaking it");
            }
        }
    }
}

impl fmt::Debug for Cond {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Cond").finish_non_exhaustive()
    }
}

/// A mutual exclusion lock for fibers.
///
/// Not recursive: a second `lock` from the owner fails with
/// [`Error::Deadlock`]. Unlock hands ownership directly to the first
/// waiting fiber, so the lock never passes through an unowned state while
/// fibers queue for it and acquisition order is strictly FIFO.
pub struct Mutex {
    inner: *mut MutexInner,
}

impl Mutex {
    pub fn new() -> Self {
        Mutex {
            inner: MutexInner::alloc(),
        }
    }

    /// Acquire the lock, suspending the calling fiber while another fiber
    /// owns it.
    pub fn lock(&self) -> Result<()> {
        unsafe { sched::mutex_lock(self.inner) }
    }

    /// Acquire the lock only if it is free right now; fails with
    /// [`Error::Busy`] otherwise. Never yields.
    pub fn trylock(&self) -> Result<()> {
        unsafe { sched::mutex_trylock(self.inner) }
    }

    /// Release the lock, waking the first waiter if any. Fails with
    /// [`Error::NotOwner`] when the calling fiber does not hold it.
    pub fn unlock(&self) -> Result<()> {
        unsafe { sched::mutex_unlock(self.inner) }
    }

    /// Acquire the lock and get back an RAII guard that releases it when
    /// dropped.
    pub fn guard(&self) -> Result<MutexGuard<'_>> {
        self.lock()?;
        Ok(MutexGuard { mutex: self })
    }

    /// Destroy the mutex. Fails with [`Error::Busy`] while it is owned or
    /// waited for; the storage is leaked in that case.
    pub fn destroy(self) -> Result<()> {
        unsafe {
            if !(*self.inner).owner.is_null() || !(*self.inner).wait_q.is_empty() {
                std::mem::forget(self);
                return Err(Error::Busy);
            }
        }
        Ok(())
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        unsafe {
            if (*self.inner).owner.is_null() && (*self.inner).wait_q.is_empty() {
                MutexInner::free(self.inner);
            } else {
                log::warn!("mutex dropped while in use, leaking it");
            }
        }
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure
/// is dropped (falls out of scope), the lock will be unlocked.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl<'a> Drop for MutexGuard<'a> {
    fn drop(&mut self) {
        let _ = self.mutex.unlock();
    }
}
