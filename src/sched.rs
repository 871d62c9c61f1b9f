//! Scheduler core: fiber control blocks, run/IO/zombie queues, the sleep
//! heap, the idle fiber and the context-switch discipline.
//!
//! The whole runtime executes on one OS thread, so a single `Vp` value per
//! thread holds every queue and the current-fiber cell, and nothing here
//! needs synchronization. Fibers never transfer control to each other
//! directly: every suspension swaps into the scheduler context, which picks
//! the head of the run queue (or the idle fiber when the queue is empty) and
//! swaps into it. The idle fiber drives the event system and the clock.

use std::cell::Cell;
use std::mem;
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::ptr;

use crate::clock;
use crate::coio::{self, PollFd};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::Reactor;
use crate::list::{Link, List};
use crate::sleepq::SleepHeap;
use crate::stack::{self, Stack};
use crate::tls;
use crate::{Utime, NO_TIMEOUT};

pub(crate) const DEFAULT_STACK_SIZE: usize = 128 * 1024;

const SCHED_STACK_SIZE: usize = 64 * 1024;

pub(crate) type StartFn = Box<dyn FnOnce() -> *mut c_void>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Running,
    Runnable,
    IoWait,
    LockWait,
    CondWait,
    Sleeping,
    Zombie,
    Suspended,
}

bitflags! {
    pub(crate) struct Flags: u8 {
        /// The initial OS thread's execution, registered at init.
        const PRIMORDIAL = 0x01;
        /// The internal event-pump fiber; not counted as active.
        const IDLE       = 0x02;
        /// Present on the sleep heap (set iff linked into the tree).
        const ON_SLEEPQ  = 0x04;
        /// Sticky interrupt bit; consumed by the next suspending call.
        const INTERRUPT  = 0x08;
        /// The last wait ended because its deadline elapsed.
        const TIMEDOUT   = 0x10;
    }
}

/// Fiber control block. Lives at the low end of the fiber's own stack
/// mapping (heap-allocated only for the primordial fiber, which has no
/// mapping of its own).
pub(crate) struct Cb {
    pub state: State,
    pub flags: Flags,
    pub start: Option<StartFn>,
    pub retval: *mut c_void,
    pub stack: *mut Stack,
    /// Run queue / sleep-wake queue / zombie queue anchor.
    pub sched_link: Link<Cb>,
    /// Mutex / condition variable wait-list anchor.
    pub wait_link: Link<Cb>,
    pub due: Utime,
    pub left: *mut Cb,
    pub right: *mut Cb,
    pub heap_index: usize,
    pub private_data: [*mut c_void; tls::KEYS_MAX],
    /// Signalled at exit so joiners can pick up the return value; null for
    /// detached fibers.
    pub term: *mut CondInner,
    pub ctx: Context,
}

impl Cb {
    fn new(state: State, flags: Flags) -> Cb {
        Cb {
            state,
            flags,
            start: None,
            retval: ptr::null_mut(),
            stack: ptr::null_mut(),
            sched_link: Link::new(),
            wait_link: Link::new(),
            due: 0,
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            heap_index: 0,
            private_data: [ptr::null_mut(); tls::KEYS_MAX],
            term: ptr::null_mut(),
            ctx: Context::new(),
        }
    }
}

/// Transient record of one fiber's interests during a `poll` call; lives on
/// the polling fiber's stack for the duration of the call.
pub(crate) struct PollQueue {
    pub link: Link<PollQueue>,
    pub pds: *mut PollFd,
    pub npds: usize,
    pub fiber: *mut Cb,
    pub on_ioq: bool,
}

/// The per-thread scheduler singleton ("virtual processor").
pub(crate) struct Vp {
    pub idle: *mut Cb,
    pub current: *mut Cb,
    /// Monotonically non-decreasing; refreshed only by `check_clock`.
    pub last_clock: Utime,
    pub run_q: List<Cb>,
    pub io_q: List<PollQueue>,
    pub zombie_q: List<Cb>,
    pub pagesize: usize,
    pub sleep: SleepHeap,
    /// Fibers that have not yet exited, the primordial one included; the
    /// idle fiber is not counted.
    pub active_count: usize,
    pub sched_ctx: Context,
    sched_stack: Box<[u8]>,
    pub reactor: Reactor,
}

thread_local! {
    static VP: Cell<*mut Vp> = Cell::new(ptr::null_mut());
}

pub(crate) fn is_initialized() -> bool {
    VP.with(|c| !c.get().is_null())
}

pub(crate) fn vp() -> &'static mut Vp {
    let p = VP.with(|c| c.get());
    assert!(!p.is_null(), "strand runtime is not initialized on this thread");
    unsafe { &mut *p }
}

pub(crate) fn active_count() -> usize {
    let p = VP.with(|c| c.get());
    if p.is_null() {
        0
    } else {
        unsafe { (*p).active_count }
    }
}

pub(crate) fn current() -> *mut Cb {
    vp().current
}

pub(crate) fn init() -> Result<()> {
    if is_initialized() {
        return Ok(());
    }

    coio::os_init()?;

    let mut vp = Box::new(Vp {
        idle: ptr::null_mut(),
        current: ptr::null_mut(),
        last_clock: clock::utime(),
        run_q: List::new(),
        io_q: List::new(),
        zombie_q: List::new(),
        pagesize: stack::page_size(),
        sleep: SleepHeap::new(),
        active_count: 0,
        sched_ctx: Context::new(),
        sched_stack: vec![0u8; SCHED_STACK_SIZE].into_boxed_slice(),
        reactor: Reactor::new(coio::os_fd_limit())?,
    });
    vp.run_q.init();
    vp.io_q.init();
    vp.zombie_q.init();
    unsafe {
        let sp = vp.sched_stack.as_mut_ptr();
        let len = vp.sched_stack.len();
        vp.sched_ctx.init(sp, len, ptr::null_mut(), schedule_loop);
    }
    VP.with(|c| c.set(Box::into_raw(vp)));

    let idle = create(Box::new(|| -> *mut c_void { idle_loop() }), false, 0)?;
    let vp = self::vp();
    unsafe {
        (*idle).flags = Flags::IDLE;
        (*idle).sched_link.unlink();
    }
    vp.idle = idle;
    vp.active_count -= 1;

    // The caller's own execution becomes the primordial fiber: it has a
    // pre-existing stack and no start function, so it is assembled by hand.
    let primordial = Box::into_raw(Box::new(Cb::new(State::Running, Flags::PRIMORDIAL)));
    unsafe {
        (*primordial).sched_link.init(primordial);
        (*primordial).wait_link.init(primordial);
    }
    vp.current = primordial;
    vp.active_count += 1;

    log::debug!("fiber runtime initialized, epoll event system ready");
    Ok(())
}

/// The scheduler context body: run fibers until none remain active.
extern "C" fn schedule_loop() {
    let vp = vp();
    while vp.active_count > 0 {
        let fiber = if !vp.run_q.is_empty() {
            unsafe { vp.run_q.pop_front() }
        } else {
            vp.idle
        };
        unsafe {
            debug_assert_eq!((*fiber).state, State::Runnable);
            (*fiber).state = State::Running;
            vp.current = fiber;
            Context::swap(&mut vp.sched_ctx, &mut (*fiber).ctx);
        }
    }
    process::exit(0);
}

/// Swap from the running fiber into the scheduler context. Returns when the
/// scheduler resumes this fiber.
pub(crate) fn switch_out(fiber: *mut Cb) {
    let vp = vp();
    unsafe { Context::swap(&mut (*fiber).ctx, &mut vp.sched_ctx) }
}

fn idle_loop() -> ! {
    let me = current();
    loop {
        crate::event::dispatch();
        check_clock();
        unsafe {
            let vp = vp();
            (*me).state = State::Runnable;
            vp.run_q.push_back(&mut (*me).sched_link);
        }
        switch_out(me);
    }
}

/// Refresh the cached clock and move every sleeper whose deadline passed to
/// the run queue, marking condvar waiters as timed out.
pub(crate) fn check_clock() {
    let vp = vp();
    let now = clock::utime();
    vp.last_clock = now;
    clock::timecache_tick(now);

    unsafe {
        while !vp.sleep.is_empty() {
            let fiber = vp.sleep.root;
            debug_assert!((*fiber).flags.contains(Flags::ON_SLEEPQ));
            if (*fiber).due > now {
                break;
            }
            vp.sleep.remove(fiber);
            if (*fiber).state == State::CondWait {
                (*fiber).flags.insert(Flags::TIMEDOUT);
            }
            debug_assert!(!(*fiber).flags.contains(Flags::IDLE));
            (*fiber).state = State::Runnable;
            vp.run_q.push_back(&mut (*fiber).sched_link);
        }
    }
}

pub(crate) unsafe fn sleep_add(fiber: *mut Cb, timeout: Utime) {
    let vp = vp();
    vp.sleep.add(fiber, vp.last_clock.saturating_add(timeout));
}

pub(crate) unsafe fn sleep_del(fiber: *mut Cb) {
    vp().sleep.remove(fiber);
}

/// The entry every fiber context starts in: run the start closure, then take
/// the normal exit path with its boxed result.
extern "C" fn fiber_entry() {
    let me = current();
    let start = unsafe { (*me).start.take() };
    let start = match start {
        Some(f) => f,
        None => unsafe { exit_fiber(ptr::null_mut()) },
    };
    match panic::catch_unwind(AssertUnwindSafe(start)) {
        Ok(retval) => unsafe { exit_fiber(retval) },
        Err(_) => {
            // A fiber stack cannot unwind into the scheduler context.
            log::error!("fiber function panicked, aborting");
            process::abort();
        }
    }
}

pub(crate) fn create(start: StartFn, joinable: bool, stack_size: usize) -> Result<*mut Cb> {
    let vp = vp();
    let mut size = if stack_size == 0 {
        DEFAULT_STACK_SIZE
    } else {
        stack_size
    };
    size = (size + vp.pagesize - 1) / vp.pagesize * vp.pagesize;
    let stack = stack::alloc(size)?;

    unsafe {
        // Carve the control block (TLS slots included) out of the bottom of
        // the usable span; what remains above it is the fiber's stack.
        let bottom = (*stack).bottom;
        let cb = bottom as *mut Cb;
        ptr::write(cb, Cb::new(State::Runnable, Flags::empty()));
        (*cb).start = Some(start);
        (*cb).stack = stack;
        (*cb).sched_link.init(cb);
        (*cb).wait_link.init(cb);
        if joinable {
            (*cb).term = CondInner::alloc();
        }

        let mut sp = bottom.add(mem::size_of::<Cb>());
        let misalign = sp as usize & 0x3f;
        if misalign != 0 {
            sp = sp.add(0x40 - misalign);
        }
        let len = (*stack).top as usize - sp as usize;
        (*cb).ctx.init(sp, len, &mut vp.sched_ctx, fiber_entry);

        vp.active_count += 1;
        vp.run_q.push_back(&mut (*cb).sched_link);
        Ok(cb)
    }
}

pub(crate) unsafe fn exit_fiber(retval: *mut c_void) -> ! {
    let vp = vp();
    let me = vp.current;
    (*me).retval = retval;
    tls::cleanup(me);
    vp.active_count -= 1;

    if !(*me).term.is_null() {
        // Joinable: park in the zombie queue until a joiner has read the
        // return value, then come back for the final teardown.
        (*me).state = State::Zombie;
        vp.zombie_q.push_back(&mut (*me).sched_link);
        cond_signal((*me).term, false);
        switch_out(me);

        CondInner::free((*me).term);
        (*me).term = ptr::null_mut();
    }

    if !(*me).flags.contains(Flags::PRIMORDIAL) {
        // The control block lives inside this stack, so freeing the stack
        // recycles the fiber as well; the mapping stays valid for the swap
        // below because stacks are pooled, never unmapped.
        stack::free((*me).stack);
    }

    switch_out(me);
    unreachable!("zombie fiber rescheduled after teardown");
}

pub(crate) fn join(target: *mut Cb) -> Result<*mut c_void> {
    let vp = vp();
    unsafe {
        if (*target).term.is_null() {
            // Detached fibers cannot be joined.
            return Err(Error::Invalid);
        }
        if target == vp.current {
            return Err(Error::Invalid);
        }
        if !(*(*target).term).wait_q.is_empty() {
            // Somebody is already joining it.
            return Err(Error::Invalid);
        }

        while (*target).state != State::Zombie {
            cond_timedwait((*target).term, NO_TIMEOUT)?;
        }

        let retval = (*target).retval;
        // Reschedule the zombie so it can run its final teardown.
        (*target).state = State::Runnable;
        (*target).sched_link.unlink();
        vp.run_q.push_back(&mut (*target).sched_link);
        Ok(retval)
    }
}

/// Make the target's next (or current) blocking call fail with
/// `Interrupted`. A fiber blocked right now is made runnable immediately.
pub(crate) fn interrupt(target: *mut Cb) {
    let vp = vp();
    unsafe {
        if (*target).state == State::Zombie {
            return;
        }
        (*target).flags.insert(Flags::INTERRUPT);
        if (*target).state == State::Running || (*target).state == State::Runnable {
            return;
        }
        if (*target).flags.contains(Flags::ON_SLEEPQ) {
            sleep_del(target);
        }
        (*target).state = State::Runnable;
        vp.run_q.push_back(&mut (*target).sched_link);
    }
}

pub(crate) fn usleep(usecs: Utime) -> Result<()> {
    let vp = vp();
    let me = vp.current;
    unsafe {
        if (*me).flags.contains(Flags::INTERRUPT) {
            (*me).flags.remove(Flags::INTERRUPT);
            return Err(Error::Interrupted);
        }
        if usecs != NO_TIMEOUT {
            (*me).state = State::Sleeping;
            sleep_add(me, usecs);
        } else {
            (*me).state = State::Suspended;
        }
        switch_out(me);
        if (*me).flags.contains(Flags::INTERRUPT) {
            (*me).flags.remove(Flags::INTERRUPT);
            return Err(Error::Interrupted);
        }
    }
    Ok(())
}

pub(crate) fn yield_now() {
    let vp = vp();
    let me = vp.current;
    unsafe {
        (*me).state = State::Runnable;
        vp.run_q.push_back(&mut (*me).sched_link);
    }
    switch_out(me);
}

/// Wait for readiness on a set of descriptors, with an optional deadline.
pub(crate) fn poll_fds(pds: &mut [PollFd], timeout: Utime) -> Result<usize> {
    let vp = vp();
    let me = vp.current;
    unsafe {
        if (*me).flags.contains(Flags::INTERRUPT) {
            (*me).flags.remove(Flags::INTERRUPT);
            return Err(Error::Interrupted);
        }

        vp.reactor.pollset_add(pds)?;

        let mut pq = PollQueue {
            link: Link::new(),
            pds: pds.as_mut_ptr(),
            npds: pds.len(),
            fiber: me,
            on_ioq: true,
        };
        let pq_ptr: *mut PollQueue = &mut pq;
        pq.link.init(pq_ptr);
        vp.io_q.push_back(&mut pq.link);
        if timeout != NO_TIMEOUT {
            sleep_add(me, timeout);
        }
        (*me).state = State::IoWait;
        switch_out(me);

        let mut n = 0;
        if pq.on_ioq {
            // Still queued: the wake came from the deadline or an interrupt,
            // not from the event system.
            pq.link.unlink();
            vp.reactor.pollset_del(pds);
        } else {
            n = pds.iter().filter(|pd| !pd.revents.is_empty()).count();
        }

        if (*me).flags.contains(Flags::INTERRUPT) {
            (*me).flags.remove(Flags::INTERRUPT);
            return Err(Error::Interrupted);
        }
        Ok(n)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Condition variable and mutex internals
////////////////////////////////////////////////////////////////////////////////

/// Backing storage of a condition variable. Heap-pinned because waiting
/// fibers hold pointers into the wait list.
pub(crate) struct CondInner {
    pub wait_q: List<Cb>,
}

impl CondInner {
    pub fn alloc() -> *mut CondInner {
        let cvar = Box::into_raw(Box::new(CondInner { wait_q: List::new() }));
        unsafe { (*cvar).wait_q.init() };
        cvar
    }

    pub unsafe fn free(cvar: *mut CondInner) {
        drop(Box::from_raw(cvar));
    }
}

pub(crate) unsafe fn cond_timedwait(cvar: *mut CondInner, timeout: Utime) -> Result<()> {
    let vp = vp();
    let me = vp.current;
    if (*me).flags.contains(Flags::INTERRUPT) {
        (*me).flags.remove(Flags::INTERRUPT);
        return Err(Error::Interrupted);
    }

    (*me).state = State::CondWait;
    (*cvar).wait_q.push_back(&mut (*me).wait_link);
    if timeout != NO_TIMEOUT {
        sleep_add(me, timeout);
    }
    switch_out(me);
    (*me).wait_link.unlink();

    // Interrupt outranks the deadline when both fired.
    let mut result = Ok(());
    if (*me).flags.contains(Flags::TIMEDOUT) {
        (*me).flags.remove(Flags::TIMEDOUT);
        result = Err(Error::TimedOut);
    }
    if (*me).flags.contains(Flags::INTERRUPT) {
        (*me).flags.remove(Flags::INTERRUPT);
        result = Err(Error::Interrupted);
    }
    result
}

pub(crate) unsafe fn cond_signal(cvar: *mut CondInner, broadcast: bool) {
    let vp = vp();
    let sentinel = (*cvar).wait_q.sentinel();
    let mut q = (*cvar).wait_q.first();
    while q != sentinel {
        let next = (*q).next;
        let fiber = (*q).owner();
        if (*fiber).state == State::CondWait {
            // The waiter unlinks itself from the wait list when it resumes.
            if (*fiber).flags.contains(Flags::ON_SLEEPQ) {
                sleep_del(fiber);
            }
            (*fiber).state = State::Runnable;
            vp.run_q.push_back(&mut (*fiber).sched_link);
            if !broadcast {
                break;
            }
        }
        q = next;
    }
}

/// Backing storage of a mutex; heap-pinned like [`CondInner`].
pub(crate) struct MutexInner {
    pub owner: *mut Cb,
    pub wait_q: List<Cb>,
}

impl MutexInner {
    pub fn alloc() -> *mut MutexInner {
        let lock = Box::into_raw(Box::new(MutexInner {
            owner: ptr::null_mut(),
            wait_q: List::new(),
        }));
        unsafe { (*lock).wait_q.init() };
        lock
    }

    pub unsafe fn free(lock: *mut MutexInner) {
        drop(Box::from_raw(lock));
    }
}

pub(crate) unsafe fn mutex_lock(lock: *mut MutexInner) -> Result<()> {
    let vp = vp();
    let me = vp.current;
    if (*me).flags.contains(Flags::INTERRUPT) {
        (*me).flags.remove(Flags::INTERRUPT);
        return Err(Error::Interrupted);
    }
    if (*lock).owner.is_null() {
        (*lock).owner = me;
        return Ok(());
    }
    if (*lock).owner == me {
        return Err(Error::Deadlock);
    }

    (*me).state = State::LockWait;
    (*lock).wait_q.push_back(&mut (*me).wait_link);
    switch_out(me);
    (*me).wait_link.unlink();

    // Ownership is handed over by the unlocker. If we were interrupted but
    // the handoff reached us anyway, the lock is ours and the interrupt
    // stays pending for the next blocking call.
    if (*me).flags.contains(Flags::INTERRUPT) && (*lock).owner != me {
        (*me).flags.remove(Flags::INTERRUPT);
        return Err(Error::Interrupted);
    }
    Ok(())
}

pub(crate) unsafe fn mutex_unlock(lock: *mut MutexInner) -> Result<()> {
    let vp = vp();
    if (*lock).owner != vp.current {
        return Err(Error::NotOwner);
    }

    let sentinel = (*lock).wait_q.sentinel();
    let mut q = (*lock).wait_q.first();
    while q != sentinel {
        let fiber = (*q).owner();
        if (*fiber).state == State::LockWait {
            // Hand ownership straight to the first waiter; the lock never
            // goes through an unowned state.
            (*lock).owner = fiber;
            (*fiber).state = State::Runnable;
            vp.run_q.push_back(&mut (*fiber).sched_link);
            return Ok(());
        }
        q = (*q).next;
    }

    (*lock).owner = ptr::null_mut();
    Ok(())
}

pub(crate) unsafe fn mutex_trylock(lock: *mut MutexInner) -> Result<()> {
    if !(*lock).owner.is_null() {
        return Err(Error::Busy);
    }
    (*lock).owner = vp().current;
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_cb() -> *mut Cb {
    let mut cb = Box::new(Cb::new(State::Runnable, Flags::empty()));
    let ptr: *mut Cb = &mut *cb;
    cb.sched_link.init(ptr);
    cb.wait_link.init(ptr);
    Box::into_raw(cb)
}
