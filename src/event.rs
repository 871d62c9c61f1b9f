//! Readiness event system over epoll.
//!
//! Per descriptor the reactor keeps three reference counts, one per interest
//! kind, and the kernel registration is always the OR of the non-zero
//! counts. During one `dispatch` pass the kernel events are first latched
//! into the descriptor table, then every waiter on the IO queue is examined
//! against the latches, and only afterwards is kernel registration
//! reconciled. Deregistration requests that arrive while a latch is pending
//! are therefore applied to the reference counts only; the kernel call is
//! skipped so the final reconciliation stays authoritative.

use std::cmp;
use std::io;
use std::os::unix::io::RawFd;
use std::slice;

use crate::coio::{Interest, PollFd};
use crate::error::{Error, Result};
use crate::sched::{self, Flags, State};

/// Not a limit, just a sizing hint for the event buffer.
const EVTLIST_SIZE: usize = 4096;

#[derive(Default, Clone)]
struct FdData {
    rd: i32,
    wr: i32,
    pri: i32,
    /// Kernel events latched for the duration of one dispatch pass.
    revents: u32,
}

pub(crate) struct Reactor {
    epfd: RawFd,
    pid: libc::pid_t,
    fd_data: Vec<FdData>,
    evtlist: Vec<libc::epoll_event>,
    evtlist_cnt: usize,
    fd_hint: usize,
}

impl Reactor {
    /// `fdlim` is the open-file limit established at init, 0 when unknown;
    /// it only sizes the descriptor table and the event buffer.
    pub fn new(fdlim: usize) -> Result<Reactor> {
        let hint = if fdlim > 0 && fdlim < EVTLIST_SIZE {
            fdlim
        } else {
            EVTLIST_SIZE
        };
        let epfd = unsafe { libc::epoll_create(hint as i32) };
        if epfd < 0 {
            return Err(Error::last_os());
        }
        unsafe { libc::fcntl(epfd, libc::F_SETFD, libc::FD_CLOEXEC) };
        Ok(Reactor {
            epfd,
            pid: unsafe { libc::getpid() },
            fd_data: vec![FdData::default(); hint],
            evtlist: vec![libc::epoll_event { events: 0, u64: 0 }; hint],
            evtlist_cnt: 0,
            fd_hint: hint,
        })
    }

    /// Kernel interest mask implied by the reference counts.
    fn events_mask(&self, fd: usize) -> u32 {
        let data = &self.fd_data[fd];
        let mut mask = 0;
        if data.rd > 0 {
            mask |= libc::EPOLLIN as u32;
        }
        if data.wr > 0 {
            mask |= libc::EPOLLOUT as u32;
        }
        if data.pri > 0 {
            mask |= libc::EPOLLPRI as u32;
        }
        mask
    }

    fn ensure_fd(&mut self, fd: usize) {
        if fd < self.fd_data.len() {
            return;
        }
        let mut n = self.fd_data.len();
        while fd >= n {
            n <<= 1;
        }
        self.fd_data.resize(n, FdData::default());
    }

    fn grow_evtlist(&mut self) {
        let mut n = self.evtlist.len();
        while self.evtlist_cnt > n {
            n <<= 1;
        }
        self.evtlist.resize(n, libc::epoll_event { events: 0, u64: 0 });
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Register a set of interests. All entries are validated up front;
    /// a kernel failure part-way through rolls back the entries already
    /// applied and reports the kernel error.
    pub fn pollset_add(&mut self, pds: &[PollFd]) -> Result<()> {
        let valid = Interest::IN | Interest::OUT | Interest::PRI;
        for pd in pds {
            if pd.fd < 0 || pd.events.is_empty() || !valid.contains(pd.events) {
                return Err(Error::Invalid);
            }
            self.ensure_fd(pd.fd as usize);
        }

        for (i, pd) in pds.iter().enumerate() {
            let fd = pd.fd as usize;
            let old = self.events_mask(fd);
            {
                let data = &mut self.fd_data[fd];
                if pd.events.contains(Interest::IN) {
                    data.rd += 1;
                }
                if pd.events.contains(Interest::OUT) {
                    data.wr += 1;
                }
                if pd.events.contains(Interest::PRI) {
                    data.pri += 1;
                }
            }
            let new = self.events_mask(fd);
            if new == old {
                continue;
            }
            let op = if old != 0 {
                libc::EPOLL_CTL_MOD
            } else {
                libc::EPOLL_CTL_ADD
            };
            match self.ctl(op, pd.fd, new) {
                Err(e)
                    if !(op == libc::EPOLL_CTL_ADD
                        && e.raw_os_error() == Some(libc::EEXIST)) =>
                {
                    log::warn!("epoll registration of fd {} failed, rolling back: {}", pd.fd, e);
                    self.pollset_del(&pds[..=i]);
                    return Err(Error::Io(e));
                }
                _ => {
                    if op == libc::EPOLL_CTL_ADD {
                        self.evtlist_cnt += 1;
                        if self.evtlist_cnt > self.evtlist.len() {
                            self.grow_evtlist();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop a set of interests. Kernel errors are tolerated (the descriptor
    /// may already be closed), and the kernel call is skipped entirely for
    /// descriptors with a pending latch, which dispatch reconciles itself.
    pub fn pollset_del(&mut self, pds: &[PollFd]) {
        for pd in pds {
            let fd = pd.fd as usize;
            let old = self.events_mask(fd);
            {
                let data = &mut self.fd_data[fd];
                if pd.events.contains(Interest::IN) {
                    data.rd -= 1;
                }
                if pd.events.contains(Interest::OUT) {
                    data.wr -= 1;
                }
                if pd.events.contains(Interest::PRI) {
                    data.pri -= 1;
                }
            }
            let new = self.events_mask(fd);
            if new != old && self.fd_data[fd].revents == 0 {
                let op = if new != 0 {
                    libc::EPOLL_CTL_MOD
                } else {
                    libc::EPOLL_CTL_DEL
                };
                if self.ctl(op, pd.fd, new).is_ok() && op == libc::EPOLL_CTL_DEL {
                    self.evtlist_cnt -= 1;
                }
            }
        }
    }

    /// Make room in the descriptor table for a new descriptor.
    pub fn fd_new(&mut self, fd: RawFd) -> Result<()> {
        if fd < 0 {
            return Err(Error::Invalid);
        }
        self.ensure_fd(fd as usize);
        Ok(())
    }

    /// Refuse to close a descriptor that still has registered interests.
    pub fn fd_close(&mut self, fd: RawFd) -> Result<()> {
        let fd = fd as usize;
        if fd < self.fd_data.len() {
            let data = &self.fd_data[fd];
            if data.rd > 0 || data.wr > 0 || data.pri > 0 {
                return Err(Error::Busy);
            }
        }
        Ok(())
    }
}

/// Descriptor limit imposed by the event backend; 0 means unlimited (epoll
/// has no cap of its own).
pub(crate) fn backend_fd_limit() -> usize {
    0
}

/// One pass of the event pump, run by the idle fiber: wait for kernel
/// readiness up to the next sleep deadline, then make every waiter whose
/// events fired runnable.
pub(crate) fn dispatch() {
    let vp = sched::vp();

    let timeout: libc::c_int = if vp.sleep.is_empty() {
        -1
    } else {
        let due = unsafe { (*vp.sleep.root).due };
        let min_us = if due <= vp.last_clock {
            0
        } else {
            due - vp.last_clock
        };
        cmp::min(min_us / 1000, libc::c_int::MAX as u64) as libc::c_int
    };

    unsafe {
        if vp.reactor.pid != libc::getpid() {
            // The process forked. Rebuild the kernel state from scratch and
            // re-register the interests of everything on the IO queue.
            log::warn!("pid change detected, recreating the epoll instance");
            libc::close(vp.reactor.epfd);
            let epfd = libc::epoll_create(vp.reactor.fd_hint as i32);
            if epfd < 0 {
                return;
            }
            libc::fcntl(epfd, libc::F_SETFD, libc::FD_CLOEXEC);
            vp.reactor.epfd = epfd;
            vp.reactor.pid = libc::getpid();
            for data in vp.reactor.fd_data.iter_mut() {
                *data = FdData::default();
            }
            vp.reactor.evtlist_cnt = 0;

            let sentinel = vp.io_q.sentinel();
            let mut q = vp.io_q.first();
            while q != sentinel {
                let pq = (*q).owner();
                let pds = slice::from_raw_parts((*pq).pds, (*pq).npds);
                let _ = vp.reactor.pollset_add(pds);
                q = (*q).next;
            }
        }

        let nfd = libc::epoll_wait(
            vp.reactor.epfd,
            vp.reactor.evtlist.as_mut_ptr(),
            vp.reactor.evtlist.len() as libc::c_int,
            timeout,
        );
        if nfd <= 0 {
            return;
        }

        // Latch the kernel events; an error or hangup wakes every
        // registered interest on that descriptor.
        for i in 0..nfd as usize {
            let ev = vp.reactor.evtlist[i];
            let fd = ev.u64 as usize;
            vp.reactor.fd_data[fd].revents = ev.events;
            if ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                let mask = vp.reactor.events_mask(fd);
                vp.reactor.fd_data[fd].revents |= mask;
            }
        }

        // Project the latches through each waiter's requested interests.
        let sentinel = vp.io_q.sentinel();
        let mut q = vp.io_q.first();
        while q != sentinel {
            let next = (*q).next;
            let pq = (*q).owner();
            let pds = slice::from_raw_parts_mut((*pq).pds, (*pq).npds);
            let mut notify = false;
            for pd in pds.iter_mut() {
                let latched = vp.reactor.fd_data[pd.fd as usize].revents;
                if latched == 0 {
                    pd.revents = Interest::empty();
                    continue;
                }
                let mut revents = Interest::empty();
                if pd.events.contains(Interest::IN) && latched & libc::EPOLLIN as u32 != 0 {
                    revents |= Interest::IN;
                }
                if pd.events.contains(Interest::OUT) && latched & libc::EPOLLOUT as u32 != 0 {
                    revents |= Interest::OUT;
                }
                if pd.events.contains(Interest::PRI) && latched & libc::EPOLLPRI as u32 != 0 {
                    revents |= Interest::PRI;
                }
                if latched & libc::EPOLLERR as u32 != 0 {
                    revents |= Interest::ERR;
                }
                if latched & libc::EPOLLHUP as u32 != 0 {
                    revents |= Interest::HUP;
                }
                pd.revents = revents;
                if !revents.is_empty() {
                    notify = true;
                }
            }
            if notify {
                (*pq).link.unlink();
                (*pq).on_ioq = false;
                // No-op at the kernel for descriptors whose latch is still
                // set; the reconciliation below has the last word on those.
                vp.reactor.pollset_del(pds);

                let fiber = (*pq).fiber;
                if (*fiber).flags.contains(Flags::ON_SLEEPQ) {
                    sched::sleep_del(fiber);
                }
                (*fiber).state = State::Runnable;
                vp.run_q.push_back(&mut (*fiber).sched_link);
            }
            q = next;
        }

        // Clear the latches and bring kernel registration in line with the
        // post-notify reference counts.
        for i in 0..nfd as usize {
            let fd = vp.reactor.evtlist[i].u64 as libc::c_int;
            vp.reactor.fd_data[fd as usize].revents = 0;
            let mask = vp.reactor.events_mask(fd as usize);
            let op = if mask != 0 {
                libc::EPOLL_CTL_MOD
            } else {
                libc::EPOLL_CTL_DEL
            };
            if vp.reactor.ctl(op, fd, mask).is_ok() && op == libc::EPOLL_CTL_DEL {
                vp.reactor.evtlist_cnt -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn pd(fd: RawFd, events: Interest) -> [PollFd; 1] {
        [PollFd::new(fd, events)]
    }

    #[test]
    fn add_del_round_trip() {
        let mut reactor = Reactor::new(0).unwrap();
        let (rfd, wfd) = pipe();

        let pds = pd(rfd, Interest::IN);
        reactor.pollset_add(&pds).unwrap();
        assert_eq!(reactor.fd_data[rfd as usize].rd, 1);
        assert_eq!(reactor.events_mask(rfd as usize), libc::EPOLLIN as u32);

        reactor.pollset_add(&pds).unwrap();
        assert_eq!(reactor.fd_data[rfd as usize].rd, 2);

        reactor.pollset_del(&pds);
        assert_eq!(reactor.fd_data[rfd as usize].rd, 1);
        assert_eq!(reactor.events_mask(rfd as usize), libc::EPOLLIN as u32);

        reactor.pollset_del(&pds);
        assert_eq!(reactor.fd_data[rfd as usize].rd, 0);
        assert_eq!(reactor.events_mask(rfd as usize), 0);
        assert!(reactor.fd_close(rfd).is_ok());

        unsafe {
            libc::close(rfd);
            libc::close(wfd);
        }
    }

    #[test]
    fn mixed_interests_compose() {
        let mut reactor = Reactor::new(0).unwrap();
        let (rfd, wfd) = pipe();

        reactor.pollset_add(&pd(wfd, Interest::OUT)).unwrap();
        reactor
            .pollset_add(&pd(wfd, Interest::OUT | Interest::PRI))
            .unwrap();
        assert_eq!(
            reactor.events_mask(wfd as usize),
            (libc::EPOLLOUT | libc::EPOLLPRI) as u32
        );

        reactor.pollset_del(&pd(wfd, Interest::OUT | Interest::PRI));
        assert_eq!(reactor.events_mask(wfd as usize), libc::EPOLLOUT as u32);
        reactor.pollset_del(&pd(wfd, Interest::OUT));
        assert_eq!(reactor.events_mask(wfd as usize), 0);

        unsafe {
            libc::close(rfd);
            libc::close(wfd);
        }
    }

    #[test]
    fn close_refused_while_registered() {
        let mut reactor = Reactor::new(0).unwrap();
        let (rfd, wfd) = pipe();

        let pds = pd(rfd, Interest::IN);
        reactor.pollset_add(&pds).unwrap();
        assert!(matches!(reactor.fd_close(rfd), Err(Error::Busy)));
        reactor.pollset_del(&pds);
        assert!(reactor.fd_close(rfd).is_ok());

        unsafe {
            libc::close(rfd);
            libc::close(wfd);
        }
    }

    #[test]
    fn rejects_bad_entries() {
        let mut reactor = Reactor::new(0).unwrap();
        let bad_fd = [PollFd::new(-1, Interest::IN)];
        assert!(matches!(reactor.pollset_add(&bad_fd), Err(Error::Invalid)));

        let (rfd, wfd) = pipe();
        let no_events = [PollFd::new(rfd, Interest::empty())];
        assert!(matches!(reactor.pollset_add(&no_events), Err(Error::Invalid)));
        let out_only_bits = [PollFd::new(rfd, Interest::ERR)];
        assert!(matches!(
            reactor.pollset_add(&out_only_bits),
            Err(Error::Invalid)
        ));

        unsafe {
            libc::close(rfd);
            libc::close(wfd);
        }
    }

    #[test]
    fn rollback_on_partial_failure() {
        let mut reactor = Reactor::new(0).unwrap();
        let (rfd, wfd) = pipe();
        let closed = {
            let (r2, w2) = pipe();
            unsafe {
                libc::close(r2);
                libc::close(w2);
            }
            r2
        };

        let pds = [PollFd::new(rfd, Interest::IN), PollFd::new(closed, Interest::IN)];
        assert!(reactor.pollset_add(&pds).is_err());
        // The first entry must have been rolled back.
        assert_eq!(reactor.fd_data[rfd as usize].rd, 0);
        assert_eq!(reactor.events_mask(rfd as usize), 0);

        unsafe {
            libc::close(rfd);
            libc::close(wfd);
        }
    }
}
