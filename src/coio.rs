//! Cooperative input/output.
//!
//! Every blocking-looking operation here follows the same recipe: attempt
//! the syscall on a non-blocking descriptor; retry on a spurious signal
//! interrupt; on would-block, suspend the calling fiber in [`poll`] until the
//! descriptor is ready (or the deadline passes); surface every other kernel
//! error unmodified. Only the fiber blocks; the OS thread keeps running
//! other fibers in the meantime.

use std::cell::Cell;
use std::convert::TryFrom;
use std::ffi::CString;
use std::io;
use std::mem::{self, ManuallyDrop};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::raw::c_void;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::sched;
use crate::tls::Destructor;
use crate::{Utime, NO_TIMEOUT};

bitflags! {
    /// Poll-style readiness interests. `IN`, `OUT` and `PRI` may be
    /// requested; `ERR`, `HUP` and `NVAL` only ever appear in results.
    pub struct Interest: i16 {
        const IN   = libc::POLLIN;
        const OUT  = libc::POLLOUT;
        const PRI  = libc::POLLPRI;
        const ERR  = libc::POLLERR;
        const HUP  = libc::POLLHUP;
        const NVAL = libc::POLLNVAL;
    }
}

/// One descriptor's entry in a [`poll`] call.
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    pub fd: RawFd,
    pub events: Interest,
    pub revents: Interest,
}

impl PollFd {
    pub fn new(fd: RawFd, events: Interest) -> Self {
        PollFd {
            fd,
            events,
            revents: Interest::empty(),
        }
    }
}

/// Suspend the current fiber until at least one descriptor in `pds` is ready
/// for a requested interest, the deadline passes, or the fiber is
/// interrupted.
///
/// Returns the number of entries with non-empty `revents`; `Ok(0)` means the
/// deadline passed with no event. With [`NO_TIMEOUT`] the call returns only
/// on an event or an interrupt; with [`NO_WAIT`] it performs a single pass
/// of the event pump and returns.
///
/// [`NO_TIMEOUT`]: crate::NO_TIMEOUT
/// [`NO_WAIT`]: crate::NO_WAIT
pub fn poll(pds: &mut [PollFd], timeout: Utime) -> Result<usize> {
    sched::poll_fds(pds, timeout)
}

thread_local! {
    static OSFD_LIMIT: Cell<usize> = Cell::new(0);
    static NETFD_FREE: Cell<*mut NetFdInner> = Cell::new(ptr::null_mut());
}

/// Process-level setup run once from `init`: ignore `SIGPIPE` (routine in
/// socket code) and raise the open-file soft limit to the hard limit.
pub(crate) fn os_init() -> Result<()> {
    unsafe {
        let mut sigact: libc::sigaction = mem::zeroed();
        sigact.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut sigact.sa_mask);
        sigact.sa_flags = 0;
        if libc::sigaction(libc::SIGPIPE, &sigact, ptr::null_mut()) < 0 {
            return Err(Error::last_os());
        }

        let mut rlim: libc::rlimit = mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) < 0 {
            return Err(Error::last_os());
        }
        let backend_limit = crate::event::backend_fd_limit();
        if backend_limit > 0 && rlim.rlim_max > backend_limit as libc::rlim_t {
            rlim.rlim_max = backend_limit as libc::rlim_t;
        }
        rlim.rlim_cur = rlim.rlim_max;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) < 0 {
            return Err(Error::last_os());
        }
        let limit = if rlim.rlim_max == libc::RLIM_INFINITY {
            0
        } else {
            rlim.rlim_max as usize
        };
        OSFD_LIMIT.with(|c| c.set(limit));
    }
    Ok(())
}

pub(crate) fn os_fd_limit() -> usize {
    OSFD_LIMIT.with(|c| c.get())
}

struct NetFdInner {
    osfd: RawFd,
    inuse: bool,
    private_data: *mut c_void,
    destructor: Option<Destructor>,
    next: *mut NetFdInner,
}

/// A non-blocking OS descriptor wrapped for cooperative I/O, with an opaque
/// user-data slot. Wrappers are recycled through a free list.
///
/// Dropping a `NetFd` releases the wrapper (running the user-data
/// destructor) but leaves the OS descriptor open; [`NetFd::close`] closes
/// it.
pub struct NetFd {
    inner: *mut NetFdInner,
}

fn netfd_new(osfd: RawFd, nonblock: bool, is_socket: bool) -> Result<NetFd> {
    sched::vp().reactor.fd_new(osfd)?;

    let recycled = NETFD_FREE.with(|c| {
        let head = c.get();
        if !head.is_null() {
            unsafe { c.set((*head).next) };
        }
        head
    });
    let inner = if recycled.is_null() {
        Box::into_raw(Box::new(NetFdInner {
            osfd,
            inuse: true,
            private_data: ptr::null_mut(),
            destructor: None,
            next: ptr::null_mut(),
        }))
    } else {
        unsafe {
            (*recycled).osfd = osfd;
            (*recycled).inuse = true;
            (*recycled).private_data = ptr::null_mut();
            (*recycled).destructor = None;
            (*recycled).next = ptr::null_mut();
        }
        recycled
    };
    let fd = NetFd { inner };

    if nonblock {
        // FIONBIO is one syscall instead of two; it only works on sockets.
        if is_socket {
            let mut on: libc::c_int = 1;
            if unsafe { libc::ioctl(osfd, libc::FIONBIO, &mut on) } != -1 {
                return Ok(fd);
            }
        }
        unsafe {
            let flags = libc::fcntl(osfd, libc::F_GETFL, 0);
            if flags < 0 || libc::fcntl(osfd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(Error::last_os());
            }
        }
    }
    Ok(fd)
}

unsafe fn release_inner(inner: *mut NetFdInner) {
    if !(*inner).inuse {
        return;
    }
    (*inner).inuse = false;
    if !(*inner).private_data.is_null() {
        if let Some(dtor) = (*inner).destructor {
            dtor((*inner).private_data);
        }
    }
    (*inner).private_data = ptr::null_mut();
    (*inner).destructor = None;
    NETFD_FREE.with(|c| {
        (*inner).next = c.get();
        c.set(inner);
    });
}

/// Wrap an already-open descriptor, switching it to non-blocking mode.
pub fn open_fd(osfd: RawFd) -> Result<NetFd> {
    netfd_new(osfd, true, false)
}

/// Wrap an already-open socket, switching it to non-blocking mode.
pub fn open_socket(osfd: RawFd) -> Result<NetFd> {
    netfd_new(osfd, true, true)
}

/// Open a FIFO or other special file cooperatively (`O_NONBLOCK` is OR'd in
/// so that the open itself cannot wedge the thread).
pub fn open(path: &str, oflags: i32, mode: libc::mode_t) -> Result<NetFd> {
    let cpath = CString::new(path).map_err(|_| Error::Invalid)?;
    loop {
        let osfd = unsafe { libc::open(cpath.as_ptr(), oflags | libc::O_NONBLOCK, mode) };
        if osfd >= 0 {
            return netfd_new(osfd, false, false).map_err(|e| {
                unsafe { libc::close(osfd) };
                e
            });
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::Io(err));
        }
    }
}

impl NetFd {
    pub fn fileno(&self) -> RawFd {
        unsafe { (*self.inner).osfd }
    }

    /// Close the OS descriptor and release the wrapper. Fails with `Busy`
    /// while other fibers still have interests registered on it; the
    /// descriptor stays open and the wrapper is leaked in that case, since
    /// the user data must not be destroyed while the descriptor is in use.
    pub fn close(self) -> Result<()> {
        let osfd = self.fileno();
        if let Err(e) = sched::vp().reactor.fd_close(osfd) {
            std::mem::forget(self);
            return Err(e);
        }
        drop(self);
        if unsafe { libc::close(osfd) } < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    /// Release the wrapper without touching the OS descriptor.
    pub fn free(self) {}

    /// Attach opaque data to the descriptor; a previous value is destroyed
    /// first.
    pub fn set_specific(&self, value: *mut c_void, destructor: Option<Destructor>) {
        unsafe {
            let inner = self.inner;
            if value != (*inner).private_data
                && !(*inner).private_data.is_null()
            {
                if let Some(dtor) = (*inner).destructor {
                    dtor((*inner).private_data);
                }
            }
            (*inner).private_data = value;
            (*inner).destructor = destructor;
        }
    }

    pub fn get_specific(&self) -> *mut c_void {
        unsafe { (*self.inner).private_data }
    }

    /// Wait for readiness on this single descriptor. Unlike [`poll`], a
    /// deadline is reported as `TimedOut` rather than a zero count.
    pub fn poll(&self, how: Interest, timeout: Utime) -> Result<()> {
        let mut pds = [PollFd::new(self.fileno(), how)];
        let n = poll(&mut pds, timeout)?;
        if n == 0 {
            return Err(Error::TimedOut);
        }
        if pds[0].revents.contains(Interest::NVAL) {
            return Err(Error::from_raw_os(libc::EBADF));
        }
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8], timeout: Utime) -> Result<usize> {
        loop {
            let n = unsafe {
                libc::read(self.fileno(), buf.as_mut_ptr() as *mut c_void, buf.len())
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            self.wait_or_fail(Interest::IN, timeout)?;
        }
    }

    /// Read until `buf` is full or the peer reaches end of stream; returns
    /// the number of bytes placed in `buf`.
    pub fn read_fully(&self, buf: &mut [u8], timeout: Utime) -> Result<usize> {
        let mut nread = 0;
        while nread < buf.len() {
            let n = self.read(&mut buf[nread..], timeout)?;
            if n == 0 {
                break;
            }
            nread += n;
        }
        Ok(nread)
    }

    pub fn readv(&self, iov: &[libc::iovec], timeout: Utime) -> Result<usize> {
        loop {
            let n = unsafe { libc::readv(self.fileno(), iov.as_ptr(), iov.len() as libc::c_int) };
            if n >= 0 {
                return Ok(n as usize);
            }
            self.wait_or_fail(Interest::IN, timeout)?;
        }
    }

    /// Single write attempt (waiting for readiness as needed); may return a
    /// short count.
    pub fn write_once(&self, buf: &[u8], timeout: Utime) -> Result<usize> {
        loop {
            let n = unsafe {
                libc::write(self.fileno(), buf.as_ptr() as *const c_void, buf.len())
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            self.wait_or_fail(Interest::OUT, timeout)?;
        }
    }

    /// Write the whole buffer, waiting for writability as often as needed.
    /// Short counts never escape: the result is `buf.len()` or an error.
    pub fn write(&self, buf: &[u8], timeout: Utime) -> Result<usize> {
        let mut nwritten = 0;
        while nwritten < buf.len() {
            nwritten += self.write_once(&buf[nwritten..], timeout)?;
        }
        Ok(nwritten)
    }

    /// Write the full contents of all vectors, like [`NetFd::write`] does
    /// for one buffer.
    pub fn writev(&self, iov: &[libc::iovec], timeout: Utime) -> Result<usize> {
        let total: usize = iov.iter().map(|v| v.iov_len).sum();
        let mut vecs: Vec<libc::iovec> = iov.to_vec();
        let mut left = total;
        while left > 0 {
            let n = unsafe {
                libc::writev(self.fileno(), vecs.as_ptr(), vecs.len() as libc::c_int)
            };
            if n < 0 {
                self.wait_or_fail(Interest::OUT, timeout)?;
                continue;
            }
            let mut n = n as usize;
            left -= n;
            if left == 0 {
                break;
            }
            // Skip past the fully written vectors and trim the partial one.
            while n > 0 && n >= vecs[0].iov_len {
                n -= vecs[0].iov_len;
                vecs.remove(0);
            }
            if n > 0 {
                vecs[0].iov_base = unsafe { (vecs[0].iov_base as *mut u8).add(n) } as *mut c_void;
                vecs[0].iov_len -= n;
            }
        }
        Ok(total)
    }

    pub fn recvfrom(
        &self,
        buf: &mut [u8],
        from: &mut libc::sockaddr_storage,
        timeout: Utime,
    ) -> Result<(usize, libc::socklen_t)> {
        loop {
            let mut fromlen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    self.fileno(),
                    buf.as_mut_ptr() as *mut c_void,
                    buf.len(),
                    0,
                    from as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                    &mut fromlen,
                )
            };
            if n >= 0 {
                return Ok((n as usize, fromlen));
            }
            self.wait_or_fail(Interest::IN, timeout)?;
        }
    }

    pub fn sendto(
        &self,
        buf: &[u8],
        to: &libc::sockaddr,
        tolen: libc::socklen_t,
        timeout: Utime,
    ) -> Result<usize> {
        loop {
            let n = unsafe {
                libc::sendto(
                    self.fileno(),
                    buf.as_ptr() as *const c_void,
                    buf.len(),
                    0,
                    to,
                    tolen,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            self.wait_or_fail(Interest::OUT, timeout)?;
        }
    }

    pub fn recvmsg(&self, msg: &mut libc::msghdr, flags: i32, timeout: Utime) -> Result<usize> {
        loop {
            let n = unsafe { libc::recvmsg(self.fileno(), msg, flags) };
            if n >= 0 {
                return Ok(n as usize);
            }
            self.wait_or_fail(Interest::IN, timeout)?;
        }
    }

    pub fn sendmsg(&self, msg: &libc::msghdr, flags: i32, timeout: Utime) -> Result<usize> {
        loop {
            let n = unsafe { libc::sendmsg(self.fileno(), msg, flags) };
            if n >= 0 {
                return Ok(n as usize);
            }
            self.wait_or_fail(Interest::OUT, timeout)?;
        }
    }

    /// Send a batch of datagrams. An error is reported only if nothing was
    /// sent; otherwise the number of messages that went out.
    pub fn sendmmsg(
        &self,
        msgvec: &mut [libc::mmsghdr],
        flags: i32,
        timeout: Utime,
    ) -> Result<usize> {
        let vlen = msgvec.len();
        if vlen == 0 {
            return Ok(0);
        }
        let mut left = vlen;
        let mut failure = None;
        while left > 0 {
            let head = unsafe { msgvec.as_mut_ptr().add(vlen - left) };
            let n = unsafe { libc::sendmmsg(self.fileno(), head, left as libc::c_uint, flags) };
            if n < 0 {
                if let Err(e) = self.wait_or_fail(Interest::OUT, timeout) {
                    failure = Some(e);
                    break;
                }
                continue;
            }
            left -= n as usize;
        }
        if left == vlen {
            Err(failure.unwrap_or_else(Error::last_os))
        } else {
            Ok(vlen - left)
        }
    }

    /// Accept one connection, returning the peer as a new non-blocking
    /// [`NetFd`].
    pub fn accept(&self, timeout: Utime) -> Result<NetFd> {
        loop {
            let osfd =
                unsafe { libc::accept(self.fileno(), ptr::null_mut(), ptr::null_mut()) };
            if osfd >= 0 {
                return netfd_new(osfd, true, true).map_err(|e| {
                    unsafe { libc::close(osfd) };
                    e
                });
            }
            self.wait_or_fail(Interest::IN, timeout)?;
        }
    }

    /// Establish a connection on this socket. Readiness for write signals
    /// completion of a non-blocking connect; `SO_ERROR` then tells whether
    /// it actually succeeded.
    pub fn connect(
        &self,
        addr: &libc::sockaddr,
        addrlen: libc::socklen_t,
        timeout: Utime,
    ) -> Result<()> {
        let mut after_eintr = false;
        loop {
            if unsafe { libc::connect(self.fileno(), addr, addrlen) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                after_eintr = true;
                continue;
            }
            let code = err.raw_os_error().unwrap_or(0);
            // A connect retried after a signal interrupt may report
            // EADDRINUSE for the address the first attempt already bound.
            if code != libc::EINPROGRESS && !(code == libc::EADDRINUSE && after_eintr) {
                return Err(Error::Io(err));
            }
            self.poll(Interest::OUT, timeout)?;

            let mut so_error: libc::c_int = 0;
            let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
            if unsafe {
                libc::getsockopt(
                    self.fileno(),
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut so_error as *mut libc::c_int as *mut c_void,
                    &mut len,
                )
            } < 0
            {
                return Err(Error::last_os());
            }
            if so_error != 0 {
                return Err(Error::from_raw_os(so_error));
            }
            return Ok(());
        }
    }

    /// Shared would-block handling: retry on signal interrupt, suspend on
    /// would-block, fail otherwise.
    fn wait_or_fail(&self, how: Interest, timeout: Utime) -> Result<()> {
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => Ok(()),
            io::ErrorKind::WouldBlock => self.poll(how, timeout),
            _ => Err(Error::Io(err)),
        }
    }
}

impl AsRawFd for NetFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fileno()
    }
}

impl Drop for NetFd {
    fn drop(&mut self) {
        unsafe { release_inner(self.inner) }
    }
}

/// A byte stream whose reads and writes suspend only the calling fiber.
pub struct CoStream {
    fd: NetFd,
}

impl CoStream {
    /// Take ownership of an fd-like object and switch it to non-blocking
    /// mode.
    pub fn new<T: IntoRawFd>(inner: T) -> Result<CoStream> {
        Ok(CoStream {
            fd: netfd_new(inner.into_raw_fd(), true, false)?,
        })
    }

    /// Connect to a remote TCP endpoint.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<CoStream> {
        let stream = TcpStream::connect(addr).map_err(Error::Io)?;
        stream.set_nonblocking(true).map_err(Error::Io)?;
        CoStream::new(stream)
    }

    /// Pull some bytes into `buf`; `None` waits without limit.
    pub fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        self.fd.read(buf, duration_to_utime(timeout))
    }

    /// Push some bytes from `buf`; `None` waits without limit.
    pub fn write_with_timeout(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        self.fd.write_once(buf, duration_to_utime(timeout))
    }

    pub fn netfd(&self) -> &NetFd {
        &self.fd
    }
}

fn duration_to_utime(timeout: Option<Duration>) -> Utime {
    match timeout {
        None => NO_TIMEOUT,
        Some(d) => d.as_micros() as Utime,
    }
}

impl io::Read for CoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fd.read(buf, NO_TIMEOUT).map_err(Into::into)
    }
}

impl io::Write for CoStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.fd.write_once(buf, NO_TIMEOUT).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for CoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.fileno()
    }
}

impl IntoRawFd for CoStream {
    fn into_raw_fd(self) -> RawFd {
        let this = ManuallyDrop::new(self);
        let osfd = this.fd.fileno();
        unsafe { ptr::read(&this.fd) }.free();
        osfd
    }
}

impl Drop for CoStream {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd.fileno()) };
    }
}

/// A TCP listener whose `accept` suspends only the calling fiber.
pub struct CoListener {
    inner: TcpListener,
}

impl CoListener {
    pub fn accept(&self) -> Result<CoStream> {
        loop {
            match self.inner.accept() {
                Ok((stream, _)) => return CoStream::new(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let mut pds = [PollFd::new(self.inner.as_raw_fd(), Interest::IN)];
                    poll(&mut pds, NO_TIMEOUT)?;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    pub fn inner_listener(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

impl TryFrom<TcpListener> for CoListener {
    type Error = Error;

    fn try_from(value: TcpListener) -> Result<Self> {
        value.set_nonblocking(true)?;
        Ok(CoListener { inner: value })
    }
}
