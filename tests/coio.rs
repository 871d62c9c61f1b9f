use std::convert::TryInto;
use std::io::{Read, Write};
use std::mem;
use std::net::{TcpListener, TcpStream};
use std::os::raw::c_void;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use strand::coio::{self, CoListener, CoStream, Interest, PollFd};
use strand::fiber;
use strand::{Error, NO_TIMEOUT, NO_WAIT};

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

#[test]
fn read_waits_for_writer() {
    strand::init().unwrap();
    let (rfd, wfd) = pipe();

    let reader = fiber::start(move || {
        let fd = coio::open_fd(rfd).unwrap();
        let mut buf = [0u8; 16];
        let started = Instant::now();
        let n = fd.read(&mut buf, NO_TIMEOUT).unwrap();
        (buf[..n].to_vec(), started.elapsed())
    });
    let writer = fiber::start(move || {
        let fd = coio::open_fd(wfd).unwrap();
        fiber::sleep(Duration::from_millis(10)).unwrap();
        fd.write(b"hello\n", NO_TIMEOUT).unwrap()
    });

    let (data, elapsed) = reader.join().unwrap();
    assert_eq!(data, b"hello\n");
    assert!(elapsed >= Duration::from_millis(10));
    assert_eq!(writer.join().unwrap(), 6);
}

#[test]
fn poll_no_wait_returns_immediately() {
    strand::init().unwrap();
    let (rfd, _wfd) = pipe();
    let mut pds = [PollFd::new(rfd, Interest::IN)];
    assert_eq!(coio::poll(&mut pds, NO_WAIT).unwrap(), 0);
    assert!(pds[0].revents.is_empty());
}

#[test]
fn poll_times_out() {
    strand::init().unwrap();
    let (rfd, _wfd) = pipe();
    let mut pds = [PollFd::new(rfd, Interest::IN)];
    let started = Instant::now();
    assert_eq!(coio::poll(&mut pds, 20_000).unwrap(), 0);
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test]
fn poll_sees_readiness() {
    strand::init().unwrap();
    let (rfd, wfd) = pipe();
    assert_eq!(
        unsafe { libc::write(wfd, b"x".as_ptr() as *const c_void, 1) },
        1
    );
    let mut pds = [PollFd::new(rfd, Interest::IN)];
    assert_eq!(coio::poll(&mut pds, NO_TIMEOUT).unwrap(), 1);
    assert!(pds[0].revents.contains(Interest::IN));
}

#[test]
fn netfd_poll_times_out() {
    strand::init().unwrap();
    let (rfd, _wfd) = pipe();
    let fd = coio::open_fd(rfd).unwrap();
    assert!(matches!(
        fd.poll(Interest::IN, 10_000),
        Err(Error::TimedOut)
    ));
}

#[test]
fn interrupt_unblocks_read() {
    strand::init().unwrap();
    let (rfd, wfd) = pipe();

    let reader = fiber::start(move || {
        let fd = coio::open_fd(rfd).unwrap();
        let mut buf = [0u8; 8];
        let res = fd.read(&mut buf, NO_TIMEOUT);
        (fd, res)
    });
    fiber::sleep(Duration::from_millis(5)).unwrap();
    reader.handle().interrupt();
    let (fd, res) = reader.join().unwrap();
    assert!(matches!(res, Err(Error::Interrupted)));

    // The pipe is still open and undisturbed.
    assert_eq!(
        unsafe { libc::write(wfd, b"ab".as_ptr() as *const c_void, 2) },
        2
    );
    let mut buf = [0u8; 8];
    assert_eq!(fd.read(&mut buf, NO_TIMEOUT).unwrap(), 2);
    assert_eq!(&buf[..2], b"ab");
}

#[test]
fn close_busy_while_polled() {
    strand::init().unwrap();
    let (rfd, _wfd) = pipe();

    let reader = fiber::start(move || {
        let fd = coio::open_fd(rfd).unwrap();
        let mut buf = [0u8; 8];
        let res = fd.read(&mut buf, NO_TIMEOUT);
        fd.free();
        res
    });
    fiber::sleep(Duration::from_millis(5)).unwrap();

    // The reader holds a registered interest on rfd.
    let other = coio::open_fd(rfd).unwrap();
    assert!(matches!(other.close(), Err(Error::Busy)));

    reader.handle().interrupt();
    assert!(matches!(reader.join().unwrap(), Err(Error::Interrupted)));

    let other = coio::open_fd(rfd).unwrap();
    other.close().unwrap();
}

#[test]
fn full_write_drains_through_backpressure() {
    strand::init().unwrap();
    let (rfd, wfd) = pipe();
    // Well past the default pipe capacity.
    let size = 1 << 20;

    let writer = fiber::start(move || {
        let fd = coio::open_fd(wfd).unwrap();
        let data = vec![0x5au8; size];
        fd.write(&data, NO_TIMEOUT).unwrap()
    });
    let reader = fiber::start(move || {
        let fd = coio::open_fd(rfd).unwrap();
        let mut data = vec![0u8; size];
        let n = fd.read_fully(&mut data, NO_TIMEOUT).unwrap();
        assert!(data.iter().all(|&b| b == 0x5a));
        n
    });

    assert_eq!(writer.join().unwrap(), size);
    assert_eq!(reader.join().unwrap(), size);
}

#[test]
fn readv_and_writev() {
    strand::init().unwrap();
    let (rfd, wfd) = pipe();
    let rfd = coio::open_fd(rfd).unwrap();
    let wfd = coio::open_fd(wfd).unwrap();

    let one = b"one".to_vec();
    let two = b"twotwo".to_vec();
    let out = [
        libc::iovec {
            iov_base: one.as_ptr() as *mut c_void,
            iov_len: one.len(),
        },
        libc::iovec {
            iov_base: two.as_ptr() as *mut c_void,
            iov_len: two.len(),
        },
    ];
    assert_eq!(wfd.writev(&out, NO_TIMEOUT).unwrap(), 9);

    let mut a = [0u8; 4];
    let mut b = [0u8; 5];
    let input = [
        libc::iovec {
            iov_base: a.as_mut_ptr() as *mut c_void,
            iov_len: a.len(),
        },
        libc::iovec {
            iov_base: b.as_mut_ptr() as *mut c_void,
            iov_len: b.len(),
        },
    ];
    assert_eq!(rfd.readv(&input, NO_TIMEOUT).unwrap(), 9);
    assert_eq!(&a, b"onet");
    assert_eq!(&b, b"wotwo");
}

#[test]
fn sendmsg_recvmsg_roundtrip() {
    strand::init().unwrap();
    let (left, right) = UnixStream::pair().unwrap();
    let left = CoStream::new(left).unwrap();
    let right = CoStream::new(right).unwrap();

    let payload = b"datagram-ish".to_vec();
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut c_void,
        iov_len: payload.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    assert_eq!(
        left.netfd().sendmsg(&msg, 0, NO_TIMEOUT).unwrap(),
        payload.len()
    );

    let mut buf = vec![0u8; 64];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    let n = right.netfd().recvmsg(&mut msg, 0, NO_TIMEOUT).unwrap();
    assert_eq!(&buf[..n], payload.as_slice());
}

#[test]
fn costream_read_write() {
    strand::init().unwrap();
    let (reader_sock, writer_sock) = UnixStream::pair().unwrap();

    let reader = fiber::start(move || {
        let mut stream = CoStream::new(reader_sock).unwrap();
        let mut buf = vec![0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        buf
    });
    let writer = fiber::start(move || {
        let mut stream = CoStream::new(writer_sock).unwrap();
        stream.write_all(&[1, 2, 3, 4]).unwrap();
    });

    assert_eq!(reader.join().unwrap(), vec![1, 2, 3, 4]);
    writer.join().unwrap();
}

#[test]
fn listener_accepts_fiber_connection() {
    strand::init().unwrap();
    let tcp_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = tcp_listener.local_addr().unwrap();
    let listener: CoListener = tcp_listener.try_into().unwrap();

    let client = fiber::start(move || {
        fiber::sleep(Duration::from_millis(10)).unwrap();
        let mut stream = CoStream::connect(addr).unwrap();
        stream.write_with_timeout(b"ping", None).unwrap();
    });

    let mut accepted = listener.accept().unwrap();
    let mut buf = [0u8; 4];
    accepted
        .read_with_timeout(&mut buf, Some(Duration::from_secs(1)))
        .unwrap();
    assert_eq!(&buf, b"ping");
    client.join().unwrap();
}

#[test]
fn connect_reaches_listener() {
    strand::init().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nonblocking(true).unwrap();
    let fd = coio::open_socket(stream.into_raw_fd()).unwrap();
    fd.poll(Interest::OUT, 1_000_000).unwrap();
    fd.close().unwrap();
}
