//! Timeout- and signal-mask-aware socket send/recv.
//!
//! Each primitive computes one absolute deadline at entry, then alternates
//! a single-fd ppoll wait with a `MSG_DONTWAIT | MSG_NOSIGNAL` transfer
//! until everything moved or a terminating condition hit. Partial progress
//! is the return value: a timeout, a delivered signal, or a peer close
//! yields `Ok(moved_so_far)`, never an error. `MSG_NOSIGNAL` keeps a dead
//! peer from killing the process with SIGPIPE.
//!
//! The `_block` variants close the classic cancellation race: all signals
//! are blocked, the caller's "should break?" predicate is consulted inside
//! that window, and only then does the wait begin with the caller's mask —
//! so a cancel signal either flips the predicate before the wait or wakes
//! the wait itself; it cannot fall between.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;
use std::ptr;

use crate::error::{Error, Result};
use crate::sigset::SigSet;
use crate::timespec::TimeSpec;

const XFER_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;

/// Outcome of one readiness wait.
enum Wait {
    Ready,
    /// Deadline passed, or a masked-in signal arrived. Both are terminal
    /// for the caller with whatever byte count it has.
    Expired,
}

/// Wait for `events` on `fd` until `deadline`. `mask` is the signal mask in
/// effect during the wait (ppoll swaps it atomically; the portable fallback
/// brackets poll with pthread_sigmask).
fn wait_ready(
    fd: RawFd,
    events: libc::c_short,
    deadline: Option<TimeSpec>,
    mask: Option<&SigSet>,
) -> Result<Wait> {
    loop {
        let remaining = deadline.map(|d| d.saturating_sub(TimeSpec::now_monotonic()));
        let mut pfd = libc::pollfd { fd, events, revents: 0 };

        #[cfg(target_os = "linux")]
        let rc = {
            let ts = remaining.map(|r| r.as_libc());
            let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const libc::timespec);
            let mask_ptr = mask.map_or(ptr::null(), |m| m.as_ptr());
            unsafe { libc::ppoll(&mut pfd, 1, ts_ptr, mask_ptr) }
        };

        #[cfg(not(target_os = "linux"))]
        let rc = {
            // No ppoll: swap the mask in around a plain poll. The swap is
            // not atomic with the wait, which is exactly why the _block
            // variants exist.
            let ms = remaining.map_or(-1, |r| {
                (r.as_nanos() / 1_000_000).min(libc::c_int::MAX as i128) as libc::c_int
            });
            let prev = match mask {
                Some(m) => Some(m.swap_thread_mask()?),
                None => None,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
            if let Some(prev) = prev {
                let _ = prev.swap_thread_mask();
            }
            rc
        };

        if rc < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                // Signal delivery during the wait: terminal, partial count
                // goes back to the caller.
                Some(libc::EINTR) => return Ok(Wait::Expired),
                // Spurious wakeup; re-arm with the remaining time.
                Some(libc::EAGAIN) => continue,
                _ => return Err(Error::Io(err)),
            }
        }
        if rc == 0 {
            return Ok(Wait::Expired);
        }
        return Ok(Wait::Ready);
    }
}

fn deadline_from(timeout: Option<TimeSpec>) -> Option<TimeSpec> {
    timeout.map(|t| TimeSpec::now_monotonic().checked_add(t))
}

/// Send all of `data`, returning the count actually moved (short on
/// timeout, signal, or dead peer).
pub fn send(fd: RawFd, data: &[u8], timeout: Option<TimeSpec>, mask: Option<&SigSet>) -> Result<usize> {
    let deadline = deadline_from(timeout);
    let mut done = 0;
    while done < data.len() {
        match wait_ready(fd, libc::POLLOUT, deadline, mask)? {
            Wait::Expired => return Ok(done),
            Wait::Ready => {}
        }
        let rest = &data[done..];
        let n = loop {
            let n = unsafe { libc::send(fd, rest.as_ptr() as *const libc::c_void, rest.len(), XFER_FLAGS) };
            if n >= 0 {
                break n as usize;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                // Readiness was stale; go back to the wait.
                Some(libc::EAGAIN) => break 0,
                Some(libc::EPIPE) => return Ok(done),
                _ => return Err(Error::last_os()),
            }
        };
        done += n;
    }
    Ok(done)
}

/// Receive exactly `out.len()` bytes, short on timeout, signal, or EOF.
pub fn recv(fd: RawFd, out: &mut [u8], timeout: Option<TimeSpec>, mask: Option<&SigSet>) -> Result<usize> {
    let deadline = deadline_from(timeout);
    let mut done = 0;
    while done < out.len() {
        match wait_ready(fd, libc::POLLIN, deadline, mask)? {
            Wait::Expired => return Ok(done),
            Wait::Ready => {}
        }
        let rest = &mut out[done..];
        let n = loop {
            let n = unsafe { libc::recv(fd, rest.as_mut_ptr() as *mut libc::c_void, rest.len(), XFER_FLAGS) };
            if n > 0 {
                break n as usize;
            }
            if n == 0 {
                // Peer closed mid-transfer.
                return Ok(done);
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => break 0,
                _ => return Err(Error::last_os()),
            }
        };
        done += n;
    }
    Ok(done)
}

/// Vectored send. `iovs` is advanced past transferred bytes in place, the
/// way `write_all_vectored` consumes its slices.
pub fn sendv(fd: RawFd, iovs: &mut [IoSlice<'_>], timeout: Option<TimeSpec>, mask: Option<&SigSet>) -> Result<usize> {
    let deadline = deadline_from(timeout);
    let total: usize = iovs.iter().map(|s| s.len()).sum();
    let mut slices = iovs;
    let mut done = 0;
    while done < total {
        match wait_ready(fd, libc::POLLOUT, deadline, mask)? {
            Wait::Expired => return Ok(done),
            Wait::Ready => {}
        }
        let n = loop {
            let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
            // IoSlice is ABI-compatible with iovec.
            hdr.msg_iov = slices.as_mut_ptr() as *mut libc::iovec;
            hdr.msg_iovlen = slices.len() as _;
            let n = unsafe { libc::sendmsg(fd, &hdr, XFER_FLAGS) };
            if n >= 0 {
                break n as usize;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => break 0,
                Some(libc::EPIPE) => return Ok(done),
                _ => return Err(Error::last_os()),
            }
        };
        done += n;
        IoSlice::advance_slices(&mut slices, n);
    }
    Ok(done)
}

/// Vectored receive filling every slice, short on timeout, signal, or EOF.
/// `iovs` is advanced past filled bytes in place.
pub fn recvv(fd: RawFd, iovs: &mut [IoSliceMut<'_>], timeout: Option<TimeSpec>, mask: Option<&SigSet>) -> Result<usize> {
    let deadline = deadline_from(timeout);
    let total: usize = iovs.iter().map(|s| s.len()).sum();
    let mut slices = iovs;
    let mut done = 0;
    while done < total {
        match wait_ready(fd, libc::POLLIN, deadline, mask)? {
            Wait::Expired => return Ok(done),
            Wait::Ready => {}
        }
        let n = loop {
            let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
            hdr.msg_iov = slices.as_mut_ptr() as *mut libc::iovec;
            hdr.msg_iovlen = slices.len() as _;
            let n = unsafe { libc::recvmsg(fd, &mut hdr, XFER_FLAGS) };
            if n > 0 {
                break n as usize;
            }
            if n == 0 {
                return Ok(done);
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => break 0,
                _ => return Err(Error::last_os()),
            }
        };
        done += n;
        IoSliceMut::advance_slices(&mut slices, n);
    }
    Ok(done)
}

fn with_all_blocked<T>(is_break: Option<&dyn Fn() -> bool>, run: impl FnOnce() -> Result<T>, zero: T) -> Result<T> {
    let saved = SigSet::full().swap_thread_mask()?;
    let out = match is_break {
        Some(f) if f() => Ok(zero),
        _ => run(),
    };
    let _ = saved.swap_thread_mask();
    out
}

/// `send` with the signal/wait race closed: all signals blocked, `is_break`
/// consulted, then the base call runs with `mask` governing the wait.
pub fn send_block(
    fd: RawFd,
    data: &[u8],
    timeout: Option<TimeSpec>,
    mask: Option<&SigSet>,
    is_break: Option<&dyn Fn() -> bool>,
) -> Result<usize> {
    with_all_blocked(is_break, || send(fd, data, timeout, mask), 0)
}

pub fn recv_block(
    fd: RawFd,
    out: &mut [u8],
    timeout: Option<TimeSpec>,
    mask: Option<&SigSet>,
    is_break: Option<&dyn Fn() -> bool>,
) -> Result<usize> {
    with_all_blocked(is_break, || recv(fd, out, timeout, mask), 0)
}

pub fn sendv_block(
    fd: RawFd,
    iovs: &mut [IoSlice<'_>],
    timeout: Option<TimeSpec>,
    mask: Option<&SigSet>,
    is_break: Option<&dyn Fn() -> bool>,
) -> Result<usize> {
    with_all_blocked(is_break, || sendv(fd, iovs, timeout, mask), 0)
}

pub fn recvv_block(
    fd: RawFd,
    iovs: &mut [IoSliceMut<'_>],
    timeout: Option<TimeSpec>,
    mask: Option<&SigSet>,
    is_break: Option<&dyn Fn() -> bool>,
) -> Result<usize> {
    with_all_blocked(is_break, || recvv(fd, iovs, timeout, mask), 0)
}

/// A socket plus the I/O policy to apply to it: default timeouts, the
/// signal mask to honor while waiting, and an optional abort predicate.
/// The fd is borrowed, not owned; the creator closes it.
pub struct NetIo {
    fd: RawFd,
    send_timeout: Option<TimeSpec>,
    recv_timeout: Option<TimeSpec>,
    mask: Option<SigSet>,
    break_fn: Option<Box<dyn Fn() -> bool>>,
}

impl NetIo {
    pub fn new(fd: RawFd) -> NetIo {
        NetIo { fd, send_timeout: None, recv_timeout: None, mask: None, break_fn: None }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// `None` waits forever.
    pub fn set_send_timeout(&mut self, timeout: Option<TimeSpec>) -> &mut Self {
        self.send_timeout = timeout;
        self
    }

    pub fn set_recv_timeout(&mut self, timeout: Option<TimeSpec>) -> &mut Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn set_mask(&mut self, mask: Option<SigSet>) -> &mut Self {
        self.mask = mask;
        self
    }

    pub fn set_break_fn(&mut self, f: Option<Box<dyn Fn() -> bool>>) -> &mut Self {
        self.break_fn = f;
        self
    }

    fn break_ref(&self) -> Option<&dyn Fn() -> bool> {
        self.break_fn.as_deref()
    }

    pub fn send(&self, data: &[u8]) -> Result<usize> {
        send_block(self.fd, data, self.send_timeout, self.mask.as_ref(), self.break_ref())
    }

    pub fn recv(&self, out: &mut [u8]) -> Result<usize> {
        recv_block(self.fd, out, self.recv_timeout, self.mask.as_ref(), self.break_ref())
    }

    pub fn sendv(&self, iovs: &mut [IoSlice<'_>]) -> Result<usize> {
        sendv_block(self.fd, iovs, self.send_timeout, self.mask.as_ref(), self.break_ref())
    }

    pub fn recvv(&self, iovs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        recvv_block(self.fd, iovs, self.recv_timeout, self.mask.as_ref(), self.break_ref())
    }
}

impl std::fmt::Debug for NetIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetIo")
            .field("fd", &self.fd)
            .field("send_timeout", &self.send_timeout)
            .field("recv_timeout", &self.recv_timeout)
            .field("has_break_fn", &self.break_fn.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::ChunkBuf;
    use socket2::{Domain, Socket, Type};
    use std::os::unix::io::AsRawFd;

    fn ms(n: i64) -> TimeSpec {
        TimeSpec::new(0, n * 1_000_000)
    }

    fn stream_pair() -> (Socket, Socket) {
        Socket::pair(Domain::UNIX, Type::STREAM, None).expect("socketpair")
    }

    #[test]
    fn test_send_recv_round_trip() {
        let (a, b) = stream_pair();
        let msg = b"over the wire";
        assert_eq!(send(a.as_raw_fd(), msg, None, None).unwrap(), msg.len());

        let mut out = vec![0u8; msg.len()];
        assert_eq!(recv(b.as_raw_fd(), &mut out, None, None).unwrap(), msg.len());
        assert_eq!(&out, msg);
    }

    #[test]
    fn test_recv_timeout_returns_partial() {
        let (a, b) = stream_pair();
        send(a.as_raw_fd(), b"abc", None, None).unwrap();

        // Wants 8, only 3 will ever arrive; the deadline ends the wait.
        let mut out = vec![0u8; 8];
        let n = recv(b.as_raw_fd(), &mut out, Some(ms(80)), None).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&out[..3], b"abc");
    }

    #[test]
    fn test_recv_eof_returns_partial() {
        let (a, b) = stream_pair();
        send(a.as_raw_fd(), b"tail", None, None).unwrap();
        drop(a);

        let mut out = vec![0u8; 64];
        let n = recv(b.as_raw_fd(), &mut out, None, None).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&out[..4], b"tail");
    }

    #[test]
    fn test_send_timeout_on_full_pipe() {
        let (a, _b) = stream_pair();
        // Nobody reads from b, so the kernel buffer eventually fills and
        // the deadline kicks in with a short count.
        let big = vec![0x5au8; 32 * 1024 * 1024];
        let n = send(a.as_raw_fd(), &big, Some(ms(120)), None).unwrap();
        assert!(n < big.len());
    }

    #[test]
    fn test_vectored_round_trip() {
        let (a, b) = stream_pair();
        let (one, two, three) = (b"scatter ".to_vec(), b"gather ".to_vec(), b"io".to_vec());
        let mut iovs = vec![IoSlice::new(&one), IoSlice::new(&two), IoSlice::new(&three)];
        assert_eq!(sendv(a.as_raw_fd(), &mut iovs, None, None).unwrap(), 17);

        let mut front = vec![0u8; 8];
        let mut back = vec![0u8; 9];
        let mut out = vec![IoSliceMut::new(&mut front), IoSliceMut::new(&mut back)];
        assert_eq!(recvv(b.as_raw_fd(), &mut out, None, None).unwrap(), 17);
        drop(out);
        assert_eq!(&front, b"scatter ");
        assert_eq!(&back, b"gather io");
    }

    #[test]
    fn test_break_predicate_short_circuits() {
        let (a, _b) = stream_pair();
        let n = send_block(a.as_raw_fd(), b"never sent", None, None, Some(&|| true)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_netio_wrapper_defaults_and_timeouts() {
        let (a, b) = stream_pair();
        let mut tx = NetIo::new(a.as_raw_fd());
        let mut rx = NetIo::new(b.as_raw_fd());
        tx.set_send_timeout(Some(ms(500)));
        rx.set_recv_timeout(Some(ms(80)));

        assert_eq!(tx.send(b"hello").unwrap(), 5);
        let mut out = vec![0u8; 5];
        assert_eq!(rx.recv(&mut out).unwrap(), 5);
        assert_eq!(&out, b"hello");

        // Nothing more in flight: the recv timeout produces a zero count.
        assert_eq!(rx.recv(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_buffer_to_socket_zero_copy() -> anyhow::Result<()> {
        let (a, b) = stream_pair();
        let mut src = ChunkBuf::new(100);
        let payload: Vec<u8> = (0..350).map(|i| (i % 251) as u8).collect();
        src.write(&payload)?;

        // Drain the buffer into the socket straight from its chunks.
        let sent = {
            let (got, mut iovs) = src.dread_lock(350)?;
            assert_eq!(got, 350);
            sendv(a.as_raw_fd(), &mut iovs, None, None)?
        };
        src.dread_unlock(sent)?;
        assert_eq!(sent, 350);
        assert_eq!(src.len(), 0);

        // Land the bytes in another buffer through its write reservation.
        let mut dst = ChunkBuf::new(100);
        let received = {
            let mut iovs = dst.dwrite_lock(350)?;
            recvv(b.as_raw_fd(), &mut iovs, None, None)?
        };
        dst.dwrite_unlock(received)?;
        assert_eq!(received, 350);

        let mut out = vec![0u8; 350];
        dst.read(&mut out)?;
        assert_eq!(out, payload);
        Ok(())
    }

    /// 9 MB through a ChunkBuf into a non-blocking pipe, drained
    /// incrementally by the read end, byte-for-byte identical at the far
    /// side.
    #[test]
    fn test_pipe_drain_nine_megabytes() -> anyhow::Result<()> {
        const TOTAL: usize = 9 * 1024 * 1024;

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);
        for fd in [rd, wr] {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                let fdflags = libc::fcntl(fd, libc::F_GETFD);
                libc::fcntl(fd, libc::F_SETFD, fdflags | libc::FD_CLOEXEC);
            }
        }

        let src: Vec<u8> = (0..TOTAL).map(|i| (i as u8) ^ ((i >> 8) as u8)).collect();
        let mut buf = ChunkBuf::new(4096);
        buf.set_limit(10 * 1024 * 1024);
        buf.write(&src)?;

        let mut dest = Vec::with_capacity(TOTAL);
        let mut scratch = vec![0u8; 64 * 1024];
        while buf.len() > 0 {
            // Offer the head of the buffer; take whatever the pipe accepts.
            let wrote = {
                let (_, iovs) = buf.dread_lock(256 * 1024)?;
                let n = unsafe {
                    libc::writev(wr, iovs.as_ptr() as *const libc::iovec, iovs.len() as libc::c_int)
                };
                if n < 0 {
                    let err = std::io::Error::last_os_error();
                    assert_eq!(err.raw_os_error(), Some(libc::EAGAIN), "unexpected writev error: {err}");
                    0
                } else {
                    n as usize
                }
            };
            buf.dread_unlock(wrote)?;

            // Drain the read end so the writer can make progress.
            loop {
                let n = unsafe {
                    libc::read(rd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len())
                };
                if n <= 0 {
                    break;
                }
                dest.extend_from_slice(&scratch[..n as usize]);
            }
        }

        unsafe { libc::close(wr) };
        loop {
            let n = unsafe { libc::read(rd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len()) };
            if n <= 0 {
                break;
            }
            dest.extend_from_slice(&scratch[..n as usize]);
        }
        unsafe { libc::close(rd) };

        assert_eq!(dest.len(), TOTAL);
        assert_eq!(dest, src);
        Ok(())
    }
}
