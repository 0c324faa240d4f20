//! # Non-blocking adapters
//!
//! Wrappers that turn would-block syscalls into fiber suspensions:
//!
//! ```ignore
//! let listener = NbListener::bind(&ctx, "127.0.0.1:7000".parse()?)?;
//! loop {
//!     let stream = listener.accept(&ctx).await?;
//!     ctx.spawn(move |ctx| async move {
//!         let mut buf = [0u8; 4096];
//!         let n = stream.read(&ctx, &mut buf).await?;
//!         stream.write_all(&ctx, &buf[..n]).await
//!     });
//! }
//! ```
//!
//! Every descriptor is switched to `O_NONBLOCK`. When a call would block
//! and the fiber is non-blocking (see [`FiberCtx::neverblocking`]), the
//! adapter waits for readiness and retries. Otherwise it blocks the thread
//! in poll(2), which is what a plain blocking call would do.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;

use noblock_core::{kdebug, NbError, NbResult, TimeoutKind, WaitMode};
use noblock_runtime::{FiberCtx, SchedulerRef};

/// Switch `fd` to non-blocking mode
pub fn set_nonblocking(fd: RawFd) -> NbResult<()> {
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK == 0 {
        Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    }
    Ok(())
}

/// Thread-blocking readiness wait, for fibers with the non-blocking flag off
fn block_until(fd: RawFd, mode: WaitMode) -> NbResult<()> {
    let events = match mode {
        WaitMode::Read => libc::POLLIN,
        WaitMode::Write => libc::POLLOUT,
    };
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    loop {
        match Errno::result(unsafe { libc::poll(&mut pfd, 1, -1) }) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Suspend the fiber (or block the thread) until `fd` is ready
async fn ready(ctx: &FiberCtx, mode: WaitMode, fd: RawFd) -> NbResult<()> {
    if ctx.neverblocking() {
        ctx.wait(mode, fd).await
    } else {
        block_until(fd, mode)
    }
}

fn to_sockaddr(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sin
}

fn from_sockaddr(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    )
}

fn tcp_socket() -> NbResult<RawFd> {
    let fd = Errno::result(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) })?;
    if let Err(e) = set_nonblocking(fd).and_then(|_| set_cloexec(fd)) {
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

fn set_cloexec(fd: RawFd) -> NbResult<()> {
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
    Ok(())
}

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int) -> NbResult<()> {
    let one: libc::c_int = 1;
    Errno::result(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of_val(&one) as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// A non-blocking stream descriptor (socket or pipe end) owned by a fiber
/// program. Closing it fails every fiber still waiting on it.
pub struct NbStream {
    fd: RawFd,
    sched: SchedulerRef,
}

impl NbStream {
    /// Take ownership of `fd`, switching it to non-blocking mode. `fd` is
    /// closed if that fails.
    pub fn from_raw_fd(ctx: &FiberCtx, fd: RawFd) -> NbResult<Self> {
        let stream = Self::owning(ctx, fd);
        set_nonblocking(fd)?;
        Ok(stream)
    }

    fn owning(ctx: &FiberCtx, fd: RawFd) -> Self {
        Self {
            fd,
            sched: ctx.scheduler_ref(),
        }
    }

    /// Connected pair of Unix stream sockets
    pub fn pair(ctx: &FiberCtx) -> NbResult<(NbStream, NbStream)> {
        let mut fds: [RawFd; 2] = [0; 2];
        Errno::result(unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        })?;
        // Both ends are owned before either can fail
        let (a, b) = (Self::owning(ctx, fds[0]), Self::owning(ctx, fds[1]));
        for end in [&a, &b] {
            set_nonblocking(end.fd)?;
            set_cloexec(end.fd)?;
        }
        Ok((a, b))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Read into `buf`; 0 means end of stream
    pub async fn read(&self, ctx: &FiberCtx, buf: &mut [u8]) -> NbResult<usize> {
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            match Errno::result(n) {
                Ok(n) => return Ok(n as usize),
                Err(Errno::EAGAIN) => ready(ctx, WaitMode::Read, self.fd).await?,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write some of `buf`, suspending until at least one byte is accepted
    pub async fn write(&self, ctx: &FiberCtx, buf: &[u8]) -> NbResult<usize> {
        loop {
            let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            match Errno::result(n) {
                Ok(n) => return Ok(n as usize),
                Err(Errno::EAGAIN) => ready(ctx, WaitMode::Write, self.fd).await?,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn write_all(&self, ctx: &FiberCtx, mut buf: &[u8]) -> NbResult<()> {
        while !buf.is_empty() {
            let n = self.write(ctx, buf).await?;
            if n == 0 {
                return Err(NbError::from(std::io::ErrorKind::WriteZero));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Read under a [`TimeoutKind::READ`] deadline (none when absent or zero)
    pub async fn read_timeout(
        &self,
        ctx: &FiberCtx,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> NbResult<usize> {
        ctx.with_timeout(timeout, TimeoutKind::READ, self.read(ctx, buf)).await
    }

    /// Half-close the write side
    pub fn shutdown_write(&self) -> NbResult<()> {
        Errno::result(unsafe { libc::shutdown(self.fd, libc::SHUT_WR) })?;
        Ok(())
    }
}

impl Drop for NbStream {
    fn drop(&mut self) {
        self.sched.close_descriptor(self.fd);
        unsafe { libc::close(self.fd) };
    }
}

impl std::fmt::Debug for NbStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NbStream").field("fd", &self.fd).finish()
    }
}

/// Open a TCP connection, suspending while the handshake is in flight
pub async fn connect(ctx: &FiberCtx, addr: SocketAddrV4) -> NbResult<NbStream> {
    // Owned before the first suspension so a timeout closes it
    let stream = NbStream {
        fd: tcp_socket()?,
        sched: ctx.scheduler_ref(),
    };
    let sin = to_sockaddr(addr);
    let ret = unsafe {
        libc::connect(
            stream.fd,
            &sin as *const _ as *const libc::sockaddr,
            std::mem::size_of_val(&sin) as libc::socklen_t,
        )
    };
    match Errno::result(ret) {
        Ok(_) => return Ok(stream),
        Err(Errno::EINPROGRESS) | Err(Errno::EINTR) => {}
        Err(e) => return Err(e.into()),
    }

    ready(ctx, WaitMode::Write, stream.fd).await?;

    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of_val(&err) as libc::socklen_t;
    Errno::result(unsafe {
        libc::getsockopt(
            stream.fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    if err != 0 {
        return Err(Errno::from_raw(err).into());
    }
    kdebug!("fd {}: connected to {}", stream.fd, addr);
    Ok(stream)
}

/// [`connect`] under a [`TimeoutKind::OPEN`] deadline
pub async fn connect_timeout(
    ctx: &FiberCtx,
    addr: SocketAddrV4,
    timeout: Option<Duration>,
) -> NbResult<NbStream> {
    ctx.with_timeout(timeout, TimeoutKind::OPEN, connect(ctx, addr)).await
}

/// A listening TCP socket
pub struct NbListener {
    stream: NbStream,
}

impl NbListener {
    /// Bind and listen. Port 0 picks an ephemeral port; see [`local_addr`](Self::local_addr).
    pub fn bind(ctx: &FiberCtx, addr: SocketAddrV4) -> NbResult<Self> {
        let stream = NbStream {
            fd: tcp_socket()?,
            sched: ctx.scheduler_ref(),
        };
        set_opt(stream.fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
        let sin = to_sockaddr(addr);
        Errno::result(unsafe {
            libc::bind(
                stream.fd,
                &sin as *const _ as *const libc::sockaddr,
                std::mem::size_of_val(&sin) as libc::socklen_t,
            )
        })?;
        Errno::result(unsafe { libc::listen(stream.fd, 1024) })?;
        Ok(Self { stream })
    }

    pub fn local_addr(&self) -> NbResult<SocketAddrV4> {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of_val(&sin) as libc::socklen_t;
        Errno::result(unsafe {
            libc::getsockname(self.stream.fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len)
        })?;
        Ok(from_sockaddr(&sin))
    }

    pub fn fd(&self) -> RawFd {
        self.stream.fd
    }

    /// Wait for the next connection
    pub async fn accept(&self, ctx: &FiberCtx) -> NbResult<(NbStream, SocketAddrV4)> {
        loop {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of_val(&sin) as libc::socklen_t;
            match accept_raw(self.stream.fd, &mut sin, &mut len) {
                Ok(fd) => {
                    let stream = NbStream::owning(ctx, fd);
                    // TCP_NODELAY is best effort
                    let _ = set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY);
                    return Ok((stream, from_sockaddr(&sin)));
                }
                Err(Errno::EAGAIN) | Err(Errno::ECONNABORTED) => {
                    ready(ctx, WaitMode::Read, self.stream.fd).await?
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// Accepted descriptor, already non-blocking and close-on-exec
        fn accept_raw(
            listener: RawFd,
            sin: &mut libc::sockaddr_in,
            len: &mut libc::socklen_t,
        ) -> Result<RawFd, Errno> {
            Errno::result(unsafe {
                libc::accept4(
                    listener,
                    sin as *mut _ as *mut libc::sockaddr,
                    len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            })
        }
    } else {
        fn accept_raw(
            listener: RawFd,
            sin: &mut libc::sockaddr_in,
            len: &mut libc::socklen_t,
        ) -> Result<RawFd, Errno> {
            let fd = Errno::result(unsafe {
                libc::accept(listener, sin as *mut _ as *mut libc::sockaddr, len)
            })?;
            let setup = Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })
                .and_then(|_| Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) }))
                .and_then(|fl| Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK) }));
            match setup {
                Ok(_) => Ok(fd),
                Err(e) => {
                    unsafe { libc::close(fd) };
                    Err(e)
                }
            }
        }
    }
}

/// Buffered line reader over an [`NbStream`] with an optional per-read
/// deadline
pub struct NbBufReader {
    stream: NbStream,
    buf: Vec<u8>,
    pos: usize,
    filled: usize,
    read_timeout: Option<Duration>,
}

impl NbBufReader {
    pub fn new(stream: NbStream) -> Self {
        Self::with_capacity(8192, stream)
    }

    pub fn with_capacity(capacity: usize, stream: NbStream) -> Self {
        Self {
            stream,
            buf: vec![0; capacity.max(1)],
            pos: 0,
            filled: 0,
            read_timeout: None,
        }
    }

    /// Deadline for each refill; expiry fails the read with
    /// [`TimeoutKind::READ`]
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn get_ref(&self) -> &NbStream {
        &self.stream
    }

    pub fn into_inner(self) -> NbStream {
        self.stream
    }

    /// Buffered bytes, refilling from the stream when empty. Empty at end
    /// of stream.
    pub async fn fill_buf(&mut self, ctx: &FiberCtx) -> NbResult<&[u8]> {
        if self.pos >= self.filled {
            let n = self
                .stream
                .read_timeout(ctx, &mut self.buf, self.read_timeout)
                .await?;
            self.pos = 0;
            self.filled = n;
        }
        Ok(&self.buf[self.pos..self.filled])
    }

    pub fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.filled);
    }

    /// Append bytes up to and including `b'\n'` to `out`. Returns the count
    /// appended; 0 at end of stream.
    pub async fn read_line(&mut self, ctx: &FiberCtx, out: &mut Vec<u8>) -> NbResult<usize> {
        let mut total = 0;
        loop {
            let (done, used) = {
                let available = self.fill_buf(ctx).await?;
                if available.is_empty() {
                    return Ok(total);
                }
                match available.iter().position(|&b| b == b'\n') {
                    Some(i) => {
                        out.extend_from_slice(&available[..=i]);
                        (true, i + 1)
                    }
                    None => {
                        out.extend_from_slice(available);
                        (false, available.len())
                    }
                }
            };
            self.consume(used);
            total += used;
            if done {
                return Ok(total);
            }
        }
    }

    /// Fill `out` from the buffer first, then the stream
    pub async fn read(&mut self, ctx: &FiberCtx, out: &mut [u8]) -> NbResult<usize> {
        let available = self.fill_buf(ctx).await?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8080);
        assert_eq!(from_sockaddr(&to_sockaddr(addr)), addr);
    }

    #[test]
    fn test_set_nonblocking() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        set_nonblocking(fds[0]).unwrap();
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        let mut byte = [0u8; 1];
        let n = unsafe { libc::read(fds[0], byte.as_mut_ptr() as *mut libc::c_void, 1) };
        assert_eq!(Errno::result(n), Err(Errno::EAGAIN));
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
