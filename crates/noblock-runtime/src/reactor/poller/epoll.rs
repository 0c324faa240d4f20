//! epoll backend (Linux)

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use noblock_core::Interest;

use super::{timeout_ms, PollEvent, Poller};

fn epoll_bits(interest: Interest) -> u32 {
    let mut bits = 0u32;
    if interest.read {
        bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if interest.write {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

pub struct EpollPoller {
    epfd: RawFd,
    buf: Vec<libc::epoll_event>,
}

impl EpollPoller {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epfd = Errno::result(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            epfd,
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: epoll_bits(interest),
            u64: fd as u64,
        };
        Errno::result(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) })?;
        Ok(())
    }
}

impl Poller for EpollPoller {
    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        match Errno::result(ret) {
            Ok(_) | Err(Errno::ENOENT) | Err(Errno::EBADF) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn poll(&mut self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.buf.as_mut_ptr(),
                self.buf.len() as libc::c_int,
                timeout_ms(timeout),
            )
        };
        let n = match Errno::result(n) {
            Ok(n) => n as usize,
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for ev in &self.buf[..n] {
            let bits = ev.events;
            let error = bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            events.push(PollEvent {
                fd: ev.u64 as RawFd,
                readable: bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                error,
                invalid: false,
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}
