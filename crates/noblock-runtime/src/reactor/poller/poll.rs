//! poll(2) backend, the portable fallback

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use noblock_core::Interest;

use super::{timeout_ms, PollEvent, Poller};

fn poll_bits(interest: Interest) -> libc::c_short {
    let mut bits = 0;
    if interest.read {
        bits |= libc::POLLIN;
    }
    if interest.write {
        bits |= libc::POLLOUT;
    }
    bits
}

/// Keeps a dense `pollfd` array; removal swaps the last entry into the hole.
pub struct PollPoller {
    fds: Vec<libc::pollfd>,
    index: HashMap<RawFd, usize>,
    max_events: usize,
}

impl PollPoller {
    pub fn new(max_events: usize) -> io::Result<Self> {
        Ok(Self {
            fds: Vec::new(),
            index: HashMap::new(),
            max_events: max_events.max(1),
        })
    }
}

impl Poller for PollPoller {
    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.index.contains_key(&fd) {
            return Err(Errno::EEXIST.into());
        }
        self.index.insert(fd, self.fds.len());
        self.fds.push(libc::pollfd {
            fd,
            events: poll_bits(interest),
            revents: 0,
        });
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self.index.get(&fd) {
            Some(&i) => {
                self.fds[i].events = poll_bits(interest);
                Ok(())
            }
            None => Err(Errno::ENOENT.into()),
        }
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        if let Some(i) = self.index.remove(&fd) {
            self.fds.swap_remove(i);
            if let Some(moved) = self.fds.get(i) {
                self.index.insert(moved.fd, i);
            }
        }
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()> {
        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        match Errno::result(n) {
            Ok(0) | Err(Errno::EINTR) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        for pfd in self.fds.iter().filter(|p| p.revents != 0).take(self.max_events) {
            let bits = pfd.revents;
            events.push(PollEvent {
                fd: pfd.fd,
                readable: bits & libc::POLLIN != 0,
                writable: bits & libc::POLLOUT != 0,
                error: bits & (libc::POLLERR | libc::POLLHUP) != 0,
                invalid: bits & libc::POLLNVAL != 0,
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_readable_after_write() {
        let (r, w) = pipe();
        let mut poller = PollPoller::new(8).unwrap();
        poller.add(r, Interest::READ).unwrap();
        assert!(poller.add(r, Interest::READ).is_err());

        let mut events = Vec::new();
        poller.poll(&mut events, Some(Duration::ZERO)).unwrap();
        assert!(events.is_empty());

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) }, 1);
        poller.poll(&mut events, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].readable);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_delete_keeps_index_dense() {
        let (r1, w1) = pipe();
        let (r2, w2) = pipe();
        let mut poller = PollPoller::new(8).unwrap();
        poller.add(r1, Interest::READ).unwrap();
        poller.add(r2, Interest::READ).unwrap();
        poller.delete(r1).unwrap();
        poller.modify(r2, Interest::READ).unwrap();
        assert!(poller.modify(r1, Interest::READ).is_err());

        assert_eq!(unsafe { libc::write(w2, b"y".as_ptr() as *const libc::c_void, 1) }, 1);
        let mut events = Vec::new();
        poller.poll(&mut events, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(events.iter().map(|e| e.fd).collect::<Vec<_>>(), vec![r2]);
        unsafe {
            for fd in [r1, w1, r2, w2] {
                libc::close(fd);
            }
        }
    }
}
