//! Wake descriptor used to interrupt a blocked poll from another thread.
//!
//! Coalescing: any number of `notify()` calls before the loop drains the
//! descriptor produce a single wakeup.

use std::io;
use std::os::unix::io::RawFd;

use nix::errno::Errno;

pub struct WakeFd {
    read_fd: RawFd,
    write_fd: RawFd,
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// eventfd counter; one descriptor serves both ends
        fn open_wake_pair() -> io::Result<(RawFd, RawFd)> {
            let fd = Errno::result(unsafe {
                libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)
            })?;
            Ok((fd, fd))
        }
    } else {
        /// Self-pipe with both ends non-blocking
        fn open_wake_pair() -> io::Result<(RawFd, RawFd)> {
            let mut fds = [0 as RawFd; 2];
            Errno::result(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
            for fd in fds {
                unsafe {
                    let flags = libc::fcntl(fd, libc::F_GETFL);
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                    libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                }
            }
            Ok((fds[0], fds[1]))
        }
    }
}

impl WakeFd {
    pub fn create() -> io::Result<Self> {
        let (read_fd, write_fd) = open_wake_pair()?;
        Ok(Self { read_fd, write_fd })
    }

    /// Descriptor the loop polls for readability
    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn notify(&self) -> io::Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.write_fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        match Errno::result(ret) {
            // EAGAIN: counter full or pipe full, a wakeup is already pending
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Consume pending wakeups
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 || self.read_fd == self.write_fd {
                break;
            }
        }
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}
