//! The administrative channel carrying bind requests.
//!
//! The kernel ties a devmem binding to the netlink socket that created it, so
//! each [`crate::Binding`] owns its own channel and tearing the binding down
//! means closing that channel.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::time::Duration;

/// Request/response transport for control-plane messages.
pub trait ControlChannel {
    /// Queues one encoded message for delivery.
    fn send(&mut self, msg: &[u8]) -> io::Result<()>;

    /// Waits at most `wait` for one datagram. `Ok(None)` means nothing
    /// arrived; a zero `wait` is a single non-blocking attempt.
    fn recv(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Option<usize>>;

    /// Closes the channel, dropping whatever state the kernel associates
    /// with it.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `AF_NETLINK`/`NETLINK_GENERIC` socket.
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: Option<OwnedFd>,
}

impl NetlinkSocket {
    pub fn open() -> io::Result<Self> {
        // SAFETY: plain socket(2) call with constant arguments.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a fresh descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: an all-zero sockaddr_nl is valid; the kernel assigns the port id.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: `addr` is a properly sized sockaddr_nl living across the call.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd: Some(fd) })
    }

    fn raw_fd(&self) -> io::Result<i32> {
        self.fd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }
}

impl ControlChannel for NetlinkSocket {
    fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        let fd = self.raw_fd()?;
        // SAFETY: `msg` is valid for reads of `msg.len()` bytes.
        let sent = unsafe { libc::send(fd, msg.as_ptr().cast(), msg.len(), 0) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        if sent as usize != msg.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "netlink message truncated on send",
            ));
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Option<usize>> {
        let fd = self.raw_fd()?;
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = wait.as_millis().min(i32::MAX as u128) as libc::c_int;
        // SAFETY: `pfd` is a single valid pollfd.
        let ready = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::Interrupted {
                Ok(None)
            } else {
                Err(err)
            };
        }
        if ready == 0 {
            return Ok(None);
        }

        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let n = unsafe {
            libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), libc::MSG_DONTWAIT)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            };
        }
        Ok(Some(n as usize))
    }

    fn close(&mut self) -> io::Result<()> {
        let Some(fd) = self.fd.take() else {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        };
        // SAFETY: we own the descriptor and never touch it again.
        if unsafe { libc::close(fd.into_raw_fd()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
