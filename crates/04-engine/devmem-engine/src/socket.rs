//! Data-plane socket operations.

use crate::cmsg::{MSG_SOCK_DEVMEM, SO_DEVMEM_DONTNEED};
use frag_ledger::{TokenReleaser, TokenRun};
use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;

/// Result of one devmem receive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecvMeta {
    /// Payload bytes across both delivery paths; zero means the peer closed.
    pub bytes: usize,
    /// Bytes of ancillary data written into the control buffer.
    pub control_len: usize,
    /// The kernel dropped metadata that did not fit.
    pub truncated: bool,
}

/// A connected stream socket able to move bytes by reference.
///
/// Every call is a single non-blocking attempt. "Try again" comes back as
/// [`io::ErrorKind::WouldBlock`]; the engine owns the retry policy.
pub trait DevmemSocket: TokenReleaser {
    /// Sends `len` bytes starting at `offset` of the dma-buf named in `control`.
    fn send_devmem(&mut self, control: &[u8], offset: u64, len: usize) -> io::Result<usize>;

    fn send_bytes(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Receives with devmem delivery requested. Linear bytes land in
    /// `linear`, fragment metadata in `control`.
    fn recv_devmem(&mut self, linear: &mut [u8], control: &mut [u8]) -> io::Result<RecvMeta>;

    fn recv_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DmabufToken {
    token_start: u32,
    token_count: u32,
}

/// [`DevmemSocket`] over a kernel TCP connection.
#[derive(Debug)]
pub struct TcpDevmemSocket {
    stream: TcpStream,
}

impl TcpDevmemSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Opts the socket into `MSG_ZEROCOPY` sends.
    pub fn enable_zerocopy(&self) -> io::Result<()> {
        set_int_opt(&self.stream, libc::SOL_SOCKET, libc::SO_ZEROCOPY, 1)
    }

    /// Pins egress to `ifname` so sends reach the NIC holding the TX binding.
    pub fn bind_to_device(&self, ifname: &str) -> io::Result<()> {
        let name =
            CString::new(ifname).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let bytes = name.as_bytes_with_nul();
        // SAFETY: `bytes` is valid for reads of `bytes.len()` bytes.
        let ret = unsafe {
            libc::setsockopt(
                self.stream.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                bytes.as_ptr().cast(),
                bytes.len() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl DevmemSocket for TcpDevmemSocket {
    fn send_devmem(&mut self, control: &[u8], offset: u64, len: usize) -> io::Result<usize> {
        // The iov base is an offset into the dma-buf, never dereferenced here.
        let mut iov = libc::iovec {
            iov_base: offset as usize as *mut libc::c_void,
            iov_len: len,
        };
        // SAFETY: an all-zero msghdr is valid.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        let flags = libc::MSG_ZEROCOPY | libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
        // SAFETY: `msg` points at `iov` and `control`, both alive for the call.
        let sent = unsafe { libc::sendmsg(self.stream.as_raw_fd(), &msg, flags) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    fn send_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for reads of `buf.len()` bytes.
        let sent = unsafe {
            libc::send(
                self.stream.as_raw_fd(),
                buf.as_ptr().cast(),
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    fn recv_devmem(&mut self, linear: &mut [u8], control: &mut [u8]) -> io::Result<RecvMeta> {
        let mut iov = libc::iovec {
            iov_base: linear.as_mut_ptr().cast(),
            iov_len: linear.len(),
        };
        // SAFETY: an all-zero msghdr is valid.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = control.len() as _;

        // SAFETY: `msg` points at buffers that stay borrowed for the call.
        let received = unsafe {
            libc::recvmsg(
                self.stream.as_raw_fd(),
                &mut msg,
                MSG_SOCK_DEVMEM | libc::MSG_DONTWAIT,
            )
        };
        if received < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(RecvMeta {
            bytes: received as usize,
            control_len: msg.msg_controllen as usize,
            truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
        })
    }

    fn recv_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let received = unsafe {
            libc::recv(
                self.stream.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if received < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(received as usize)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl TokenReleaser for TcpDevmemSocket {
    fn release_tokens(&mut self, runs: &[TokenRun]) -> io::Result<usize> {
        let tokens: Vec<DmabufToken> = runs
            .iter()
            .map(|run| DmabufToken {
                token_start: run.start,
                token_count: run.count,
            })
            .collect();
        // SAFETY: `tokens` is a contiguous array of repr(C) dmabuf_token.
        let freed = unsafe {
            libc::setsockopt(
                self.stream.as_raw_fd(),
                libc::SOL_SOCKET,
                SO_DEVMEM_DONTNEED,
                tokens.as_ptr().cast(),
                (tokens.len() * mem::size_of::<DmabufToken>()) as libc::socklen_t,
            )
        };
        if freed < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(freed as usize)
    }
}

fn set_int_opt(
    stream: &TcpStream,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: `value` is a live c_int for the duration of the call.
    let ret = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            level,
            name,
            (&value as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
