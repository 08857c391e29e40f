//! memfd allocation and `/dev/udmabuf` registration.

use crate::{RegionError, RegionResult};
use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

const UDMABUF_DEVICE: &str = "/dev/udmabuf";
const UDMABUF_FLAGS_CLOEXEC: u32 = 0x01;

/// Mirrors `struct udmabuf_create` from `linux/udmabuf.h`.
#[repr(C)]
struct UdmabufCreate {
    memfd: u32,
    flags: u32,
    offset: u64,
    size: u64,
}

const fn iow(ty: u8, nr: u8, size: usize) -> u64 {
    const IOC_WRITE: u64 = 1;
    (IOC_WRITE << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | nr as u64
}

const UDMABUF_CREATE: u64 = iow(b'u', 0x42, std::mem::size_of::<UdmabufCreate>());

/// Creates a sealed-size anonymous memfd of `len` bytes.
pub(crate) fn create_memfd(name: &CStr, len: usize) -> RegionResult<File> {
    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING) };
    if fd < 0 {
        return Err(RegionError::Allocation {
            len,
            source: io::Error::last_os_error(),
        });
    }
    // SAFETY: `fd` was just returned by memfd_create and is owned by nobody else.
    let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
    file.set_len(len as u64)
        .map_err(|source| RegionError::Allocation { len, source })?;

    // udmabuf refuses memfds that could still shrink under the mapping.
    // SAFETY: `file` owns a valid descriptor for the duration of the call.
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_ADD_SEALS, libc::F_SEAL_SHRINK) } < 0 {
        return Err(RegionError::Allocation {
            len,
            source: io::Error::last_os_error(),
        });
    }
    Ok(file)
}

/// Turns `memfd` into a dma-buf and returns the new descriptor.
///
/// The memfd may be closed afterwards; the dma-buf keeps its pages alive.
pub(crate) fn register(memfd: &File, len: usize) -> RegionResult<File> {
    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(UDMABUF_DEVICE)
        .map_err(|source| RegionError::Registration { source })?;

    let create = UdmabufCreate {
        memfd: memfd.as_raw_fd() as u32,
        flags: UDMABUF_FLAGS_CLOEXEC,
        offset: 0,
        size: len as u64,
    };

    // SAFETY: `create` matches the kernel layout and outlives the ioctl.
    let fd = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            UDMABUF_CREATE as _,
            &create as *const UdmabufCreate,
        )
    };
    if fd < 0 {
        return Err(RegionError::Registration {
            source: io::Error::last_os_error(),
        });
    }
    // SAFETY: the ioctl returns a fresh descriptor we now own.
    Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_number_matches_uapi() {
        // _IOW('u', 0x42, struct udmabuf_create) with a 24-byte payload.
        assert_eq!(std::mem::size_of::<UdmabufCreate>(), 24);
        assert_eq!(UDMABUF_CREATE, 0x4018_7542);
    }

    #[test]
    fn memfd_has_requested_length() {
        let file = create_memfd(c"memfd-test", 8192).expect("memfd");
        assert_eq!(file.metadata().expect("metadata").len(), 8192);
    }

    #[test]
    fn memfd_is_sealed_against_shrinking() {
        let file = create_memfd(c"memfd-seal", 8192).expect("memfd");
        // SAFETY: querying seals on a descriptor we own.
        let seals = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GET_SEALS) };
        assert!(seals >= 0, "F_GET_SEALS failed");
        assert_ne!(seals & libc::F_SEAL_SHRINK, 0);
        assert_eq!(seals & libc::F_SEAL_SEAL, 0, "further seals stay possible");
        assert!(file.set_len(4096).is_err(), "shrinking a sealed memfd fails");
        file.set_len(16384).expect("growing is still allowed");
    }
}
