//! Ancillary data riding alongside the stream socket.
//!
//! On send a single `SCM_DEVMEM_DMABUF` message names the TX dma-buf. On
//! receive the kernel attaches one `struct dmabuf_cmsg` per fragment, tagged
//! `SCM_DEVMEM_DMABUF` when the bytes landed in device memory and
//! `SCM_DEVMEM_LINEAR` when they were copied into the iov buffer instead.

use crate::{EngineError, EngineResult};
use frag_ledger::RxFragment;
use smallvec::SmallVec;
use std::mem;
use std::ptr;

pub const SO_DEVMEM_LINEAR: libc::c_int = 78;
pub const SCM_DEVMEM_LINEAR: libc::c_int = SO_DEVMEM_LINEAR;
pub const SO_DEVMEM_DMABUF: libc::c_int = 79;
pub const SCM_DEVMEM_DMABUF: libc::c_int = SO_DEVMEM_DMABUF;
pub const SO_DEVMEM_DONTNEED: libc::c_int = 80;
pub const MSG_SOCK_DEVMEM: libc::c_int = 0x0200_0000;

/// `sizeof(struct dmabuf_cmsg)`: u64 offset, then size, token, id, flags.
pub const DMABUF_CMSG_LEN: usize = 24;

const HDR_LEN: usize = cmsg_align(mem::size_of::<libc::cmsghdr>());

const fn cmsg_align(len: usize) -> usize {
    let align = mem::size_of::<usize>();
    (len + align - 1) & !(align - 1)
}

/// Bytes one message with a `payload`-byte body occupies in a control buffer.
pub const fn cmsg_space(payload: usize) -> usize {
    HDR_LEN + cmsg_align(payload)
}

/// One fragment as the kernel describes it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DmabufCmsg {
    pub frag_offset: u64,
    pub frag_size: u32,
    pub frag_token: u32,
    pub dmabuf_id: u32,
    pub flags: u32,
}

impl DmabufCmsg {
    fn to_bytes(self) -> [u8; DMABUF_CMSG_LEN] {
        let mut out = [0u8; DMABUF_CMSG_LEN];
        out[0..8].copy_from_slice(&self.frag_offset.to_ne_bytes());
        out[8..12].copy_from_slice(&self.frag_size.to_ne_bytes());
        out[12..16].copy_from_slice(&self.frag_token.to_ne_bytes());
        out[16..20].copy_from_slice(&self.dmabuf_id.to_ne_bytes());
        out[20..24].copy_from_slice(&self.flags.to_ne_bytes());
        out
    }

    fn from_bytes(raw: &[u8]) -> Option<Self> {
        let raw: &[u8; DMABUF_CMSG_LEN] = raw.get(..DMABUF_CMSG_LEN)?.try_into().ok()?;
        let u32_at = |at: usize| u32::from_ne_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&raw[0..8]);
        Some(Self {
            frag_offset: u64::from_ne_bytes(offset),
            frag_size: u32_at(8),
            frag_token: u32_at(12),
            dmabuf_id: u32_at(16),
            flags: u32_at(20),
        })
    }
}

/// Where one slice of a receive ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Bytes sit in the bound RX region and are on loan until released.
    Dma(RxFragment),
    /// Bytes were copied into the linear iov buffer.
    Linear { len: u32 },
}

impl Delivery {
    pub fn len(&self) -> u32 {
        match self {
            Delivery::Dma(frag) => frag.len,
            Delivery::Linear { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type Deliveries = SmallVec<[Delivery; 8]>;

/// Appends one control message to `buf`.
pub fn push_cmsg(buf: &mut Vec<u8>, level: libc::c_int, ty: libc::c_int, payload: &[u8]) {
    let start = buf.len();
    buf.resize(start + cmsg_space(payload.len()), 0);

    // SAFETY: all-zero is a valid cmsghdr, including musl's padding fields.
    let mut hdr: libc::cmsghdr = unsafe { mem::zeroed() };
    hdr.cmsg_len = (HDR_LEN + payload.len()) as _;
    hdr.cmsg_level = level;
    hdr.cmsg_type = ty;
    // SAFETY: `buf` has at least HDR_LEN bytes at `start`; the write is unaligned.
    unsafe { ptr::write_unaligned(buf[start..].as_mut_ptr().cast::<libc::cmsghdr>(), hdr) };
    buf[start + HDR_LEN..start + HDR_LEN + payload.len()].copy_from_slice(payload);
}

/// Control buffer for a zero-copy send sourced from dma-buf `dmabuf_id`.
pub fn encode_tx_dmabuf(dmabuf_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(cmsg_space(mem::size_of::<u32>()));
    push_cmsg(&mut buf, libc::SOL_SOCKET, SCM_DEVMEM_DMABUF, &dmabuf_id.to_ne_bytes());
    buf
}

/// Appends RX fragment metadata the way the kernel lays it out.
pub fn push_rx_fragment(buf: &mut Vec<u8>, ty: libc::c_int, frag: DmabufCmsg) {
    push_cmsg(buf, libc::SOL_SOCKET, ty, &frag.to_bytes());
}

/// Reads the dma-buf id out of a TX control buffer.
pub fn parse_tx_dmabuf(control: &[u8]) -> EngineResult<Option<u32>> {
    for (level, ty, payload) in CmsgIter::new(control) {
        let payload = payload?;
        if level == libc::SOL_SOCKET && ty == SCM_DEVMEM_DMABUF {
            let raw: [u8; 4] = payload
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or(EngineError::Metadata("short tx dmabuf id"))?;
            return Ok(Some(u32::from_ne_bytes(raw)));
        }
    }
    Ok(None)
}

/// Enumerates the fragments described by a receive's control buffer.
///
/// Unknown levels or types are skipped.
pub fn parse_rx(control: &[u8]) -> EngineResult<Deliveries> {
    let mut out = Deliveries::new();
    for (level, ty, payload) in CmsgIter::new(control) {
        let payload = payload?;
        if level != libc::SOL_SOCKET || (ty != SCM_DEVMEM_DMABUF && ty != SCM_DEVMEM_LINEAR) {
            tracing::trace!(level, ty, "skipping unrelated control message");
            continue;
        }
        let cmsg = DmabufCmsg::from_bytes(payload).ok_or(EngineError::Metadata("short dmabuf_cmsg"))?;
        if ty == SCM_DEVMEM_DMABUF {
            out.push(Delivery::Dma(RxFragment {
                token: cmsg.frag_token,
                offset: cmsg.frag_offset,
                len: cmsg.frag_size,
                dmabuf_id: cmsg.dmabuf_id,
            }));
        } else {
            out.push(Delivery::Linear {
                len: cmsg.frag_size,
            });
        }
    }
    Ok(out)
}

struct CmsgIter<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> CmsgIter<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }
}

impl<'a> Iterator for CmsgIter<'a> {
    type Item = (libc::c_int, libc::c_int, EngineResult<&'a [u8]>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.len() < HDR_LEN {
            return None;
        }
        // SAFETY: at least HDR_LEN bytes are readable; the read is unaligned.
        let hdr: libc::cmsghdr = unsafe { ptr::read_unaligned(self.buf.as_ptr().cast()) };
        let len = hdr.cmsg_len as usize;
        if len < HDR_LEN || len > self.buf.len() {
            self.failed = true;
            return Some((
                hdr.cmsg_level,
                hdr.cmsg_type,
                Err(EngineError::Metadata("control message length out of range")),
            ));
        }
        let payload = &self.buf[HDR_LEN..len];
        let advance = cmsg_align(len).min(self.buf.len());
        self.buf = &self.buf[advance..];
        Some((hdr.cmsg_level, hdr.cmsg_type, Ok(payload)))
    }
}
