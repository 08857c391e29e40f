//! Generic netlink framing.
//!
//! Messages are `nlmsghdr` + `genlmsghdr` + a run of `nlattr` TLVs, all in host
//! byte order and padded to 4 bytes. Only the pieces the netdev binding
//! exchange needs are implemented: flat and nested attributes on the way out,
//! error/ack/attribute messages on the way back.

use std::mem;

pub const NLMSG_HDRLEN: usize = 16;
pub const GENL_HDRLEN: usize = 4;
pub const NLA_HDRLEN: usize = 4;
const NLA_ALIGNTO: usize = 4;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_ACK: u16 = 0x04;

pub const NLMSG_ERROR: u16 = 0x02;
pub const NLMSG_DONE: u16 = 0x03;

pub const NLA_F_NESTED: u16 = 1 << 15;
const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

pub const GENL_ID_CTRL: u16 = 0x10;
pub const CTRL_CMD_GETFAMILY: u8 = 3;
pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;

#[inline]
const fn align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Builder for a single generic netlink message.
#[derive(Debug)]
pub struct GenlMessage {
    buf: Vec<u8>,
    nests: Vec<usize>,
}

impl GenlMessage {
    /// Starts a message addressed to `family` carrying `cmd`.
    pub fn new(family: u16, flags: u16, seq: u32, cmd: u8, version: u8) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_len, patched in finish()
        buf.extend_from_slice(&family.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid: kernel fills it in
        buf.extend_from_slice(&[cmd, version, 0, 0]);
        Self {
            buf,
            nests: Vec::new(),
        }
    }

    fn put(&mut self, ty: u16, payload: &[u8]) -> &mut Self {
        let len = NLA_HDRLEN + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&ty.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align(self.buf.len()), 0);
        self
    }

    pub fn put_u16(&mut self, ty: u16, value: u16) -> &mut Self {
        self.put(ty, &value.to_ne_bytes())
    }

    pub fn put_u32(&mut self, ty: u16, value: u32) -> &mut Self {
        self.put(ty, &value.to_ne_bytes())
    }

    /// Appends a NUL-terminated string attribute.
    pub fn put_str(&mut self, ty: u16, value: &str) -> &mut Self {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.put(ty, &payload)
    }

    /// Opens a nested attribute; close it with [`GenlMessage::end_nest`].
    pub fn begin_nest(&mut self, ty: u16) -> &mut Self {
        self.nests.push(self.buf.len());
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(ty | NLA_F_NESTED).to_ne_bytes());
        self
    }

    pub fn end_nest(&mut self) -> &mut Self {
        let Some(start) = self.nests.pop() else {
            debug_assert!(false, "end_nest called without a matching begin_nest");
            return self;
        };
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
        self
    }

    /// Patches the total length and returns the wire bytes.
    pub fn finish(mut self) -> Vec<u8> {
        debug_assert!(self.nests.is_empty(), "unterminated nest");
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// Encodes an `NLMSG_ERROR` reply, as the kernel would send it. A zero
/// `errno` is a plain acknowledgement.
pub fn encode_error(seq: u32, errno: i32) -> Vec<u8> {
    let total = NLMSG_HDRLEN + mem::size_of::<i32>() + NLMSG_HDRLEN;
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_ne_bytes());
    buf.extend_from_slice(&NLMSG_ERROR.to_ne_bytes());
    buf.extend_from_slice(&0u16.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&(-errno).to_ne_bytes());
    // Echo of the offending header; only its sequence number matters to us.
    buf.extend_from_slice(&(NLMSG_HDRLEN as u32).to_ne_bytes());
    buf.extend_from_slice(&0u16.to_ne_bytes());
    buf.extend_from_slice(&NLM_F_REQUEST.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf
}

/// Reads the sequence number out of an encoded message header.
pub fn peek_seq(msg: &[u8]) -> Option<u32> {
    read_u32(msg, 8)
}

/// One decoded message from a netlink datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply<'a> {
    /// `NLMSG_ERROR` with a non-zero errno (positive value).
    Error { seq: u32, errno: i32 },
    /// `NLMSG_ERROR` with errno 0.
    Ack { seq: u32 },
    Done { seq: u32 },
    /// A family message; `attrs` is the attribute stream after the genl header.
    Message {
        msg_type: u16,
        seq: u32,
        cmd: u8,
        attrs: &'a [u8],
    },
}

/// Framing problems in a received datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Malformed(pub &'static str);

/// Splits a datagram into its messages.
pub fn parse_replies(mut buf: &[u8]) -> Result<Vec<Reply<'_>>, Malformed> {
    let mut replies = Vec::new();
    while buf.len() >= NLMSG_HDRLEN {
        let len = read_u32(buf, 0).ok_or(Malformed("short header"))? as usize;
        if len < NLMSG_HDRLEN || len > buf.len() {
            return Err(Malformed("message length out of range"));
        }
        let msg_type = read_u16(buf, 4).ok_or(Malformed("short header"))?;
        let seq = read_u32(buf, 8).ok_or(Malformed("short header"))?;
        let body = &buf[NLMSG_HDRLEN..len];

        let reply = match msg_type {
            NLMSG_ERROR => {
                let raw = read_u32(body, 0).ok_or(Malformed("truncated error"))? as i32;
                if raw == 0 {
                    Reply::Ack { seq }
                } else {
                    Reply::Error { seq, errno: -raw }
                }
            }
            NLMSG_DONE => Reply::Done { seq },
            _ => {
                if body.len() < GENL_HDRLEN {
                    return Err(Malformed("truncated genl header"));
                }
                Reply::Message {
                    msg_type,
                    seq,
                    cmd: body[0],
                    attrs: &body[GENL_HDRLEN..],
                }
            }
        };
        replies.push(reply);

        let advance = align(len).min(buf.len());
        buf = &buf[advance..];
    }
    Ok(replies)
}

/// Iterator over `(type, payload)` pairs in an attribute stream.
///
/// Nested and byte-order flags are masked off the type. Iteration stops at the
/// first truncated attribute.
#[derive(Clone, Debug)]
pub struct Attrs<'a> {
    buf: &'a [u8],
}

impl<'a> Attrs<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Finds the first attribute of `ty` and decodes it as a `u32`.
    pub fn find_u32(self, ty: u16) -> Option<u32> {
        self.into_iter()
            .find(|(t, _)| *t == ty)
            .and_then(|(_, payload)| read_u32(payload, 0))
    }

    pub fn find_u16(self, ty: u16) -> Option<u16> {
        self.into_iter()
            .find(|(t, _)| *t == ty)
            .and_then(|(_, payload)| read_u16(payload, 0))
    }
}

impl<'a> Iterator for Attrs<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let len = read_u16(self.buf, 0)? as usize;
        let ty = read_u16(self.buf, 2)?;
        if len < NLA_HDRLEN || len > self.buf.len() {
            self.buf = &[];
            return None;
        }
        let payload = &self.buf[NLA_HDRLEN..len];
        let advance = align(len).min(self.buf.len());
        self.buf = &self.buf[advance..];
        Some((ty & NLA_TYPE_MASK, payload))
    }
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_ne_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
