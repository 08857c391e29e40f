use devmem_engine::cmsg::{self, DmabufCmsg, SCM_DEVMEM_DMABUF, SCM_DEVMEM_LINEAR};
use devmem_engine::{DevmemSocket, RecvMeta};
use dmabuf::{DmaRegion, RegionBackend, RegionConfig};
use frag_ledger::{RxFragment, TokenReleaser, TokenRun};
use netdev_bind::genl::{self, GenlMessage};
use netdev_bind::{ControlChannel, NETDEV_A_DMABUF_ID};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Page-aligned region on the anonymous backend.
pub fn anonymous_region(len: usize) -> DmaRegion {
    DmaRegion::create(
        len,
        RegionConfig {
            backend: RegionBackend::Anonymous,
        },
    )
    .expect("anonymous region")
}

/// Next outcome of a send attempt.
#[derive(Clone, Copy, Debug)]
pub enum SendStep {
    /// Accept at most this many bytes.
    Accept(usize),
    WouldBlock,
    Fail(i32),
}

/// Next outcome of a receive attempt.
#[derive(Clone, Debug)]
pub enum RecvStep {
    WouldBlock,
    /// Devmem receive: fragments in device memory plus bytes copied linearly.
    Deliver {
        dma: Vec<RxFragment>,
        linear: Vec<u8>,
    },
    /// Plain receive of these bytes.
    Bytes(Vec<u8>),
    Eof,
    Fail(i32),
}

/// One zero-copy send as the kernel saw it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxCall {
    pub dmabuf_id: u32,
    pub offset: u64,
    pub len: usize,
}

/// Data-plane fake. Unscripted sends accept everything; unscripted receives
/// would block.
#[derive(Debug, Default)]
pub struct ScriptedSocket {
    pub sends: VecDeque<SendStep>,
    pub recvs: VecDeque<RecvStep>,
    pub tx_calls: Vec<TxCall>,
    pub copied: Vec<u8>,
    pub released: Vec<TokenRun>,
    /// Tokens the fake kernel "forgets" to free on each release call.
    pub release_shortfall: usize,
    pub shutdowns: u32,
}

impl ScriptedSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(mut self, step: SendStep) -> Self {
        self.sends.push_back(step);
        self
    }

    pub fn recv(mut self, step: RecvStep) -> Self {
        self.recvs.push_back(step);
        self
    }

    pub fn released_tokens(&self) -> Vec<u32> {
        let mut tokens: Vec<u32> = self
            .released
            .iter()
            .flat_map(|run| run.start..run.start + run.count)
            .collect();
        tokens.sort_unstable();
        tokens
    }

    fn next_send(&mut self, wanted: usize) -> io::Result<usize> {
        match self.sends.pop_front() {
            None => Ok(wanted),
            Some(SendStep::Accept(n)) => Ok(n.min(wanted)),
            Some(SendStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(SendStep::Fail(errno)) => Err(io::Error::from_raw_os_error(errno)),
        }
    }
}

impl TokenReleaser for ScriptedSocket {
    fn release_tokens(&mut self, runs: &[TokenRun]) -> io::Result<usize> {
        self.released.extend_from_slice(runs);
        let total: usize = runs.iter().map(|run| run.count as usize).sum();
        Ok(total.saturating_sub(self.release_shortfall))
    }
}

impl DevmemSocket for ScriptedSocket {
    fn send_devmem(&mut self, control: &[u8], offset: u64, len: usize) -> io::Result<usize> {
        let dmabuf_id = cmsg::parse_tx_dmabuf(control)
            .ok()
            .flatten()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let n = self.next_send(len)?;
        self.tx_calls.push(TxCall {
            dmabuf_id,
            offset,
            len: n,
        });
        Ok(n)
    }

    fn send_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.next_send(buf.len())?;
        self.copied.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn recv_devmem(&mut self, linear: &mut [u8], control: &mut [u8]) -> io::Result<RecvMeta> {
        match self.recvs.pop_front() {
            None | Some(RecvStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(RecvStep::Eof) => Ok(RecvMeta::default()),
            Some(RecvStep::Fail(errno)) => Err(io::Error::from_raw_os_error(errno)),
            Some(RecvStep::Bytes(bytes)) => {
                linear[..bytes.len()].copy_from_slice(&bytes);
                Ok(RecvMeta {
                    bytes: bytes.len(),
                    ..RecvMeta::default()
                })
            }
            Some(RecvStep::Deliver { dma, linear: copied }) => {
                let mut meta = Vec::new();
                let mut bytes = 0usize;
                for frag in &dma {
                    bytes += frag.len as usize;
                    cmsg::push_rx_fragment(
                        &mut meta,
                        SCM_DEVMEM_DMABUF,
                        DmabufCmsg {
                            frag_offset: frag.offset,
                            frag_size: frag.len,
                            frag_token: frag.token,
                            dmabuf_id: frag.dmabuf_id,
                            flags: 0,
                        },
                    );
                }
                if !copied.is_empty() {
                    bytes += copied.len();
                    linear[..copied.len()].copy_from_slice(&copied);
                    cmsg::push_rx_fragment(
                        &mut meta,
                        SCM_DEVMEM_LINEAR,
                        DmabufCmsg {
                            frag_size: copied.len() as u32,
                            ..DmabufCmsg::default()
                        },
                    );
                }
                let truncated = meta.len() > control.len();
                let control_len = meta.len().min(control.len());
                control[..control_len].copy_from_slice(&meta[..control_len]);
                Ok(RecvMeta {
                    bytes,
                    control_len,
                    truncated,
                })
            }
        }
    }

    fn recv_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.recvs.pop_front() {
            None | Some(RecvStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(RecvStep::Eof) => Ok(0),
            Some(RecvStep::Fail(errno)) => Err(io::Error::from_raw_os_error(errno)),
            Some(RecvStep::Bytes(bytes)) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Some(RecvStep::Deliver { .. }) => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.shutdowns += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ChannelLog {
    pub requests: Vec<Vec<u8>>,
    pub closes: u32,
}

#[derive(Clone, Copy, Debug)]
enum BindReply {
    Confirm(u32),
    Reject(i32),
    Silent,
}

/// Control-plane fake. Answers family lookups with `family` and bind
/// requests according to how it was built.
#[derive(Clone, Debug)]
pub struct ScriptedChannel {
    family: u16,
    reply: BindReply,
    pending: VecDeque<Vec<u8>>,
    pub log: Arc<Mutex<ChannelLog>>,
}

impl ScriptedChannel {
    fn with_reply(family: u16, reply: BindReply) -> Self {
        Self {
            family,
            reply,
            pending: VecDeque::new(),
            log: Arc::default(),
        }
    }

    /// Binds succeed and report `dmabuf_id`.
    pub fn confirming(family: u16, dmabuf_id: u32) -> Self {
        Self::with_reply(family, BindReply::Confirm(dmabuf_id))
    }

    pub fn rejecting(family: u16, errno: i32) -> Self {
        Self::with_reply(family, BindReply::Reject(errno))
    }

    /// Binds are accepted for delivery and never answered.
    pub fn silent(family: u16) -> Self {
        Self::with_reply(family, BindReply::Silent)
    }
}

impl ControlChannel for ScriptedChannel {
    fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        self.log.lock().requests.push(msg.to_vec());
        let seq = genl::peek_seq(msg).ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let msg_type = u16::from_ne_bytes([msg[4], msg[5]]);
        let cmd = msg[genl::NLMSG_HDRLEN];

        if msg_type == genl::GENL_ID_CTRL {
            let mut reply = GenlMessage::new(genl::GENL_ID_CTRL, 0, seq, 1, 1);
            reply
                .put_str(genl::CTRL_ATTR_FAMILY_NAME, "netdev")
                .put_u16(genl::CTRL_ATTR_FAMILY_ID, self.family);
            self.pending.push_back(reply.finish());
            return Ok(());
        }

        match self.reply {
            BindReply::Confirm(dmabuf_id) => {
                let mut reply = GenlMessage::new(self.family, 0, seq, cmd, 1);
                reply.put_u32(NETDEV_A_DMABUF_ID, dmabuf_id);
                let mut datagram = reply.finish();
                datagram.extend(genl::encode_error(seq, 0));
                self.pending.push_back(datagram);
            }
            BindReply::Reject(errno) => self.pending.push_back(genl::encode_error(seq, errno)),
            BindReply::Silent => {}
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], _wait: Duration) -> io::Result<Option<usize>> {
        let Some(datagram) = self.pending.pop_front() else {
            return Ok(None);
        };
        buf[..datagram.len()].copy_from_slice(&datagram);
        Ok(Some(datagram.len()))
    }

    fn close(&mut self) -> io::Result<()> {
        self.log.lock().closes += 1;
        Ok(())
    }
}
