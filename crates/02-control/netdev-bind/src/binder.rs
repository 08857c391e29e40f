//! Binding dma-buf regions to NIC queues through the `netdev` genl family.
//!
//! The exchange is request-then-optional-acknowledgement. A bind is sent, then
//! replies are drained for at most [`BinderConfig::ack_grace`]. An error reply
//! fails the bind; a reply naming the dma-buf id confirms it; silence leaves
//! the binding [`BindState::Unconfirmed`] and the first data-plane transfer is
//! the real confirmation.

use crate::channel::ControlChannel;
use crate::genl::{self, Attrs, GenlMessage, Reply};
use crate::{BindError, BindResult, InterfaceIndex};
use dmabuf::RegionHandle;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const NETDEV_FAMILY_NAME: &str = "netdev";
const NETDEV_FAMILY_VERSION: u8 = 1;
const CTRL_FAMILY_VERSION: u8 = 1;

pub const NETDEV_CMD_BIND_RX: u8 = 13;
pub const NETDEV_CMD_BIND_TX: u8 = 15;

pub const NETDEV_A_DMABUF_IFINDEX: u16 = 1;
pub const NETDEV_A_DMABUF_QUEUES: u16 = 2;
pub const NETDEV_A_DMABUF_FD: u16 = 3;
pub const NETDEV_A_DMABUF_ID: u16 = 4;

pub const NETDEV_A_QUEUE_ID: u16 = 1;
pub const NETDEV_A_QUEUE_TYPE: u16 = 3;

pub const NETDEV_QUEUE_TYPE_RX: u32 = 0;
pub const NETDEV_QUEUE_TYPE_TX: u32 = 1;

const REPLY_BUF_LEN: usize = 8192;
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Which side of the NIC a region feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Rx,
    Tx,
}

impl Direction {
    fn command(self) -> u8 {
        match self {
            Direction::Rx => NETDEV_CMD_BIND_RX,
            Direction::Tx => NETDEV_CMD_BIND_TX,
        }
    }

    fn command_name(self) -> &'static str {
        match self {
            Direction::Rx => "NETDEV_CMD_BIND_RX",
            Direction::Tx => "NETDEV_CMD_BIND_TX",
        }
    }
}

/// Parameters a binding was created with; kept for idempotent teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindParams {
    pub ifindex: InterfaceIndex,
    /// RX queue index. TX binds are interface-wide.
    pub queue: Option<u32>,
    pub direction: Direction,
    pub region: RegionHandle,
}

/// What the kernel has told us about a binding so far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindState {
    /// Request delivered, no answer yet.
    Unconfirmed,
    /// Kernel replied with the id it will use in transfer metadata.
    Confirmed { dmabuf_id: u32 },
}

#[derive(Clone, Copy, Debug)]
pub struct BinderConfig {
    /// How long to drain bind replies before returning. Zero means a single
    /// non-blocking read.
    pub ack_grace: Duration,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            ack_grace: Duration::ZERO,
        }
    }
}

type BoundSet = Arc<Mutex<HashSet<(RegionHandle, Direction)>>>;

/// Issues bind requests against a resolved `netdev` family.
pub struct QueueBinder {
    family_id: u16,
    config: BinderConfig,
    seq: u32,
    bound: BoundSet,
}

impl QueueBinder {
    /// Looks up the `netdev` family id over `channel`.
    pub fn resolve<C: ControlChannel>(channel: &mut C, config: BinderConfig) -> BindResult<Self> {
        let seq = 1;
        let mut msg = GenlMessage::new(
            genl::GENL_ID_CTRL,
            genl::NLM_F_REQUEST,
            seq,
            genl::CTRL_CMD_GETFAMILY,
            CTRL_FAMILY_VERSION,
        );
        msg.put_str(genl::CTRL_ATTR_FAMILY_NAME, NETDEV_FAMILY_NAME);
        channel.send(&msg.finish())?;

        let deadline = Instant::now() + RESOLVE_TIMEOUT;
        let mut buf = vec![0u8; REPLY_BUF_LEN];
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let Some(n) = channel.recv(&mut buf, wait)? else {
                if wait.is_zero() {
                    return Err(BindError::Channel(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "no reply to CTRL_CMD_GETFAMILY",
                    )));
                }
                continue;
            };
            for reply in parse(&buf[..n])? {
                match reply {
                    Reply::Message { seq: s, attrs, .. } if s == seq => {
                        let family_id = Attrs::new(attrs)
                            .find_u16(genl::CTRL_ATTR_FAMILY_ID)
                            .ok_or(BindError::Malformed("family reply without id"))?;
                        debug!(family_id, "resolved netdev genl family");
                        return Ok(Self::with_family(family_id, config));
                    }
                    Reply::Error { seq: s, errno } if s == seq => {
                        return Err(if errno == libc::ENOENT {
                            BindError::FamilyNotFound(NETDEV_FAMILY_NAME)
                        } else {
                            BindError::Rejected {
                                command: "CTRL_CMD_GETFAMILY",
                                errno,
                            }
                        });
                    }
                    other => debug!(?other, "ignoring unrelated control reply"),
                }
            }
        }
    }

    /// Uses an already known family id.
    pub fn with_family(family_id: u16, config: BinderConfig) -> Self {
        Self {
            family_id,
            config,
            seq: 1,
            bound: Arc::default(),
        }
    }

    pub fn family_id(&self) -> u16 {
        self.family_id
    }

    /// Binds `region` to RX queue `queue` of `ifindex`.
    pub fn bind_rx<C: ControlChannel>(
        &mut self,
        channel: C,
        ifindex: InterfaceIndex,
        queue: u32,
        region: RegionHandle,
    ) -> BindResult<Binding<C>> {
        self.bind(
            channel,
            BindParams {
                ifindex,
                queue: Some(queue),
                direction: Direction::Rx,
                region,
            },
        )
    }

    /// Binds `region` as the TX source for `ifindex`.
    pub fn bind_tx<C: ControlChannel>(
        &mut self,
        channel: C,
        ifindex: InterfaceIndex,
        region: RegionHandle,
    ) -> BindResult<Binding<C>> {
        self.bind(
            channel,
            BindParams {
                ifindex,
                queue: None,
                direction: Direction::Tx,
                region,
            },
        )
    }

    fn bind<C: ControlChannel>(&mut self, mut channel: C, params: BindParams) -> BindResult<Binding<C>> {
        let key = (params.region, params.direction);
        if self.bound.lock().contains(&key) {
            return Err(BindError::AlreadyBound {
                region: params.region,
                direction: params.direction,
            });
        }

        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        channel.send(&encode_bind(self.family_id, seq, &params))?;
        info!(
            ifindex = %params.ifindex,
            queue = ?params.queue,
            direction = ?params.direction,
            region = %params.region,
            "bind request sent"
        );

        let state = self.await_reply(&mut channel, seq, params.direction)?;
        match state {
            BindState::Confirmed { dmabuf_id } => info!(dmabuf_id, "bind confirmed"),
            BindState::Unconfirmed => info!("bind unconfirmed; first transfer will tell"),
        }

        self.bound.lock().insert(key);
        Ok(Binding {
            channel,
            params,
            state,
            bound: true,
            registry: Arc::clone(&self.bound),
        })
    }

    fn await_reply<C: ControlChannel>(
        &self,
        channel: &mut C,
        seq: u32,
        direction: Direction,
    ) -> BindResult<BindState> {
        let deadline = Instant::now() + self.config.ack_grace;
        let mut buf = vec![0u8; REPLY_BUF_LEN];
        let mut state = BindState::Unconfirmed;

        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let Some(n) = channel.recv(&mut buf, wait)? else {
                return Ok(state);
            };
            for reply in parse(&buf[..n])? {
                match reply {
                    Reply::Error { seq: s, errno } if s == seq => {
                        return Err(BindError::Rejected {
                            command: direction.command_name(),
                            errno,
                        });
                    }
                    Reply::Message { seq: s, attrs, .. } if s == seq => {
                        if let Some(dmabuf_id) = Attrs::new(attrs).find_u32(NETDEV_A_DMABUF_ID) {
                            state = BindState::Confirmed { dmabuf_id };
                        }
                    }
                    Reply::Ack { seq: s } if s == seq => return Ok(state),
                    other => debug!(?other, "ignoring unrelated control reply"),
                }
            }
        }
    }
}

impl fmt::Debug for QueueBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueBinder")
            .field("family_id", &self.family_id)
            .field("config", &self.config)
            .field("seq", &self.seq)
            .finish()
    }
}

fn parse(datagram: &[u8]) -> BindResult<Vec<Reply<'_>>> {
    genl::parse_replies(datagram).map_err(|genl::Malformed(why)| BindError::Malformed(why))
}

/// Encodes a `NETDEV_CMD_BIND_{RX,TX}` request.
pub fn encode_bind(family_id: u16, seq: u32, params: &BindParams) -> Vec<u8> {
    let mut msg = GenlMessage::new(
        family_id,
        genl::NLM_F_REQUEST | genl::NLM_F_ACK,
        seq,
        params.direction.command(),
        NETDEV_FAMILY_VERSION,
    );
    msg.put_u32(NETDEV_A_DMABUF_IFINDEX, params.ifindex.get())
        .put_u32(NETDEV_A_DMABUF_FD, params.region.raw_fd() as u32);
    if let Some(queue) = params.queue {
        msg.begin_nest(NETDEV_A_DMABUF_QUEUES)
            .put_u32(NETDEV_A_QUEUE_TYPE, NETDEV_QUEUE_TYPE_RX)
            .put_u32(NETDEV_A_QUEUE_ID, queue)
            .end_nest();
    }
    msg.finish()
}

/// A live association between a region and a queue.
///
/// Owns the control channel the bind went out on. Dropping the binding, or
/// calling [`Binding::unbind`], closes that channel, which is how the kernel
/// learns the binding is gone.
pub struct Binding<C: ControlChannel> {
    channel: C,
    params: BindParams,
    state: BindState,
    bound: bool,
    registry: BoundSet,
}

impl<C: ControlChannel> Binding<C> {
    pub fn params(&self) -> &BindParams {
        &self.params
    }

    pub fn state(&self) -> BindState {
        self.state
    }

    pub fn dmabuf_id(&self) -> Option<u32> {
        match self.state {
            BindState::Confirmed { dmabuf_id } => Some(dmabuf_id),
            BindState::Unconfirmed => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Records confirmation learned from the data plane.
    pub fn mark_confirmed(&mut self, dmabuf_id: u32) {
        self.state = BindState::Confirmed { dmabuf_id };
    }

    /// Tears the binding down. Safe to call more than once; failures are
    /// logged, never returned.
    pub fn unbind(&mut self) {
        if !self.bound {
            return;
        }
        self.bound = false;
        self.registry
            .lock()
            .remove(&(self.params.region, self.params.direction));

        match self.channel.close() {
            Ok(()) => info!(
                ifindex = %self.params.ifindex,
                direction = ?self.params.direction,
                "binding torn down"
            ),
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::EBADF)
                ) =>
            {
                debug!(%err, "binding already released")
            }
            Err(err) => warn!(%err, "unbind failed"),
        }
    }
}

impl<C: ControlChannel> Drop for Binding<C> {
    fn drop(&mut self) {
        self.unbind();
    }
}

impl<C: ControlChannel> fmt::Debug for Binding<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("params", &self.params)
            .field("state", &self.state)
            .field("bound", &self.bound)
            .finish()
    }
}
