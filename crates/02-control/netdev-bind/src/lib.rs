//! Control plane for device-memory transfers.
//!
//! Resolves interfaces and binds [`dmabuf`] regions to NIC queues over
//! generic netlink. Each binding owns its channel; closing the channel is
//! the unbind.

mod binder;
mod channel;
mod error;
pub mod genl;
mod interface;

pub use binder::{
    encode_bind, BindParams, BindState, BinderConfig, Binding, Direction, QueueBinder,
    NETDEV_A_DMABUF_FD, NETDEV_A_DMABUF_ID, NETDEV_A_DMABUF_IFINDEX, NETDEV_A_DMABUF_QUEUES,
    NETDEV_A_QUEUE_ID, NETDEV_A_QUEUE_TYPE, NETDEV_CMD_BIND_RX, NETDEV_CMD_BIND_TX,
    NETDEV_QUEUE_TYPE_RX, NETDEV_QUEUE_TYPE_TX,
};
pub use channel::{ControlChannel, NetlinkSocket};
pub use error::{BindError, BindResult};
pub use interface::{resolve_interface, InterfaceIndex};
