//! End-to-end tests for the device-memory TCP stack.
//!
//! The kernel is replaced by scripted fakes: [`ScriptedSocket`] plays the
//! data plane, [`ScriptedChannel`] the netlink control plane, and regions use
//! the anonymous backend so no devmem-capable NIC is needed.

mod harness;

pub use harness::{
    anonymous_region, ChannelLog, RecvStep, ScriptedChannel, ScriptedSocket, SendStep, TxCall,
};

#[cfg(test)]
mod pipeline;

#[cfg(test)]
mod transfer_e2e;
