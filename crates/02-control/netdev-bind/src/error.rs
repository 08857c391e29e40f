use crate::Direction;
use dmabuf::RegionHandle;
use std::io;
use thiserror::Error;

/// Convenience result alias for control-plane operations.
pub type BindResult<T> = Result<T, BindError>;

/// Failures while resolving interfaces or binding regions to queues.
///
/// None of these are retried here. Whether to carry on without zero-copy is
/// the caller's decision.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("network interface {name:?} not found")]
    InterfaceNotFound { name: String },

    #[error("control channel unavailable: {0}")]
    Channel(#[from] io::Error),

    #[error("generic netlink family {0:?} is not registered")]
    FamilyNotFound(&'static str),

    /// The kernel answered the request with an error.
    #[error("kernel rejected {command} with errno {errno}")]
    Rejected { command: &'static str, errno: i32 },

    /// The region already has a live binding in this direction.
    #[error("region {region} is already bound for {direction:?}")]
    AlreadyBound {
        region: RegionHandle,
        direction: Direction,
    },

    #[error("malformed control-plane reply: {0}")]
    Malformed(&'static str),
}

impl BindError {
    /// Underlying reason code when the kernel produced one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            BindError::Rejected { errno, .. } => Some(*errno),
            BindError::Channel(err) => err.raw_os_error(),
            _ => None,
        }
    }
}
