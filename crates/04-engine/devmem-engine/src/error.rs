use crate::EngineState;
use dmabuf::RegionError;
use frag_ledger::LedgerError;
use netdev_bind::BindError;
use std::io;
use thiserror::Error;

/// Convenience result alias for transfer operations.
pub type EngineResult<T, E = EngineError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("socket failure")]
    Io(#[from] io::Error),

    /// Ancillary data did not parse as kernel fragment metadata.
    #[error("malformed fragment metadata: {0}")]
    Metadata(&'static str),

    /// The kernel had more fragment metadata than the control buffer held.
    /// The missing tokens can never be released.
    #[error("fragment metadata truncated; control buffer of {capacity} bytes is too small")]
    ControlTruncated { capacity: usize },

    #[error("transfer refused while engine is {0:?}")]
    Closing(EngineState),

    #[error("no connection attached")]
    NotConnected,
}

impl EngineError {
    /// Whether the kernel and the application now disagree about fragment
    /// ownership.
    pub fn is_protocol_fault(&self) -> bool {
        match self {
            EngineError::Ledger(err) => err.is_protocol_fault(),
            EngineError::Metadata(_) | EngineError::ControlTruncated { .. } => true,
            _ => false,
        }
    }
}
