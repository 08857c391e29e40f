use std::io;
use thiserror::Error;

/// Convenience result alias for ledger operations.
pub type LedgerResult<T, E = LedgerError> = Result<T, E>;

/// Ledger failures.
///
/// Everything except [`LedgerError::Release`] means the kernel and the
/// application disagree about who owns a fragment. Those are protocol faults
/// and must abort the transfer.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("kernel reported token {token} while it is still live")]
    DuplicateToken { token: u32 },

    #[error("token {token} is not live")]
    UnknownToken { token: u32 },

    #[error("kernel freed {freed} of {requested} tokens")]
    ReleaseShortfall { requested: usize, freed: usize },

    /// The release request itself could not be issued; nothing was forgotten.
    #[error("token release request failed")]
    Release(#[source] io::Error),
}

impl LedgerError {
    pub fn is_protocol_fault(&self) -> bool {
        !matches!(self, LedgerError::Release(_))
    }
}
