//! Ownership ledger for RX fragments the kernel has loaned to the application.
//!
//! A fragment is live from the moment receive metadata reports it until its
//! token is handed back. The ledger hands out one [`FragmentLoan`] per live
//! fragment and turns loans back into kernel release requests.

mod error;
mod ledger;

pub use error::{LedgerError, LedgerResult};
pub use ledger::{
    coalesce_runs, release_batches, release_untracked, FragmentLedger, FragmentLoan, RxFragment,
    TokenReleaser, TokenRun, MAX_RUNS_PER_RELEASE, MAX_TOKENS_PER_RELEASE,
};
