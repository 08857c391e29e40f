use crate::{LedgerError, LedgerResult};
use dmabuf::{DmaRegion, LoanTracker, RegionResult};
use std::collections::HashMap;
use std::io;
use tracing::{debug, error, warn};

/// Upper bound on runs in one kernel release request.
pub const MAX_RUNS_PER_RELEASE: usize = 128;

/// Upper bound on tokens the kernel frees in one release request.
pub const MAX_TOKENS_PER_RELEASE: usize = 1024;

/// A received byte range inside the bound RX region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxFragment {
    /// Kernel-assigned release token.
    pub token: u32,
    /// Offset of the payload from the start of the region.
    pub offset: u64,
    pub len: u32,
    /// Kernel id of the dma-buf binding the bytes landed in.
    pub dmabuf_id: u32,
}

/// `count` consecutive tokens starting at `start`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenRun {
    pub start: u32,
    pub count: u32,
}

/// Kernel side of the hand-back.
pub trait TokenReleaser {
    /// Releases every token in `runs`; returns how many the kernel freed.
    fn release_tokens(&mut self, runs: &[TokenRun]) -> io::Result<usize>;
}

/// Checked-out fragment. Give it back with [`FragmentLedger::release_loan`].
#[must_use = "a loaned fragment stays pinned until it is released"]
#[derive(Debug, PartialEq, Eq)]
pub struct FragmentLoan {
    fragment: RxFragment,
    seq: u64,
}

impl FragmentLoan {
    pub fn fragment(&self) -> &RxFragment {
        &self.fragment
    }

    pub fn token(&self) -> u32 {
        self.fragment.token
    }

    pub fn len(&self) -> usize {
        self.fragment.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.fragment.len == 0
    }

    /// Payload bytes. Only valid until the loan is released.
    pub fn bytes<'r>(&self, region: &'r DmaRegion) -> RegionResult<&'r [u8]> {
        region.slice(self.fragment.offset as usize, self.len())
    }
}

#[derive(Debug)]
struct Entry {
    fragment: RxFragment,
    seq: u64,
    live: bool,
}

/// Arena of fragment entries indexed by token.
///
/// Dead slots are recycled through a free list, so the arena only grows to
/// the high-water mark of simultaneously live fragments.
#[derive(Debug, Default)]
pub struct FragmentLedger {
    entries: Vec<Entry>,
    free: Vec<usize>,
    by_token: HashMap<u32, usize>,
    next_seq: u64,
    live: usize,
}

impl FragmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fragment reported by receive metadata and checks it out.
    pub fn record_fragment(&mut self, fragment: RxFragment) -> LedgerResult<FragmentLoan> {
        if let Some(&idx) = self.by_token.get(&fragment.token) {
            error!(
                token = fragment.token,
                existing = ?self.entries[idx].fragment,
                reported = ?fragment,
                "kernel reused a live fragment token"
            );
            return Err(LedgerError::DuplicateToken {
                token: fragment.token,
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = Entry {
            fragment,
            seq,
            live: true,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.entries[idx] = entry;
                idx
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        self.by_token.insert(fragment.token, idx);
        self.live += 1;
        Ok(FragmentLoan { fragment, seq })
    }

    /// Releases `count` tokens starting at `token`.
    ///
    /// Every token in the run must be live; otherwise nothing happens and the
    /// first missing token is reported. Loans still held for released tokens
    /// become stale and are refused by [`FragmentLedger::release_loan`].
    pub fn release<R: TokenReleaser + ?Sized>(
        &mut self,
        releaser: &mut R,
        token: u32,
        count: u32,
    ) -> LedgerResult<()> {
        if count == 0 {
            return Ok(());
        }
        for offset in 0..count {
            let candidate = token
                .checked_add(offset)
                .ok_or(LedgerError::UnknownToken { token })?;
            if !self.is_live(candidate) {
                return Err(LedgerError::UnknownToken { token: candidate });
            }
        }
        self.hand_back(releaser, &[TokenRun { start: token, count }])
    }

    pub fn release_loan<R: TokenReleaser + ?Sized>(
        &mut self,
        releaser: &mut R,
        loan: FragmentLoan,
    ) -> LedgerResult<()> {
        self.release_loans(releaser, [loan])
    }

    /// Releases a batch of loans, coalescing contiguous tokens into runs.
    pub fn release_loans<R, I>(&mut self, releaser: &mut R, loans: I) -> LedgerResult<()>
    where
        R: TokenReleaser + ?Sized,
        I: IntoIterator<Item = FragmentLoan>,
    {
        let mut tokens = Vec::new();
        for loan in loans {
            let current = self
                .by_token
                .get(&loan.fragment.token)
                .map(|&idx| &self.entries[idx]);
            match current {
                Some(entry) if entry.live && entry.seq == loan.seq => tokens.push(loan.fragment.token),
                _ => {
                    return Err(LedgerError::UnknownToken {
                        token: loan.fragment.token,
                    })
                }
            }
        }
        if tokens.is_empty() {
            return Ok(());
        }
        let runs = coalesce_runs(&mut tokens);
        self.hand_back(releaser, &runs)
    }

    /// Hands every live fragment back. Returns how many were released.
    pub fn release_all<R: TokenReleaser + ?Sized>(&mut self, releaser: &mut R) -> LedgerResult<usize> {
        let mut tokens: Vec<u32> = self.by_token.keys().copied().collect();
        let count = tokens.len();
        if count == 0 {
            return Ok(0);
        }
        let runs = coalesce_runs(&mut tokens);
        self.hand_back(releaser, &runs)?;
        Ok(count)
    }

    pub fn outstanding_count(&self) -> usize {
        self.live
    }

    pub fn is_live(&self, token: u32) -> bool {
        self.by_token.contains_key(&token)
    }

    pub fn fragment(&self, token: u32) -> Option<&RxFragment> {
        self.by_token.get(&token).map(|&idx| &self.entries[idx].fragment)
    }

    /// Issues the kernel release first and forgets entries only once it went
    /// through. A short count still forgets: the application has let go.
    fn hand_back<R: TokenReleaser + ?Sized>(
        &mut self,
        releaser: &mut R,
        runs: &[TokenRun],
    ) -> LedgerResult<()> {
        let mut requested = 0usize;
        let mut freed = 0usize;
        for batch in release_batches(runs) {
            let batch_tokens: usize = batch.iter().map(|run| run.count as usize).sum();
            let batch_freed = releaser.release_tokens(&batch).map_err(LedgerError::Release)?;
            for run in &batch {
                for step in 0..run.count {
                    self.forget(run.start.wrapping_add(step));
                }
            }
            requested += batch_tokens;
            freed += batch_freed;
        }

        debug!(runs = runs.len(), requested, freed, outstanding = self.live, "released fragments");
        if freed < requested {
            warn!(requested, freed, "kernel freed fewer tokens than requested");
            return Err(LedgerError::ReleaseShortfall { requested, freed });
        }
        Ok(())
    }

    fn forget(&mut self, token: u32) {
        if let Some(idx) = self.by_token.remove(&token) {
            self.entries[idx].live = false;
            self.free.push(idx);
            self.live -= 1;
        }
    }
}

impl LoanTracker for FragmentLedger {
    fn outstanding(&self) -> usize {
        self.live
    }
}

/// Hands back tokens the ledger never recorded, such as the rest of a
/// receive batch abandoned after a protocol fault. Returns how many the
/// kernel freed.
pub fn release_untracked<R: TokenReleaser + ?Sized>(
    releaser: &mut R,
    tokens: &mut [u32],
) -> io::Result<usize> {
    let runs = coalesce_runs(tokens);
    let mut freed = 0usize;
    for batch in release_batches(&runs) {
        freed += releaser.release_tokens(&batch)?;
    }
    Ok(freed)
}

/// Splits `runs` into requests of at most [`MAX_RUNS_PER_RELEASE`] runs and
/// [`MAX_TOKENS_PER_RELEASE`] tokens, cutting long runs where needed.
pub fn release_batches(runs: &[TokenRun]) -> Vec<Vec<TokenRun>> {
    let mut batches = Vec::new();
    let mut batch: Vec<TokenRun> = Vec::new();
    let mut batch_tokens = 0usize;
    for run in runs {
        let mut rest = *run;
        while rest.count > 0 {
            if batch.len() == MAX_RUNS_PER_RELEASE || batch_tokens == MAX_TOKENS_PER_RELEASE {
                batches.push(std::mem::take(&mut batch));
                batch_tokens = 0;
            }
            let take = rest.count.min((MAX_TOKENS_PER_RELEASE - batch_tokens) as u32);
            batch.push(TokenRun {
                start: rest.start,
                count: take,
            });
            batch_tokens += take as usize;
            rest.start = rest.start.wrapping_add(take);
            rest.count -= take;
        }
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

/// Sorts `tokens` and folds consecutive ids into runs.
pub fn coalesce_runs(tokens: &mut [u32]) -> Vec<TokenRun> {
    tokens.sort_unstable();
    let mut runs: Vec<TokenRun> = Vec::new();
    for &token in tokens.iter() {
        match runs.last_mut() {
            Some(run) if run.start.checked_add(run.count) == Some(token) => run.count += 1,
            _ => runs.push(TokenRun {
                start: token,
                count: 1,
            }),
        }
    }
    runs
}
