use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic source of job name suffixes, shared between all clients of a run
#[derive(Debug, Default)]
pub struct JobSequence {
    next: AtomicU64,
}

impl JobSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// start counting at `first`, e.g., to continue the numbering of a previous run
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// `<base>_<n>` with a fresh sequence number
    pub fn job_name(&self, base: &str) -> String {
        format!("{base}_{}", self.next())
    }
}
