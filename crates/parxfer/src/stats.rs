//! Process-wide atomic counters, one `{total, failed}` pair per operation class. Zeroed at
//! startup, read back once at shutdown after every worker has joined (so `Relaxed` ordering is
//! sufficient: the join itself establishes happens-before).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::is_cancellation_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    FileOp,
    ShellOp,
    S3Op,
}

#[derive(Default)]
struct Counter {
    total: AtomicU64,
    failed: AtomicU64,
}

impl Counter {
    fn snapshot(&self) -> (u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

#[derive(Default)]
pub struct Stats {
    file: Counter,
    shell: Counter,
    s3: Counter,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, class: OpClass) -> &Counter {
        match class {
            OpClass::FileOp => &self.file,
            OpClass::ShellOp => &self.shell,
            OpClass::S3Op => &self.s3,
        }
    }

    /// Increments `total` unconditionally and `failed` iff `result` is `Err` and the error is
    /// not a cancellation error.
    pub fn increment_if_success<T>(&self, class: OpClass, result: &anyhow::Result<T>) {
        let counter = self.counter(class);
        counter.total.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = result {
            if !is_cancellation_error(err) {
                counter.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self, class: OpClass) -> (u64, u64) {
        self.counter(class).snapshot()
    }

    pub fn total_failed(&self) -> u64 {
        self.snapshot(OpClass::FileOp).1 + self.snapshot(OpClass::ShellOp).1 + self.snapshot(OpClass::S3Op).1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_success_without_incrementing_failed() {
        let stats = Stats::new();
        let ok: anyhow::Result<()> = Ok(());
        stats.increment_if_success(OpClass::S3Op, &ok);
        assert_eq!(stats.snapshot(OpClass::S3Op), (1, 0));
    }

    #[test]
    fn counts_genuine_failure() {
        let stats = Stats::new();
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("boom"));
        stats.increment_if_success(OpClass::FileOp, &err);
        assert_eq!(stats.snapshot(OpClass::FileOp), (1, 1));
    }

    #[test]
    fn cancellation_bumps_total_not_failed() {
        let stats = Stats::new();
        let err: anyhow::Result<()> = Err(crate::error::Error::Cancelled.into());
        stats.increment_if_success(OpClass::ShellOp, &err);
        assert_eq!(stats.snapshot(OpClass::ShellOp), (1, 0));
    }
}
