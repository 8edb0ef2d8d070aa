//! Per-module run statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of a module's counters, returned by `Module::read_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// FIFO pool exhaustion events that could not be resolved by
    /// compaction.
    pub fifo_overflows: u64,
    /// Queue compaction merges performed by the FIFO worker.
    pub fifo_compactions: u64,
    /// Words moved off the hardware FIFO by DMA.
    pub fifo_dma_words: u64,
    /// Words handed to `read_list_mode` callers.
    pub list_mode_words_read: u64,
    /// Bus failures observed by the FIFO worker.
    pub hw_errors: u64,
}

/// Live counters; the FIFO worker increments them lock-free.
#[derive(Debug, Default)]
pub struct Counters {
    pub fifo_overflows: AtomicU64,
    pub fifo_compactions: AtomicU64,
    pub fifo_dma_words: AtomicU64,
    pub list_mode_words_read: AtomicU64,
    pub hw_errors: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> Stats {
        Stats {
            fifo_overflows: self.fifo_overflows.load(Ordering::Relaxed),
            fifo_compactions: self.fifo_compactions.load(Ordering::Relaxed),
            fifo_dma_words: self.fifo_dma_words.load(Ordering::Relaxed),
            list_mode_words_read: self.list_mode_words_read.load(Ordering::Relaxed),
            hw_errors: self.hw_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let counters = Counters::default();
        counters.fifo_dma_words.fetch_add(8192, Ordering::Relaxed);
        counters.fifo_overflows.fetch_add(1, Ordering::Relaxed);
        let stats = counters.snapshot();
        assert_eq!(stats.fifo_dma_words, 8192);
        assert_eq!(stats.fifo_overflows, 1);
        assert_eq!(stats.list_mode_words_read, 0);
    }
}
