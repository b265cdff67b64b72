//! Per-worker mining statistics and the collector that merges them.

use std::sync::{Arc, Mutex};

/// Counters one worker accumulates while mining. `difficulty` and
/// `block_range_searched` are per-block; the rest survive block changes and
/// are reported cumulatively, mirroring the periodic debug report.
#[derive(Clone, Debug, Default)]
pub struct PrimeStats {
    pub fermat_tests: u64,
    pub fermat_primes: u64,
    pub chains: u64,
    pub chain_total_length: u64,
    pub chain_max_length: u32,
    /// Confirmed chain lengths, clamped to 0..=9.
    pub chain_histogram: [u64; 10],
    pub range_searched: u64,
    pub block_range_searched: u64,
    pub shares: u64,
    pub cross_check_failures: u64,
    /// Current block's nbits.
    pub difficulty: u32,
}

impl PrimeStats {
    pub fn begin_block(&mut self, nbits: u32) {
        self.difficulty = nbits;
        self.block_range_searched = 0;
    }

    pub fn record_chain(&mut self, surviving: u32) {
        self.chains += 1;
        self.chain_total_length += surviving as u64;
        self.chain_max_length = self.chain_max_length.max(surviving);
    }

    pub fn record_confirmed_length(&mut self, length: u32) {
        self.chain_histogram[length.min(9) as usize] += 1;
    }

    pub fn fermat_positive_rate(&self) -> f64 {
        if self.fermat_tests == 0 {
            return 0.0;
        }
        self.fermat_primes as f64 / self.fermat_tests as f64
    }

    pub fn chains_per_million(&self) -> f64 {
        if self.range_searched == 0 {
            return 0.0;
        }
        1.0e6 * self.chains as f64 / self.range_searched as f64
    }

    pub fn avg_chain_length(&self) -> f64 {
        if self.chains == 0 {
            return 0.0;
        }
        self.chain_total_length as f64 / self.chains as f64
    }

    pub fn merge(&mut self, other: &PrimeStats) {
        self.fermat_tests += other.fermat_tests;
        self.fermat_primes += other.fermat_primes;
        self.chains += other.chains;
        self.chain_total_length += other.chain_total_length;
        self.chain_max_length = self.chain_max_length.max(other.chain_max_length);
        for (into, from) in self.chain_histogram.iter_mut().zip(&other.chain_histogram) {
            *into += from;
        }
        self.range_searched += other.range_searched;
        self.block_range_searched += other.block_range_searched;
        self.shares += other.shares;
        self.cross_check_failures += other.cross_check_failures;
        self.difficulty = self.difficulty.max(other.difficulty);
    }
}

/// Read-side view over every worker's stats.
#[derive(Clone, Default)]
pub struct StatsCollector {
    workers: Vec<Arc<Mutex<PrimeStats>>>,
}

impl StatsCollector {
    pub fn new(workers: Vec<Arc<Mutex<PrimeStats>>>) -> Self {
        StatsCollector { workers }
    }

    pub fn worker(&self, internal_id: u16) -> Option<PrimeStats> {
        self.workers
            .get(internal_id as usize)
            .map(|w| w.lock().expect("stats lock").clone())
    }

    pub fn total(&self) -> PrimeStats {
        let mut total = PrimeStats::default();
        for w in &self.workers {
            total.merge(&w.lock().expect("stats lock"));
        }
        total
    }

    pub fn log_summary(&self) {
        let t = self.total();
        log::info!(
            target: "miner",
            "{:.2} billion integers searched. {} chain candidates ({:.2}/Mi, avg len {:.2}, max {}). \
             Fermat {}/{} ({:.3}% positive). {} shares.",
            t.range_searched as f64 / 1.0e9,
            t.chains,
            t.chains_per_million(),
            t.avg_chain_length(),
            t.chain_max_length,
            t.fermat_primes,
            t.fermat_tests,
            100.0 * t.fermat_positive_rate(),
            t.shares,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates() {
        let mut a = PrimeStats { fermat_tests: 10, fermat_primes: 2, chains: 3, ..Default::default() };
        a.chain_histogram[2] = 1;
        let mut b = PrimeStats { fermat_tests: 5, fermat_primes: 1, chains: 1, ..Default::default() };
        b.chain_histogram[2] = 2;
        a.merge(&b);
        assert_eq!(a.fermat_tests, 15);
        assert_eq!(a.fermat_primes, 3);
        assert_eq!(a.chains, 4);
        assert_eq!(a.chain_histogram[2], 3);
    }

    #[test]
    fn rates() {
        let mut s = PrimeStats::default();
        assert_eq!(s.fermat_positive_rate(), 0.0);
        s.fermat_tests = 100;
        s.fermat_primes = 3;
        assert!((s.fermat_positive_rate() - 0.03).abs() < 1e-12);
        s.range_searched = 2_000_000;
        s.chains = 4;
        assert!((s.chains_per_million() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn begin_block_resets_only_block_scope() {
        let mut s = PrimeStats { range_searched: 10, block_range_searched: 10, ..Default::default() };
        s.begin_block(31_000_000);
        assert_eq!(s.difficulty, 31_000_000);
        assert_eq!(s.block_range_searched, 0);
        assert_eq!(s.range_searched, 10);
    }

    #[test]
    fn histogram_clamps_length() {
        let mut s = PrimeStats::default();
        s.record_confirmed_length(42);
        assert_eq!(s.chain_histogram[9], 1);
    }
}
