//! Startup performance self-tests.
//!
//! Run before mining to exercise the Fermat tester and the sieve against a
//! known 1024-bit starting point, reporting throughput and measured-versus-
//! expected rates. A backend whose numbers are far off is misconfigured or
//! miscompiled; the cross-checks during mining will catch outright wrong
//! arithmetic, these catch slow or implausible backends early.

use std::time::{Duration, Instant};

use engine_cpu::locator::ChainLocator;
use engine_cpu::sieve::SegmentBitmap;
use engine_cpu::{EngineError, PrimeEngine};
use prime_core::wheel::{WHEEL, WHEEL_RESIDUES};
use prime_core::{primes, U1024, Wheel};

use crate::MinerConfig;

/// Known 1024-bit starting point used by the self-tests (block 200 hash).
pub const T200_HEX: &str = "53bf18ac03f0adfb36fc4864b42013375ebdc0bb311f06636771e605ad731ca1\
                            383c7d9056522ed9bda4f608ef71498bc9c7dade6c56bf1534494e0ef371e79f\
                            09433e4c9e64624695a42d7920bd5022f449156d2f93f3be3a429159794ac9e4\
                            9f69c706793ef249a284f9173a82379e62dffac42c0f53f155f65a784f31f42c";

/// Batch size of the full Fermat throughput test.
pub const FERMAT_PERF_BATCH: usize = 100_000;

/// Primes the full test is expected to find in its fixed offset ramp.
pub const FERMAT_PERF_EXPECTED_PRIMES: u64 = 269;

pub fn t200() -> U1024 {
    U1024::from_str_radix(T200_HEX, 16).expect("constant parses")
}

#[derive(Clone, Debug)]
pub struct FermatPerfReport {
    pub attempted: u64,
    pub passed: u64,
    pub expected: f64,
    pub elapsed: Duration,
    pub tests_per_second: f64,
}

/// Fermat throughput test: a fixed ramp of even offsets from the (odd-forced)
/// T200 base. With the full batch size the prime count is a known constant.
pub fn fermat_performance_test(
    engine: &mut dyn PrimeEngine,
    batch_size: usize,
) -> Result<FermatPerfReport, EngineError> {
    log::info!(target: "miner", "starting Fermat primality throughput test");
    let base = t200() | U1024::one();
    let offset_start: u64 = 0xFF_FFFF_FFFF_FFFE;
    let offsets: Vec<u64> = (0..batch_size as u64)
        .map(|j| (offset_start + j) * 2)
        .collect();

    let start = Instant::now();
    let outcome = engine.fermat_batch(&base, &offsets)?;
    let elapsed = start.elapsed();

    let expected = batch_size as f64 * 2.0 / (1024.0 * std::f64::consts::LN_2);
    let tests_per_second = batch_size as f64 / elapsed.as_secs_f64().max(1e-9);
    log::info!(
        target: "miner",
        "found {} primes out of {} tested; expected about {:.0}",
        outcome.passed,
        outcome.attempted,
        expected
    );
    log::info!(
        target: "miner",
        "{:.2} primality tests/second ({:.3} ms each)",
        tests_per_second,
        1e3 / tests_per_second
    );
    Ok(FermatPerfReport {
        attempted: outcome.attempted,
        passed: outcome.passed,
        expected,
        elapsed,
        tests_per_second,
    })
}

#[derive(Clone, Debug)]
pub struct SievePerfReport {
    pub sieved_range: u64,
    pub survivor_ratio: f64,
    pub expected_ratio: f64,
    pub chains: usize,
    pub sieve_elapsed: Duration,
    pub locate_elapsed: Duration,
    pub fermat_positive_rate: f64,
    pub expected_positive_rate: f64,
}

/// Sieve accuracy and throughput test over one batch from the T200 origin:
/// measured pass-through and Fermat positive rates against their expected
/// values, plus chains-per-range from the locator.
pub fn sieve_performance_test(
    engine: &mut dyn PrimeEngine,
    config: &MinerConfig,
    fermat_sample: usize,
) -> Result<SievePerfReport, EngineError> {
    log::info!(target: "miner", "starting sieve performance test");
    let wheel = Wheel::new();
    let params = config.sieve_params()?;
    let origin = {
        let t = t200();
        t - (t % U1024::from(WHEEL))
    };
    engine.set_origin(&origin)?;

    let mut bitmap = SegmentBitmap::new(params.rows_per_batch);
    let start = Instant::now();
    engine.sieve_batch(0, &mut bitmap)?;
    let sieve_elapsed = start.elapsed();

    let sieved_range = params.span();
    let survivors = bitmap.count_survivors();
    let survivor_ratio = survivors as f64 / bitmap.positions() as f64;
    let expected_ratio: f64 = primes::sieving_primes(params.prime_limit)
        .iter()
        .map(|&q| 1.0 - 1.0 / q as f64)
        .product();
    log::info!(
        target: "miner",
        "sieved {:.1e} integers using primes up to {:.1e} in {:.3}s ({:.1} MISPS)",
        sieved_range as f64,
        params.prime_limit as f64,
        sieve_elapsed.as_secs_f64(),
        sieved_range as f64 / sieve_elapsed.as_secs_f64().max(1e-9) / 1e6
    );
    log::info!(
        target: "miner",
        "got {:.3}% sieve pass-through rate, expected about {:.3}%",
        100.0 * survivor_ratio,
        100.0 * expected_ratio
    );

    let locator = ChainLocator::new(&wheel, &config.pattern, config.test_levels)?;
    let mut chains = Vec::new();
    let locate_start = Instant::now();
    locator.locate(&bitmap, &mut chains);
    let locate_elapsed = locate_start.elapsed();
    log::info!(
        target: "miner",
        "found {} chains in {:.4}s ({:.2} chains/Mi)",
        chains.len(),
        locate_elapsed.as_secs_f64(),
        1.0e6 * chains.len() as f64 / sieved_range as f64
    );

    // Fermat positive rate over the first survivors.
    let mut sample = Vec::with_capacity(fermat_sample);
    'collect: for row in 0..bitmap.rows() {
        for plane in 0..WHEEL_RESIDUES as u8 {
            if bitmap.bit(plane, row) {
                sample.push(row as u64 * WHEEL as u64 + wheel.residue(plane as usize) as u64);
                if sample.len() == fermat_sample {
                    break 'collect;
                }
            }
        }
    }
    let outcome = engine.fermat_batch(&origin, &sample)?;
    let fermat_positive_rate = if outcome.attempted == 0 {
        0.0
    } else {
        outcome.passed as f64 / outcome.attempted as f64
    };
    let expected_positive_rate = (WHEEL as f64 / WHEEL_RESIDUES as f64)
        / (1024.0 * std::f64::consts::LN_2)
        / expected_ratio;
    log::info!(
        target: "miner",
        "got {:.3}% fermat positive rate, expected about {:.3}%",
        100.0 * fermat_positive_rate,
        100.0 * expected_positive_rate
    );

    Ok(SievePerfReport {
        sieved_range,
        survivor_ratio,
        expected_ratio,
        chains: chains.len(),
        sieve_elapsed,
        locate_elapsed,
        fermat_positive_rate,
        expected_positive_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineSelection, MinerConfig};
    use engine_cpu::CpuEngine;
    use prime_core::{verify, Pattern};

    fn small_config() -> MinerConfig {
        MinerConfig {
            sieving_prime_limit_log2: 12,
            sieve_bits_log2: 16,
            sieve_iterations_log2: 0,
            test_levels: 2,
            device_ids: vec![0],
            pattern: Pattern::classic(),
            fermat_batch_size: 256,
            engine: EngineSelection::CpuReference,
        }
    }

    #[test]
    fn fermat_perf_prefix_matches_bigint_reference() {
        // Fast variant of the throughput test: the first offsets of the ramp
        // checked one by one against the arbitrary-precision reference.
        let config = small_config();
        let mut engine = CpuEngine::new(config.sieve_params().unwrap());
        let report = fermat_performance_test(&mut engine, 200).unwrap();
        assert_eq!(report.attempted, 200);

        let base = t200() | U1024::one();
        let offset_start: u64 = 0xFF_FFFF_FFFF_FFFE;
        let reference = (0..200u64)
            .filter(|j| verify::is_fermat_prime(&(base + U1024::from((offset_start + j) * 2))))
            .count() as u64;
        assert_eq!(report.passed, reference);
    }

    #[test]
    #[ignore = "full 100k-candidate throughput test; minutes on CPU"]
    fn fermat_perf_full_batch_finds_the_expected_primes() {
        let config = small_config();
        let mut engine = CpuEngine::new(config.sieve_params().unwrap());
        let report = fermat_performance_test(&mut engine, FERMAT_PERF_BATCH).unwrap();
        assert_eq!(report.passed, FERMAT_PERF_EXPECTED_PRIMES);
    }

    #[test]
    fn sieve_perf_rates_track_expectations() {
        let config = small_config();
        let mut engine = CpuEngine::new(config.sieve_params().unwrap());
        let report = sieve_performance_test(&mut engine, &config, 64).unwrap();
        assert!(report.sieved_range > 0);
        // Loose envelope: one small batch, statistical rates.
        assert!((report.survivor_ratio / report.expected_ratio - 1.0).abs() < 0.05);
        assert!(report.fermat_positive_rate <= 1.0);
    }

    #[test]
    fn t200_constant_parses_to_1024_bits() {
        let t = t200();
        assert_eq!(t.bits(), 1023);
        assert_eq!(t.to_big_endian()[0], 0x53);
    }
}
