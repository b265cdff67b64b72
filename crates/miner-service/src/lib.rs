#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Mining service: configuration, per-device workers and share plumbing.
//!
//! The service owns one `Worker` per claimed device. A block source hands it
//! `BlockHeader`s; an external `HeaderHasher` (Skein→Keccak in production)
//! turns header bytes into the 1024-bit search base. Found shares are posted
//! onto the Tokio I/O executor through the callback passed at `set_block`
//! time; the callback is never stored by the block source, which keeps the
//! collaborator graph acyclic.

use std::fmt;
use std::sync::Arc;

use engine_cpu::montgomery::FERMAT_BATCH_CAP;
use engine_cpu::sieve::SieveParams;
use engine_cpu::{CpuEngine, EngineError, PrimeEngine};
use prime_core::{Pattern, U1024, U512};

pub mod selftest;
pub mod stats;
pub mod worker;

pub use stats::{PrimeStats, StatsCollector};
pub use worker::Worker;

/// Inbound work from the block source.
#[derive(Clone, Debug)]
pub struct BlockHeader {
    pub header_bytes: Vec<u8>,
    pub merkle_root: U512,
    pub previous_hash: U1024,
    pub nbits: u32,
}

/// Outbound share delivered through the block-found callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundShare {
    pub internal_id: u16,
    pub merkle_root: U512,
    pub previous_hash: U1024,
    pub nonce: u64,
    pub nonce_difficulty: u32,
}

/// Share callback; posted onto the I/O executor per share.
pub type ShareHandler = Arc<dyn Fn(FoundShare) + Send + Sync>;

/// Bounded-channel share handler for callers that consume shares from a
/// receiver (the CLI and tests).
pub fn channel_share_handler(
    capacity: usize,
) -> (ShareHandler, crossbeam_channel::Receiver<FoundShare>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let handler: ShareHandler = Arc::new(move |share| {
        if tx.try_send(share).is_err() {
            log::warn!(target: "miner", "share receiver full or gone; share dropped");
        }
    });
    (handler, rx)
}

/// External header hasher (Skein→Keccak); opaque to the core.
pub trait HeaderHasher: Send + Sync {
    fn hash_header(&self, header_bytes: &[u8]) -> U1024;
}

/// Bench/test hasher: the header bytes already are the big-endian 1024-bit
/// hash.
pub struct IdentityHasher;

impl HeaderHasher for IdentityHasher {
    fn hash_header(&self, header_bytes: &[u8]) -> U1024 {
        let mut padded = [0u8; 128];
        let n = header_bytes.len().min(128);
        padded[128 - n..].copy_from_slice(&header_bytes[..n]);
        U1024::from_big_endian(&padded)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineSelection {
    /// CPU reference path; verification and tests only.
    CpuReference,
    /// wgpu compute backend, one worker per device id.
    Gpu,
}

/// Immutable miner configuration, built once at startup and shared read-only
/// with every worker.
#[derive(Clone)]
pub struct MinerConfig {
    /// `L = 2^x`; valid range 20–28.
    pub sieving_prime_limit_log2: u32,
    /// Batch bitmap size exponent; valid range 20–28.
    pub sieve_bits_log2: u32,
    /// Sieve batches per flush/report cycle, as an exponent.
    pub sieve_iterations_log2: u32,
    /// Minimum confirmed chain length worth reporting; also the locator's
    /// survivor threshold.
    pub test_levels: u32,
    /// GPU devices to claim; at most 8.
    pub device_ids: Vec<u32>,
    pub pattern: Pattern,
    /// Fermat queue flush threshold; capped by the device batch limit.
    pub fermat_batch_size: usize,
    pub engine: EngineSelection,
}

impl Default for MinerConfig {
    fn default() -> Self {
        MinerConfig {
            sieving_prime_limit_log2: 23,
            sieve_bits_log2: 24,
            sieve_iterations_log2: 4,
            test_levels: 6,
            device_ids: vec![0],
            pattern: Pattern::classic(),
            fermat_batch_size: FERMAT_BATCH_CAP,
            engine: EngineSelection::Gpu,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    OutOfRange { name: &'static str, value: u64, min: u64, max: u64 },
    NoDevices,
    TooManyDevices(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::OutOfRange { name, value, min, max } => {
                write!(f, "{name} = {value} outside valid range {min}..={max}")
            }
            ConfigError::NoDevices => write!(f, "no GPU devices configured"),
            ConfigError::TooManyDevices(n) => write!(f, "{n} devices configured, maximum is 8"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl MinerConfig {
    /// Startup validation of the configuration surface. Violations refuse to
    /// start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        range(
            "sieving_prime_limit_log2",
            self.sieving_prime_limit_log2 as u64,
            20,
            28,
        )?;
        range("sieve_bits_log2", self.sieve_bits_log2 as u64, 20, 28)?;
        range("sieve_iterations_log2", self.sieve_iterations_log2 as u64, 0, 10)?;
        range("test_levels", self.test_levels as u64, 1, 10)?;
        range(
            "fermat_batch_size",
            self.fermat_batch_size as u64,
            1,
            FERMAT_BATCH_CAP as u64,
        )?;
        if self.engine == EngineSelection::Gpu {
            if self.device_ids.is_empty() {
                return Err(ConfigError::NoDevices);
            }
            if self.device_ids.len() > 8 {
                return Err(ConfigError::TooManyDevices(self.device_ids.len()));
            }
        }
        Ok(())
    }

    pub fn sieve_params(&self) -> Result<SieveParams, EngineError> {
        SieveParams::from_log2(self.sieving_prime_limit_log2, self.sieve_bits_log2)
    }
}

fn range(name: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange { name, value, min, max });
    }
    Ok(())
}

/// The mining service: one worker per engine, shared immutable config.
pub struct MinerService {
    config: Arc<MinerConfig>,
    workers: Vec<Worker>,
    collector: StatsCollector,
    io: tokio::runtime::Handle,
}

impl MinerService {
    /// Build one engine per configured device. Engine construction failures
    /// (missing device, compile errors) are fatal at startup.
    pub fn build_engines(config: &MinerConfig) -> anyhow::Result<Vec<Box<dyn PrimeEngine>>> {
        let params = config.sieve_params()?;
        let mut engines: Vec<Box<dyn PrimeEngine>> = Vec::new();
        match config.engine {
            EngineSelection::CpuReference => {
                for _ in &config.device_ids {
                    engines.push(Box::new(CpuEngine::new(params.clone())));
                }
            }
            EngineSelection::Gpu => {
                for &id in &config.device_ids {
                    engines.push(Box::new(engine_gpu::GpuEngine::new(
                        params.clone(),
                        id as usize,
                    )?));
                }
            }
        }
        Ok(engines)
    }

    pub fn new(
        config: Arc<MinerConfig>,
        engines: Vec<Box<dyn PrimeEngine>>,
        io: tokio::runtime::Handle,
    ) -> Self {
        let workers: Vec<Worker> = engines
            .into_iter()
            .enumerate()
            .map(|(i, engine)| Worker::new(i as u16, config.clone(), engine))
            .collect();
        let collector = StatsCollector::new(workers.iter().map(|w| w.stats_handle()).collect());
        MinerService { config, workers, collector, io }
    }

    pub fn config(&self) -> &MinerConfig {
        &self.config
    }

    pub fn collector(&self) -> &StatsCollector {
        &self.collector
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn any_unhealthy(&self) -> bool {
        self.workers.iter().any(|w| w.is_unhealthy())
    }

    /// Hand every worker the new block. Each worker cancels its current run,
    /// reprimes and relaunches in its own nonce subspace.
    pub fn set_block(
        &mut self,
        header: &BlockHeader,
        hasher: &dyn HeaderHasher,
        on_share: Option<ShareHandler>,
    ) -> anyhow::Result<()> {
        for worker in &mut self.workers {
            worker
                .set_block(header, hasher, on_share.clone(), self.io.clone())
                .map_err(|e| anyhow::anyhow!("worker {}: {e}", worker.internal_id()))?;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
    }

    /// Periodic aggregate report on the I/O executor.
    pub fn start_report_loop(&self, interval: std::time::Duration) {
        let collector = self.collector.clone();
        self.io.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                collector.log_summary();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prime_core::{verify, wheel::WHEEL};
    use std::time::Duration;

    fn test_config() -> MinerConfig {
        // Deliberately tiny parameters (outside the production validation
        // ranges) so the CPU reference engine can find shares in seconds.
        MinerConfig {
            sieving_prime_limit_log2: 4,
            sieve_bits_log2: 12,
            sieve_iterations_log2: 0,
            test_levels: 1,
            device_ids: vec![0],
            pattern: Pattern::classic(),
            fermat_batch_size: 32,
            engine: EngineSelection::CpuReference,
        }
    }

    fn test_header(byte: u8, nbits: u32) -> BlockHeader {
        BlockHeader {
            header_bytes: vec![byte; 128],
            merkle_root: U512::from(7u64),
            previous_hash: U1024::from(9u64),
            nbits,
        }
    }

    fn test_service(config: &MinerConfig) -> MinerService {
        let engines = MinerService::build_engines(config).expect("engines");
        MinerService::new(
            Arc::new(config.clone()),
            engines,
            tokio::runtime::Handle::current(),
        )
    }

    #[test]
    fn config_validation_bounds() {
        let mut config = MinerConfig::default();
        assert!(config.validate().is_ok());

        config.sieving_prime_limit_log2 = 19;
        assert!(matches!(config.validate(), Err(ConfigError::OutOfRange { .. })));
        config.sieving_prime_limit_log2 = 23;

        config.test_levels = 0;
        assert!(matches!(config.validate(), Err(ConfigError::OutOfRange { .. })));
        config.test_levels = 11;
        assert!(matches!(config.validate(), Err(ConfigError::OutOfRange { .. })));
        config.test_levels = 6;

        config.device_ids = vec![];
        assert!(matches!(config.validate(), Err(ConfigError::NoDevices)));
        config.device_ids = (0..9).collect();
        assert!(matches!(config.validate(), Err(ConfigError::TooManyDevices(9))));
    }

    #[test]
    fn identity_hasher_pads_left() {
        let h = IdentityHasher.hash_header(&[1, 2]);
        assert_eq!(h, U1024::from(0x0102u64));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mined_share_nonce_maps_back_to_a_probable_prime() {
        let config = test_config();
        let mut service = test_service(&config);
        let (handler, rx) = channel_share_handler(64);
        let header = test_header(0xAA, 1); // any confirmed chain is a share
        service
            .set_block(&header, &IdentityHasher, Some(handler))
            .unwrap();

        let share = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(120)))
            .await
            .unwrap()
            .expect("expected a share with trivial difficulty");
        service.stop();

        let h = IdentityHasher.hash_header(&header.header_bytes);
        let p = h + U1024::from(share.nonce);
        assert!(verify::is_fermat_prime(&p), "share base must be probable prime");
        // The base sits on a wheel residue the pattern admits.
        let residue = (p % U1024::from(WHEEL)).low_u64() as u32;
        let wheel = prime_core::Wheel::new();
        assert!(config
            .pattern
            .admissible_base_planes(&wheel)
            .iter()
            .any(|&plane| wheel.residue(plane as usize) == residue));
        assert_eq!(share.internal_id, 0);
        assert_eq!(share.merkle_root, header.merkle_root);
        assert!(share.nonce_difficulty >= header.nbits);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn new_block_cancels_previous_work() {
        let config = test_config();
        let mut service = test_service(&config);

        let (handler_a, rx_a) = channel_share_handler(1024);
        service
            .set_block(&test_header(0xAA, 1), &IdentityHasher, Some(handler_a))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let (handler_b, _rx_b) = channel_share_handler(1024);
        service
            .set_block(&test_header(0xBB, 1), &IdentityHasher, Some(handler_b))
            .unwrap();

        // Drain anything posted before the cutover, then verify silence.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let settled = rx_a.len();
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(
            rx_a.len(),
            settled,
            "no share from the old block may surface after the cutover"
        );
        service.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_callback_drops_shares_quietly() {
        let config = test_config();
        let mut service = test_service(&config);
        service
            .set_block(&test_header(0xCC, 1), &IdentityHasher, None)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        service.stop();
        // Mining proceeded; nothing to assert beyond a clean shutdown.
        assert!(service.collector().total().range_searched > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_workers_cover_disjoint_subspaces() {
        let mut config = test_config();
        config.device_ids = vec![0, 1];
        let mut service = test_service(&config);
        assert_eq!(service.worker_count(), 2);

        let (handler, rx) = channel_share_handler(1024);
        service
            .set_block(&test_header(0xAA, 1), &IdentityHasher, Some(handler))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        service.stop();

        let boundary = 1u64 << 48;
        for share in rx.try_iter() {
            match share.internal_id {
                0 => assert!(share.nonce < boundary),
                1 => assert!(share.nonce >= boundary),
                other => panic!("unexpected worker id {other}"),
            }
        }
    }
}
