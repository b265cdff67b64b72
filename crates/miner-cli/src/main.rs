use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use miner_service::{
    channel_share_handler, selftest, BlockHeader, EngineSelection, IdentityHasher, MinerConfig,
    MinerService,
};
use prime_core::{Pattern, U1024, U512};

/// Nexus-style GPU prime-constellation miner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Sieving-prime limit exponent: L = 2^x (20-28)
    #[arg(long, env = "MINER_SIEVE_PRIMES_LOG2", default_value_t = 23)]
    sieving_prime_limit_log2: u32,

    /// Sieve batch size exponent in bitmap bits (20-28)
    #[arg(long, env = "MINER_SIEVE_BITS_LOG2", default_value_t = 24)]
    sieve_bits_log2: u32,

    /// Sieve batches per flush/report cycle, as an exponent
    #[arg(long, env = "MINER_SIEVE_ITERATIONS_LOG2", default_value_t = 4)]
    sieve_iterations_log2: u32,

    /// Minimum confirmed chain length to report (1-10)
    #[arg(long, env = "MINER_TEST_LEVELS", default_value_t = 6)]
    test_levels: u32,

    /// GPU device indices to claim (comma separated, at most 8)
    #[arg(long = "devices", env = "MINER_DEVICES", value_delimiter = ',', default_value = "0")]
    device_ids: Vec<u32>,

    /// Constellation offset file (one offset per line); classic octuplet if omitted
    #[arg(long, env = "MINER_OFFSET_FILE")]
    offset_file: Option<PathBuf>,

    /// Compute backend
    #[arg(long, env = "MINER_ENGINE", value_enum, default_value_t = EngineCli::Gpu)]
    engine: EngineCli,

    /// Skip the startup performance self-tests
    #[arg(long)]
    skip_self_test: bool,

    /// Mine from this 1024-bit block hash (hex); self-tests only if omitted
    #[arg(long, env = "MINER_HEADER_HASH")]
    header_hash: Option<String>,

    /// Network difficulty target as nbits (difficulty = nbits / 10^7)
    #[arg(long, env = "MINER_NBITS", default_value_t = 30_000_000)]
    nbits: u32,

    /// Optional Prometheus metrics exporter port
    #[arg(long, env = "MINER_METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum EngineCli {
    /// CPU reference engine (verification only)
    Cpu,
    /// wgpu compute backend
    Gpu,
}

impl From<EngineCli> for EngineSelection {
    fn from(value: EngineCli) -> Self {
        match value {
            EngineCli::Cpu => EngineSelection::CpuReference,
            EngineCli::Gpu => EngineSelection::Gpu,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    log::info!("starting prime-constellation miner...");
    if let Err(e) = run(args).await {
        log::error!("miner terminated with error: {e:?}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let pattern = match &args.offset_file {
        Some(path) => {
            let pattern = Pattern::load(path)
                .map_err(|e| anyhow::anyhow!("offset file {}: {e}", path.display()))?;
            log::info!("loaded {}-offset pattern from {}", pattern.len(), path.display());
            pattern
        }
        None => {
            log::info!("no offset file given; using the classic octuplet pattern");
            Pattern::classic()
        }
    };

    let config = MinerConfig {
        sieving_prime_limit_log2: args.sieving_prime_limit_log2,
        sieve_bits_log2: args.sieve_bits_log2,
        sieve_iterations_log2: args.sieve_iterations_log2,
        test_levels: args.test_levels,
        device_ids: args.device_ids.clone(),
        pattern,
        engine: args.engine.into(),
        ..MinerConfig::default()
    };
    config.validate()?;
    log::info!(
        "config: L=2^{}, sieve=2^{} bits, {} devices, test levels {}, engine {:?}",
        config.sieving_prime_limit_log2,
        config.sieve_bits_log2,
        config.device_ids.len(),
        config.test_levels,
        args.engine
    );

    if let Some(port) = args.metrics_port {
        #[cfg(feature = "metrics")]
        metrics::start_http_exporter(port).await?;
        #[cfg(not(feature = "metrics"))]
        log::warn!("metrics port {port} given, but the 'metrics' feature is not enabled");
    }

    let mut engines = MinerService::build_engines(&config)?;

    if !args.skip_self_test {
        for engine in &mut engines {
            let fermat = selftest::fermat_performance_test(engine.as_mut(), 10_000)?;
            log::info!(
                "{}: {:.0} Fermat tests/s",
                engine.name(),
                fermat.tests_per_second
            );
            let sieve = selftest::sieve_performance_test(engine.as_mut(), &config, 1_000)?;
            log::info!(
                "{}: {:.1} MISPS, {:.2} chains/Mi",
                engine.name(),
                sieve.sieved_range as f64 / sieve.sieve_elapsed.as_secs_f64().max(1e-9) / 1e6,
                1.0e6 * sieve.chains as f64 / sieve.sieved_range as f64
            );
        }
    }

    let Some(header_hex) = args.header_hash else {
        log::info!("no --header-hash given; self-tests complete, exiting");
        return Ok(());
    };
    let header_bytes = hex::decode(header_hex.trim_start_matches("0x"))
        .map_err(|e| anyhow::anyhow!("--header-hash must be hex: {e}"))?;
    if header_bytes.len() != 128 {
        anyhow::bail!(
            "--header-hash must be 128 bytes (256 hex chars), got {}",
            header_bytes.len()
        );
    }

    let mut service = MinerService::new(
        Arc::new(config),
        engines,
        tokio::runtime::Handle::current(),
    );
    service.start_report_loop(std::time::Duration::from_secs(30));

    let (handler, shares) = channel_share_handler(1024);
    let header = BlockHeader {
        header_bytes,
        merkle_root: U512::zero(),
        previous_hash: U1024::zero(),
        nbits: args.nbits,
    };
    service.set_block(&header, &IdentityHasher, Some(handler))?;
    log::info!("mining started; target difficulty {:.7}", args.nbits as f64 / 1e7);

    let share_logger = tokio::task::spawn_blocking(move || {
        for share in shares.iter() {
            log::info!(
                "SHARE worker {} nonce {} difficulty {:.7}",
                share.internal_id,
                share.nonce,
                share.nonce_difficulty as f64 / 1e7
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("interrupt received; stopping workers");
    service.stop();
    service.collector().log_summary();
    drop(service);
    share_logger.abort();
    Ok(())
}
