//! Per-device mining worker.
//!
//! Each worker owns one engine (and with it all device buffers) and drives
//! the pipeline for its nonce subspace:
//!
//! ```text
//! Idle ── set_block ──▶ Priming ── origin ready ──▶ Running
//! Running ── stop/new block ──▶ Draining ── in-flight done ──▶ Idle
//! Running ── share found ──▶ Submitting ── posted ──▶ Running
//! ```
//!
//! `set_block` is the sole cancellation trigger: it raises the stop flag,
//! joins the run thread (taking the engine back), recomputes the origin and
//! starting multiples, and relaunches. Queued candidates from the old block
//! are discarded at that point.
//!
//! Within the run loop, CPU-side chain location overlaps the next device
//! sieve batch; Fermat batches and sieve batches share the device queue
//! sequentially. Shares are posted onto the Tokio I/O executor in discovery
//! order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use engine_cpu::locator::ChainLocator;
use engine_cpu::sieve::SegmentBitmap;
use engine_cpu::{EngineError, PrimeEngine};
use prime_core::chain::{confirmed_prefix, MemberStatus};
use prime_core::wheel::WHEEL;
use prime_core::{difficulty, verify, U1024, Wheel};

use crate::stats::PrimeStats;
use crate::{BlockHeader, FoundShare, HeaderHasher, MinerConfig, ShareHandler};

/// Every Nth Fermat batch gets a sampled CPU cross-check.
const CROSS_CHECK_INTERVAL: u64 = 16;
const CROSS_CHECK_SAMPLES: usize = 4;

/// Interval between periodic progress reports while running.
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Sieve origin and nonce bookkeeping for one worker and block.
///
/// The worker's subspace starts at `H + internal_id·2^48`, advanced to the
/// next multiple of the wheel modulus; `nonce_base = S − H` so that a sieve
/// offset `δ` maps to the nonce `nonce_base + δ`.
pub fn worker_origin(base_hash: &U1024, internal_id: u16) -> (U1024, u64) {
    let start = *base_hash + (U1024::from(internal_id) << 48);
    let rem = (start % U1024::from(WHEEL)).low_u64();
    let origin = if rem == 0 {
        start
    } else {
        start + U1024::from(WHEEL as u64 - rem)
    };
    let nonce_base = (origin - *base_hash).low_u64();
    (origin, nonce_base)
}

#[derive(Clone)]
struct BlockJob {
    origin: U1024,
    nonce_base: u64,
    nbits: u32,
    merkle_root: prime_core::U512,
    previous_hash: U1024,
}

struct RunContext {
    config: Arc<MinerConfig>,
    job: BlockJob,
    internal_id: u16,
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<PrimeStats>>,
    unhealthy: Arc<AtomicBool>,
    on_share: Option<ShareHandler>,
    io: tokio::runtime::Handle,
}

struct WorkerExit {
    engine: Box<dyn PrimeEngine>,
    result: Result<(), EngineError>,
}

pub struct Worker {
    internal_id: u16,
    config: Arc<MinerConfig>,
    stop: Arc<AtomicBool>,
    engine: Option<Box<dyn PrimeEngine>>,
    run_thread: Option<thread::JoinHandle<WorkerExit>>,
    stats: Arc<Mutex<PrimeStats>>,
    unhealthy: Arc<AtomicBool>,
    failed: bool,
}

impl Worker {
    pub fn new(internal_id: u16, config: Arc<MinerConfig>, engine: Box<dyn PrimeEngine>) -> Self {
        Worker {
            internal_id,
            config,
            stop: Arc::new(AtomicBool::new(true)),
            engine: Some(engine),
            run_thread: None,
            stats: Arc::new(Mutex::new(PrimeStats::default())),
            unhealthy: Arc::new(AtomicBool::new(false)),
            failed: false,
        }
    }

    pub fn internal_id(&self) -> u16 {
        self.internal_id
    }

    pub fn stats_handle(&self) -> Arc<Mutex<PrimeStats>> {
        self.stats.clone()
    }

    /// True after a device arithmetic mismatch; the worker keeps mining but
    /// its results should be treated with suspicion.
    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::Relaxed)
    }

    /// True after a fatal device failure; the worker has exited.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Cancel any current run, rebuild origin and starting multiples for the
    /// new block and relaunch the mining loop.
    pub fn set_block(
        &mut self,
        header: &BlockHeader,
        hasher: &dyn HeaderHasher,
        on_share: Option<ShareHandler>,
        io: tokio::runtime::Handle,
    ) -> Result<(), EngineError> {
        self.stop.store(true, Ordering::Relaxed);
        self.join_run();
        if self.failed {
            return Err(EngineError::Device("worker previously failed".into()));
        }

        let base_hash = hasher.hash_header(&header.header_bytes);
        let (origin, nonce_base) = worker_origin(&base_hash, self.internal_id);
        log::debug!(
            target: "miner",
            "worker {}: new block, nbits {}, starting nonce {}",
            self.internal_id,
            header.nbits,
            nonce_base
        );

        // Priming: recompute starting multiples and per-block counters.
        let mut engine = self.engine.take().ok_or_else(|| {
            EngineError::Device("engine unavailable; worker in undefined state".into())
        })?;
        if let Err(e) = engine.set_origin(&origin) {
            self.engine = Some(engine);
            return Err(e);
        }
        self.stats
            .lock()
            .expect("stats lock")
            .begin_block(header.nbits);

        let ctx = RunContext {
            config: self.config.clone(),
            job: BlockJob {
                origin,
                nonce_base,
                nbits: header.nbits,
                merkle_root: header.merkle_root,
                previous_hash: header.previous_hash,
            },
            internal_id: self.internal_id,
            stop: self.stop.clone(),
            stats: self.stats.clone(),
            unhealthy: self.unhealthy.clone(),
            on_share,
            io,
        };

        self.stop.store(false, Ordering::Relaxed);
        self.run_thread = Some(thread::spawn(move || {
            let result = run_loop(engine.as_mut(), &ctx);
            if let Err(e) = &result {
                log::error!(
                    target: "miner",
                    "worker {} exited with device error: {e}",
                    ctx.internal_id
                );
            }
            WorkerExit { engine, result }
        }));
        Ok(())
    }

    /// Stop mining and drain. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.join_run();
    }

    fn join_run(&mut self) {
        if let Some(handle) = self.run_thread.take() {
            match handle.join() {
                Ok(exit) => {
                    self.engine = Some(exit.engine);
                    if exit.result.is_err() {
                        self.failed = true;
                    }
                }
                Err(_) => {
                    log::error!(target: "miner", "worker {} run thread panicked", self.internal_id);
                    self.failed = true;
                }
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A located constellation awaiting Fermat verdicts for its queued members.
struct PendingChain {
    delta0: u64,
    mask: u32,
    statuses: Vec<MemberStatus>,
    outstanding: u32,
}

/// Candidate queue plus the pending-chain map results are folded back into.
/// `BTreeMap` keeps completion processing in discovery order.
struct ChainAssembler {
    pending: BTreeMap<u64, PendingChain>,
    next_id: u64,
    queue_refs: Vec<(u64, u8)>,
    queue_deltas: Vec<u64>,
}

impl ChainAssembler {
    fn new() -> Self {
        ChainAssembler {
            pending: BTreeMap::new(),
            next_id: 0,
            queue_refs: Vec::new(),
            queue_deltas: Vec::new(),
        }
    }

    fn queued(&self) -> usize {
        self.queue_deltas.len()
    }

    fn enqueue(&mut self, delta0: u64, mask: u32, pattern: &[u32]) {
        let id = self.next_id;
        self.next_id += 1;
        let mut outstanding = 0u32;
        for (i, &offset) in pattern.iter().enumerate() {
            if mask >> i & 1 == 1 {
                self.queue_refs.push((id, i as u8));
                self.queue_deltas.push(delta0 + offset as u64);
                outstanding += 1;
            }
        }
        self.pending.insert(
            id,
            PendingChain {
                delta0,
                mask,
                statuses: vec![MemberStatus::Untested; pattern.len()],
                outstanding,
            },
        );
    }

    /// Pop up to `cap` queued members for one Fermat dispatch.
    fn take_batch(&mut self, cap: usize) -> (Vec<(u64, u8)>, Vec<u64>) {
        let take = self.queue_deltas.len().min(cap);
        let refs = self.queue_refs.drain(..take).collect();
        let deltas = self.queue_deltas.drain(..take).collect();
        (refs, deltas)
    }

    /// Fold a batch's verdicts back into the pending chains. With
    /// `discard`, members are marked untested instead (failed cross-check).
    fn apply(&mut self, refs: &[(u64, u8)], results: Option<&[u8]>) {
        for (j, &(id, member)) in refs.iter().enumerate() {
            if let Some(chain) = self.pending.get_mut(&id) {
                chain.statuses[member as usize] = match results {
                    Some(r) if r[j] == 1 => MemberStatus::Prime,
                    Some(_) => MemberStatus::Composite,
                    None => MemberStatus::Untested,
                };
                chain.outstanding -= 1;
            }
        }
    }

    /// Remove and return chains with every queued member resolved, in
    /// discovery order.
    fn drain_completed(&mut self) -> Vec<PendingChain> {
        let done: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, c)| c.outstanding == 0)
            .map(|(&id, _)| id)
            .collect();
        done.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }
}

fn run_loop(engine: &mut dyn PrimeEngine, ctx: &RunContext) -> Result<(), EngineError> {
    let wheel = Wheel::new();
    let pattern = ctx.config.pattern.clone();
    let locator = ChainLocator::new(&wheel, &pattern, ctx.config.test_levels)?;
    let params = ctx.config.sieve_params()?;
    let rows = params.rows_per_batch;
    let advance = locator.advance_rows(rows) as u64;
    if advance == 0 {
        return Err(EngineError::Config(format!(
            "sieve batch of {rows} rows cannot fit a {}-row pattern window",
            locator.overlap_rows()
        )));
    }
    let batches_per_cycle = 1u64 << ctx.config.sieve_iterations_log2;

    let mut bitmap = SegmentBitmap::new(rows);
    let mut next_bitmap = SegmentBitmap::new(rows);
    let mut assembler = ChainAssembler::new();
    let mut emissions = Vec::new();
    let mut base_row: u64 = 0;
    let mut batch_index: u64 = 0;
    let mut fermat_batches: u64 = 0;

    let mut sieving = Duration::ZERO;
    let mut locating = Duration::ZERO;
    let mut testing = Duration::ZERO;
    let started = Instant::now();
    let mut last_report = Instant::now();

    // Prime the pipeline with the first batch.
    let t0 = Instant::now();
    engine.sieve_batch(0, &mut bitmap)?;
    sieving += t0.elapsed();
    add_range(ctx, rows as u64 * WHEEL as u64);

    while !ctx.stop.load(Ordering::Relaxed) {
        let next_base = base_row + advance;

        // Locate on the CPU while the device sieves the next batch.
        emissions.clear();
        let sieve_result = thread::scope(|s| {
            let handle = s.spawn(|| {
                let t = Instant::now();
                let r = engine.sieve_batch(next_base, &mut next_bitmap);
                (r, t.elapsed())
            });
            let t1 = Instant::now();
            locator.locate(&bitmap, &mut emissions);
            locating += t1.elapsed();
            handle
                .join()
                .map_err(|_| EngineError::Device("sieve thread panicked".into()))
        });
        let (batch_result, batch_elapsed) = sieve_result?;
        batch_result?;
        sieving += batch_elapsed;

        {
            let mut stats = ctx.stats.lock().expect("stats lock");
            for em in &emissions {
                stats.record_chain(em.surviving());
            }
        }
        #[cfg(feature = "metrics")]
        metrics::inc_chains(emissions.len() as u64);

        for em in &emissions {
            // Flush ahead of enqueue so the queue never outgrows one batch:
            // the locator stalls on a full Fermat queue.
            if assembler.queued() >= ctx.config.fermat_batch_size {
                let t2 = Instant::now();
                flush_fermat(engine, ctx, &mut assembler, &mut fermat_batches)?;
                testing += t2.elapsed();
            }
            let delta0 = (base_row + em.row as u64) * WHEEL as u64
                + wheel.residue(em.plane as usize) as u64;
            assembler.enqueue(delta0, em.mask, pattern.offsets());
        }

        batch_index += 1;
        if batch_index % batches_per_cycle == 0 && assembler.queued() > 0 {
            // End-of-cycle flush bounds candidate latency.
            let t2 = Instant::now();
            flush_fermat(engine, ctx, &mut assembler, &mut fermat_batches)?;
            testing += t2.elapsed();
        }

        classify_completed(ctx, &pattern, &mut assembler);

        std::mem::swap(&mut bitmap, &mut next_bitmap);
        base_row = next_base;
        add_range(ctx, advance * WHEEL as u64);

        if last_report.elapsed() >= REPORT_INTERVAL {
            report_progress(ctx, started.elapsed(), sieving, locating, testing);
            last_report = Instant::now();
        }
    }

    // Draining: synchronous backends have nothing in flight; queued
    // candidates belong to the cancelled block and are discarded.
    log::debug!(
        target: "miner",
        "worker {}: drained with {} candidates discarded",
        ctx.internal_id,
        assembler.pending.len()
    );
    Ok(())
}

fn add_range(ctx: &RunContext, span: u64) {
    let mut stats = ctx.stats.lock().expect("stats lock");
    stats.range_searched += span;
    stats.block_range_searched += span;
    #[cfg(feature = "metrics")]
    metrics::add_range_searched(span);
}

fn flush_fermat(
    engine: &mut dyn PrimeEngine,
    ctx: &RunContext,
    assembler: &mut ChainAssembler,
    fermat_batches: &mut u64,
) -> Result<(), EngineError> {
    let (refs, deltas) = assembler.take_batch(ctx.config.fermat_batch_size);
    if deltas.is_empty() {
        return Ok(());
    }
    let outcome = engine.fermat_batch(&ctx.job.origin, &deltas)?;
    *fermat_batches += 1;

    // Sampled CPU cross-check: a disagreement discards the whole batch and
    // marks the worker unhealthy; results are never partially trusted.
    if *fermat_batches % CROSS_CHECK_INTERVAL == 1 {
        let step = (deltas.len() / CROSS_CHECK_SAMPLES).max(1);
        for j in (0..deltas.len()).step_by(step).take(CROSS_CHECK_SAMPLES) {
            let expect = verify::is_fermat_prime(&(ctx.job.origin + U1024::from(deltas[j])));
            if expect != (outcome.results[j] == 1) {
                log::error!(
                    target: "miner",
                    "worker {}: device/CPU Fermat mismatch at offset {}; discarding batch",
                    ctx.internal_id,
                    deltas[j]
                );
                ctx.unhealthy.store(true, Ordering::Relaxed);
                ctx.stats.lock().expect("stats lock").cross_check_failures += 1;
                #[cfg(feature = "metrics")]
                metrics::set_worker_unhealthy(ctx.internal_id, true);
                assembler.apply(&refs, None);
                return Ok(());
            }
        }
    }

    {
        let mut stats = ctx.stats.lock().expect("stats lock");
        stats.fermat_tests += outcome.attempted;
        stats.fermat_primes += outcome.passed;
    }
    #[cfg(feature = "metrics")]
    {
        metrics::inc_fermat_tests(outcome.attempted);
        metrics::inc_fermat_primes(outcome.passed);
    }
    assembler.apply(&refs, Some(&outcome.results));
    Ok(())
}

fn classify_completed(
    ctx: &RunContext,
    pattern: &prime_core::Pattern,
    assembler: &mut ChainAssembler,
) {
    for chain in assembler.drain_completed() {
        let confirmed = confirmed_prefix(&chain.statuses);
        {
            let mut stats = ctx.stats.lock().expect("stats lock");
            stats.record_confirmed_length(confirmed);
        }
        #[cfg(feature = "metrics")]
        metrics::observe_chain_length(confirmed);

        if confirmed < ctx.config.test_levels {
            continue;
        }

        // Difficulty tail: the first failed member, or the next wheel-step
        // probe past a fully-confirmed pattern.
        let failed_delta = if (confirmed as usize) < pattern.len() {
            chain.delta0 + pattern.offsets()[confirmed as usize] as u64
        } else {
            chain.delta0 + pattern.max_gap() as u64 + 2
        };
        let failed_value = ctx.job.origin + U1024::from(failed_delta);
        let achieved = difficulty::chain_difficulty(confirmed, &failed_value);
        log::info!(
            target: "miner",
            "worker {}: chain of {} at nonce {}: difficulty {:.7}, required {:.7}",
            ctx.internal_id,
            confirmed,
            ctx.job.nonce_base + chain.delta0,
            achieved,
            difficulty::network_target(ctx.job.nbits)
        );
        if !difficulty::meets_target(achieved, ctx.job.nbits) {
            continue;
        }
        if ctx.stop.load(Ordering::Relaxed) {
            // Stale: a new block arrived while this chain was in flight.
            continue;
        }

        let share = FoundShare {
            internal_id: ctx.internal_id,
            merkle_root: ctx.job.merkle_root,
            previous_hash: ctx.job.previous_hash,
            nonce: ctx.job.nonce_base + chain.delta0,
            nonce_difficulty: difficulty::to_nbits(achieved),
        };
        {
            let mut stats = ctx.stats.lock().expect("stats lock");
            stats.shares += 1;
        }
        #[cfg(feature = "metrics")]
        metrics::inc_shares();

        match &ctx.on_share {
            Some(handler) => {
                let handler = handler.clone();
                ctx.io.spawn(async move {
                    handler(share);
                });
            }
            None => {
                log::debug!(
                    target: "miner",
                    "worker {}: miner callback not set; share dropped",
                    ctx.internal_id
                );
            }
        }
    }
}

fn report_progress(
    ctx: &RunContext,
    elapsed: Duration,
    sieving: Duration,
    locating: Duration,
    testing: Duration,
) {
    let stats = ctx.stats.lock().expect("stats lock").clone();
    let elapsed_s = elapsed.as_secs_f64().max(1e-9);
    let other = elapsed
        .saturating_sub(sieving)
        .saturating_sub(locating)
        .saturating_sub(testing);
    log::info!(
        target: "miner",
        "worker {}: {:.2}B searched ({:.1} Mi/s). {} chains ({:.2}/Mi, avg {:.2}, max {}). \
         Fermat {}/{} ({:.3}%). sieve {:.0}% locate {:.0}% test {:.0}% other {:.0}%",
        ctx.internal_id,
        stats.range_searched as f64 / 1e9,
        stats.block_range_searched as f64 / elapsed_s / 1e6,
        stats.chains,
        stats.chains_per_million(),
        stats.avg_chain_length(),
        stats.chain_max_length,
        stats.fermat_primes,
        stats.fermat_tests,
        100.0 * stats.fermat_positive_rate(),
        100.0 * sieving.as_secs_f64() / elapsed_s,
        100.0 * locating.as_secs_f64() / elapsed_s,
        100.0 * testing.as_secs_f64() / elapsed_s,
        100.0 * other.as_secs_f64() / elapsed_s,
    );
}
