#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Engine trait and CPU reference implementation.
//!
//! This crate defines the `PrimeEngine` trait so the service layer can drive
//! the mining pipeline without knowing about specific compute backends, plus
//! a complete CPU implementation used as the correctness reference, for
//! sampled cross-checks of device results, and in tests.
//!
//! The CPU engine is not a production mining path; candidate density makes
//! unaccelerated Fermat testing uncompetitive. It is, however, a faithful
//! implementation of the same algorithms the GPU kernels run: the
//! wheel-factorised segmented sieve and fixed 16-limb Montgomery
//! exponentiation.

use std::fmt;

use prime_core::{U1024, Wheel};

pub mod locator;
pub mod montgomery;
pub mod sieve;

use sieve::{SegmentBitmap, SieveParams, SieveTable};

/// Errors surfaced by engines. Device failures are worker-fatal; the worker
/// reports and exits rather than retrying.
#[derive(Debug)]
pub enum EngineError {
    /// Invalid engine configuration; refused at startup.
    Config(String),
    /// Device allocation, kernel launch or copy failure.
    Device(String),
    /// `sieve_batch`/`fermat_batch` called before `set_origin`.
    OriginNotSet,
    /// The sieve origin must be a multiple of the wheel modulus.
    MisalignedOrigin,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Config(msg) => write!(f, "engine configuration invalid: {msg}"),
            EngineError::Device(msg) => write!(f, "device failure: {msg}"),
            EngineError::OriginNotSet => write!(f, "sieve origin not set"),
            EngineError::MisalignedOrigin => {
                write!(f, "sieve origin is not a multiple of the wheel modulus")
            }
        }
    }
}

impl std::error::Error for EngineError {}

/// Result of one Fermat batch. `results[j]` is `1` when `base + offsets[j]`
/// passed the witness, `0` otherwise, in submission order. The counters come
/// from the backend itself and are cross-checked against the submitted batch.
#[derive(Clone, Debug)]
pub struct FermatOutcome {
    pub results: Vec<u8>,
    pub attempted: u64,
    pub passed: u64,
}

/// Abstract sieve + Fermat backend.
///
/// One engine instance is owned by exactly one worker; all methods take
/// `&mut self` and device buffers live inside the implementation for the
/// duration of a block epoch.
pub trait PrimeEngine: Send {
    /// Human-readable backend name for logs/metrics.
    fn name(&self) -> &'static str;

    /// Recompute per-prime starting multiples for a new sieve origin.
    /// `origin` must be a multiple of the wheel modulus. Runs once per block.
    fn set_origin(&mut self, origin: &U1024) -> Result<(), EngineError>;

    /// Sieve one batch beginning `base_row` wheel rows past the origin into
    /// `bitmap`. The bitmap is reset to all-candidates first; sieving only
    /// clears bits. Deterministic for identical inputs.
    fn sieve_batch(&mut self, base_row: u64, bitmap: &mut SegmentBitmap)
        -> Result<(), EngineError>;

    /// Fermat-test `base + offsets[j]` for every `j`, returning one result
    /// byte per input in submission order. Either the whole batch completes
    /// or the whole batch fails; partial results are never returned.
    fn fermat_batch(&mut self, base: &U1024, offsets: &[u64])
        -> Result<FermatOutcome, EngineError>;
}

/// The CPU reference engine.
pub struct CpuEngine {
    wheel: Wheel,
    table: SieveTable,
    origin: Option<U1024>,
}

impl CpuEngine {
    /// Builds the sieving-prime table up front; this is the once-per-process
    /// cost shared by every backend.
    pub fn new(params: SieveParams) -> Self {
        let wheel = Wheel::new();
        let table = SieveTable::generate(&params);
        CpuEngine { wheel, table, origin: None }
    }

    pub fn params(&self) -> &SieveParams {
        self.table.params()
    }

    pub fn table(&self) -> &SieveTable {
        &self.table
    }

    pub fn wheel(&self) -> &Wheel {
        &self.wheel
    }
}

impl PrimeEngine for CpuEngine {
    fn name(&self) -> &'static str {
        "cpu-reference"
    }

    fn set_origin(&mut self, origin: &U1024) -> Result<(), EngineError> {
        self.table.set_origin(origin)?;
        self.origin = Some(*origin);
        Ok(())
    }

    fn sieve_batch(
        &mut self,
        base_row: u64,
        bitmap: &mut SegmentBitmap,
    ) -> Result<(), EngineError> {
        if self.origin.is_none() {
            return Err(EngineError::OriginNotSet);
        }
        sieve::sieve_batch_cpu(&self.table, &self.wheel, base_row, bitmap);
        Ok(())
    }

    fn fermat_batch(
        &mut self,
        base: &U1024,
        offsets: &[u64],
    ) -> Result<FermatOutcome, EngineError> {
        Ok(montgomery::fermat_batch_cpu(base, offsets))
    }
}
