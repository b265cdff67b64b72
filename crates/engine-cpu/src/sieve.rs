//! Wheel-factorised segmented sieve.
//!
//! The sieve covers the integer range `[S, S + rows·210)` with one bit per
//! wheel position: bit `(plane i, row j)` stands for `S + j·210 + R[i]` and
//! survives only while no sieving prime divides it. Storage is residue-major:
//! 48 bit-planes of `rows` bits each, so a sieving prime walks each plane as
//! a plain arithmetic progression with stride `q` rows.
//!
//! Strike rows for prime `q` on plane `i` satisfy
//! `j ≡ −(S + R[i])·210⁻¹ (mod q)`; the per-prime state is just
//! `(q, 210⁻¹ mod q, S mod q)` and the 48 plane starts are derived per batch.
//!
//! Primes below 64 hit every word several times and are applied as
//! precomputed per-phase word masks; larger primes use a strided bit-clear
//! loop.

use prime_core::wheel::{Wheel, WHEEL, WHEEL_RESIDUES};
use prime_core::{primes, U1024};

use crate::EngineError;

/// Primes below this bound are applied with whole-word masks.
pub const SMALL_PRIME_LIMIT: u32 = 64;

/// Rows per device workgroup tile. The batch is a whole number of segments.
pub const SEGMENT_ROWS: u32 = 1 << 15;

/// Derived sieve geometry shared by every backend.
#[derive(Clone, Debug)]
pub struct SieveParams {
    /// Sieving-prime limit `L`.
    pub prime_limit: u32,
    /// Wheel rows per sieve batch; always a multiple of 64.
    pub rows_per_batch: u32,
}

impl SieveParams {
    /// Build from the configuration surface: `L = 2^prime_limit_log2` and a
    /// batch bitmap of `2^sieve_bits_log2` bits spread over the 48 planes.
    pub fn from_log2(prime_limit_log2: u32, sieve_bits_log2: u32) -> Result<Self, EngineError> {
        if prime_limit_log2 >= 32 {
            return Err(EngineError::Config(format!(
                "sieving prime limit 2^{prime_limit_log2} does not fit u32"
            )));
        }
        let prime_limit = 1u32 << prime_limit_log2;
        if prime_limit < 11 {
            return Err(EngineError::Config(
                "sieving prime limit below the first sieving prime".into(),
            ));
        }
        let bits = 1u64 << sieve_bits_log2;
        let rows = ((bits / WHEEL_RESIDUES as u64) as u32) & !63;
        if rows < 64 {
            return Err(EngineError::Config(format!(
                "sieve size 2^{sieve_bits_log2} bits is too small for one batch"
            )));
        }
        Ok(SieveParams { prime_limit, rows_per_batch: rows })
    }

    /// Integers covered by one batch.
    pub fn span(&self) -> u64 {
        self.rows_per_batch as u64 * WHEEL as u64
    }
}

/// One sieving prime with its per-origin state.
#[derive(Clone, Copy, Debug)]
pub struct SievingPrime {
    pub q: u32,
    /// `210⁻¹ mod q`; origin-independent.
    pub winv: u32,
    /// `S mod q`; recomputed by `set_origin` each block.
    pub smodq: u32,
}

/// Word masks for one small prime: `masks[phase]` clears the bits
/// `phase, phase+q, …` of a 64-bit word.
struct SmallPrimeMasks {
    masks: Vec<u64>,
}

impl SmallPrimeMasks {
    fn build(q: u32) -> Self {
        let masks = (0..q)
            .map(|phase| {
                let mut m = 0u64;
                let mut b = phase;
                while b < 64 {
                    m |= 1u64 << b;
                    b += q;
                }
                m
            })
            .collect();
        SmallPrimeMasks { masks }
    }
}

/// The sieving-prime table. Generated once per process; `set_origin` updates
/// the per-prime residues each block.
pub struct SieveTable {
    params: SieveParams,
    primes: Vec<SievingPrime>,
    /// Prefix length of `primes` covered by word masks.
    small_count: usize,
    small_masks: Vec<SmallPrimeMasks>,
    origin_set: bool,
}

impl SieveTable {
    pub fn generate(params: &SieveParams) -> Self {
        let raw = primes::sieving_primes(params.prime_limit);
        let table: Vec<SievingPrime> = raw
            .iter()
            .map(|&q| SievingPrime {
                q,
                winv: primes::mod_inverse(WHEEL as u64, q as u64)
                    .expect("sieving primes are coprime to the wheel") as u32,
                smodq: 0,
            })
            .collect();
        let small_count = table.iter().take_while(|p| p.q < SMALL_PRIME_LIMIT).count();
        let small_masks = table[..small_count]
            .iter()
            .map(|p| SmallPrimeMasks::build(p.q))
            .collect();
        log::info!(
            target: "miner",
            "generated {} sieving primes up to {} ({} small-prime mask tables)",
            table.len(),
            params.prime_limit,
            small_count
        );
        SieveTable {
            params: params.clone(),
            primes: table,
            small_count,
            small_masks,
            origin_set: false,
        }
    }

    pub fn params(&self) -> &SieveParams {
        &self.params
    }

    pub fn primes(&self) -> &[SievingPrime] {
        &self.primes
    }

    pub fn len(&self) -> usize {
        self.primes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primes.is_empty()
    }

    /// Recompute `S mod q` for every sieving prime. The origin must be a
    /// multiple of the wheel modulus (the miner advances it to one).
    pub fn set_origin(&mut self, origin: &U1024) -> Result<(), EngineError> {
        if (*origin % U1024::from(WHEEL)).low_u64() != 0 {
            return Err(EngineError::MisalignedOrigin);
        }
        for p in &mut self.primes {
            p.smodq = (*origin % U1024::from(p.q)).low_u64() as u32;
        }
        self.origin_set = true;
        Ok(())
    }

    pub fn origin_set(&self) -> bool {
        self.origin_set
    }

    /// Fraction of materialised positions expected to survive the sieve:
    /// the exact product of `1 − 1/q` over the table.
    pub fn pass_through_rate_expected(&self) -> f64 {
        self.primes.iter().map(|p| 1.0 - 1.0 / p.q as f64).product()
    }

    /// Probability that a survivor of this sieve is prime, for candidates
    /// around `2^origin_bits`: prime density among wheel positions divided
    /// by the pass-through rate.
    pub fn probability_is_prime_after_sieve(&self, origin_bits: u32) -> f64 {
        let ln_s = origin_bits as f64 * std::f64::consts::LN_2;
        (WHEEL as f64 / WHEEL_RESIDUES as f64) / ln_s / self.pass_through_rate_expected()
    }
}

/// Packed survivor bitmap for one sieve batch: 48 residue-major planes.
#[derive(Clone)]
pub struct SegmentBitmap {
    words: Vec<u64>,
    rows: u32,
    words_per_plane: usize,
}

impl SegmentBitmap {
    /// `rows` must be a multiple of 64 so planes are whole words.
    pub fn new(rows: u32) -> Self {
        assert_eq!(rows % 64, 0, "bitmap rows must be word-aligned");
        let words_per_plane = rows as usize / 64;
        SegmentBitmap {
            words: vec![0u64; words_per_plane * WHEEL_RESIDUES],
            rows,
            words_per_plane,
        }
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn words_per_plane(&self) -> usize {
        self.words_per_plane
    }

    /// Reset every position to candidate (all-1). Sieving only clears.
    pub fn fill_candidates(&mut self) {
        self.words.fill(!0u64);
    }

    #[inline]
    pub fn bit(&self, plane: u8, row: u32) -> bool {
        let w = self.words[self.word_index(plane, row)];
        w >> (row % 64) & 1 == 1
    }

    #[inline]
    pub fn clear_bit(&mut self, plane: u8, row: u32) {
        let idx = self.word_index(plane, row);
        self.words[idx] &= !(1u64 << (row % 64));
    }

    #[inline]
    pub fn set_bit(&mut self, plane: u8, row: u32) {
        let idx = self.word_index(plane, row);
        self.words[idx] |= 1u64 << (row % 64);
    }

    #[inline]
    fn word_index(&self, plane: u8, row: u32) -> usize {
        debug_assert!(row < self.rows);
        plane as usize * self.words_per_plane + row as usize / 64
    }

    pub fn plane(&self, plane: u8) -> &[u64] {
        let start = plane as usize * self.words_per_plane;
        &self.words[start..start + self.words_per_plane]
    }

    pub fn plane_mut(&mut self, plane: u8) -> &mut [u64] {
        let start = plane as usize * self.words_per_plane;
        &mut self.words[start..start + self.words_per_plane]
    }

    /// Raw words, plane-major; used for device readback.
    pub fn as_words(&self) -> &[u64] {
        &self.words
    }

    pub fn as_words_mut(&mut self) -> &mut [u64] {
        &mut self.words
    }

    /// Popcount over the whole bitmap.
    pub fn count_survivors(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Total materialised positions.
    pub fn positions(&self) -> u64 {
        self.rows as u64 * WHEEL_RESIDUES as u64
    }
}

/// First strike row (mod q) for `prime` on the plane with residue `r`:
/// solves `S + j·210 + r ≡ 0 (mod q)`.
#[inline]
fn strike_class(prime: &SievingPrime, residue: u32) -> u64 {
    let q = prime.q as u64;
    let s_plus_r = (prime.smodq as u64 + residue as u64) % q;
    primes::mul_mod((q - s_plus_r) % q, prime.winv as u64, q)
}

/// First strike row relative to `base_row`, in `[0, q)`.
#[inline]
fn first_relative_row(class: u64, base_row: u64, q: u64) -> u64 {
    (class + q - base_row % q) % q
}

/// Sieve one batch on the CPU. The bitmap is cleared to all-candidates and
/// every sieving prime strikes every plane.
pub fn sieve_batch_cpu(
    table: &SieveTable,
    wheel: &Wheel,
    base_row: u64,
    bitmap: &mut SegmentBitmap,
) {
    debug_assert!(table.origin_set(), "set_origin must run before sieving");
    bitmap.fill_candidates();
    let rows = bitmap.rows() as u64;

    for plane in 0..WHEEL_RESIDUES as u8 {
        let residue = wheel.residue(plane as usize);
        let words = bitmap.plane_mut(plane);

        // Small primes: whole-word masks, one AND per word per prime.
        for (prime, masks) in table.primes[..table.small_count]
            .iter()
            .zip(&table.small_masks)
        {
            let q = prime.q;
            let class = strike_class(prime, residue);
            let mut phase = first_relative_row(class, base_row, q as u64) as u32;
            let step = 64 % q;
            for word in words.iter_mut() {
                *word &= !masks.masks[phase as usize];
                phase = if phase < step { phase + q - step } else { phase - step };
            }
        }

        // Medium and large primes: strided bit clears. Primes beyond the
        // batch length fall through the loop after at most one strike.
        for prime in &table.primes[table.small_count..] {
            let q = prime.q as u64;
            let class = strike_class(prime, residue);
            let mut j = first_relative_row(class, base_row, q);
            while j < rows {
                words[j as usize / 64] &= !(1u64 << (j % 64));
                j += q;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_small() -> SieveParams {
        // L = 1024, one batch of 2^15 bits (640 rows).
        SieveParams::from_log2(10, 15).unwrap()
    }

    fn sieved_bitmap(origin: U1024, params: &SieveParams) -> (SieveTable, Wheel, SegmentBitmap) {
        let wheel = Wheel::new();
        let mut table = SieveTable::generate(params);
        table.set_origin(&origin).unwrap();
        let mut bitmap = SegmentBitmap::new(params.rows_per_batch);
        sieve_batch_cpu(&table, &wheel, 0, &mut bitmap);
        (table, wheel, bitmap)
    }

    #[test]
    fn wheel_smoke_fresh_bitmap_materialises_the_48_coprime_residues() {
        // One wheel turn starting at 0: the candidate positions of row 0 are
        // exactly the 48 residues coprime to 210.
        let wheel = Wheel::new();
        let mut bitmap = SegmentBitmap::new(64);
        bitmap.fill_candidates();
        let mut survivors = Vec::new();
        for value in 0..WHEEL {
            if let Some(plane) = wheel.plane_of(value) {
                if bitmap.bit(plane, 0) {
                    survivors.push(value);
                }
            }
        }
        assert_eq!(survivors.len(), WHEEL_RESIDUES);
        assert_eq!(survivors, wheel.residues().to_vec());
    }

    #[test]
    fn sieve_is_sound_and_complete_against_trial_division() {
        // Moderate origin so struck values stay well above the table primes.
        let params = params_small();
        let origin = U1024::from(1_000_000_000_000u64 / WHEEL as u64 * WHEEL as u64);
        let (table, wheel, bitmap) = sieved_bitmap(origin, &params);

        for row in 0..bitmap.rows() {
            for plane in 0..WHEEL_RESIDUES as u8 {
                let value = origin
                    + U1024::from(row as u64 * WHEEL as u64 + wheel.residue(plane as usize) as u64);
                let divisible = table
                    .primes()
                    .iter()
                    .any(|p| (value % U1024::from(p.q)).is_zero());
                assert_eq!(
                    bitmap.bit(plane, row),
                    !divisible,
                    "row {row} plane {plane}"
                );
            }
        }
    }

    #[test]
    fn sieve_batches_are_deterministic() {
        let params = params_small();
        let origin = U1024::from(987_654 * WHEEL as u64);
        let (table, wheel, first) = sieved_bitmap(origin, &params);
        let mut second = SegmentBitmap::new(params.rows_per_batch);
        sieve_batch_cpu(&table, &wheel, 0, &mut second);
        assert_eq!(first.as_words(), second.as_words());
    }

    #[test]
    fn adjacent_batches_agree_on_shared_rows() {
        // Sieving rows [640, 1280) directly or as the second batch of a
        // shifted origin must produce identical bits.
        let params = params_small();
        let origin = U1024::from(123_456_789u64 * WHEEL as u64);
        let wheel = Wheel::new();
        let mut table = SieveTable::generate(&params);
        table.set_origin(&origin).unwrap();

        let rows = params.rows_per_batch as u64;
        let mut direct = SegmentBitmap::new(params.rows_per_batch);
        sieve_batch_cpu(&table, &wheel, rows, &mut direct);

        let shifted_origin = origin + U1024::from(rows * WHEEL as u64);
        let mut shifted_table = SieveTable::generate(&params);
        shifted_table.set_origin(&shifted_origin).unwrap();
        let mut shifted = SegmentBitmap::new(params.rows_per_batch);
        sieve_batch_cpu(&shifted_table, &wheel, 0, &mut shifted);

        assert_eq!(direct.as_words(), shifted.as_words());
    }

    #[test]
    fn surviving_bits_really_have_no_small_factor() {
        // Soundness restated through the reference path: pick the first few
        // survivors and confirm trial division over the whole table finds
        // nothing.
        let params = params_small();
        let origin = U1024::from(1_000_003_110u64 / WHEEL as u64 * WHEEL as u64);
        let (table, wheel, bitmap) = sieved_bitmap(origin, &params);
        let mut checked = 0;
        'rows: for row in 0..bitmap.rows() {
            for plane in 0..WHEEL_RESIDUES as u8 {
                if !bitmap.bit(plane, row) {
                    continue;
                }
                let value = origin
                    + U1024::from(row as u64 * WHEEL as u64 + wheel.residue(plane as usize) as u64);
                assert!(
                    table.primes().iter().all(|p| !(value % U1024::from(p.q)).is_zero()),
                    "survivor at row {row} plane {plane} has a small factor"
                );
                checked += 1;
                if checked == 256 {
                    break 'rows;
                }
            }
        }
        assert_eq!(checked, 256);
    }

    #[test]
    fn pass_through_rate_within_one_percent_over_large_range() {
        // Survivor ratio against the exact product of (1 − 1/q); a scaled
        // version of the production sanity check.
        let params = SieveParams::from_log2(14, 22).unwrap();
        let origin_hex = "53bf18ac03f0adfb36fc4864b42013375ebdc0bb311f06636771e605ad731ca1\
                          383c7d9056522ed9bda4f608ef71498bc9c7dade6c56bf1534494e0ef371e79f\
                          09433e4c9e64624695a42d7920bd5022f449156d2f93f3be3a429159794ac9e4\
                          9f69c706793ef249a284f9173a82379e62dffac42c0f53f155f65a784f31f42c";
        let origin = U1024::from_str_radix(origin_hex, 16).unwrap();
        let origin = origin - (origin % U1024::from(WHEEL));
        let (table, _wheel, bitmap) = sieved_bitmap(origin, &params);

        let measured = bitmap.count_survivors() as f64 / bitmap.positions() as f64;
        let expected = table.pass_through_rate_expected();
        let relative = (measured / expected - 1.0).abs();
        assert!(
            relative < 0.01,
            "measured {measured:.5} vs expected {expected:.5} ({relative:.4} off)"
        );
    }

    #[test]
    #[ignore = "full-scale survivor-ratio scenario: primes to ~10^6 over ~10^8 integers"]
    fn pass_through_rate_at_production_scale() {
        let params = SieveParams::from_log2(20, 25).unwrap();
        let origin_hex = "53bf18ac03f0adfb36fc4864b42013375ebdc0bb311f06636771e605ad731ca1\
                          383c7d9056522ed9bda4f608ef71498bc9c7dade6c56bf1534494e0ef371e79f\
                          09433e4c9e64624695a42d7920bd5022f449156d2f93f3be3a429159794ac9e4\
                          9f69c706793ef249a284f9173a82379e62dffac42c0f53f155f65a784f31f42c";
        let origin = U1024::from_str_radix(origin_hex, 16).unwrap();
        let origin = origin - (origin % U1024::from(WHEEL));
        let (table, _wheel, bitmap) = sieved_bitmap(origin, &params);

        let measured = bitmap.count_survivors() as f64 / bitmap.positions() as f64;
        let expected = table.pass_through_rate_expected();
        let relative = (measured / expected - 1.0).abs();
        assert!(
            relative < 0.01,
            "measured {measured:.6} vs expected {expected:.6} ({relative:.5} off)"
        );
    }

    #[test]
    fn small_prime_masks_match_strided_reference() {
        // Force the masked path and the strided path to agree by comparing a
        // full sieve against one with SMALL_PRIME_LIMIT effectively disabled.
        let params = params_small();
        let origin = U1024::from(444_444 * WHEEL as u64);
        let wheel = Wheel::new();
        let mut table = SieveTable::generate(&params);
        table.set_origin(&origin).unwrap();

        let mut masked = SegmentBitmap::new(params.rows_per_batch);
        sieve_batch_cpu(&table, &wheel, 0, &mut masked);

        // Reference: clear bits with the naive per-position loop.
        let mut naive = SegmentBitmap::new(params.rows_per_batch);
        naive.fill_candidates();
        for plane in 0..WHEEL_RESIDUES as u8 {
            let residue = wheel.residue(plane as usize);
            for prime in table.primes() {
                let q = prime.q as u64;
                let mut j = first_relative_row(strike_class(prime, residue), 0, q);
                while j < params.rows_per_batch as u64 {
                    naive.clear_bit(plane, j as u32);
                    j += q;
                }
            }
        }
        assert_eq!(masked.as_words(), naive.as_words());
    }

    #[test]
    fn probability_estimates_are_sane() {
        let params = params_small();
        let wheel = Wheel::new();
        let table = SieveTable::generate(&params);
        let pass = table.pass_through_rate_expected();
        assert!(pass > 0.0 && pass < 1.0);
        let p_prime = table.probability_is_prime_after_sieve(1024);
        assert!(p_prime > 0.0 && p_prime < 1.0);
    }
}
