//! Chain locator: scans a sieved bitmap for constellation candidates.
//!
//! Each pattern offset is translated once into a `(Δrow, plane)` wheel
//! coordinate per admissible base residue, so testing a base costs `k` fixed
//! bitmap lookups. Emissions are ordered by `(row, base plane)` ascending and
//! a base is only emitted when its `o_0` bit survives, so every constellation
//! appears exactly once.
//!
//! Bases in the final window rows of a batch are left to the next batch; the
//! worker advances successive batches by `rows − overlap_rows()` so coverage
//! is exact-once.

use prime_core::pattern::Pattern;
use prime_core::wheel::{Wheel, WHEEL};
use prime_core::ChainCandidate;

use crate::sieve::SegmentBitmap;
use crate::EngineError;

struct BaseTranslation {
    plane: u8,
    /// `(Δrow, plane)` per pattern offset; `steps[0] == (0, plane)`.
    steps: Vec<(u32, u8)>,
}

pub struct ChainLocator {
    bases: Vec<BaseTranslation>,
    overlap_rows: u32,
    k_min: u32,
}

impl ChainLocator {
    /// `k_min` is the minimum surviving-member count worth testing
    /// (`test_levels` in the configuration); clamped to the pattern length.
    pub fn new(wheel: &Wheel, pattern: &Pattern, k_min: u32) -> Result<Self, EngineError> {
        let bases: Vec<BaseTranslation> = pattern
            .admissible_base_planes(wheel)
            .into_iter()
            .map(|plane| BaseTranslation {
                plane,
                steps: pattern
                    .translate(wheel, plane)
                    .expect("admissible planes translate fully"),
            })
            .collect();
        if bases.is_empty() {
            return Err(EngineError::Config(
                "pattern admits no wheel base residue".into(),
            ));
        }
        let overlap_rows = pattern.max_gap() / WHEEL + 1;
        let k_min = k_min.clamp(1, pattern.len() as u32);
        Ok(ChainLocator { bases, overlap_rows, k_min })
    }

    /// Window rows deferred to the following batch.
    pub fn overlap_rows(&self) -> u32 {
        self.overlap_rows
    }

    /// Rows the sieve advances between batches so every base is scanned
    /// exactly once. Zero means the batch cannot fit one window.
    pub fn advance_rows(&self, batch_rows: u32) -> u32 {
        batch_rows.saturating_sub(self.overlap_rows)
    }

    pub fn k_min(&self) -> u32 {
        self.k_min
    }

    /// Scan `bitmap` and append candidates to `out`, rows relative to the
    /// batch. Output is complete (no qualifying window missed), minimal (no
    /// sub-threshold mask emitted) and ordered by `(row, plane)`.
    pub fn locate(&self, bitmap: &SegmentBitmap, out: &mut Vec<ChainCandidate>) {
        let scan_rows = bitmap.rows().saturating_sub(self.overlap_rows);
        let words = scan_rows.div_ceil(64) as usize;

        // Word-level guard: skip 64-row blocks with no surviving base bit on
        // any admissible plane.
        for w in 0..words {
            let mut guard = 0u64;
            for base in &self.bases {
                guard |= bitmap.plane(base.plane)[w];
            }
            if guard == 0 {
                continue;
            }
            let row_base = w as u32 * 64;
            let top = scan_rows.min(row_base + 64);
            for row in row_base..top {
                for base in &self.bases {
                    if !bitmap.bit(base.plane, row) {
                        continue;
                    }
                    let mut mask = 0u32;
                    for (i, &(drow, plane)) in base.steps.iter().enumerate() {
                        if bitmap.bit(plane, row + drow) {
                            mask |= 1 << i;
                        }
                    }
                    if mask.count_ones() >= self.k_min {
                        out.push(ChainCandidate { row, plane: base.plane, mask });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prime_core::wheel::WHEEL_RESIDUES;

    fn classic_locator(k_min: u32) -> (Wheel, Pattern, ChainLocator) {
        let wheel = Wheel::new();
        let pattern = Pattern::classic();
        let locator = ChainLocator::new(&wheel, &pattern, k_min).unwrap();
        (wheel, pattern, locator)
    }

    fn empty_bitmap(rows: u32) -> SegmentBitmap {
        // All-composite bitmap; tests set individual survivor bits.
        SegmentBitmap::new(rows)
    }

    #[test]
    fn emits_full_constellation_once() {
        let (wheel, pattern, locator) = classic_locator(8);
        let mut bitmap = empty_bitmap(256);
        let base_plane = wheel.plane_of(11).unwrap();
        let row = 17u32;
        for &(drow, plane) in pattern
            .translate(&wheel, base_plane)
            .unwrap()
            .iter()
        {
            bitmap.set_bit(plane, row + drow);
        }

        let mut out = Vec::new();
        locator.locate(&bitmap, &mut out);
        assert_eq!(
            out,
            vec![ChainCandidate { row, plane: base_plane, mask: 0xFF }]
        );
    }

    #[test]
    fn partial_chain_mask_reassembly() {
        // Offsets {0,2,6,8} survive, {12,18,20,26} are struck: exactly one
        // candidate with mask 0b00001111.
        let (wheel, pattern, locator) = classic_locator(4);
        let mut bitmap = empty_bitmap(256);
        let base_plane = wheel.plane_of(11).unwrap();
        let row = 40u32;
        let steps = pattern.translate(&wheel, base_plane).unwrap();
        for &(drow, plane) in steps.iter().take(4) {
            bitmap.set_bit(plane, row + drow);
        }

        let mut out = Vec::new();
        locator.locate(&bitmap, &mut out);
        assert_eq!(
            out,
            vec![ChainCandidate { row, plane: base_plane, mask: 0b0000_1111 }]
        );
    }

    #[test]
    fn below_threshold_masks_are_not_emitted() {
        let (wheel, pattern, locator) = classic_locator(4);
        let mut bitmap = empty_bitmap(256);
        let base_plane = wheel.plane_of(11).unwrap();
        let steps = pattern.translate(&wheel, base_plane).unwrap();
        for &(drow, plane) in steps.iter().take(3) {
            bitmap.set_bit(plane, 5 + drow);
        }

        let mut out = Vec::new();
        locator.locate(&bitmap, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn base_without_surviving_first_offset_is_skipped() {
        let (wheel, pattern, locator) = classic_locator(4);
        let mut bitmap = empty_bitmap(256);
        let base_plane = wheel.plane_of(11).unwrap();
        let steps = pattern.translate(&wheel, base_plane).unwrap();
        // All members except o_0 survive.
        for &(drow, plane) in steps.iter().skip(1) {
            bitmap.set_bit(plane, 9 + drow);
        }

        let mut out = Vec::new();
        locator.locate(&bitmap, &mut out);
        assert!(out.is_empty(), "o_0 missing must suppress the base");
    }

    #[test]
    fn emission_order_is_row_then_plane() {
        let (wheel, pattern, locator) = classic_locator(8);
        let mut bitmap = empty_bitmap(512);
        let base_plane = wheel.plane_of(11).unwrap();
        let steps = pattern.translate(&wheel, base_plane).unwrap();
        for &row in &[300u32, 12, 77] {
            for &(drow, plane) in steps.iter() {
                bitmap.set_bit(plane, row + drow);
            }
        }

        let mut out = Vec::new();
        locator.locate(&bitmap, &mut out);
        let rows: Vec<u32> = out.iter().map(|c| c.row).collect();
        assert_eq!(rows, vec![12, 77, 300]);
    }

    #[test]
    fn completeness_on_saturated_bitmap() {
        // Every position a candidate: every scanned row of every admissible
        // base plane must be emitted with the full mask.
        let (_wheel, pattern, locator) = classic_locator(pattern_len() as u32);
        let mut bitmap = SegmentBitmap::new(128);
        bitmap.fill_candidates();

        let mut out = Vec::new();
        locator.locate(&bitmap, &mut out);
        let scan_rows = 128 - locator.overlap_rows();
        let expected = scan_rows as usize * admissible_count(&pattern);
        assert_eq!(out.len(), expected);
        assert!(out.iter().all(|c| c.mask == 0xFF));
        fn pattern_len() -> usize {
            Pattern::classic().len()
        }
        fn admissible_count(p: &Pattern) -> usize {
            p.admissible_base_planes(&Wheel::new()).len()
        }
    }

    #[test]
    fn tail_rows_are_deferred_to_the_next_batch() {
        let (wheel, pattern, locator) = classic_locator(8);
        let rows = 128u32;
        let mut bitmap = empty_bitmap(rows);
        let base_plane = wheel.plane_of(11).unwrap();
        let steps = pattern.translate(&wheel, base_plane).unwrap();
        // A full constellation in the overlap window.
        let row = rows - locator.overlap_rows();
        for &(drow, plane) in steps.iter() {
            bitmap.set_bit(plane, row + drow);
        }

        let mut out = Vec::new();
        locator.locate(&bitmap, &mut out);
        assert!(out.is_empty(), "tail-window base belongs to the next batch");
        assert!(locator.advance_rows(rows) == rows - locator.overlap_rows());
    }

    #[test]
    fn locator_respects_k_min_bounds() {
        let wheel = Wheel::new();
        let pattern = Pattern::classic();
        let locator = ChainLocator::new(&wheel, &pattern, 99).unwrap();
        assert_eq!(locator.k_min(), pattern.len() as u32);
        let locator = ChainLocator::new(&wheel, &pattern, 0).unwrap();
        assert_eq!(locator.k_min(), 1);
    }

    #[test]
    fn all_planes_scannable() {
        // Guard iteration touches every admissible plane without panicking
        // on plane indices near the top of the table.
        let (_wheel, _pattern, locator) = classic_locator(1);
        let mut bitmap = SegmentBitmap::new(64);
        bitmap.fill_candidates();
        let mut out = Vec::new();
        locator.locate(&bitmap, &mut out);
        assert!(!out.is_empty());
        assert!(out.iter().all(|c| (c.plane as usize) < WHEEL_RESIDUES));
    }
}
