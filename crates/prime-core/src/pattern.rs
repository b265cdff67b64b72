//! Constellation pattern: the fixed sequence of small offsets whose
//! simultaneous primality defines a share.
//!
//! Patterns are loaded from an ASCII file with one offset per line (blank
//! lines and `#` comments allowed), validated at startup and immutable
//! afterwards.

use std::fmt;
use std::path::Path;

use crate::wheel::{Wheel, WHEEL};

/// Hard cap on pattern length; also bounds the candidate bitmask width.
pub const MAX_OFFSETS: usize = 24;

/// Largest accepted offset: `W · 2^16`.
pub const MAX_OFFSET: u32 = WHEEL << 16;

#[derive(Debug)]
pub enum PatternError {
    Empty,
    TooMany(usize),
    FirstNotZero,
    NotIncreasing { index: usize },
    OffsetTooLarge(u32),
    /// No base residue class keeps every pattern member coprime to the wheel.
    NoAdmissibleResidue,
    Parse { line: usize },
    Io(std::io::Error),
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternError::Empty => write!(f, "pattern has no offsets"),
            PatternError::TooMany(n) => {
                write!(f, "pattern has {n} offsets, maximum is {MAX_OFFSETS}")
            }
            PatternError::FirstNotZero => write!(f, "first pattern offset must be 0"),
            PatternError::NotIncreasing { index } => {
                write!(f, "pattern offsets must be strictly increasing (index {index})")
            }
            PatternError::OffsetTooLarge(o) => {
                write!(f, "pattern offset {o} exceeds maximum {MAX_OFFSET}")
            }
            PatternError::NoAdmissibleResidue => {
                write!(f, "no wheel residue admits the full pattern")
            }
            PatternError::Parse { line } => write!(f, "invalid offset on line {line}"),
            PatternError::Io(e) => write!(f, "failed to read offset file: {e}"),
        }
    }
}

impl std::error::Error for PatternError {}

impl From<std::io::Error> for PatternError {
    fn from(e: std::io::Error) -> Self {
        PatternError::Io(e)
    }
}

/// A validated, immutable constellation pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    offsets: Vec<u32>,
}

impl Pattern {
    pub fn from_offsets(offsets: Vec<u32>) -> Result<Self, PatternError> {
        if offsets.is_empty() {
            return Err(PatternError::Empty);
        }
        if offsets.len() > MAX_OFFSETS {
            return Err(PatternError::TooMany(offsets.len()));
        }
        if offsets[0] != 0 {
            return Err(PatternError::FirstNotZero);
        }
        for i in 1..offsets.len() {
            if offsets[i] <= offsets[i - 1] {
                return Err(PatternError::NotIncreasing { index: i });
            }
        }
        if let Some(&o) = offsets.iter().find(|&&o| o >= MAX_OFFSET) {
            return Err(PatternError::OffsetTooLarge(o));
        }
        let pattern = Pattern { offsets };
        if pattern.admissible_base_planes(&Wheel::new()).is_empty() {
            return Err(PatternError::NoAdmissibleResidue);
        }
        Ok(pattern)
    }

    /// Parse the offset-file format: one decimal offset per line, blank lines
    /// and `#` comments ignored.
    pub fn parse(text: &str) -> Result<Self, PatternError> {
        let mut offsets = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let offset: u32 = line.parse().map_err(|_| PatternError::Parse { line: idx + 1 })?;
            offsets.push(offset);
        }
        Pattern::from_offsets(offsets)
    }

    pub fn load(path: &Path) -> Result<Self, PatternError> {
        let text = std::fs::read_to_string(path)?;
        Pattern::parse(&text)
    }

    /// Textual form accepted by [`Pattern::parse`]; round-trips exactly.
    pub fn to_offset_file(&self) -> String {
        let mut out = String::new();
        for &o in &self.offsets {
            out.push_str(&o.to_string());
            out.push('\n');
        }
        out
    }

    /// The classic dense 8-tuple used by Nexus prime mining.
    pub fn classic() -> Self {
        Pattern::from_offsets(vec![0, 2, 6, 8, 12, 18, 20, 26]).expect("classic pattern is valid")
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// `o_{k-1} − o_0`; the sieve window a constellation can span.
    pub fn max_gap(&self) -> u32 {
        *self.offsets.last().expect("pattern is non-empty")
    }

    /// Wheel planes `i0` for which every `R[i0] + o_i` stays coprime to the
    /// wheel; only these planes can host a constellation base.
    pub fn admissible_base_planes(&self, wheel: &Wheel) -> Vec<u8> {
        (0..wheel.residues().len() as u8)
            .filter(|&i0| self.translate(wheel, i0).is_some())
            .collect()
    }

    /// Translate each offset into a `(Δrow, plane)` wheel coordinate relative
    /// to a base at plane `base_plane`. `None` when any member lands on a
    /// residue the wheel never materialises.
    pub fn translate(&self, wheel: &Wheel, base_plane: u8) -> Option<Vec<(u32, u8)>> {
        let base = wheel.residue(base_plane as usize);
        self.offsets
            .iter()
            .map(|&o| {
                let v = base + o;
                wheel.plane_of(v).map(|plane| (v / WHEEL, plane))
            })
            .collect()
    }
}
