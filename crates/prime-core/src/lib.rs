#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Domain math for the prime-constellation miner.
//!
//! This crate holds everything that is pure arithmetic and independent of any
//! particular compute backend:
//! - 1024-bit unsigned integers (`U1024`) for block hashes and candidate primes.
//! - The mod-210 wheel and its residue tables.
//! - The constellation `Pattern` (offset file parsing, validation, wheel
//!   translation).
//! - Sieving-prime generation and small modular helpers.
//! - Chain candidate types and confirmed-prefix classification.
//! - The prime-chain difficulty function.
//! - An arbitrary-precision Fermat reference (`num-bigint`) used for host-side
//!   verification only; engines carry their own fixed-width arithmetic.

use uint::construct_uint;

construct_uint! {
    /// 1024-bit unsigned integer (sixteen 64-bit limbs, little-endian order).
    pub struct U1024(16);
}

pub use primitive_types::U512;

pub mod chain;
pub mod difficulty;
pub mod pattern;
pub mod primes;
pub mod verify;
pub mod wheel;

pub use chain::{ChainCandidate, MemberStatus};
pub use pattern::Pattern;
pub use wheel::Wheel;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u1024_round_trips_big_endian() {
        let x = U1024::from(0xdead_beef_u64) << 512;
        let bytes = x.to_big_endian();
        assert_eq!(U1024::from_big_endian(&bytes), x);
    }

    #[test]
    fn u1024_parses_hex() {
        let x = U1024::from_str_radix("ff00", 16).unwrap();
        assert_eq!(x, U1024::from(0xff00u64));
    }
}
