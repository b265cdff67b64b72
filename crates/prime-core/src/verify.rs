//! Arbitrary-precision Fermat reference for host-side verification.
//!
//! This path exists to cross-check the fixed-width engines and to evaluate
//! difficulty tails; it must never appear in the per-candidate hot path.

use num_bigint::BigUint;
use num_traits::One;

use crate::U1024;

pub fn to_biguint(p: &U1024) -> BigUint {
    BigUint::from_bytes_be(&p.to_big_endian())
}

/// `2^{p−1} mod p`. Returns `None` for `p < 2` where the witness is
/// undefined.
pub fn fermat_remainder(p: &U1024) -> Option<BigUint> {
    if *p < U1024::from(2u64) {
        return None;
    }
    let n = to_biguint(p);
    let e = &n - BigUint::one();
    Some(BigUint::from(2u32).modpow(&e, &n))
}

/// Fermat probable-prime witness to base 2.
pub fn is_fermat_prime(p: &U1024) -> bool {
    fermat_remainder(p).is_some_and(|r| r.is_one())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_primes_pass() {
        for p in [3u64, 5, 7, 11, 13, 10_007] {
            assert!(is_fermat_prime(&U1024::from(p)), "{p} should pass");
        }
    }

    #[test]
    fn small_composites_fail() {
        for c in [9u64, 15, 21, 10_005] {
            assert!(!is_fermat_prime(&U1024::from(c)), "{c} should fail");
        }
    }

    #[test]
    fn base2_pseudoprime_is_accepted() {
        // 341 = 11·31 is the smallest base-2 Fermat pseudoprime; the witness
        // is probabilistic by design.
        assert!(is_fermat_prime(&U1024::from(341u64)));
    }

    #[test]
    fn undefined_below_two() {
        assert_eq!(fermat_remainder(&U1024::zero()), None);
        assert_eq!(fermat_remainder(&U1024::one()), None);
    }

    #[test]
    fn large_prime_passes() {
        // 2^127 − 1 (Mersenne prime).
        let p = (U1024::one() << 127) - U1024::one();
        assert!(is_fermat_prime(&p));
    }
}
