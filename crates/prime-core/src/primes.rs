//! Sieving-prime generation and small modular helpers.

use crate::wheel::WHEEL_PRIMES;

/// All primes `<= limit` by a plain sieve of Eratosthenes.
pub fn primes_up_to(limit: u32) -> Vec<u32> {
    if limit < 2 {
        return Vec::new();
    }
    let n = limit as usize;
    let mut composite = vec![false; n + 1];
    let mut primes = Vec::new();
    for p in 2..=n {
        if composite[p] {
            continue;
        }
        primes.push(p as u32);
        let mut m = p * p;
        while m <= n {
            composite[m] = true;
            m += p;
        }
    }
    primes
}

/// Sieving primes for the wheel sieve: primes in `(7, limit]`. The wheel
/// primes never divide a materialised position and have no inverse of the
/// wheel modulus, so they are excluded by construction.
pub fn sieving_primes(limit: u32) -> Vec<u32> {
    primes_up_to(limit)
        .into_iter()
        .filter(|p| !WHEEL_PRIMES.contains(p))
        .collect()
}

/// Modular inverse of `a` modulo `m` via the extended Euclidean algorithm.
pub fn mod_inverse(a: u64, m: u64) -> Option<u64> {
    if m == 0 {
        return None;
    }
    let (mut old_r, mut r) = (a as i128, m as i128);
    let (mut old_s, mut s) = (1i128, 0i128);
    while r != 0 {
        let q = old_r / r;
        (old_r, r) = (r, old_r - q * r);
        (old_s, s) = (s, old_s - q * s);
    }
    if old_r != 1 {
        return None;
    }
    Some(old_s.rem_euclid(m as i128) as u64)
}

/// `a · b mod m` without overflow.
#[inline]
pub fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((a as u128 * b as u128) % m as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wheel::WHEEL;

    #[test]
    fn small_prime_table() {
        assert_eq!(primes_up_to(30), vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
        assert_eq!(primes_up_to(1), Vec::<u32>::new());
    }

    #[test]
    fn sieving_primes_skip_wheel_primes() {
        let primes = sieving_primes(100);
        assert_eq!(primes.first(), Some(&11));
        assert!(primes.iter().all(|&q| q % 2 != 0 && q % 3 != 0 && q % 5 != 0 && q % 7 != 0));
    }

    #[test]
    fn prime_count_to_a_million() {
        // pi(10^6) = 78498; minus the four wheel primes.
        assert_eq!(sieving_primes(1_000_000).len(), 78_494);
    }

    #[test]
    fn wheel_inverse_exists_for_all_sieving_primes() {
        for q in sieving_primes(10_000) {
            let inv = mod_inverse(WHEEL as u64, q as u64).expect("wheel coprime to q");
            assert_eq!(mul_mod(inv, WHEEL as u64, q as u64), 1);
        }
    }

    #[test]
    fn mod_inverse_rejects_shared_factor() {
        assert_eq!(mod_inverse(WHEEL as u64, 7), None);
    }
}
