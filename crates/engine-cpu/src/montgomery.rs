//! Fixed 16-limb Montgomery arithmetic and the batched Fermat tester.
//!
//! Candidates are `p = S + Δ` with `S` 1024-bit and `Δ < 2^64`. The witness
//! `2^{p−1} mod p` is evaluated entirely in Montgomery form:
//! - `n0' = −p^{−1} mod 2^64` comes from the low limb per candidate.
//! - `R mod p` (the Montgomery one) is `2^1024 − p` when the top bit of `p`
//!   is set (the common case for hash-derived bases), else a doubling
//!   ladder; no `R²` table is needed because the base is 2 and
//!   `mont(2) = 2·(R mod p) mod p`.
//! - Exponentiation uses a left-to-right sliding 5-bit window over the odd
//!   powers `g, g³, …, g³¹`.
//!
//! Limbs are little-endian (limb 0 least significant), matching the layout
//! the WGSL kernel uses with 32-bit limbs.

use prime_core::U1024;

use crate::FermatOutcome;

pub const LIMBS: usize = 16;
pub const WINDOW_BITS: u32 = 5;
pub const WINDOW_SIZE: usize = 1 << WINDOW_BITS;

/// Device dispatch cap for one Fermat batch.
pub const FERMAT_BATCH_CAP: usize = 1 << 14;

pub type Limbs = [u64; LIMBS];

pub fn u1024_to_limbs(x: &U1024) -> Limbs {
    let le = x.to_little_endian();
    let mut limbs = [0u64; LIMBS];
    for (i, limb) in limbs.iter_mut().enumerate() {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&le[i * 8..(i + 1) * 8]);
        *limb = u64::from_le_bytes(bytes);
    }
    limbs
}

pub fn limbs_to_u1024(limbs: &Limbs) -> U1024 {
    let mut le = [0u8; LIMBS * 8];
    for (i, limb) in limbs.iter().enumerate() {
        le[i * 8..(i + 1) * 8].copy_from_slice(&limb.to_le_bytes());
    }
    U1024::from_little_endian(&le)
}

/// `−n0^{−1} mod 2^64` by Newton iteration; `n0` must be odd.
#[inline]
fn mont_n0_inv(n0: u64) -> u64 {
    let mut x = 1u64;
    for _ in 0..6 {
        let t = x.wrapping_mul(n0);
        x = x.wrapping_mul(2u64.wrapping_sub(t));
    }
    x.wrapping_neg()
}

#[inline]
fn ge(a: &Limbs, b: &Limbs) -> bool {
    for i in (0..LIMBS).rev() {
        if a[i] != b[i] {
            return a[i] > b[i];
        }
    }
    true
}

#[inline]
fn sub_in_place(a: &mut Limbs, b: &Limbs) {
    let mut borrow: u128 = 0;
    for i in 0..LIMBS {
        let tmp = (1u128 << 64) + a[i] as u128 - b[i] as u128 - borrow;
        a[i] = tmp as u64;
        borrow = u128::from(tmp >> 64 == 0);
    }
}

/// `(a + b) mod n` for `a, b < n`.
#[inline]
fn add_mod(a: &Limbs, b: &Limbs, n: &Limbs) -> Limbs {
    let mut out = [0u64; LIMBS];
    let mut carry: u128 = 0;
    for i in 0..LIMBS {
        let s = a[i] as u128 + b[i] as u128 + carry;
        out[i] = s as u64;
        carry = s >> 64;
    }
    // Any carry means the true value exceeds 2^1024 > n; one subtraction
    // suffices since a + b < 2n.
    if carry != 0 || ge(&out, n) {
        sub_in_place(&mut out, n);
    }
    out
}

/// `R mod n` with `R = 2^1024`, i.e. the Montgomery representation of 1.
fn r_mod(n: &Limbs) -> Limbs {
    if n[LIMBS - 1] >> 63 == 1 {
        // n > 2^1023, so 2^1024 − n < n already.
        let mut r = [0u64; LIMBS];
        let mut carry: u128 = 1;
        for i in 0..LIMBS {
            let s = (!n[i]) as u128 + carry;
            r[i] = s as u64;
            carry = s >> 64;
        }
        r
    } else {
        // Rare small-modulus path: double 1 up 1024 times mod n.
        let mut r = [0u64; LIMBS];
        r[0] = 1;
        for _ in 0..LIMBS * 64 {
            r = add_mod(&r, &r, n);
        }
        r
    }
}

/// CIOS Montgomery multiplication: `(a · b · R^{−1}) mod n`.
///
/// Every accumulator limb stays masked below 2^64 (the top carries spill
/// into two extra slots), so `acc[j] + ai·b[j] + carry` never overflows
/// u128 even for moduli with an all-ones top limb.
#[inline]
fn mont_mul(a: &Limbs, b: &Limbs, n: &Limbs, n0_inv: u64) -> Limbs {
    const MASK: u128 = 0xFFFF_FFFF_FFFF_FFFFu128;
    let mut acc = [0u128; LIMBS + 2];

    for &ai_u64 in a.iter() {
        // acc += ai * b
        let ai = ai_u64 as u128;
        let mut carry = 0u128;
        for j in 0..LIMBS {
            let sum = acc[j] + ai * (b[j] as u128) + carry;
            acc[j] = sum & MASK;
            carry = sum >> 64;
        }
        let s = acc[LIMBS] + carry;
        acc[LIMBS] = s & MASK;
        acc[LIMBS + 1] += s >> 64;

        // m = (acc[0] * n0_inv) mod 2^64
        let m = ((acc[0] as u64).wrapping_mul(n0_inv)) as u128;

        // acc += m * n
        let mut carry2 = 0u128;
        for j in 0..LIMBS {
            let sum = acc[j] + m * (n[j] as u128) + carry2;
            acc[j] = sum & MASK;
            carry2 = sum >> 64;
        }
        let s2 = acc[LIMBS] + carry2;
        acc[LIMBS] = s2 & MASK;
        acc[LIMBS + 1] += s2 >> 64;

        // shift acc right by one limb
        for j in 0..LIMBS + 1 {
            acc[j] = acc[j + 1];
        }
        acc[LIMBS + 1] = 0;
    }

    let mut res = [0u64; LIMBS];
    for j in 0..LIMBS {
        res[j] = acc[j] as u64;
    }

    // The CIOS output is < 2n, which can carry one bit past the top limb.
    let overflow = acc[LIMBS] != 0;
    if overflow || ge(&res, n) {
        sub_in_place(&mut res, n);
    }
    res
}

#[inline]
fn bit(x: &Limbs, i: usize) -> bool {
    x[i / 64] >> (i % 64) & 1 == 1
}

#[inline]
fn bit_len(x: &Limbs) -> usize {
    for i in (0..LIMBS).rev() {
        if x[i] != 0 {
            return i * 64 + 64 - x[i].leading_zeros() as usize;
        }
    }
    0
}

/// Fermat witness `2^{p−1} ≡ 1 (mod p)` in fixed-width arithmetic.
///
/// Even and trivial inputs fail: the sieve only ever feeds odd candidates,
/// but the batch API is callable with anything.
pub fn fermat_is_probable_prime(p: &Limbs) -> bool {
    if p[0] & 1 == 0 {
        return false;
    }
    if p[0] == 1 && p[1..].iter().all(|&l| l == 0) {
        return false;
    }

    let n0_inv = mont_n0_inv(p[0]);
    let one_m = r_mod(p);
    let g = add_mod(&one_m, &one_m, p); // mont(2)

    // e = p − 1; p is odd so the low limb cannot borrow.
    let mut e = *p;
    e[0] -= 1;

    // Odd-power table g^1, g^3, …, g^31.
    let g2 = mont_mul(&g, &g, p, n0_inv);
    let mut table = [[0u64; LIMBS]; WINDOW_SIZE / 2];
    table[0] = g;
    for i in 1..WINDOW_SIZE / 2 {
        table[i] = mont_mul(&table[i - 1], &g2, p, n0_inv);
    }

    let mut acc = one_m;
    let mut i = bit_len(&e) as i64 - 1;
    while i >= 0 {
        if !bit(&e, i as usize) {
            acc = mont_mul(&acc, &acc, p, n0_inv);
            i -= 1;
            continue;
        }
        // Widest window ending at bit i whose lowest bit is set.
        let mut s = (i - (WINDOW_BITS as i64 - 1)).max(0);
        while !bit(&e, s as usize) {
            s += 1;
        }
        let mut w = 0u32;
        for b in (s..=i).rev() {
            w = (w << 1) | bit(&e, b as usize) as u32;
        }
        for _ in s..=i {
            acc = mont_mul(&acc, &acc, p, n0_inv);
        }
        acc = mont_mul(&acc, &table[((w - 1) / 2) as usize], p, n0_inv);
        i = s - 1;
    }

    acc == one_m
}

/// Add a 64-bit offset to a limb array. Returns `None` on carry-out; the
/// caller treats such candidates as failed.
pub fn add_offset(base: &Limbs, offset: u64) -> Option<Limbs> {
    let mut out = *base;
    let mut carry = offset as u128;
    for limb in out.iter_mut() {
        if carry == 0 {
            break;
        }
        let s = *limb as u128 + carry;
        *limb = s as u64;
        carry = s >> 64;
    }
    if carry != 0 {
        return None;
    }
    Some(out)
}

/// CPU Fermat batch: one result byte per offset, in submission order.
pub fn fermat_batch_cpu(base: &U1024, offsets: &[u64]) -> FermatOutcome {
    let base_limbs = u1024_to_limbs(base);
    let mut results = Vec::with_capacity(offsets.len());
    let mut passed = 0u64;
    for &delta in offsets {
        let ok = match add_offset(&base_limbs, delta) {
            Some(p) => fermat_is_probable_prime(&p),
            None => {
                log::warn!(target: "miner", "fermat candidate overflows 1024 bits; offset {delta}");
                false
            }
        };
        passed += u64::from(ok);
        results.push(u8::from(ok));
    }
    FermatOutcome { results, attempted: offsets.len() as u64, passed }
}
