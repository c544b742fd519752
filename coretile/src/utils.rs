use log::debug;
use num_traits::PrimInt;
use std::fmt::Debug;

/// Ceiling division. Returns `None` if `b` is zero.
///
/// # Examples
/// ```
/// # use coretile::utils::ceil_div;
/// assert_eq!(ceil_div(7u64, 2), Some(4));
/// assert_eq!(ceil_div(8u64, 2), Some(4));
/// assert_eq!(ceil_div(0u64, 3), Some(0));
/// assert_eq!(ceil_div(3u64, 0), None);
/// ```
pub fn ceil_div<T: PrimInt + Debug>(a: T, b: T) -> Option<T> {
    if b.is_zero() {
        debug!("ceil_div({a:?}, 0) is not computable");
        return None;
    }
    let q = a / b;
    if (a % b).is_zero() {
        Some(q)
    } else {
        q.checked_add(&T::one())
    }
}

/// Rounds `a` up to the next multiple of `b`. Returns `None` if `b` is zero or on overflow.
pub fn align_up<T: PrimInt + Debug>(a: T, b: T) -> Option<T> {
    ceil_div(a, b)?.checked_mul(&b)
}

/// Rounds `a` down to a multiple of `b`. Returns `None` if `b` is zero.
pub fn floor_align<T: PrimInt + Debug>(a: T, b: T) -> Option<T> {
    if b.is_zero() {
        debug!("floor_align({a:?}, 0) is not computable");
        return None;
    }
    Some((a / b) * b)
}

/// Greatest common divisor by the Euclidean algorithm.
///
/// Zero on either side is treated as not computable and yields `None`, so that a caller
/// never mistakes a degenerate split for a legitimate one.
pub fn gcd<T: PrimInt + Debug>(a: T, b: T) -> Option<T> {
    if a.is_zero() || b.is_zero() {
        debug!("gcd({a:?}, {b:?}) is not computable");
        return None;
    }
    let (mut a, mut b) = (a, b);
    while !b.is_zero() {
        let r = a % b;
        a = b;
        b = r;
    }
    Some(a)
}

/// Least common multiple. Returns `None` for zero inputs or on overflow.
pub fn lcm<T: PrimInt + Debug>(a: T, b: T) -> Option<T> {
    let g = gcd(a, b)?;
    (a / g).checked_mul(&b)
}

/// Returns the divisors of `n` which are at most `cap`, in ascending order.
///
/// Divisors are found by trial division up to `sqrt(n)`. Returns an empty [Vec] for `n == 0`.
pub fn factors<T: PrimInt>(n: T, cap: T) -> Vec<T> {
    let mut result = Vec::new();
    if n.is_zero() {
        return result;
    }
    let mut i = T::one();
    while i <= n / i {
        if (n % i).is_zero() {
            if i <= cap {
                result.push(i);
            }
            let right = n / i;
            if right != i && right <= cap {
                result.push(right);
            }
        }
        i = i + T::one();
    }
    result.sort_unstable();
    result
}

/// Like [factors], unioned with every power of two up to `min(n, cap)`.
pub fn factors_with_pow2(n: u64, cap: u64) -> Vec<u64> {
    let mut result = factors(n, cap);
    let limit = n.min(cap);
    if limit > 0 {
        result.extend(iter_powers_of_two(prev_power_of_two(limit)));
        result.sort_unstable();
        result.dedup();
    }
    result
}

/// Common divisors of `a` and `b` which are at most `cap`, in ascending order.
pub fn pair_factors(a: u64, b: u64, cap: u64) -> Vec<u64> {
    match gcd(a, b) {
        Some(g) => factors(g, cap),
        None => vec![],
    }
}

/// Unions `base` with every element of `core_factors` not exceeding `extent`.
///
/// The result is ascending and free of duplicates.
pub fn merge_axis_candidates(extent: u64, base: &[u32], core_factors: &[u32]) -> Vec<u32> {
    let mut merged = base
        .iter()
        .copied()
        .chain(
            core_factors
                .iter()
                .copied()
                .filter(|&f| u64::from(f) <= extent),
        )
        .collect::<Vec<_>>();
    merged.sort_unstable();
    merged.dedup();
    merged
}

pub const fn is_power_of_two(n: u64) -> bool {
    if n == 0 {
        return false;
    }
    n & (n - 1) == 0
}

pub const fn prev_power_of_two(n: u64) -> u64 {
    let highest_bit_set_idx = (u64::BITS - 1) - (n | 1).leading_zeros();
    (1 << highest_bit_set_idx) & n
}

/// Returns an iterator over the powers of two from 1 through `n`.
///
/// Behavior is undefined and may panic if `n` is not 0 or a power of two.
pub fn iter_powers_of_two(n: u64) -> impl DoubleEndedIterator<Item = u64> + Clone {
    debug_assert!(n == 0 || is_power_of_two(n));
    let end_bits = u64::BITS - n.leading_zeros();
    (1..end_bits + 1).map(|b| 1u64 << (b - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_factors_prime_under_cap() {
        assert_eq!(factors(7u64, 4), vec![1]);
    }

    #[test]
    fn test_factors_capped() {
        assert_eq!(factors(12u64, 6), vec![1, 2, 3, 4, 6]);
    }

    #[test]
    fn test_factors_of_zero_is_empty() {
        assert!(factors(0u64, 10).is_empty());
    }

    #[test]
    fn test_factors_of_perfect_square_has_no_duplicate_root() {
        assert_eq!(factors(36u32, 36), vec![1, 2, 3, 4, 6, 9, 12, 18, 36]);
    }

    #[test]
    fn test_factors_with_pow2_adds_non_divisor_powers() {
        assert_eq!(factors_with_pow2(12, 16), vec![1, 2, 3, 4, 6, 8, 12]);
        assert_eq!(factors_with_pow2(5, 3), vec![1, 2]);
        assert!(factors_with_pow2(5, 0).is_empty());
    }

    #[test]
    fn test_pair_factors() {
        assert_eq!(pair_factors(12, 18, 100), vec![1, 2, 3, 6]);
        assert_eq!(pair_factors(12, 18, 4), vec![1, 2, 3]);
        assert!(pair_factors(0, 18, 4).is_empty());
    }

    #[test]
    fn test_merge_axis_candidates() {
        let core_factors = factors(32u32, 32);
        assert_eq!(
            merge_axis_candidates(12, &[1, 3], &core_factors),
            vec![1, 2, 3, 4, 8]
        );
        assert_eq!(merge_axis_candidates(1, &[1], &core_factors), vec![1]);
    }

    #[test]
    fn test_gcd_zero_is_not_computable() {
        assert_eq!(gcd(0u64, 12), None);
        assert_eq!(gcd(12u64, 0), None);
        assert_eq!(lcm(0u32, 12), None);
    }

    #[test]
    fn test_gcd_and_lcm() {
        assert_eq!(gcd(12u64, 18), Some(6));
        assert_eq!(gcd(7u64, 5), Some(1));
        assert_eq!(lcm(4u64, 6), Some(12));
        assert_eq!(lcm(3u32, 16), Some(48));
    }

    #[test]
    fn test_zero_divisors_are_not_computable() {
        assert_eq!(ceil_div(10u64, 0), None);
        assert_eq!(align_up(10u64, 0), None);
        assert_eq!(floor_align(10u64, 0), None);
    }

    #[test]
    fn test_align_and_floor_align() {
        assert_eq!(align_up(33u64, 32), Some(64));
        assert_eq!(align_up(32u64, 32), Some(32));
        assert_eq!(floor_align(33u64, 32), Some(32));
        assert_eq!(floor_align(31u64, 32), Some(0));
    }

    #[test]
    fn test_ceil_div_does_not_overflow() {
        assert_eq!(ceil_div(u64::MAX, 1), Some(u64::MAX));
        assert_eq!(ceil_div(u64::MAX, 2), Some(u64::MAX / 2 + 1));
    }

    #[test]
    fn test_iter_powers_of_two() {
        assert_eq!(iter_powers_of_two(8).collect::<Vec<_>>(), vec![1, 2, 4, 8]);
        assert_eq!(iter_powers_of_two(1).collect::<Vec<_>>(), vec![1]);
        assert_eq!(iter_powers_of_two(0).collect::<Vec<_>>(), Vec::<u64>::new());
    }

    proptest! {
        #[test]
        fn test_factors_uncapped_is_exact_divisor_set(n in 1u64..5000) {
            let got = factors(n, n);
            let expected = (1..=n).filter(|d| n % d == 0).collect::<Vec<_>>();
            prop_assert_eq!(got, expected);
        }

        #[test]
        fn test_ceil_div_bounds(a in 0u64..1_000_000, b in 1u64..10_000) {
            let q = ceil_div(a, b).unwrap();
            prop_assert!(q * b >= a);
            if q > 0 {
                prop_assert!((q - 1) * b < a);
            }
        }

        #[test]
        fn test_align_up_is_idempotent(x in 0u64..1_000_000, b in 1u64..4096) {
            let once = align_up(x, b).unwrap();
            prop_assert_eq!(align_up(once, b).unwrap(), once);
            prop_assert_eq!(once % b, 0);
        }

        #[test]
        fn test_merged_candidates_never_exceed_extent_or_cap(
            extent in 1u64..2048, cores in 1u32..64
        ) {
            let core_factors = factors(cores, cores);
            let base = factors(extent, u64::from(cores))
                .into_iter()
                .map(|f| u32::try_from(f).unwrap())
                .collect::<Vec<_>>();
            let merged = merge_axis_candidates(extent, &base, &core_factors);
            prop_assert!(merged.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(merged.iter().all(|&v| u64::from(v) <= extent && v <= cores));
        }
    }
}
