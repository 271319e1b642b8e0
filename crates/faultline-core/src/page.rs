//! Process-wide page size and the rounding arithmetic built on it.

use std::sync::OnceLock;

use nix::unistd::{SysconfVar, sysconf};

/// Page size assumed when `sysconf` cannot answer.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// The OS page size in bytes, queried once per process.
#[must_use]
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .and_then(|v| usize::try_from(v).ok())
            .filter(|&v| v > 0)
            .unwrap_or(FALLBACK_PAGE_SIZE)
    })
}

/// `ceil(n / d)` for `d > 0`.
#[inline]
#[must_use]
pub const fn ceil_div(n: u64, d: u64) -> u64 {
    n.div_ceil(d)
}

/// Round `n` up to the next multiple of `multiple`.
#[inline]
#[must_use]
pub const fn round_up(n: u64, multiple: u64) -> u64 {
    ceil_div(n, multiple) * multiple
}

/// Round `n` up to a whole number of pages.
#[inline]
#[must_use]
pub fn round_up_to_page(n: u64) -> u64 {
    round_up(n, page_size() as u64)
}

/// Greatest common divisor.
#[must_use]
pub const fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let p = page_size();
        assert!(p.is_power_of_two());
        assert!(p >= 4096);
        assert_eq!(page_size(), p);
    }

    #[test]
    fn rounding() {
        assert_eq!(ceil_div(0, 8), 0);
        assert_eq!(ceil_div(1, 8), 1);
        assert_eq!(ceil_div(16, 8), 2);
        assert_eq!(round_up(17, 8), 24);
        assert_eq!(round_up(24, 8), 24);
        let p = page_size() as u64;
        assert_eq!(round_up_to_page(1), p);
        assert_eq!(round_up_to_page(p), p);
        assert_eq!(round_up_to_page(0), 0);
    }

    #[test]
    fn gcd_values() {
        assert_eq!(gcd(100, 30), 10);
        assert_eq!(gcd(30, 100), 10);
        assert_eq!(gcd(4096, 24), 8);
        assert_eq!(gcd(7, 1), 1);
    }
}
