//! Content fingerprints used to detect chunks modified while resident.

use xxhash_rust::xxh3::xxh3_128;

/// 128-bit XXH3 digest of a chunk's bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Fingerprint(u128);

impl Fingerprint {
    #[inline]
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(xxh3_128(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_single_byte_change() {
        let mut data = vec![7_u8; 8192];
        let before = Fingerprint::of(&data);
        assert_eq!(before, Fingerprint::of(&data));
        data[4096] = 8;
        assert_ne!(before, Fingerprint::of(&data));
    }

    #[test]
    fn length_matters() {
        assert_ne!(Fingerprint::of(&[0; 16]), Fingerprint::of(&[0; 17]));
    }
}
