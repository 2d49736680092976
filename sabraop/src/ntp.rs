//! NTP timestamps, 1900 epoch.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between 1 Jan 1900 and 1 Jan 1970.
const EPOCH_DELTA: u64 = 0x83aa_7e80;

/// A 64-bit NTP timestamp: integer seconds since 1900 in the high
/// word, fraction (`µs · 2³² / 10⁶`) in the low word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    pub fn now() -> Self {
        Self::from_system(SystemTime::now())
    }

    pub fn from_system(t: SystemTime) -> Self {
        let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        let secs = since.as_secs() + EPOCH_DELTA;
        let frac = (since.subsec_micros() as u64) * (u32::MAX as u64) / 1_000_000;
        NtpTimestamp((secs << 32) | frac)
    }

    pub fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn fraction(self) -> u32 {
        self.0 as u32
    }

    /// Écrit les deux mots gros-boutistes.
    pub fn to_be_words(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_words(buf: &[u8]) -> Option<Self> {
        Some(NtpTimestamp(u64::from_be_bytes(buf.try_into().ok()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn epoch_is_1900() {
        let unix_zero = NtpTimestamp::from_system(UNIX_EPOCH);
        assert_eq!(unix_zero.seconds() as u64, EPOCH_DELTA);
        assert_eq!(unix_zero.fraction(), 0);
    }

    #[test]
    fn fraction_scales_microseconds() {
        let t = NtpTimestamp::from_system(UNIX_EPOCH + Duration::from_micros(500_000));
        // Une demi-seconde vaut environ 2³¹ en fraction.
        let frac = t.fraction() as u64;
        assert!((frac as i64 - (1u64 << 31) as i64).abs() < 10_000, "{frac}");
    }

    #[test]
    fn words_roundtrip() {
        let t = NtpTimestamp::now();
        assert_eq!(NtpTimestamp::from_be_words(&t.to_be_words()), Some(t));
    }
}
