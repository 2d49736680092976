//! Spécification d'échantillonnage : format, nombre de canaux, cadence.
//!
//! Les conversions octets ↔ durée supposent toujours une spec valide
//! (vérifiée par [`SampleSpec::check`] à l'entrée du système).

use std::fmt;
use std::time::Duration;

use crate::error::CoreError;

/// Nombre maximal de canaux d'une spec.
pub const CHANNELS_MAX: u8 = 32;

/// Cadence maximale acceptée (Hz).
pub const RATE_MAX: u32 = 384_000;

/// Format d'un échantillon individuel.
///
/// Les valeurs numériques sont celles du protocole natif et ne doivent
/// pas changer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SampleFormat {
    /// PCM non signé 8 bits
    U8 = 0,
    /// A-law 8 bits
    ALaw = 1,
    /// µ-law 8 bits
    ULaw = 2,
    /// PCM signé 16 bits, petit-boutiste
    S16Le = 3,
    /// PCM signé 16 bits, gros-boutiste
    S16Be = 4,
    /// Flottant IEEE 32 bits, petit-boutiste
    F32Le = 5,
    /// Flottant IEEE 32 bits, gros-boutiste
    F32Be = 6,
    /// PCM signé 32 bits, petit-boutiste
    S32Le = 7,
    /// PCM signé 32 bits, gros-boutiste
    S32Be = 8,
    /// PCM signé 24 bits sur 3 octets, petit-boutiste
    S24Le = 9,
    /// PCM signé 24 bits sur 3 octets, gros-boutiste
    S24Be = 10,
}

impl SampleFormat {
    /// Taille d'un échantillon en octets.
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::ALaw | SampleFormat::ULaw => 1,
            SampleFormat::S16Le | SampleFormat::S16Be => 2,
            SampleFormat::S24Le | SampleFormat::S24Be => 3,
            SampleFormat::S32Le
            | SampleFormat::S32Be
            | SampleFormat::F32Le
            | SampleFormat::F32Be => 4,
        }
    }

    /// Octet de silence du format.
    ///
    /// Pour les formats signés et flottants le silence est 0 ; U8 est
    /// centré sur 0x80, A-law et µ-law ont leurs valeurs propres.
    pub fn silence_byte(self) -> u8 {
        match self {
            SampleFormat::U8 => 0x80,
            SampleFormat::ALaw => 0xd5,
            SampleFormat::ULaw => 0xff,
            _ => 0x00,
        }
    }

    /// Décode une valeur du protocole.
    pub fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0 => SampleFormat::U8,
            1 => SampleFormat::ALaw,
            2 => SampleFormat::ULaw,
            3 => SampleFormat::S16Le,
            4 => SampleFormat::S16Be,
            5 => SampleFormat::F32Le,
            6 => SampleFormat::F32Be,
            7 => SampleFormat::S32Le,
            8 => SampleFormat::S32Be,
            9 => SampleFormat::S24Le,
            10 => SampleFormat::S24Be,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::ALaw => "alaw",
            SampleFormat::ULaw => "ulaw",
            SampleFormat::S16Le => "s16le",
            SampleFormat::S16Be => "s16be",
            SampleFormat::F32Le => "float32le",
            SampleFormat::F32Be => "float32be",
            SampleFormat::S32Le => "s32le",
            SampleFormat::S32Be => "s32be",
            SampleFormat::S24Le => "s24le",
            SampleFormat::S24Be => "s24be",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Spécification complète d'un flux PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub channels: u8,
    pub rate: u32,
}

impl SampleSpec {
    pub fn new(format: SampleFormat, channels: u8, rate: u32) -> Result<Self, CoreError> {
        let spec = SampleSpec {
            format,
            channels,
            rate,
        };
        spec.check()?;
        Ok(spec)
    }

    /// Vérifie que la spec est dans les bornes admises.
    pub fn check(&self) -> Result<(), CoreError> {
        if self.channels == 0 || self.channels > CHANNELS_MAX {
            return Err(CoreError::InvalidSpec(format!(
                "channels {} out of range [1, {}]",
                self.channels, CHANNELS_MAX
            )));
        }
        if self.rate == 0 || self.rate > RATE_MAX {
            return Err(CoreError::InvalidSpec(format!(
                "rate {} out of range [1, {}]",
                self.rate, RATE_MAX
            )));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    /// Taille d'une frame (un échantillon par canal) en octets.
    pub fn frame_size(&self) -> usize {
        self.format.sample_size() * self.channels as usize
    }

    /// Débit en octets par seconde.
    pub fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.rate as usize
    }

    /// Convertit une durée en octets, alignée sur la taille de frame.
    pub fn duration_to_bytes(&self, d: Duration) -> usize {
        let bytes = (d.as_micros() as u128 * self.bytes_per_second() as u128) / 1_000_000;
        let fs = self.frame_size();
        (bytes as usize / fs) * fs
    }

    /// Convertit une longueur en octets vers une durée.
    pub fn bytes_to_duration(&self, bytes: usize) -> Duration {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros((bytes as u64).saturating_mul(1_000_000) / bps as u64)
    }

    /// Arrondit `l` vers le bas au multiple de la taille de frame.
    pub fn align_down(&self, l: usize) -> usize {
        let fs = self.frame_size();
        (l / fs) * fs
    }

    /// Vrai si les deux specs décrivent exactement le même codage.
    pub fn equal(&self, other: &SampleSpec) -> bool {
        self == other
    }
}

impl fmt::Display for SampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ch {}Hz {}", self.channels, self.rate, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_validation() {
        assert!(SampleSpec::new(SampleFormat::S16Le, 2, 44100).is_ok());
        assert!(SampleSpec::new(SampleFormat::S16Le, 0, 44100).is_err());
        assert!(SampleSpec::new(SampleFormat::S16Le, 33, 44100).is_err());
        assert!(SampleSpec::new(SampleFormat::S16Le, 2, 0).is_err());
        assert!(SampleSpec::new(SampleFormat::S16Le, 2, 400_000).is_err());
    }

    #[test]
    fn frame_and_rate_math() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 2, 44100).unwrap();
        assert_eq!(spec.frame_size(), 4);
        assert_eq!(spec.bytes_per_second(), 176_400);
        assert_eq!(spec.duration_to_bytes(Duration::from_secs(1)), 176_400);
        assert_eq!(
            spec.bytes_to_duration(176_400),
            Duration::from_secs(1)
        );
        // L'aller-retour durée → octets est aligné sur la frame.
        assert_eq!(spec.duration_to_bytes(Duration::from_micros(23)) % 4, 0);
    }

    #[test]
    fn wire_codes_roundtrip() {
        for v in 0..=10u8 {
            let f = SampleFormat::from_wire(v).unwrap();
            assert_eq!(f as u8, v);
        }
        assert!(SampleFormat::from_wire(11).is_none());
    }
}
