//! Volumes en virgule fixe.
//!
//! [`Volume`] est un scalaire 16.16 : `NORM` (0x10000) est la référence
//! unité, `MUTED` (0) le silence, au-delà de `NORM` le signal est
//! amplifié. [`CVolume`] porte un volume par canal.

use std::fmt;

use crate::channelmap::ChannelMap;
use crate::error::CoreError;
use crate::sample::CHANNELS_MAX;

/// Volume scalaire en virgule fixe 16.16.
///
/// # Exemples
///
/// ```
/// use sabcore::Volume;
///
/// let half = Volume(0x8000);
/// assert_eq!(half.multiply(Volume::NORM), half);
/// assert!((half.to_linear() - 0.5).abs() < 1e-6);
/// assert!(Volume::MUTED.is_muted());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Volume(pub u32);

impl Volume {
    /// Silence.
    pub const MUTED: Volume = Volume(0);
    /// Référence unité (0 dB logiciel).
    pub const NORM: Volume = Volume(0x10000);
    /// Borne supérieure admise.
    pub const MAX: Volume = Volume(u32::MAX / 2);

    /// Produit de deux volumes : `(a ⊗ b) = a·b / NORM`, arrondi.
    ///
    /// # Exemples
    ///
    /// ```
    /// use sabcore::Volume;
    ///
    /// let quarter = Volume(0x4000);
    /// let half = Volume(0x8000);
    /// assert_eq!(quarter.multiply(half), Volume(0x2000));
    /// assert_eq!(quarter.multiply(Volume::MUTED), Volume::MUTED);
    /// ```
    pub fn multiply(self, other: Volume) -> Volume {
        let v = (self.0 as u64 * other.0 as u64 + (Volume::NORM.0 as u64 / 2))
            / Volume::NORM.0 as u64;
        Volume((v as u64).min(Volume::MAX.0 as u64) as u32)
    }

    /// Quotient : `(a ⊘ b) = a·NORM / b`. Par convention `a ⊘ 0 = 0`.
    pub fn divide(self, other: Volume) -> Volume {
        if other.0 == 0 {
            return Volume::MUTED;
        }
        let v = (self.0 as u64 * Volume::NORM.0 as u64 + other.0 as u64 / 2) / other.0 as u64;
        Volume(v.min(Volume::MAX.0 as u64) as u32)
    }

    /// Facteur linéaire (1.0 = NORM).
    pub fn to_linear(self) -> f64 {
        self.0 as f64 / Volume::NORM.0 as f64
    }

    pub fn from_linear(v: f64) -> Volume {
        if v <= 0.0 {
            return Volume::MUTED;
        }
        let raw = (v * Volume::NORM.0 as f64).round();
        Volume((raw.min(Volume::MAX.0 as f64)) as u32)
    }

    /// Conversion en décibels ; `MUTED` donne `-inf`.
    pub fn to_db(self) -> f64 {
        if self.0 == 0 {
            return f64::NEG_INFINITY;
        }
        20.0 * self.to_linear().log10()
    }

    pub fn from_db(db: f64) -> Volume {
        if db == f64::NEG_INFINITY {
            return Volume::MUTED;
        }
        Volume::from_linear(10f64.powf(db / 20.0))
    }

    pub fn is_muted(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", (self.0 as u64 * 100) / Volume::NORM.0 as u64)
    }
}

/// Volume par canal.
///
/// # Exemples
///
/// ```
/// use sabcore::{CVolume, Volume};
///
/// let mut v = CVolume::norm(2);
/// v.set(1, Volume(0x8000));
/// assert_eq!(v.get(1), Volume(0x8000));
/// assert_eq!(v.max(), Volume::NORM);
/// assert!(!v.is_muted());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CVolume {
    values: Vec<Volume>,
}

impl CVolume {
    pub fn new(values: Vec<Volume>) -> Result<Self, CoreError> {
        if values.is_empty() || values.len() > CHANNELS_MAX as usize {
            return Err(CoreError::InvalidArg(format!(
                "{} volume channels",
                values.len()
            )));
        }
        Ok(CVolume { values })
    }

    /// Tous les canaux à `v`.
    pub fn uniform(channels: u8, v: Volume) -> Self {
        CVolume {
            values: vec![v; channels.max(1) as usize],
        }
    }

    pub fn norm(channels: u8) -> Self {
        Self::uniform(channels, Volume::NORM)
    }

    pub fn muted(channels: u8) -> Self {
        Self::uniform(channels, Volume::MUTED)
    }

    pub fn channels(&self) -> u8 {
        self.values.len() as u8
    }

    pub fn values(&self) -> &[Volume] {
        &self.values
    }

    pub fn get(&self, channel: usize) -> Volume {
        self.values.get(channel).copied().unwrap_or(Volume::MUTED)
    }

    pub fn set(&mut self, channel: usize, v: Volume) {
        if let Some(slot) = self.values.get_mut(channel) {
            *slot = v;
        }
    }

    /// Volume maximal sur l'ensemble des canaux.
    pub fn max(&self) -> Volume {
        self.values.iter().copied().max().unwrap_or(Volume::MUTED)
    }

    /// Moyenne arithmétique des canaux.
    pub fn avg(&self) -> Volume {
        if self.values.is_empty() {
            return Volume::MUTED;
        }
        let sum: u64 = self.values.iter().map(|v| v.0 as u64).sum();
        Volume((sum / self.values.len() as u64) as u32)
    }

    pub fn is_muted(&self) -> bool {
        self.values.iter().all(|v| v.is_muted())
    }

    pub fn is_norm(&self) -> bool {
        self.values.iter().all(|v| *v == Volume::NORM)
    }

    /// Produit canal par canal. Les deux volumes doivent avoir le même
    /// nombre de canaux ; sinon chaque canal de `self` est multiplié par
    /// le canal de même indice modulo la taille de `other`.
    pub fn multiply(&self, other: &CVolume) -> CVolume {
        let n = other.values.len();
        CVolume {
            values: self
                .values
                .iter()
                .enumerate()
                .map(|(i, v)| v.multiply(other.values[i % n]))
                .collect(),
        }
    }

    /// Quotient canal par canal, même convention de taille que
    /// [`CVolume::multiply`].
    pub fn divide(&self, other: &CVolume) -> CVolume {
        let n = other.values.len();
        CVolume {
            values: self
                .values
                .iter()
                .enumerate()
                .map(|(i, v)| v.divide(other.values[i % n]))
                .collect(),
        }
    }

    /// Réécrit le volume dans la géométrie de `to` : chaque canal de
    /// destination reçoit le volume du canal source de même position
    /// (table de [`ChannelMap::remap_table`] inversée) ; les canaux sans
    /// correspondant reçoivent la moyenne.
    ///
    /// # Exemples
    ///
    /// ```
    /// use sabcore::{CVolume, ChannelMap, ChannelPosition, Volume};
    ///
    /// let stereo = ChannelMap::default_for(2).unwrap();
    /// let swapped = ChannelMap::new(vec![
    ///     ChannelPosition::FrontRight,
    ///     ChannelPosition::FrontLeft,
    /// ])
    /// .unwrap();
    /// let v = CVolume::new(vec![Volume(10), Volume(20)]).unwrap();
    /// assert_eq!(
    ///     v.remap(&stereo, &swapped).values(),
    ///     &[Volume(20), Volume(10)]
    /// );
    /// ```
    pub fn remap(&self, from: &ChannelMap, to: &ChannelMap) -> CVolume {
        if from.channels() != self.channels() {
            return self.clone();
        }
        let avg = self.avg();
        let mut out = vec![avg; to.channels() as usize];
        let table = from.remap_table(to);
        for (src, dst) in table.iter().enumerate() {
            out[*dst] = self.values[src];
        }
        CVolume { values: out }
    }

    /// Fusionne canal par canal en prenant le maximum.
    pub fn merge_max(&mut self, other: &CVolume) {
        for (i, v) in self.values.iter_mut().enumerate() {
            let o = other.get(i % other.values.len().max(1));
            if o > *v {
                *v = o;
            }
        }
    }
}

impl fmt::Display for CVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiply_identities() {
        let v = Volume(0x8000);
        assert_eq!(v.multiply(Volume::NORM), v);
        assert_eq!(v.multiply(Volume::MUTED), Volume::MUTED);
        assert_eq!(Volume::NORM.multiply(Volume::NORM), Volume::NORM);
    }

    #[test]
    fn divide_inverts_multiply() {
        let a = Volume(0x20000);
        let b = Volume(0x8000);
        let p = a.multiply(b);
        // Aller-retour à l'arrondi près.
        let q = p.divide(b);
        assert!((q.0 as i64 - a.0 as i64).abs() <= 1, "{q:?} vs {a:?}");
        assert_eq!(a.divide(Volume::MUTED), Volume::MUTED);
    }

    #[test]
    fn db_conversion() {
        assert_eq!(Volume::NORM.to_db(), 0.0);
        assert_eq!(Volume::MUTED.to_db(), f64::NEG_INFINITY);
        let half = Volume::from_db(-6.0206);
        assert!((half.to_linear() - 0.5).abs() < 0.001);
    }

    #[test]
    fn cvolume_max_and_merge() {
        let mut a = CVolume::new(vec![Volume(100), Volume(300)]).unwrap();
        let b = CVolume::new(vec![Volume(200), Volume(50)]).unwrap();
        assert_eq!(a.max(), Volume(300));
        a.merge_max(&b);
        assert_eq!(a.values(), &[Volume(200), Volume(300)]);
    }

    #[test]
    fn remap_keeps_positions() {
        let stereo = ChannelMap::default_for(2).unwrap();
        let swapped = ChannelMap::new(vec![
            crate::ChannelPosition::FrontRight,
            crate::ChannelPosition::FrontLeft,
        ])
        .unwrap();
        let v = CVolume::new(vec![Volume(10), Volume(20)]).unwrap();
        let r = v.remap(&stereo, &swapped);
        assert_eq!(r.values(), &[Volume(20), Volume(10)]);
    }
}
