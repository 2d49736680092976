//! Cartographie des canaux : position de chaque canal d'une spec.

use std::fmt;

use crate::error::CoreError;
use crate::sample::CHANNELS_MAX;

/// Position d'un canal dans l'espace d'écoute.
///
/// Les valeurs numériques sont celles du protocole natif.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelPosition {
    Mono = 0,
    FrontLeft = 1,
    FrontRight = 2,
    FrontCenter = 3,
    RearCenter = 4,
    RearLeft = 5,
    RearRight = 6,
    Lfe = 7,
    FrontLeftOfCenter = 8,
    FrontRightOfCenter = 9,
    SideLeft = 10,
    SideRight = 11,
    Aux0 = 12,
    Aux1 = 13,
    Aux2 = 14,
    Aux3 = 15,
    TopCenter = 44,
    TopFrontLeft = 45,
    TopFrontRight = 46,
    TopFrontCenter = 47,
    TopRearLeft = 48,
    TopRearRight = 49,
    TopRearCenter = 50,
}

impl ChannelPosition {
    pub fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0 => ChannelPosition::Mono,
            1 => ChannelPosition::FrontLeft,
            2 => ChannelPosition::FrontRight,
            3 => ChannelPosition::FrontCenter,
            4 => ChannelPosition::RearCenter,
            5 => ChannelPosition::RearLeft,
            6 => ChannelPosition::RearRight,
            7 => ChannelPosition::Lfe,
            8 => ChannelPosition::FrontLeftOfCenter,
            9 => ChannelPosition::FrontRightOfCenter,
            10 => ChannelPosition::SideLeft,
            11 => ChannelPosition::SideRight,
            12 => ChannelPosition::Aux0,
            13 => ChannelPosition::Aux1,
            14 => ChannelPosition::Aux2,
            15 => ChannelPosition::Aux3,
            44 => ChannelPosition::TopCenter,
            45 => ChannelPosition::TopFrontLeft,
            46 => ChannelPosition::TopFrontRight,
            47 => ChannelPosition::TopFrontCenter,
            48 => ChannelPosition::TopRearLeft,
            49 => ChannelPosition::TopRearRight,
            50 => ChannelPosition::TopRearCenter,
            _ => return None,
        })
    }
}

/// Liste ordonnée des positions, de longueur égale au nombre de canaux
/// de la spec associée.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelMap {
    positions: Vec<ChannelPosition>,
}

impl ChannelMap {
    pub fn new(positions: Vec<ChannelPosition>) -> Result<Self, CoreError> {
        if positions.is_empty() || positions.len() > CHANNELS_MAX as usize {
            return Err(CoreError::InvalidMap(format!(
                "{} positions",
                positions.len()
            )));
        }
        Ok(ChannelMap { positions })
    }

    /// Cartographie par défaut pour `channels` canaux.
    ///
    /// 1 → mono, 2 → stéréo, au-delà les canaux supplémentaires
    /// reçoivent des positions auxiliaires.
    ///
    /// # Exemples
    ///
    /// ```
    /// use sabcore::{ChannelMap, ChannelPosition};
    ///
    /// let stereo = ChannelMap::default_for(2).unwrap();
    /// assert_eq!(stereo.channels(), 2);
    /// assert_eq!(stereo.find(ChannelPosition::FrontRight), Some(1));
    /// ```
    pub fn default_for(channels: u8) -> Result<Self, CoreError> {
        use ChannelPosition::*;
        let positions = match channels {
            0 => return Err(CoreError::InvalidMap("0 channels".into())),
            1 => vec![Mono],
            2 => vec![FrontLeft, FrontRight],
            3 => vec![FrontLeft, FrontRight, FrontCenter],
            4 => vec![FrontLeft, FrontRight, RearLeft, RearRight],
            5 => vec![FrontLeft, FrontRight, FrontCenter, RearLeft, RearRight],
            6 => vec![FrontLeft, FrontRight, FrontCenter, Lfe, RearLeft, RearRight],
            n if n <= CHANNELS_MAX => {
                let mut v = vec![FrontLeft, FrontRight, FrontCenter, Lfe, RearLeft, RearRight];
                for _ in 6..n {
                    v.push(Aux0);
                }
                v
            }
            n => return Err(CoreError::InvalidMap(format!("{n} channels"))),
        };
        Ok(ChannelMap { positions })
    }

    pub fn channels(&self) -> u8 {
        self.positions.len() as u8
    }

    pub fn positions(&self) -> &[ChannelPosition] {
        &self.positions
    }

    pub fn position(&self, channel: usize) -> Option<ChannelPosition> {
        self.positions.get(channel).copied()
    }

    /// Indice du canal portant `position`, s'il existe.
    pub fn find(&self, position: ChannelPosition) -> Option<usize> {
        self.positions.iter().position(|p| *p == position)
    }

    /// Vrai si la map est compatible avec `channels` canaux.
    pub fn compatible_with(&self, channels: u8) -> bool {
        self.channels() == channels
    }

    /// Table de correspondance canal-à-canal de `self` vers `dst`.
    ///
    /// Pour chaque canal de `self`, l'indice du canal de `dst` qui porte
    /// la même position ; à défaut, le canal de même indice s'il existe,
    /// sinon le canal 0. C'est le remap utilisé par la propagation de
    /// volume et par le convertisseur.
    ///
    /// # Exemples
    ///
    /// ```
    /// use sabcore::{ChannelMap, ChannelPosition};
    ///
    /// let stereo = ChannelMap::default_for(2).unwrap();
    /// let swapped = ChannelMap::new(vec![
    ///     ChannelPosition::FrontRight,
    ///     ChannelPosition::FrontLeft,
    /// ])
    /// .unwrap();
    /// assert_eq!(stereo.remap_table(&swapped), vec![1, 0]);
    /// ```
    pub fn remap_table(&self, dst: &ChannelMap) -> Vec<usize> {
        self.positions
            .iter()
            .enumerate()
            .map(|(i, p)| {
                dst.find(*p)
                    .unwrap_or(if i < dst.positions.len() { i } else { 0 })
            })
            .collect()
    }
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, p) in self.positions.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{p:?}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_maps() {
        assert_eq!(ChannelMap::default_for(1).unwrap().channels(), 1);
        let stereo = ChannelMap::default_for(2).unwrap();
        assert_eq!(
            stereo.positions(),
            &[ChannelPosition::FrontLeft, ChannelPosition::FrontRight]
        );
        assert!(ChannelMap::default_for(0).is_err());
        assert_eq!(ChannelMap::default_for(32).unwrap().channels(), 32);
    }

    #[test]
    fn remap_by_position() {
        let stereo = ChannelMap::default_for(2).unwrap();
        let swapped = ChannelMap::new(vec![
            ChannelPosition::FrontRight,
            ChannelPosition::FrontLeft,
        ])
        .unwrap();
        assert_eq!(stereo.remap_table(&swapped), vec![1, 0]);
        // Mono vers stéréo : pas de position commune, repli sur l'indice.
        let mono = ChannelMap::default_for(1).unwrap();
        assert_eq!(mono.remap_table(&stereo), vec![0]);
    }
}
