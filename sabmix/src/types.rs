//! États, drapeaux et constantes du graphe d'objets.

use std::time::Duration;

/// Plancher absolu de latence d'un périphérique.
pub const ABSOLUTE_MIN_LATENCY: Duration = Duration::from_micros(500);

/// Plafond absolu de latence d'un périphérique.
pub const ABSOLUTE_MAX_LATENCY: Duration = Duration::from_secs(10);

/// Latence fixe par défaut quand ni le pilote ni les flux n'imposent
/// rien.
pub const DEFAULT_FIXED_LATENCY: Duration = Duration::from_millis(250);

/// État d'un sink ou d'une source.
///
/// `Init` avant `put` ; `Unlinked` est terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Init,
    Running,
    Idle,
    Suspended,
    Unlinked,
}

impl DeviceState {
    /// Vrai pour les états où l'objet est enregistré et opérationnel.
    pub fn is_linked(self) -> bool {
        matches!(
            self,
            DeviceState::Running | DeviceState::Idle | DeviceState::Suspended
        )
    }

    /// Vrai quand le thread IO rend de l'audio.
    pub fn is_opened(self) -> bool {
        matches!(self, DeviceState::Running | DeviceState::Idle)
    }
}

/// État d'un flux client (sink-input ou source-output).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    Running,
    /// Lecture uniquement : la file s'est vidée naturellement.
    Drained,
    Corked,
    Unlinked,
}

impl StreamState {
    pub fn is_linked(self) -> bool {
        !matches!(self, StreamState::Init | StreamState::Unlinked)
    }
}

bitflags::bitflags! {
    /// Capacités d'un sink ou d'une source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        /// Le matériel contrôle le volume lui-même.
        const HW_VOLUME = 0x01;
        /// Le volume se convertit en décibels.
        const DECIBEL_VOLUME = 0x02;
        /// Volume plat : le volume du périphérique suit le maximum des
        /// flux attachés.
        const FLAT_VOLUME = 0x04;
        /// La latence est mesurable.
        const LATENCY = 0x08;
        /// La latence s'ajuste aux besoins des flux.
        const DYNAMIC_LATENCY = 0x10;
        /// Périphérique réseau.
        const NETWORK = 0x20;
    }
}

bitflags::bitflags! {
    /// Causes de suspension. L'objet est suspendu ssi l'ensemble est
    /// non vide ; chaque cause n'est levée que par celui qui l'a posée.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SuspendCause: u32 {
        const USER = 0x01;
        const IDLE = 0x02;
        const SESSION = 0x04;
        const PASSTHROUGH = 0x08;
        const INTERNAL = 0x10;
    }
}

/// Latence annoncée par un périphérique : fixe, ou dynamique dans un
/// intervalle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencySpec {
    Fixed(Duration),
    Dynamic { min: Duration, max: Duration },
}

impl LatencySpec {
    /// Borne `wanted` dans ce que le périphérique sait faire.
    pub fn clamp(&self, wanted: Duration) -> Duration {
        let clamped = match self {
            LatencySpec::Fixed(f) => *f,
            LatencySpec::Dynamic { min, max } => wanted.clamp(*min, *max),
        };
        clamped.clamp(ABSOLUTE_MIN_LATENCY, ABSOLUTE_MAX_LATENCY)
    }

    pub fn default_latency(&self) -> Duration {
        match self {
            LatencySpec::Fixed(f) => (*f).clamp(ABSOLUTE_MIN_LATENCY, ABSOLUTE_MAX_LATENCY),
            LatencySpec::Dynamic { max, .. } => {
                DEFAULT_FIXED_LATENCY.clamp(ABSOLUTE_MIN_LATENCY, *max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_clamping() {
        let fixed = LatencySpec::Fixed(Duration::from_millis(100));
        assert_eq!(
            fixed.clamp(Duration::from_millis(5)),
            Duration::from_millis(100)
        );
        let dynamic = LatencySpec::Dynamic {
            min: Duration::from_millis(10),
            max: Duration::from_secs(1),
        };
        assert_eq!(
            dynamic.clamp(Duration::from_millis(1)),
            Duration::from_millis(10)
        );
        assert_eq!(
            dynamic.clamp(Duration::from_secs(5)),
            Duration::from_secs(1)
        );
        // Le plancher absolu l'emporte sur l'intervalle du pilote.
        let silly = LatencySpec::Dynamic {
            min: Duration::from_micros(1),
            max: Duration::from_secs(60),
        };
        assert_eq!(silly.clamp(Duration::ZERO), ABSOLUTE_MIN_LATENCY);
        assert_eq!(silly.clamp(Duration::from_secs(60)), ABSOLUTE_MAX_LATENCY);
    }

    #[test]
    fn state_predicates() {
        assert!(!DeviceState::Init.is_linked());
        assert!(DeviceState::Suspended.is_linked());
        assert!(!DeviceState::Suspended.is_opened());
        assert!(!DeviceState::Unlinked.is_linked());
    }
}
