//! Configuration YAML du démon.
//!
//! Chemin : argument de ligne de commande, sinon `SABINE_CONFIG`,
//! sinon `$XDG_CONFIG_HOME/sabine/daemon.yaml`. Sans fichier, une
//! configuration par défaut (sink nul + protocole natif) s'applique.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Filtre de logs (syntaxe env-filter), ex. "info,sabmix=debug".
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Chemin du cookie d'authentification.
    #[serde(default)]
    pub cookie: Option<PathBuf>,

    /// Modules à charger, dans l'ordre.
    #[serde(default = "default_modules")]
    pub modules: Vec<ModuleConfig>,
}

fn default_log_filter() -> String {
    "info".to_owned()
}

fn default_modules() -> Vec<ModuleConfig> {
    vec![
        ModuleConfig::NullSink {
            name: "null".to_owned(),
            rate: 44100,
            channels: 2,
        },
        ModuleConfig::NativeProtocol { listen: None },
    ]
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            log_filter: default_log_filter(),
            cookie: None,
            modules: default_modules(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "module")]
pub enum ModuleConfig {
    /// Sink nul, périphérique par défaut des configurations sans
    /// matériel.
    #[serde(rename = "null-sink")]
    NullSink {
        name: String,
        #[serde(default = "default_rate")]
        rate: u32,
        #[serde(default = "default_channels")]
        channels: u8,
    },

    /// Source nulle (silence).
    #[serde(rename = "null-source")]
    NullSource {
        name: String,
        #[serde(default = "default_rate")]
        rate: u32,
        #[serde(default = "default_channels")]
        channels: u8,
    },

    /// Écoute du protocole natif.
    #[serde(rename = "native-protocol")]
    NativeProtocol {
        /// Adresse d'écoute ; défaut : socket runtime ou TCP local.
        #[serde(default)]
        listen: Option<String>,
    },

    /// Émission RTP de ce que capture une source.
    #[serde(rename = "rtp-send")]
    RtpSend {
        /// Source capturée ; défaut : le monitor du sink par défaut.
        #[serde(default)]
        source: Option<String>,
        /// Adresse de destination `ip:port`.
        destination: String,
        #[serde(default = "default_mtu")]
        mtu: usize,
    },

    /// Lecture d'une session RTP découverte en SAP.
    #[serde(rename = "rtp-recv")]
    RtpRecv {
        /// Sink de sortie ; défaut : le sink par défaut.
        #[serde(default)]
        sink: Option<String>,
    },

    /// Sink RAOP/AirTunes.
    #[serde(rename = "raop-sink")]
    RaopSink {
        name: String,
        host: String,
        #[serde(default)]
        port: Option<u16>,
        /// "udp" (défaut) ou "tcp".
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default = "default_true")]
        encryption: bool,
    },
}

fn default_rate() -> u32 {
    44100
}

fn default_channels() -> u8 {
    2
}

fn default_mtu() -> usize {
    1280
}

fn default_true() -> bool {
    true
}

impl DaemonConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<DaemonConfig> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => match std::env::var("SABINE_CONFIG") {
                Ok(p) if !p.is_empty() => Some(PathBuf::from(p)),
                _ => default_config_path(),
            },
        };
        match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(&path)?;
                let config: DaemonConfig = serde_yaml::from_str(&text)?;
                Ok(config)
            }
            _ => Ok(DaemonConfig::default()),
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg).join("sabine").join("daemon.yaml"));
        }
    }
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("sabine").join("daemon.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let text = r#"
log_filter: "debug"
modules:
  - module: null-sink
    name: quiet
    rate: 48000
  - module: native-protocol
    listen: "tcp:127.0.0.1:4713"
  - module: rtp-send
    destination: "224.0.0.57:46000"
  - module: raop-sink
    name: salon
    host: "airport.local"
"#;
        let config: DaemonConfig = serde_yaml::from_str(text).unwrap();
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.modules.len(), 4);
        match &config.modules[0] {
            ModuleConfig::NullSink { name, rate, channels } => {
                assert_eq!(name, "quiet");
                assert_eq!(*rate, 48000);
                assert_eq!(*channels, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &config.modules[3] {
            ModuleConfig::RaopSink { encryption, port, .. } => {
                assert!(*encryption);
                assert!(port.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn default_config_has_null_sink_and_listener() {
        let config = DaemonConfig::default();
        assert_eq!(config.modules.len(), 2);
        assert!(matches!(config.modules[0], ModuleConfig::NullSink { .. }));
        assert!(matches!(
            config.modules[1],
            ModuleConfig::NativeProtocol { .. }
        ));
    }

    #[test]
    fn unknown_top_level_fields_are_rejected() {
        let text = "log_filter: info\nsurprise: 1\n";
        assert!(serde_yaml::from_str::<DaemonConfig>(text).is_err());
    }

    #[test]
    fn unknown_module_kind_is_rejected() {
        let text = "modules:\n  - module: flux-capacitor\n";
        assert!(serde_yaml::from_str::<DaemonConfig>(text).is_err());
    }
}
