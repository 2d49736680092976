//! Server address strings.
//!
//! Accepted forms: `/path/to/socket`, `unix:/path`, `tcp:host:port`,
//! `tcp4:host:port`, `tcp6:host:port`, `host[:port]`. The default is
//! the per-user runtime socket, falling back to localhost TCP.

use std::path::PathBuf;

use crate::error::NativeError;
use crate::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl ServerAddress {
    /// Parses an address string.
    pub fn parse(s: &str) -> Result<ServerAddress, NativeError> {
        if s.is_empty() {
            return Err(NativeError::BadAddress("empty".into()));
        }
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(ServerAddress::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(ServerAddress::Unix(PathBuf::from(s)));
        }
        for prefix in ["tcp:", "tcp4:", "tcp6:"] {
            if let Some(rest) = s.strip_prefix(prefix) {
                return Self::parse_host_port(rest);
            }
        }
        Self::parse_host_port(s)
    }

    fn parse_host_port(s: &str) -> Result<ServerAddress, NativeError> {
        if s.is_empty() {
            return Err(NativeError::BadAddress("empty host".into()));
        }
        // Une adresse IPv6 littérale est entre crochets.
        if let Some(rest) = s.strip_prefix('[') {
            let Some((host, tail)) = rest.split_once(']') else {
                return Err(NativeError::BadAddress(s.into()));
            };
            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| NativeError::BadAddress(s.into()))?,
                None => DEFAULT_PORT,
            };
            return Ok(ServerAddress::Tcp {
                host: host.to_owned(),
                port,
            });
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => Ok(ServerAddress::Tcp {
                host: host.to_owned(),
                port: port
                    .parse()
                    .map_err(|_| NativeError::BadAddress(s.into()))?,
            }),
            _ => Ok(ServerAddress::Tcp {
                host: s.to_owned(),
                port: DEFAULT_PORT,
            }),
        }
    }

    /// The address to try when nothing is configured: the per-user
    /// runtime socket, else localhost TCP.
    pub fn default_address() -> ServerAddress {
        if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
            if !dir.is_empty() {
                return ServerAddress::Unix(PathBuf::from(dir).join("sabine").join("native"));
            }
        }
        ServerAddress::Tcp {
            host: "localhost".to_owned(),
            port: DEFAULT_PORT,
        }
    }

    /// Address from `SABINE_SERVER`, else the default.
    pub fn from_env() -> Result<ServerAddress, NativeError> {
        match std::env::var("SABINE_SERVER") {
            Ok(s) if !s.is_empty() => Self::parse(&s),
            _ => Ok(Self::default_address()),
        }
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            ServerAddress::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        assert_eq!(
            ServerAddress::parse("/run/sabine/native").unwrap(),
            ServerAddress::Unix(PathBuf::from("/run/sabine/native"))
        );
        assert_eq!(
            ServerAddress::parse("unix:/tmp/s").unwrap(),
            ServerAddress::Unix(PathBuf::from("/tmp/s"))
        );
        assert_eq!(
            ServerAddress::parse("tcp:music.local:4000").unwrap(),
            ServerAddress::Tcp {
                host: "music.local".into(),
                port: 4000
            }
        );
        assert_eq!(
            ServerAddress::parse("music.local").unwrap(),
            ServerAddress::Tcp {
                host: "music.local".into(),
                port: DEFAULT_PORT
            }
        );
        assert_eq!(
            ServerAddress::parse("music.local:1234").unwrap(),
            ServerAddress::Tcp {
                host: "music.local".into(),
                port: 1234
            }
        );
        assert_eq!(
            ServerAddress::parse("tcp6:[::1]:9").unwrap(),
            ServerAddress::Tcp {
                host: "::1".into(),
                port: 9
            }
        );
        assert!(ServerAddress::parse("").is_err());
        assert!(ServerAddress::parse("host:notaport").is_err());
    }
}
