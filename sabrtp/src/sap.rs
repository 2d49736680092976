//! Annonces SAP (RFC 2974) : publication périodique du descripteur
//! SDP d'une session RTP sur le groupe multicast dédié.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::RtpError;

/// Groupe multicast des annonces.
pub const SAP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 56);

/// Port des annonces.
pub const SAP_PORT: u16 = 9875;

/// Période de réannonce.
pub const SAP_INTERVAL: Duration = Duration::from_secs(5);

const MIME_SDP: &str = "application/sdp";

/// Un paquet SAP décodé.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SapPacket {
    /// Vrai pour une suppression de session, faux pour une annonce.
    pub is_goodbye: bool,
    pub msg_id_hash: u16,
    pub origin: Ipv4Addr,
    pub sdp: String,
}

impl SapPacket {
    /// Sérialise : en-tête 8 octets (V=1), type MIME, corps SDP.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + MIME_SDP.len() + 1 + self.sdp.len());
        let mut flags = 0x20u8;
        if self.is_goodbye {
            flags |= 0x04;
        }
        out.push(flags);
        out.push(0); // auth length
        out.extend_from_slice(&self.msg_id_hash.to_be_bytes());
        out.extend_from_slice(&self.origin.octets());
        out.extend_from_slice(MIME_SDP.as_bytes());
        out.push(0);
        out.extend_from_slice(self.sdp.as_bytes());
        out
    }

    pub fn parse(buf: &[u8]) -> Result<SapPacket, RtpError> {
        if buf.len() < 8 {
            return Err(RtpError::BadPacket("SAP packet too short".into()));
        }
        let flags = buf[0];
        if flags >> 5 != 1 {
            return Err(RtpError::BadPacket(format!(
                "unsupported SAP version {}",
                flags >> 5
            )));
        }
        if flags & 0x10 != 0 {
            return Err(RtpError::BadPacket("IPv6 SAP origin not supported".into()));
        }
        if flags & 0x02 != 0 {
            return Err(RtpError::BadPacket("compressed SAP not supported".into()));
        }
        let auth_len = buf[1] as usize * 4;
        let msg_id_hash = u16::from_be_bytes(buf[2..4].try_into().unwrap());
        let origin = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
        let mut body = &buf[8 + auth_len..];
        // Le type MIME est optionnel ; s'il est là, on le saute.
        if !body.starts_with(b"v=0") {
            match body.iter().position(|b| *b == 0) {
                Some(nul) => body = &body[nul + 1..],
                None => return Err(RtpError::BadPacket("no SDP payload".into())),
            }
        }
        let sdp = std::str::from_utf8(body)
            .map_err(|_| RtpError::BadPacket("SDP is not UTF-8".into()))?
            .to_owned();
        Ok(SapPacket {
            is_goodbye: flags & 0x04 != 0,
            msg_id_hash,
            origin,
            sdp,
        })
    }
}

/// Annonceur périodique d'une session.
pub struct SapSender {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    packet: SapPacket,
    stop: CancellationToken,
}

impl SapSender {
    /// Prépare l'annonceur pour `sdp`, émis depuis `origin`.
    pub async fn new(origin: Ipv4Addr, sdp: String) -> Result<SapSender, RtpError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_multicast_ttl_v4(1)?;
        let msg_id_hash = {
            // Empreinte stable du corps, pour que les récepteurs
            // reconnaissent la même session.
            let mut h: u16 = 0;
            for b in sdp.as_bytes() {
                h = h.rotate_left(3) ^ *b as u16;
            }
            h
        };
        Ok(SapSender {
            socket: Arc::new(socket),
            target: SocketAddr::new(IpAddr::V4(SAP_MULTICAST_ADDR), SAP_PORT),
            packet: SapPacket {
                is_goodbye: false,
                msg_id_hash,
                origin,
                sdp,
            },
            stop: CancellationToken::new(),
        })
    }

    /// Lance les annonces périodiques en tâche de fond.
    pub fn start(&self) {
        let socket = self.socket.clone();
        let target = self.target;
        let bytes = self.packet.pack();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = socket.send_to(&bytes, target).await {
                            warn!("SAP announce failed: {e}");
                        }
                    }
                    _ = stop.cancelled() => return,
                }
            }
        });
        info!("SAP announcements every {SAP_INTERVAL:?} to {}", self.target);
    }

    /// Arrête les annonces et publie la suppression de session.
    pub async fn goodbye(self) {
        self.stop.cancel();
        let mut packet = self.packet;
        packet.is_goodbye = true;
        if let Err(e) = self.socket.send_to(&packet.pack(), self.target).await {
            warn!("SAP goodbye failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_roundtrip() {
        let p = SapPacket {
            is_goodbye: false,
            msg_id_hash: 0x1234,
            origin: Ipv4Addr::new(10, 0, 0, 1),
            sdp: "v=0\ns=test\n".to_owned(),
        };
        let bytes = p.pack();
        assert_eq!(bytes[0], 0x20);
        let parsed = SapPacket::parse(&bytes).unwrap();
        assert_eq!(parsed, p);
    }

    #[test]
    fn goodbye_flag_survives() {
        let p = SapPacket {
            is_goodbye: true,
            msg_id_hash: 1,
            origin: Ipv4Addr::LOCALHOST,
            sdp: "v=0\n".to_owned(),
        };
        let parsed = SapPacket::parse(&p.pack()).unwrap();
        assert!(parsed.is_goodbye);
    }

    #[test]
    fn bare_sdp_without_mime_parses() {
        let mut bytes = vec![0x20, 0, 0, 1, 10, 0, 0, 2];
        bytes.extend_from_slice(b"v=0\ns=x\n");
        let parsed = SapPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.sdp, "v=0\ns=x\n");
    }
}
