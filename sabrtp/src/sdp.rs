//! Description de session SDP (RFC 2327), sous-ensemble audio L16.

use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use sabcore::{SampleFormat, SampleSpec};

use crate::error::RtpError;
use crate::rtp;

/// Les champs d'une session annoncée.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpInfo {
    pub origin_user: String,
    pub session_id: u64,
    pub origin_addr: IpAddr,
    pub session_name: String,
    pub dest_addr: IpAddr,
    pub port: u16,
    pub payload: u8,
    pub spec: SampleSpec,
}

impl SdpInfo {
    pub fn new(
        origin_user: &str,
        origin_addr: IpAddr,
        session_name: &str,
        dest: SocketAddr,
        payload: u8,
        spec: SampleSpec,
    ) -> Self {
        let session_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        SdpInfo {
            origin_user: origin_user.to_owned(),
            session_id,
            origin_addr,
            session_name: session_name.to_owned(),
            dest_addr: dest.ip(),
            port: dest.port(),
            payload,
            spec,
        }
    }

    fn ip_version(addr: &IpAddr) -> &'static str {
        match addr {
            IpAddr::V4(_) => "IP4",
            IpAddr::V6(_) => "IP6",
        }
    }

    /// Sérialise le corps SDP.
    pub fn to_sdp(&self) -> String {
        format!(
            "v=0\n\
             o={} {} 0 IN {} {}\n\
             s={}\n\
             c=IN {} {}\n\
             t={} 0\n\
             m=audio {} RTP/AVP {}\n\
             a=rtpmap:{} L16/{}/{}\n\
             a=type:broadcast\n",
            self.origin_user,
            self.session_id,
            Self::ip_version(&self.origin_addr),
            self.origin_addr,
            self.session_name,
            Self::ip_version(&self.dest_addr),
            self.dest_addr,
            self.session_id,
            self.port,
            self.payload,
            self.payload,
            self.spec.rate,
            self.spec.channels,
        )
    }

    /// Analyse un corps SDP reçu.
    pub fn parse(body: &str) -> Result<SdpInfo, RtpError> {
        let mut origin_user = String::new();
        let mut session_id = 0u64;
        let mut origin_addr = None;
        let mut session_name = String::new();
        let mut dest_addr = None;
        let mut port = None;
        let mut payload = None;
        let mut rate = None;
        let mut channels = None;

        for line in body.lines() {
            let line = line.trim_end_matches('\r');
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "o" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin_user = parts[0].to_owned();
                        session_id = parts[1].parse().unwrap_or(0);
                        origin_addr = parts[5].parse().ok();
                    }
                }
                "s" => session_name = value.to_owned(),
                "c" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        // Une adresse multicast peut porter un TTL.
                        let addr = parts[2].split('/').next().unwrap_or(parts[2]);
                        dest_addr = addr.parse().ok();
                    }
                }
                "m" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 4 && parts[0] == "audio" {
                        port = parts[1].parse::<u16>().ok();
                        payload = parts[3].parse::<u8>().ok();
                    }
                }
                "a" => {
                    if let Some(rest) = value.strip_prefix("rtpmap:") {
                        let mut it = rest.split_whitespace();
                        let _pt = it.next();
                        if let Some(map) = it.next() {
                            let mut fields = map.split('/');
                            match fields.next() {
                                Some("L16") => {}
                                other => {
                                    return Err(RtpError::BadSdp(format!(
                                        "unsupported encoding {other:?}"
                                    )))
                                }
                            }
                            rate = fields.next().and_then(|r| r.parse::<u32>().ok());
                            channels = fields.next().and_then(|c| c.parse::<u8>().ok());
                        }
                    }
                }
                _ => {}
            }
        }

        let payload = payload.ok_or_else(|| RtpError::BadSdp("missing m= line".into()))?;
        let spec = match (rate, channels) {
            (Some(rate), Some(channels)) => {
                SampleSpec::new(SampleFormat::S16Be, channels, rate)
                    .map_err(|e| RtpError::BadSdp(e.to_string()))?
            }
            _ => rtp::spec_from_payload(payload)
                .ok_or_else(|| RtpError::BadSdp(format!("no spec for payload {payload}")))?,
        };
        Ok(SdpInfo {
            origin_user,
            session_id,
            origin_addr: origin_addr
                .ok_or_else(|| RtpError::BadSdp("missing o= address".into()))?,
            session_name,
            dest_addr: dest_addr.ok_or_else(|| RtpError::BadSdp("missing c= line".into()))?,
            port: port.ok_or_else(|| RtpError::BadSdp("missing port".into()))?,
            payload,
            spec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdp_roundtrip() {
        let spec = SampleSpec::new(SampleFormat::S16Be, 2, 44100).unwrap();
        let info = SdpInfo::new(
            "sabine",
            "192.168.1.10".parse().unwrap(),
            "audio stream",
            "224.0.0.57:46000".parse().unwrap(),
            10,
            spec,
        );
        let body = info.to_sdp();
        assert!(body.contains("m=audio 46000 RTP/AVP 10"));
        assert!(body.contains("a=rtpmap:10 L16/44100/2"));
        let parsed = SdpInfo::parse(&body).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn parse_rejects_non_l16() {
        let body = "v=0\no=u 1 0 IN IP4 10.0.0.1\ns=x\nc=IN IP4 10.0.0.2\n\
                    m=audio 5004 RTP/AVP 96\na=rtpmap:96 opus/48000/2\n";
        assert!(SdpInfo::parse(body).is_err());
    }

    #[test]
    fn parse_accepts_ttl_suffix() {
        let body = "v=0\no=u 1 0 IN IP4 10.0.0.1\ns=x\nc=IN IP4 224.0.0.56/1\n\
                    m=audio 5004 RTP/AVP 10\n";
        let parsed = SdpInfo::parse(body).unwrap();
        assert_eq!(parsed.dest_addr, "224.0.0.56".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.spec.rate, 44100);
    }
}
