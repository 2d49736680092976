//! Paquetage RTP : en-tête RFC 3550, émission depuis une file mémoire,
//! réception vers des vues mémoire.

use std::time::SystemTime;

use rand::Rng;
use tracing::{debug, warn};

use sabcore::{MemBlockQ, MemChunk, MemPool, SampleFormat, SampleSpec};

use crate::error::RtpError;

/// Taille de l'en-tête RTP sans CSRC.
pub const HEADER_SIZE: usize = 12;

/// Nombre maximal de vues rassemblées dans un paquet.
pub const MAX_IOVECS: usize = 16;

/// Type de charge dynamique, pour toute spec hors table statique.
pub const PAYLOAD_DYNAMIC: u8 = 127;

/// Type de charge statique d'une spec, 127 si hors table.
pub fn payload_from_spec(spec: &SampleSpec) -> u8 {
    match (spec.format, spec.rate, spec.channels) {
        (SampleFormat::S16Be, 44100, 2) => 10,
        (SampleFormat::S16Be, 44100, 1) => 11,
        _ => PAYLOAD_DYNAMIC,
    }
}

/// Spec d'une charge statique.
pub fn spec_from_payload(payload: u8) -> Option<SampleSpec> {
    match payload {
        10 => SampleSpec::new(SampleFormat::S16Be, 2, 44100).ok(),
        11 => SampleSpec::new(SampleFormat::S16Be, 1, 44100).ok(),
        _ => None,
    }
}

/// Force une spec dans ce que RTP transporte : s16 gros-boutiste.
pub fn fixup_spec(mut spec: SampleSpec) -> SampleSpec {
    if spec.format != SampleFormat::S16Be {
        spec.format = SampleFormat::S16Be;
    }
    spec
}

/// En-tête d'un paquet (V=2, sans padding, extension ni CSRC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn pack(&self) -> [u8; HEADER_SIZE] {
        let word0 = (2u32 << 30) | ((self.payload as u32 & 127) << 16) | self.sequence as u32;
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&word0.to_be_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        out
    }

    /// Valide et décode un en-tête. Retourne aussi la longueur des
    /// métadonnées (en-tête + CSRC éventuels).
    pub fn parse(buf: &[u8]) -> Result<(RtpHeader, usize), RtpError> {
        if buf.len() < HEADER_SIZE {
            return Err(RtpError::BadPacket(format!("{} bytes", buf.len())));
        }
        let word0 = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if word0 >> 30 != 2 {
            return Err(RtpError::BadPacket("unsupported RTP version".into()));
        }
        if (word0 >> 29) & 1 != 0 {
            return Err(RtpError::BadPacket("padding not supported".into()));
        }
        if (word0 >> 28) & 1 != 0 {
            return Err(RtpError::BadPacket("header extensions not supported".into()));
        }
        let cc = ((word0 >> 24) & 0xF) as usize;
        let metadata = HEADER_SIZE + cc * 4;
        if buf.len() < metadata {
            return Err(RtpError::BadPacket("truncated CSRC list".into()));
        }
        Ok((
            RtpHeader {
                payload: ((word0 >> 16) & 127) as u8,
                sequence: (word0 & 0xFFFF) as u16,
                timestamp: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
                ssrc: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            },
            metadata,
        ))
    }
}

/// Émetteur : découpe une file mémoire en paquets d'au plus `mtu`
/// octets de charge.
pub struct RtpSender {
    payload: u8,
    mtu: usize,
    frame_size: usize,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpSender {
    pub fn new(payload: u8, mtu: usize, spec: &SampleSpec) -> Self {
        let mut rng = rand::rng();
        RtpSender {
            payload: payload & 127,
            mtu,
            frame_size: spec.frame_size(),
            ssrc: rng.random(),
            sequence: rng.random(),
            timestamp: 0,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Émet tant que la file contient au moins `mtu` octets. Chaque
    /// paquet rassemble jusqu'à [`MAX_IOVECS`] vues consécutives.
    ///
    /// `emit` écrit un paquet assemblé ; une erreur `WouldBlock` ou
    /// `Interrupted` jette le paquet (le tampon plein signifie que le
    /// récepteur ne suit pas, on ne réessaie pas), mais séquence et
    /// timestamp avancent comme s'il était parti.
    pub fn pump(
        &mut self,
        q: &mut MemBlockQ,
        emit: &mut dyn FnMut(&[u8]) -> std::io::Result<()>,
    ) -> Result<usize, RtpError> {
        let mut packets = 0;
        while q.len() >= self.mtu {
            let mut payload_buf = Vec::with_capacity(self.mtu);
            let mut iovs = 0;
            while payload_buf.len() < self.mtu && iovs < MAX_IOVECS {
                let Some(chunk) = q.peek() else {
                    break;
                };
                if chunk.is_empty() {
                    break;
                }
                let take = chunk.length.min(self.mtu - payload_buf.len());
                {
                    let data = chunk.bytes();
                    payload_buf.extend_from_slice(&data[..take]);
                }
                q.drop_bytes(take);
                iovs += 1;
            }
            if payload_buf.is_empty() {
                break;
            }
            debug_assert_eq!(payload_buf.len() % self.frame_size, 0);

            let header = RtpHeader {
                payload: self.payload,
                sequence: self.sequence,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
            };
            let mut packet = Vec::with_capacity(HEADER_SIZE + payload_buf.len());
            packet.extend_from_slice(&header.pack());
            packet.extend_from_slice(&payload_buf);

            self.sequence = self.sequence.wrapping_add(1);
            self.timestamp = self
                .timestamp
                .wrapping_add((payload_buf.len() / self.frame_size) as u32);

            match emit(&packet) {
                Ok(()) => packets += 1,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    debug!("rtp: socket full, packet dropped");
                    return Ok(packets);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(packets)
    }
}

/// Récepteur : valide les paquets et extrait la charge dans des vues
/// mémoire. Le SSRC est verrouillé sur le premier vu.
pub struct RtpReceiver {
    payload: u8,
    frame_size: usize,
    ssrc: Option<u32>,
    last_sequence: u16,
}

/// Un paquet reçu et décodé.
pub struct RtpIncoming {
    pub chunk: MemChunk,
    pub timestamp: u32,
    pub sequence: u16,
    /// Heure de réception, du cmsg `SCM_TIMESTAMP` si disponible.
    pub recv_time: SystemTime,
}

impl RtpReceiver {
    pub fn new(payload: u8, spec: &SampleSpec) -> Self {
        RtpReceiver {
            payload,
            frame_size: spec.frame_size(),
            ssrc: None,
            last_sequence: 0,
        }
    }

    pub fn last_sequence(&self) -> u16 {
        self.last_sequence
    }

    /// Décode un datagramme brut déjà lu.
    pub fn decode(
        &mut self,
        buf: &[u8],
        pool: &MemPool,
        recv_time: Option<SystemTime>,
    ) -> Result<RtpIncoming, RtpError> {
        let (header, metadata) = RtpHeader::parse(buf)?;
        match self.ssrc {
            None => self.ssrc = Some(header.ssrc),
            Some(want) if want != header.ssrc => {
                return Err(RtpError::SsrcMismatch {
                    got: header.ssrc,
                    want,
                });
            }
            _ => {}
        }
        if header.payload != self.payload {
            return Err(RtpError::BadPayload(header.payload));
        }
        let audio = &buf[metadata..];
        if audio.is_empty() || audio.len() % self.frame_size != 0 {
            return Err(RtpError::BadPacket(format!(
                "audio length {} not a frame multiple",
                audio.len()
            )));
        }
        self.last_sequence = header.sequence;

        let mut block = match pool.alloc(audio.len()) {
            Ok(b) => b,
            Err(_) => pool.alloc_appended(audio.len()),
        };
        if let Some(data) = block.try_mut() {
            data.copy_from_slice(audio);
        }
        let recv_time = match recv_time {
            Some(t) => t,
            None => {
                warn!("rtp: no SCM_TIMESTAMP on received packet");
                SystemTime::now()
            }
        };
        Ok(RtpIncoming {
            chunk: MemChunk::new(block),
            timestamp: header.timestamp,
            sequence: header.sequence,
            recv_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sabcore::memblockq::BlockQAttr;

    fn spec() -> SampleSpec {
        SampleSpec::new(SampleFormat::S16Be, 2, 44100).unwrap()
    }

    fn queue(pool: &MemPool) -> MemBlockQ {
        let silence = MemChunk::new(pool.silence_block(&spec()));
        MemBlockQ::new(
            4,
            BlockQAttr {
                maxlength: 1 << 20,
                tlength: 1 << 16,
                prebuf: 0,
                minreq: 4,
            },
            silence,
        )
    }

    fn silent_chunk(pool: &MemPool, len: usize) -> MemChunk {
        let mut b = pool.alloc(len).unwrap();
        b.try_mut().unwrap().fill(0);
        MemChunk::new(b)
    }

    #[test]
    fn header_roundtrip() {
        let h = RtpHeader {
            payload: 10,
            sequence: 0xBEEF,
            timestamp: 0x12345678,
            ssrc: 0xCAFEBABE,
        };
        let packed = h.pack();
        assert_eq!(packed[0], 0x80);
        let (parsed, metadata) = RtpHeader::parse(&packed).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(metadata, HEADER_SIZE);
    }

    #[test]
    fn parse_rejects_bad_version_and_flags() {
        let mut p = RtpHeader {
            payload: 10,
            sequence: 0,
            timestamp: 0,
            ssrc: 0,
        }
        .pack();
        p[0] = 0x40;
        assert!(RtpHeader::parse(&p).is_err());
        p[0] = 0x80 | 0x20;
        assert!(RtpHeader::parse(&p).is_err());
        p[0] = 0x80 | 0x10;
        assert!(RtpHeader::parse(&p).is_err());
    }

    #[test]
    fn sender_packetisation_matches_mtu() {
        // 4096 octets en file, mtu 1280 : trois paquets, reste 256.
        let pool = MemPool::new(64 * 1024, 32);
        let mut q = queue(&pool);
        q.push(silent_chunk(&pool, 4096)).unwrap();

        let mut sender = RtpSender::new(10, 1280, &spec());
        let seq0 = sender.sequence();
        let ts0 = sender.timestamp();

        let mut sent: Vec<Vec<u8>> = Vec::new();
        let n = sender
            .pump(&mut q, &mut |p| {
                sent.push(p.to_vec());
                Ok(())
            })
            .unwrap();

        assert_eq!(n, 3);
        assert_eq!(q.len(), 256);
        for (i, p) in sent.iter().enumerate() {
            assert_eq!(p.len(), HEADER_SIZE + 1280);
            let (h, _) = RtpHeader::parse(p).unwrap();
            assert_eq!(h.sequence, seq0.wrapping_add(i as u16));
            assert_eq!(h.timestamp, ts0.wrapping_add(320 * i as u32));
        }
    }

    #[test]
    fn sender_drops_packet_on_full_socket() {
        let pool = MemPool::new(64 * 1024, 32);
        let mut q = queue(&pool);
        q.push(silent_chunk(&pool, 2560)).unwrap();
        let mut sender = RtpSender::new(10, 1280, &spec());
        let seq0 = sender.sequence();

        let n = sender
            .pump(&mut q, &mut |_| {
                Err(std::io::Error::from(std::io::ErrorKind::WouldBlock))
            })
            .unwrap();
        assert_eq!(n, 0);
        // Le paquet assemblé est perdu mais compté.
        assert_eq!(sender.sequence(), seq0.wrapping_add(1));
        assert_eq!(sender.timestamp(), 320);
        assert_eq!(q.len(), 1280);
    }

    #[test]
    fn receiver_locks_first_ssrc() {
        let pool = MemPool::new(64 * 1024, 32);
        let mut rx = RtpReceiver::new(10, &spec());
        let mk = |ssrc: u32, seq: u16| {
            let mut p = RtpHeader {
                payload: 10,
                sequence: seq,
                timestamp: 0,
                ssrc,
            }
            .pack()
            .to_vec();
            p.extend_from_slice(&[0u8; 16]);
            p
        };
        let first = rx.decode(&mk(1, 5), &pool, None).unwrap();
        assert_eq!(first.sequence, 5);
        assert_eq!(first.chunk.length, 16);
        assert!(rx.decode(&mk(2, 6), &pool, None).is_err());
        assert!(rx.decode(&mk(1, 6), &pool, None).is_ok());
    }

    #[test]
    fn receiver_validates_payload_and_alignment() {
        let pool = MemPool::new(64 * 1024, 32);
        let mut rx = RtpReceiver::new(10, &spec());
        let mut p = RtpHeader {
            payload: 96,
            sequence: 0,
            timestamp: 0,
            ssrc: 7,
        }
        .pack()
        .to_vec();
        p.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            rx.decode(&p, &pool, None),
            Err(RtpError::BadPayload(96))
        ));

        let mut odd = RtpHeader {
            payload: 10,
            sequence: 0,
            timestamp: 0,
            ssrc: 7,
        }
        .pack()
        .to_vec();
        odd.extend_from_slice(&[0u8; 5]);
        assert!(rx.decode(&odd, &pool, None).is_err());
    }

    #[test]
    fn static_payload_table() {
        assert_eq!(payload_from_spec(&spec()), 10);
        let mono = SampleSpec::new(SampleFormat::S16Be, 1, 44100).unwrap();
        assert_eq!(payload_from_spec(&mono), 11);
        let other = SampleSpec::new(SampleFormat::S16Le, 2, 48000).unwrap();
        assert_eq!(payload_from_spec(&other), PAYLOAD_DYNAMIC);
        assert_eq!(spec_from_payload(10).unwrap(), spec());
        assert!(spec_from_payload(96).is_none());
        assert_eq!(fixup_spec(other).format, SampleFormat::S16Be);
    }
}
