//! The RAOP session: RTSP signalling, audio framing and the UDP
//! auxiliary channels.
//!
//! Session establishment is sequential: connect, OPTIONS (UDP only),
//! ANNOUNCE (SDP with the wrapped AES key), SETUP (transport
//! negotiation), RECORD. Audio then flows over TCP or UDP; in UDP
//! mode two background tasks answer timing requests and retransmit
//! requests.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sabcore::Volume;

use crate::alac;
use crate::crypto::{base64_unpadded, AesContext};
use crate::error::RaopError;
use crate::ntp::NtpTimestamp;
use crate::packet_buffer::{PacketBuffer, DEFAULT_CAPACITY};
use crate::rtsp::{parse_transport, RtspClient};
use crate::{FRAMES_PER_PACKET, LATENCY_SAMPLES};

const PAYLOAD_TIMING_REQUEST: u8 = 0x52;
const PAYLOAD_TIMING_RESPONSE: u8 = 0x53;
const PAYLOAD_RETRANSMIT_REQUEST: u8 = 0x55;
const PAYLOAD_RETRANSMIT_REPLY: u8 = 0x56;
const PAYLOAD_AUDIO: u8 = 0x60;

const USER_AGENT_TCP: &str = "iTunes/4.6 (Macintosh; U; PPC Mac OS X 10.3)";
const USER_AGENT_UDP: &str = "iTunes/7.6.2 (Windows; N;)";

/// Volume floor the receiver understands, dB.
pub const VOLUME_MIN_DB: f64 = -144.0;
/// Default attenuation span: linear volumes map into [-30, 0] dB.
pub const VOLUME_DEF_DB: f64 = -30.0;
pub const VOLUME_MAX_DB: f64 = 0.0;

/// Which data path the receiver speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaopProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Streaming,
}

/// One RAOP session towards a receiver.
pub struct RaopClient {
    host: String,
    port: u16,
    protocol: RaopProtocol,
    encryption: bool,
    state: State,
    rtsp: Option<RtspClient>,
    aes: Option<AesContext>,
    sequence: u16,
    rtptime: u32,
    ssrc: u32,
    first_packet: bool,
    sync_count: u32,
    sync_interval: u32,
    tcp_audio: Option<TcpStream>,
    udp_audio: Option<Arc<UdpSocket>>,
    udp_control: Option<Arc<UdpSocket>>,
    packet_buffer: Arc<Mutex<PacketBuffer>>,
    stop: CancellationToken,
}

impl RaopClient {
    pub fn new(host: &str, port: u16, protocol: RaopProtocol, encryption: bool) -> RaopClient {
        RaopClient {
            host: host.to_owned(),
            port,
            protocol,
            encryption,
            state: State::Disconnected,
            rtsp: None,
            aes: None,
            sequence: 0,
            rtptime: 0,
            ssrc: 0,
            first_packet: true,
            sync_count: 0,
            sync_interval: 44100 / FRAMES_PER_PACKET as u32,
            tcp_audio: None,
            udp_audio: None,
            udp_control: None,
            packet_buffer: Arc::new(Mutex::new(PacketBuffer::new(DEFAULT_CAPACITY))),
            stop: CancellationToken::new(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state == State::Streaming
    }

    /// Frames one audio packet carries.
    pub fn frames_per_packet(&self) -> usize {
        match self.protocol {
            RaopProtocol::Tcp => 4096,
            RaopProtocol::Udp => FRAMES_PER_PACKET,
        }
    }

    /// Runs the whole session establishment.
    ///
    /// Un générateur local ne traverse jamais un await : le futur doit
    /// rester `Send` pour tourner sur le thread IO du sink.
    pub async fn connect(&mut self) -> Result<(), RaopError> {
        let sid = format!("{}", rand::rng().random::<u32>());
        let user_agent = match self.protocol {
            RaopProtocol::Tcp => USER_AGENT_TCP,
            RaopProtocol::Udp => USER_AGENT_UDP,
        };
        let mut rtsp = RtspClient::connect(&self.host, self.port, &sid, user_agent).await?;
        let local_ip = rtsp.local_ip();

        if self.encryption {
            self.aes = Some(AesContext::new_random());
        }

        // OPTIONS, avec le défi Apple (UDP seulement).
        if self.protocol == RaopProtocol::Udp {
            let challenge: [u8; 16] = rand::rng().random();
            rtsp.add_header("Apple-Challenge", &base64_unpadded(&challenge));
            rtsp.options().await?;
            rtsp.remove_header("Apple-Challenge");
        }

        // ANNOUNCE : SDP AppleLossless, clé de session enveloppée.
        let sdp = self.build_announce_sdp(&sid, local_ip)?;
        rtsp.announce(&sdp).await?;

        match self.protocol {
            RaopProtocol::Udp => self.setup_udp(&mut rtsp, local_ip).await?,
            RaopProtocol::Tcp => self.setup_tcp(&mut rtsp).await?,
        }

        self.sequence = rand::rng().random();
        self.rtptime = rand::rng().random();
        self.ssrc = rand::rng().random();
        rtsp.record(self.sequence, self.rtptime).await?;

        self.first_packet = true;
        self.sync_count = 0;
        self.rtsp = Some(rtsp);
        self.state = State::Streaming;
        info!(
            "raop: session to {}:{} up ({:?}, encryption {})",
            self.host, self.port, self.protocol, self.encryption
        );
        Ok(())
    }

    fn build_announce_sdp(&self, sid: &str, local_ip: IpAddr) -> Result<String, RaopError> {
        let frames = self.frames_per_packet();
        let mut sdp = format!(
            "v=0\r\n\
             o=iTunes {sid} 0 IN IP4 {local_ip}\r\n\
             s=iTunes\r\n\
             c=IN IP4 {}\r\n\
             t=0 0\r\n\
             m=audio 0 RTP/AVP 96\r\n\
             a=rtpmap:96 AppleLossless\r\n\
             a=fmtp:96 {frames} 0 16 40 10 14 2 255 0 0 44100\r\n",
            self.host
        );
        if let Some(aes) = &self.aes {
            sdp.push_str(&format!("a=rsaaeskey:{}\r\n", aes.sdp_key()?));
            sdp.push_str(&format!("a=aesiv:{}\r\n", aes.sdp_iv()));
        }
        Ok(sdp)
    }

    async fn setup_udp(
        &mut self,
        rtsp: &mut RtspClient,
        local_ip: IpAddr,
    ) -> Result<(), RaopError> {
        // Deux sockets locaux éphémères : contrôle et timing.
        let control = UdpSocket::bind((local_ip, 0)).await?;
        let timing = UdpSocket::bind((local_ip, 0)).await?;
        let control_port = control.local_addr()?.port();
        let timing_port = timing.local_addr()?.port();

        let transport = format!(
            "RTP/AVP/UDP;unicast;interleaved=0-1;mode=record;control_port={control_port};timing_port={timing_port}"
        );
        let response = rtsp.setup(&transport).await?;
        let fields = parse_transport(
            response
                .header("Transport")
                .ok_or_else(|| RaopError::BadResponse("SETUP without Transport".into()))?,
        );
        let server_port: u16 = fields
            .get("server_port")
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| RaopError::BadResponse("no server_port".into()))?;
        let server_control: u16 = fields
            .get("control_port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(6001);
        let server_timing: u16 = fields
            .get("timing_port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(6002);
        debug!(
            "raop: server_port={server_port} control_port={server_control} timing_port={server_timing}"
        );

        let host_ip: IpAddr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .map(|a| a.ip())
            .ok_or_else(|| RaopError::Unreachable(self.host.clone()))?;

        let audio = UdpSocket::bind((local_ip, 0)).await?;
        audio.connect(SocketAddr::new(host_ip, server_port)).await?;
        control
            .connect(SocketAddr::new(host_ip, server_control))
            .await?;
        timing
            .connect(SocketAddr::new(host_ip, server_timing))
            .await?;

        let audio = Arc::new(audio);
        let control = Arc::new(control);
        let timing = Arc::new(timing);
        self.udp_audio = Some(audio);
        self.udp_control = Some(control.clone());

        // Canal timing : répondre aux requêtes du récepteur.
        let stop = self.stop.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                tokio::select! {
                    r = timing.recv(&mut buf) => match r {
                        Ok(n) => {
                            let received = NtpTimestamp::now();
                            match build_timing_reply(&buf[..n], received) {
                                Ok(reply) => {
                                    if let Err(e) = timing.send(&reply).await {
                                        warn!("raop: timing reply failed: {e}");
                                    }
                                }
                                Err(e) => debug!("raop: {e}"),
                            }
                        }
                        Err(_) => break,
                    },
                    _ = stop.cancelled() => break,
                }
            }
        });

        // Canal contrôle : retransmissions.
        let stop = self.stop.clone();
        let pb = self.packet_buffer.clone();
        let control_task = control;
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                tokio::select! {
                    r = control_task.recv(&mut buf) => match r {
                        Ok(n) => {
                            let replies = {
                                let pb = pb.lock();
                                retransmit_replies(&buf[..n], &pb)
                            };
                            match replies {
                                Ok(replies) => {
                                    for reply in replies {
                                        if let Err(e) = control_task.send(&reply).await {
                                            warn!("raop: retransmit failed: {e}");
                                        }
                                    }
                                }
                                Err(e) => debug!("raop: {e}"),
                            }
                        }
                        Err(_) => break,
                    },
                    _ = stop.cancelled() => break,
                }
            }
        });
        Ok(())
    }

    async fn setup_tcp(&mut self, rtsp: &mut RtspClient) -> Result<(), RaopError> {
        let response = rtsp
            .setup("RTP/AVP/TCP;unicast;interleaved=0-1;mode=record")
            .await?;
        let fields = parse_transport(
            response
                .header("Transport")
                .ok_or_else(|| RaopError::BadResponse("SETUP without Transport".into()))?,
        );
        let server_port: u16 = fields
            .get("server_port")
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| RaopError::BadResponse("no server_port".into()))?;
        let stream = TcpStream::connect((self.host.as_str(), server_port))
            .await
            .map_err(|e| RaopError::Unreachable(format!("audio port {server_port}: {e}")))?;
        stream.set_nodelay(true)?;
        self.tcp_audio = Some(stream);
        Ok(())
    }

    /// Sends one packet worth of s16le stereo PCM.
    pub async fn send_audio(&mut self, pcm: &[u8]) -> Result<(), RaopError> {
        if self.state != State::Streaming {
            return Err(RaopError::NotStreaming);
        }
        let frames = (pcm.len() / 4) as u32;

        let mut frame = alac::pack_frame(pcm);
        if let Some(aes) = &self.aes {
            aes.encrypt_in_place(&mut frame);
        }

        match self.protocol {
            RaopProtocol::Udp => {
                // Paquet de synchro une fois par seconde d'audio.
                if self.first_packet || self.sync_count >= self.sync_interval {
                    let sync = build_sync_packet(self.rtptime, self.first_packet);
                    if let Some(control) = &self.udp_control {
                        if let Err(e) = control.try_send(&sync) {
                            if e.kind() != std::io::ErrorKind::WouldBlock {
                                warn!("raop: sync packet failed: {e}");
                            }
                        }
                    }
                    self.sync_count = 0;
                } else {
                    self.sync_count += 1;
                }

                let packet = build_audio_packet(
                    self.sequence,
                    self.rtptime,
                    self.ssrc,
                    self.first_packet,
                    &frame,
                );
                let audio = self.udp_audio.as_ref().ok_or(RaopError::NotStreaming)?;
                match audio.try_send(&packet) {
                    Ok(_) => {}
                    // Best-effort : un tampon plein compte comme envoyé.
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        debug!("raop: audio packet {} dropped (EAGAIN)", self.sequence);
                    }
                    Err(e) => return Err(e.into()),
                }
                self.packet_buffer.lock().write(self.sequence, &packet);
                self.sequence = self.sequence.wrapping_add(1);
                self.rtptime = self.rtptime.wrapping_add(frames);
                self.first_packet = false;
            }
            RaopProtocol::Tcp => {
                let packet = build_tcp_audio_packet(&frame);
                let stream = self.tcp_audio.as_mut().ok_or(RaopError::NotStreaming)?;
                stream.write_all(&packet).await?;
                self.sequence = self.sequence.wrapping_add(1);
                self.rtptime = self.rtptime.wrapping_add(frames);
                self.first_packet = false;
            }
        }
        Ok(())
    }

    /// Maps a linear volume into the receiver's dB range and sends it.
    pub async fn set_volume(&mut self, volume: Volume) -> Result<(), RaopError> {
        let db = scale_volume_db(volume);
        let body = format!("volume: {db:.6}\r\n");
        let rtsp = self.rtsp.as_mut().ok_or(RaopError::NotStreaming)?;
        rtsp.set_parameter(&body).await?;
        Ok(())
    }

    /// Flushes the receiver-side buffer.
    pub async fn flush(&mut self) -> Result<(), RaopError> {
        let (seq, rtptime) = (self.sequence, self.rtptime);
        let rtsp = self.rtsp.as_mut().ok_or(RaopError::NotStreaming)?;
        rtsp.flush(seq, rtptime).await?;
        Ok(())
    }

    /// Orderly session teardown.
    pub async fn teardown(&mut self) {
        if let Some(mut rtsp) = self.rtsp.take() {
            if let Err(e) = rtsp.teardown().await {
                debug!("raop: teardown: {e}");
            }
        }
        self.stop.cancel();
        self.stop = CancellationToken::new();
        self.udp_audio = None;
        self.udp_control = None;
        self.tcp_audio = None;
        self.packet_buffer.lock().clear();
        self.state = State::Disconnected;
        info!("raop: session to {} closed", self.host);
    }
}

/// Linear volume → dB within `[VOLUME_DEF_DB, 0]`, then clamped to
/// what the receiver accepts. Muted is the -144 floor.
pub fn scale_volume_db(volume: Volume) -> f64 {
    if volume.is_muted() {
        return VOLUME_MIN_DB;
    }
    let min_linear = 10f64.powf(VOLUME_DEF_DB / 20.0);
    let scaled = volume.to_linear() * (1.0 - min_linear) + min_linear;
    (20.0 * scaled.log10()).clamp(VOLUME_MIN_DB, VOLUME_MAX_DB)
}

/// Sync packet: 20 bytes, current RTP time minus the fixed receiver
/// delay, transmit NTP time, current RTP time. The very first one has
/// bit 0x10 set on byte 0.
pub fn build_sync_packet(rtptime: u32, first: bool) -> [u8; 20] {
    let mut out = [0u8; 20];
    out[0] = if first { 0x80 | 0x10 } else { 0x80 };
    out[1] = 0xd4;
    out[2] = 0x00;
    out[3] = 0x07;
    out[4..8].copy_from_slice(&rtptime.wrapping_sub(LATENCY_SAMPLES).to_be_bytes());
    out[8..16].copy_from_slice(&NtpTimestamp::now().to_be_words());
    out[16..20].copy_from_slice(&rtptime.to_be_bytes());
    out
}

/// Timing reply: echoes the request's transmit stamp as originate,
/// then receive and transmit stamps of this end.
pub fn build_timing_reply(
    request: &[u8],
    received: NtpTimestamp,
) -> Result<[u8; 32], RaopError> {
    if request.len() != 32 || request[0] != 0x80 {
        return Err(RaopError::BadPacket { channel: "timing" });
    }
    if request[1] ^ 0x80 != PAYLOAD_TIMING_REQUEST {
        return Err(RaopError::BadPacket { channel: "timing" });
    }
    let mut out = [0u8; 32];
    out[0] = 0x80;
    out[1] = 0x80 | PAYLOAD_TIMING_RESPONSE;
    out[2] = 0x00;
    out[3] = 0x07;
    // Originate = transmit de la requête (mots 6 et 7).
    out[8..16].copy_from_slice(&request[24..32]);
    out[16..24].copy_from_slice(&received.to_be_words());
    out[24..32].copy_from_slice(&NtpTimestamp::now().to_be_words());
    Ok(out)
}

/// Builds the retransmit replies for one control-channel request:
/// `(start_seq, count)` looked up in the packet buffer, each found
/// packet prefixed with the retransmit-reply framing.
pub fn retransmit_replies(
    request: &[u8],
    pb: &PacketBuffer,
) -> Result<Vec<Vec<u8>>, RaopError> {
    if request.len() < 8 || request[0] != 0x80 {
        return Err(RaopError::BadPacket { channel: "control" });
    }
    if request[1] ^ 0x80 != PAYLOAD_RETRANSMIT_REQUEST {
        return Err(RaopError::BadPacket { channel: "control" });
    }
    let start = u16::from_be_bytes([request[4], request[5]]);
    let count = u16::from_be_bytes([request[6], request[7]]);
    let mut replies = Vec::new();
    for i in 0..count {
        let seq = start.wrapping_add(i);
        let Some(stored) = pb.read(seq) else {
            debug!("raop: packet {seq} not in retransmit buffer");
            continue;
        };
        // Préambule observé sur le fil ; l'octet 3 vaut 0x30 chez
        // l'implémentation d'origine, signification inconnue.
        let mut reply = Vec::with_capacity(4 + stored.len());
        reply.extend_from_slice(&[0x80, 0x80 | PAYLOAD_RETRANSMIT_REPLY, 0x01, 0x30]);
        reply.extend_from_slice(stored);
        replies.push(reply);
    }
    Ok(replies)
}

/// 12-byte RTP header + ALAC payload, UDP mode.
pub fn build_audio_packet(
    sequence: u16,
    rtptime: u32,
    ssrc: u32,
    first: bool,
    frame: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + frame.len());
    out.push(0x80);
    out.push(if first { 0x80 | PAYLOAD_AUDIO } else { PAYLOAD_AUDIO });
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(&rtptime.to_be_bytes());
    out.extend_from_slice(&ssrc.to_be_bytes());
    out.extend_from_slice(frame);
    out
}

/// 16-byte pseudo-RTP framing + ALAC payload, TCP mode. Bytes 2..4
/// carry the big-endian length of everything past them.
pub fn build_tcp_audio_packet(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + frame.len());
    out.extend_from_slice(&[
        0x24, 0x00, 0x00, 0x00, 0xF0, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ]);
    out.extend_from_slice(frame);
    let len = (out.len() - 4) as u16;
    out[2] = (len >> 8) as u8;
    out[3] = len as u8;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_packet_layout() {
        let p = build_sync_packet(100_000, true);
        assert_eq!(&p[0..4], &[0x90, 0xd4, 0x00, 0x07]);
        assert_eq!(
            u32::from_be_bytes(p[4..8].try_into().unwrap()),
            100_000u32.wrapping_sub(LATENCY_SAMPLES)
        );
        assert_eq!(u32::from_be_bytes(p[16..20].try_into().unwrap()), 100_000);
        let p2 = build_sync_packet(100_000, false);
        assert_eq!(p2[0], 0x80);
    }

    #[test]
    fn timing_reply_echoes_originate() {
        let mut request = [0u8; 32];
        request[0] = 0x80;
        request[1] = 0x80 | PAYLOAD_TIMING_REQUEST;
        request[24..32].copy_from_slice(&0x1122_3344_5566_7788u64.to_be_bytes());
        let received = NtpTimestamp(0xAABB_CCDD_0011_2233);
        let reply = build_timing_reply(&request, received).unwrap();
        assert_eq!(&reply[0..2], &[0x80, 0xd3]);
        assert_eq!(&reply[8..16], &0x1122_3344_5566_7788u64.to_be_bytes());
        assert_eq!(&reply[16..24], &received.to_be_words());
        // Mauvais type de charge : rejeté.
        request[1] = 0x80 | 0x54;
        assert!(build_timing_reply(&request, received).is_err());
    }

    #[test]
    fn retransmit_request_replays_buffered_packets() {
        // Tampon de capacité 4, séquences 10..14 écrites.
        let mut pb = PacketBuffer::new(4);
        for seq in 10u16..14 {
            let packet = build_audio_packet(seq, 1000 + seq as u32, 0x42, false, &[seq as u8; 8]);
            pb.write(seq, &packet);
        }
        // Requête : seq 11, 2 paquets.
        let request = [0x80, 0xd5, 0x00, 0x01, 0x00, 0x0b, 0x00, 0x02];
        let replies = retransmit_replies(&request, &pb).unwrap();
        assert_eq!(replies.len(), 2);
        for (i, reply) in replies.iter().enumerate() {
            let seq = 11 + i as u16;
            assert_eq!(&reply[0..4], &[0x80, 0xd6, 0x01, 0x30]);
            // Le paquet d'origine suit le préambule, intact.
            assert_eq!(&reply[4..6], &[0x80, 0x60]);
            assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), seq);
            assert_eq!(
                u32::from_be_bytes(reply[8..12].try_into().unwrap()),
                1000 + seq as u32
            );
            assert_eq!(&reply[16..], &[seq as u8; 8]);
        }
    }

    #[test]
    fn retransmit_skips_evicted_packets() {
        let mut pb = PacketBuffer::new(4);
        for seq in 10u16..16 {
            pb.write(seq, &[seq as u8]);
        }
        // 10 et 11 ont été expulsés.
        let request = [0x80, 0xd5, 0x00, 0x01, 0x00, 0x0a, 0x00, 0x04];
        let replies = retransmit_replies(&request, &pb).unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0][4], 12);
        assert_eq!(replies[1][4], 13);
    }

    #[test]
    fn audio_packet_marks_only_first() {
        let first = build_audio_packet(7, 9, 1, true, &[0xAB]);
        assert_eq!(&first[0..2], &[0x80, 0xE0]);
        let rest = build_audio_packet(8, 9, 1, false, &[0xAB]);
        assert_eq!(&rest[0..2], &[0x80, 0x60]);
        assert_eq!(rest[12], 0xAB);
    }

    #[test]
    fn tcp_packet_carries_length() {
        let p = build_tcp_audio_packet(&[0u8; 100]);
        assert_eq!(p[0], 0x24);
        let len = u16::from_be_bytes([p[2], p[3]]) as usize;
        assert_eq!(len, p.len() - 4);
    }

    #[test]
    fn volume_scaling() {
        // NORM doit donner 0 dB, MUTED le plancher.
        assert!((scale_volume_db(Volume::NORM) - 0.0).abs() < 0.01);
        assert_eq!(scale_volume_db(Volume::MUTED), VOLUME_MIN_DB);
        // Tout volume non nul reste au-dessus de -30 dB (plancher de
        // l'échelle utilisateur).
        let low = scale_volume_db(Volume(0x100));
        assert!(low >= VOLUME_DEF_DB - 0.1, "{low}");
        assert!(low < -25.0, "{low}");
    }
}
