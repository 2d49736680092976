//! Pont réception : une session RTP jouée dans un sink au travers
//! d'un sink-input.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sabcore::SeekMode;
use sabmix::{Core, Sink, SinkInput, SinkInputNewData};

use crate::error::RtpError;
use crate::rtp::RtpReceiver;
use crate::sap::{SapPacket, SAP_MULTICAST_ADDR, SAP_PORT};
use crate::sdp::SdpInfo;
use crate::sockutil;

/// Une session de réception active.
pub struct RtpRecvStream {
    input: Arc<SinkInput>,
    stop: CancellationToken,
}

impl RtpRecvStream {
    /// Joue la session décrite par `sdp` dans `sink`.
    pub async fn new(
        core: &Arc<Core>,
        sink: &Arc<Sink>,
        sdp: &SdpInfo,
        owner_module: Option<u32>,
    ) -> Result<RtpRecvStream, RtpError> {
        let spec = sdp.spec;
        let bind = SocketAddr::new(sdp.dest_addr, sdp.port);
        let socket = sockutil::bind_udp_recv(bind)?;

        let mut data = SinkInputNewData::new(spec)?;
        data.owner_module = owner_module;
        data.proplist.set_str(
            sabcore::proplist::keys::MEDIA_NAME,
            &format!("RTP stream from {}", sdp.origin_addr),
        );
        // Un demi-tlength d'avance absorbe la gigue réseau.
        data.attr.prebuf = data.attr.tlength / 2;
        let (input, mut events) = SinkInput::new(core, data)?;
        input.put(sink)?;

        let mut receiver = RtpReceiver::new(sdp.payload, &spec);
        let pool = core.pool.clone();
        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let task_input = input.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            loop {
                tokio::select! {
                    ready = socket.readable() => {
                        if ready.is_err() {
                            break;
                        }
                        let fd = socket.as_raw_fd();
                        let result = socket.try_io(tokio::io::Interest::READABLE, || {
                            sockutil::recv_with_timestamp(fd, &mut buf)
                        });
                        match result {
                            Ok((n, stamp)) => {
                                match receiver.decode(&buf[..n], &pool, stamp) {
                                    Ok(incoming) => {
                                        let _ = task_input.write(
                                            0,
                                            SeekMode::Relative,
                                            incoming.chunk,
                                        );
                                    }
                                    Err(e) => debug!("rtp recv: dropped packet: {e}"),
                                }
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                            Err(e) => {
                                warn!("rtp recv failed: {e}");
                                break;
                            }
                        }
                    }
                    event = events.recv() => match event {
                        Some(sabmix::InputEvent::Killed) | None => break,
                        Some(_) => {}
                    },
                    _ = task_stop.cancelled() => break,
                }
            }
            info!("rtp recv session closed");
        });

        info!(
            "rtp recv session: {}:{} -> {} ({spec})",
            sdp.dest_addr, sdp.port, sink.name
        );
        Ok(RtpRecvStream {
            input,
            stop,
        })
    }

    /// Attend une annonce SAP et joue la session correspondante.
    pub async fn discover(
        core: &Arc<Core>,
        sink: &Arc<Sink>,
        owner_module: Option<u32>,
    ) -> Result<RtpRecvStream, RtpError> {
        let sap = sockutil::bind_udp_recv(SocketAddr::new(SAP_MULTICAST_ADDR.into(), SAP_PORT))?;
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, _) = sap.recv_from(&mut buf).await?;
            let packet = match SapPacket::parse(&buf[..n]) {
                Ok(p) => p,
                Err(e) => {
                    debug!("sap: ignoring packet: {e}");
                    continue;
                }
            };
            if packet.is_goodbye {
                continue;
            }
            match SdpInfo::parse(&packet.sdp) {
                Ok(sdp) => {
                    info!("sap: found session '{}' from {}", sdp.session_name, packet.origin);
                    return Self::new(core, sink, &sdp, owner_module).await;
                }
                Err(e) => debug!("sap: unusable SDP: {e}"),
            }
        }
    }

    pub fn input(&self) -> &Arc<SinkInput> {
        &self.input
    }

    pub async fn shutdown(self) {
        self.stop.cancel();
        self.input.unlink().await;
    }
}
