//! Pont émission : un source-output qui pousse ce qu'il capture vers
//! une session RTP annoncée en SAP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sabcore::{memblockq::BlockQAttr, MemBlockQ, MemChunk};
use sabmix::{Core, OutputEvent, Source, SourceOutput, SourceOutputNewData};

use crate::error::RtpError;
use crate::rtp::{self, RtpSender};
use crate::sap::SapSender;
use crate::sdp::SdpInfo;
use crate::sockutil;

/// Une session d'émission active.
pub struct RtpSendStream {
    output: Arc<SourceOutput>,
    stop: CancellationToken,
}

impl RtpSendStream {
    /// Capture `source` et l'émet vers `dest` par paquets de `mtu`
    /// octets de charge.
    pub async fn new(
        core: &Arc<Core>,
        source: &Arc<Source>,
        dest: SocketAddr,
        mtu: usize,
        session_name: &str,
        owner_module: Option<u32>,
    ) -> Result<RtpSendStream, RtpError> {
        let spec = rtp::fixup_spec(source.spec);
        let payload = rtp::payload_from_spec(&spec);
        let mtu = spec.align_down(mtu).max(spec.frame_size());

        let mut data = SourceOutputNewData::new(spec)?;
        data.owner_module = owner_module;
        data.proplist.set_str(
            sabcore::proplist::keys::MEDIA_NAME,
            &format!("RTP stream to {dest}"),
        );
        let (output, mut events) = SourceOutput::new(core, data)?;
        output.put(source)?;

        let socket = sockutil::connect_udp(dest, 1)?;
        let mut sender = RtpSender::new(payload, mtu, &spec);
        let silence = MemChunk::new(core.pool.silence_block(&spec));
        let mut queue = MemBlockQ::new(
            spec.frame_size(),
            BlockQAttr {
                maxlength: mtu * 64,
                tlength: mtu * 4,
                prebuf: 0,
                minreq: spec.frame_size(),
            },
            silence,
        );

        let origin = sockutil::local_ipv4().unwrap_or(std::net::Ipv4Addr::LOCALHOST);
        let sdp = SdpInfo::new("sabine", origin.into(), session_name, dest, payload, spec);
        let sap = SapSender::new(origin, sdp.to_sdp()).await?;
        sap.start();

        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(OutputEvent::Data(chunk)) => {
                            if queue.push(chunk).is_err() {
                                // Le réseau ne suit pas : on repart de
                                // zéro plutôt que d'accumuler du retard.
                                queue.flush_write();
                                continue;
                            }
                            let r = sender.pump(&mut queue, &mut |p| {
                                socket.try_send(p).map(|_| ())
                            });
                            if let Err(e) = r {
                                warn!("rtp send failed: {e}");
                            }
                        }
                        Some(OutputEvent::Killed) | None => break,
                    },
                    _ = task_stop.cancelled() => break,
                }
            }
            sap.goodbye().await;
            info!("rtp send session to {dest} closed");
        });

        info!("rtp send session: {} -> {dest} ({spec})", source.name);
        Ok(RtpSendStream {
            output,
            stop,
        })
    }

    pub fn output(&self) -> &Arc<SourceOutput> {
        &self.output
    }

    /// Arrête la session : fin des annonces, détache le flux.
    pub async fn shutdown(self) {
        self.stop.cancel();
        self.output.unlink().await;
    }
}
