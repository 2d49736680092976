//! The RAOP sink back-end: bridges the routing core's render loop to
//! a RAOP session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use sabcore::{CVolume, MemChunk, SampleFormat, SampleSpec, Volume};
use sabmix::{
    Core, DeviceFlags, LatencySpec, MixError, Sink, SinkBackend, SinkEvent, SinkNewData,
};

use crate::client::{RaopClient, RaopProtocol};
use crate::error::RaopError;
use crate::{DEFAULT_PORT, LATENCY_SAMPLES};

/// Render period of the sink; a few audio packets per cycle.
const RENDER_PERIOD: Duration = Duration::from_millis(50);

/// A RAOP sink backed by a receiver on the network.
pub struct RaopSink;

impl RaopSink {
    /// The only spec a RAOP session carries.
    pub fn spec() -> SampleSpec {
        SampleSpec {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
        }
    }

    /// Creates and activates a sink streaming to `host`. Backend
    /// failures surface on the returned event receiver; the owning
    /// module decides about suspension and unload.
    pub fn load(
        core: &Arc<Core>,
        name: &str,
        host: &str,
        port: Option<u16>,
        protocol: RaopProtocol,
        encryption: bool,
        owner_module: Option<u32>,
    ) -> Result<(Arc<Sink>, mpsc::UnboundedReceiver<SinkEvent>), MixError> {
        let mut data = SinkNewData::new(name, Self::spec())?;
        data.driver = "raop".to_owned();
        data.flags = DeviceFlags::HW_VOLUME
            | DeviceFlags::DECIBEL_VOLUME
            | DeviceFlags::LATENCY
            | DeviceFlags::NETWORK;
        data.latency = LatencySpec::Fixed(RENDER_PERIOD);
        data.owner_module = owner_module;
        data.proplist.set_str(
            sabcore::proplist::keys::DEVICE_DESCRIPTION,
            &format!("RAOP receiver {host}"),
        );
        data.proplist
            .set_str(sabcore::proplist::keys::DEVICE_CLASS, "network");
        let sink = Sink::new(core, data)?;
        let backend = RaopSinkBackend::new(host, port.unwrap_or(DEFAULT_PORT), protocol, encryption);
        let events = sink.put(Box::new(backend))?;
        Ok((sink, events))
    }
}

/// The back-end proper, living on the sink's IO thread.
pub struct RaopSinkBackend {
    client: RaopClient,
    pending: Vec<u8>,
}

impl RaopSinkBackend {
    pub fn new(host: &str, port: u16, protocol: RaopProtocol, encryption: bool) -> Self {
        RaopSinkBackend {
            client: RaopClient::new(host, port, protocol, encryption),
            pending: Vec::new(),
        }
    }

    fn packet_bytes(&self) -> usize {
        self.client.frames_per_packet() * 4
    }
}

fn unreachable_err(e: RaopError) -> MixError {
    MixError::Unreachable(e.to_string())
}

#[async_trait::async_trait]
impl SinkBackend for RaopSinkBackend {
    async fn start(&mut self) -> Result<(), MixError> {
        self.client.connect().await.map_err(unreachable_err)
    }

    async fn write(&mut self, chunk: &MemChunk) -> Result<(), MixError> {
        {
            let data = chunk.bytes();
            self.pending.extend_from_slice(&data);
        }
        let packet = self.packet_bytes();
        while self.pending.len() >= packet {
            let rest = self.pending.split_off(packet);
            let pcm = std::mem::replace(&mut self.pending, rest);
            self.client.send_audio(&pcm).await.map_err(unreachable_err)?;
        }
        Ok(())
    }

    async fn set_volume(&mut self, real: &CVolume) -> CVolume {
        // Le récepteur n'accepte qu'un volume global : on lui envoie
        // le maximum, le reste par canal part en volume logiciel.
        let max = real.max();
        if let Err(e) = self.client.set_volume(max).await {
            warn!("raop: volume update failed: {e}");
            return real.clone();
        }
        if max == Volume::MUTED {
            return CVolume::norm(real.channels());
        }
        let residual: Vec<Volume> = real.values().iter().map(|v| v.divide(max)).collect();
        CVolume::new(residual).unwrap_or_else(|_| CVolume::norm(real.channels()))
    }

    fn latency(&self) -> Duration {
        // Le récepteur tamponne 88200 échantillons à 44100 Hz.
        Duration::from_micros(LATENCY_SAMPLES as u64 * 1_000_000 / 44_100)
            + Duration::from_micros(
                (self.pending.len() / 4) as u64 * 1_000_000 / 44_100,
            )
    }

    async fn stop(&mut self) {
        if self.client.is_streaming() {
            if let Err(e) = self.client.flush().await {
                warn!("raop: flush on stop failed: {e}");
            }
        }
        self.client.teardown().await;
    }
}
