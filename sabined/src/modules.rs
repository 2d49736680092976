//! Table des modules : construit les objets du cœur d'après la
//! configuration et les enregistre avec leur destructeur.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sabcore::{SampleFormat, SampleSpec};
use sabmix::{
    Core, DeviceFlags, LatencySpec, Module, NullSinkBackend, NullSourceBackend, Sink, SinkEvent,
    SinkNewData, Source, SourceNewData, SuspendCause,
};
use sabnative::{NativeServer, ServerAddress};
use sabraop::{RaopProtocol, RaopSink};
use sabrtp::{RtpRecvStream, RtpSendStream};
use sabwire::COOKIE_SIZE;

use crate::config::ModuleConfig;

/// Délai avant déchargement d'un module RAOP injoignable.
const RAOP_ESCALATION_DELAY: Duration = Duration::from_secs(5);

/// État partagé du chargement.
pub struct ModuleHost {
    pub core: Arc<Core>,
    pub cookie: [u8; COOKIE_SIZE],
    /// Annulé quand un client demande l'arrêt du serveur.
    pub exit: CancellationToken,
}

impl ModuleHost {
    /// Charge un module d'après sa configuration.
    pub async fn load(&self, config: &ModuleConfig) -> anyhow::Result<Arc<Module>> {
        match config {
            ModuleConfig::NullSink {
                name,
                rate,
                channels,
            } => {
                let spec = SampleSpec::new(SampleFormat::S16Le, *channels, *rate)?;
                let module = Module::new(&self.core, "null-sink", name, || {});
                let mut data = SinkNewData::new(name, spec)?;
                data.driver = "null".to_owned();
                data.flags |= DeviceFlags::DYNAMIC_LATENCY;
                data.latency = LatencySpec::Dynamic {
                    min: Duration::from_millis(1),
                    max: Duration::from_secs(1),
                };
                data.owner_module = Some(module.idx());
                let sink = Sink::new(&self.core, data)?;
                sink.put(Box::new(NullSinkBackend::new()))?;
                self.set_unloader(&module, {
                    let sink = sink.clone();
                    move || {
                        let sink = sink;
                        tokio::spawn(async move { sink.unlink().await });
                    }
                });
                Ok(module)
            }

            ModuleConfig::NullSource {
                name,
                rate,
                channels,
            } => {
                let spec = SampleSpec::new(SampleFormat::S16Le, *channels, *rate)?;
                let module = Module::new(&self.core, "null-source", name, || {});
                let mut data = SourceNewData::new(name, spec)?;
                data.driver = "null".to_owned();
                data.owner_module = Some(module.idx());
                let source = Source::new(&self.core, data)?;
                source.put(Box::new(NullSourceBackend::new(spec)))?;
                self.set_unloader(&module, {
                    let source = source.clone();
                    move || {
                        let source = source;
                        tokio::spawn(async move { source.unlink().await });
                    }
                });
                Ok(module)
            }

            ModuleConfig::NativeProtocol { listen } => {
                let address = match listen {
                    Some(s) => ServerAddress::parse(s)?,
                    None => ServerAddress::default_address(),
                };
                let server =
                    NativeServer::bind(self.core.clone(), address.clone(), self.cookie).await?;
                // L'EXIT d'un client remonte au démon.
                let exit = self.exit.clone();
                let token = server.exit_requested();
                tokio::spawn(async move {
                    token.cancelled().await;
                    exit.cancel();
                });
                let module =
                    Module::new(&self.core, "native-protocol", &address.to_string(), move || {
                        server.shutdown();
                    });
                Ok(module)
            }

            ModuleConfig::RtpSend {
                source,
                destination,
                mtu,
            } => {
                let src = match source {
                    Some(name) => self
                        .core
                        .source_by_name(name)
                        .with_context(|| format!("no source named {name}"))?,
                    None => {
                        let sink = self.core.default_sink().context("no default sink")?;
                        sink.monitor().context("default sink has no monitor")?
                    }
                };
                let dest = destination
                    .parse()
                    .with_context(|| format!("bad destination {destination}"))?;
                let module = Module::new(&self.core, "rtp-send", destination, || {});
                let stream = RtpSendStream::new(
                    &self.core,
                    &src,
                    dest,
                    *mtu,
                    "Sabine RTP stream",
                    Some(module.idx()),
                )
                .await?;
                self.set_unloader(&module, move || {
                    let stream = stream;
                    tokio::spawn(async move { stream.shutdown().await });
                });
                Ok(module)
            }

            ModuleConfig::RtpRecv { sink } => {
                let target = match sink {
                    Some(name) => self
                        .core
                        .sink_by_name(name)
                        .with_context(|| format!("no sink named {name}"))?,
                    None => self.core.default_sink().context("no default sink")?,
                };
                let module = Module::new(&self.core, "rtp-recv", &target.name, || {});
                // La découverte SAP attend la première annonce en
                // tâche de fond ; l'annulation décharge proprement.
                let core = self.core.clone();
                let owner = Some(module.idx());
                let stop = CancellationToken::new();
                let stop2 = stop.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        result = RtpRecvStream::discover(&core, &target, owner) => match result {
                            Ok(stream) => {
                                stop2.cancelled().await;
                                stream.shutdown().await;
                            }
                            Err(e) => error!("rtp-recv: discovery failed: {e}"),
                        },
                        _ = stop2.cancelled() => {}
                    }
                });
                self.set_unloader(&module, move || stop.cancel());
                Ok(module)
            }

            ModuleConfig::RaopSink {
                name,
                host,
                port,
                protocol,
                encryption,
            } => {
                let protocol = match protocol.as_deref() {
                    None | Some("udp") => RaopProtocol::Udp,
                    Some("tcp") => RaopProtocol::Tcp,
                    Some(other) => anyhow::bail!("unknown raop protocol {other}"),
                };
                let module = Module::new(&self.core, "raop-sink", host, || {});
                let (sink, mut events) = RaopSink::load(
                    &self.core,
                    name,
                    host,
                    *port,
                    protocol,
                    *encryption,
                    Some(module.idx()),
                )?;
                // Escalade : une erreur du pilote suspend le sink ; si
                // rien ne s'arrange, le module se décharge.
                let module2 = module.clone();
                let sink2 = sink.clone();
                tokio::spawn(async move {
                    while let Some(SinkEvent::BackendError(e)) = events.recv().await {
                        warn!("raop sink {}: {e}", sink2.name);
                        let _ = sink2.suspend(SuspendCause::INTERNAL, true);
                        tokio::time::sleep(RAOP_ESCALATION_DELAY).await;
                        sink2.unlink().await;
                        module2.unload();
                        break;
                    }
                });
                self.set_unloader(&module, {
                    let sink = sink.clone();
                    move || {
                        let sink = sink;
                        tokio::spawn(async move { sink.unlink().await });
                    }
                });
                Ok(module)
            }
        }
    }

    /// Pose le destructeur définitif, une fois les ressources du
    /// module construites.
    fn set_unloader(&self, module: &Arc<Module>, f: impl FnOnce() + Send + 'static) {
        module.replace_unloader(Box::new(f));
        info!("module {} ready", module.name);
    }
}
