//! Source-output : un flux de capture client attaché à une source.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use sabcore::{CVolume, ChannelMap, MemChunk, Proplist, SampleSpec};

use crate::converter::Converter;
use crate::core::{Core, EventFacility, EventKind};
use crate::error::MixError;
use crate::source::Source;
use crate::types::StreamState;
use crate::worker::OutputRender;

/// Événements du thread IO vers le propriétaire du flux.
#[derive(Debug)]
pub enum OutputEvent {
    /// Une vue capturée, dans la spec du flux.
    Data(MemChunk),
    /// Le flux a été retiré par le serveur.
    Killed,
}

/// Paramètres de construction d'un source-output.
pub struct SourceOutputNewData {
    pub spec: SampleSpec,
    pub map: ChannelMap,
    pub volume: Option<CVolume>,
    pub muted: bool,
    pub corked: bool,
    pub requested_latency: Option<Duration>,
    pub proplist: Proplist,
    pub client: Option<u32>,
    pub owner_module: Option<u32>,
}

impl SourceOutputNewData {
    pub fn new(spec: SampleSpec) -> Result<Self, MixError> {
        spec.check()?;
        Ok(SourceOutputNewData {
            map: ChannelMap::default_for(spec.channels)?,
            spec,
            volume: None,
            muted: false,
            corked: false,
            requested_latency: None,
            proplist: Proplist::new(),
            client: None,
            owner_module: None,
        })
    }
}

struct OutputCtl {
    state: StreamState,
    source: Option<Arc<Source>>,
    volume: CVolume,
    muted: bool,
    requested_latency: Option<Duration>,
    proplist: Proplist,
    client: Option<u32>,
}

/// Un flux de capture enregistré dans le cœur.
pub struct SourceOutput {
    pub spec: SampleSpec,
    pub map: ChannelMap,
    pub owner_module: Option<u32>,
    core: Weak<Core>,
    index: OnceLock<u32>,
    ctl: Mutex<OutputCtl>,
    events_tx: mpsc::UnboundedSender<OutputEvent>,
}

impl SourceOutput {
    pub fn new(
        core: &Arc<Core>,
        data: SourceOutputNewData,
    ) -> Result<(Arc<SourceOutput>, mpsc::UnboundedReceiver<OutputEvent>), MixError> {
        data.spec.check()?;
        let channels = data.spec.channels;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let output = Arc::new(SourceOutput {
            spec: data.spec,
            map: data.map,
            owner_module: data.owner_module,
            core: Arc::downgrade(core),
            index: OnceLock::new(),
            ctl: Mutex::new(OutputCtl {
                state: if data.corked {
                    StreamState::Corked
                } else {
                    StreamState::Init
                },
                source: None,
                volume: data.volume.unwrap_or_else(|| CVolume::norm(channels)),
                muted: data.muted,
                requested_latency: data.requested_latency,
                proplist: data.proplist,
                client: data.client,
            }),
            events_tx,
        });
        let index = core.register_source_output(&output);
        let _ = output.index.set(index);
        Ok((output, events_rx))
    }

    /// Attache le flux à `source` et démarre la capture.
    pub fn put(self: &Arc<Self>, source: &Arc<Source>) -> Result<(), MixError> {
        let render = {
            let mut ctl = self.ctl.lock();
            if ctl.source.is_some() {
                return Err(MixError::BadState(crate::types::DeviceState::Running));
            }
            if ctl.state == StreamState::Init {
                ctl.state = StreamState::Running;
            }
            ctl.source = Some(source.clone());
            self.build_render(&ctl, source)?
        };
        source.attach_output(self, render)?;
        if let Some(core) = self.core() {
            core.emit(EventFacility::SourceOutput, EventKind::New, self.idx());
        }
        info!(
            "source-output #{} attached to {} ({})",
            self.idx(),
            source.name,
            self.spec
        );
        Ok(())
    }

    fn build_render(&self, ctl: &OutputCtl, source: &Arc<Source>) -> Result<OutputRender, MixError> {
        let converter = if self.spec == source.spec && self.map == source.map {
            None
        } else {
            Some(Converter::new(
                source.spec,
                &source.map,
                self.spec,
                &self.map,
            )?)
        };
        Ok(OutputRender {
            index: self.idx(),
            spec: self.spec,
            converter,
            soft_volume: ctl.volume.clone(),
            muted: ctl.muted,
            corked: ctl.state == StreamState::Corked,
            events: self.events_tx.clone(),
        })
    }

    /// Détache et retire des index. Idempotent.
    pub async fn unlink(self: &Arc<Self>) {
        let source = {
            let mut ctl = self.ctl.lock();
            if ctl.state == StreamState::Unlinked {
                return;
            }
            ctl.state = StreamState::Unlinked;
            ctl.source.take()
        };
        if let Some(source) = &source {
            let _ = source.detach_output(self.idx()).await;
        }
        if let Some(core) = self.core() {
            core.unregister_source_output(self.idx());
            core.emit(EventFacility::SourceOutput, EventKind::Remove, self.idx());
        }
        debug!("source-output #{} unlinked", self.idx());
    }

    pub async fn kill(self: &Arc<Self>) {
        let _ = self.events_tx.send(OutputEvent::Killed);
        self.unlink().await;
    }

    pub fn idx(&self) -> u32 {
        *self.index.get().unwrap_or(&sabcore::INVALID_INDEX)
    }

    pub fn core(&self) -> Option<Arc<Core>> {
        self.core.upgrade()
    }

    pub fn state(&self) -> StreamState {
        self.ctl.lock().state
    }

    pub fn source(&self) -> Option<Arc<Source>> {
        self.ctl.lock().source.clone()
    }

    pub fn client(&self) -> Option<u32> {
        self.ctl.lock().client
    }

    pub fn proplist(&self) -> Proplist {
        self.ctl.lock().proplist.clone()
    }

    /// Renomme le flux (propriété `media.name`).
    pub fn set_name(self: &Arc<Self>, name: &str) {
        self.ctl
            .lock()
            .proplist
            .set_str(sabcore::proplist::keys::MEDIA_NAME, name);
        if let Some(core) = self.core() {
            core.emit(EventFacility::SourceOutput, EventKind::Change, self.idx());
        }
    }

    pub fn is_corked(&self) -> bool {
        self.ctl.lock().state == StreamState::Corked
    }

    pub fn requested_latency(&self) -> Option<Duration> {
        self.ctl.lock().requested_latency
    }

    pub fn cork(self: &Arc<Self>, corked: bool) -> Result<(), MixError> {
        let source = {
            let mut ctl = self.ctl.lock();
            match (ctl.state, corked) {
                (StreamState::Running, true) => ctl.state = StreamState::Corked,
                (StreamState::Corked, false) => ctl.state = StreamState::Running,
                _ => return Ok(()),
            }
            ctl.source.clone()
        };
        if let Some(source) = source {
            source.cork_output(self.idx(), corked)?;
            source.update_status();
        }
        if let Some(core) = self.core() {
            core.emit(EventFacility::SourceOutput, EventKind::Change, self.idx());
        }
        Ok(())
    }

    pub fn volume(&self) -> CVolume {
        self.ctl.lock().volume.clone()
    }

    pub fn muted(&self) -> bool {
        self.ctl.lock().muted
    }

    pub fn set_volume(self: &Arc<Self>, volume: &CVolume, _save: bool) {
        let source = {
            let mut ctl = self.ctl.lock();
            ctl.volume = if volume.channels() == self.spec.channels {
                volume.clone()
            } else {
                CVolume::uniform(self.spec.channels, volume.max())
            };
            ctl.source.clone()
        };
        if let Some(source) = source {
            let (v, m) = self.soft_volume_for_source(&source.map);
            source.push_output_soft_volume(self.idx(), v, m);
        }
        if let Some(core) = self.core() {
            core.emit(EventFacility::SourceOutput, EventKind::Change, self.idx());
        }
    }

    pub fn set_mute(self: &Arc<Self>, muted: bool, _save: bool) {
        let source = {
            let mut ctl = self.ctl.lock();
            if ctl.muted == muted {
                return;
            }
            ctl.muted = muted;
            ctl.source.clone()
        };
        if let Some(source) = source {
            let (v, m) = self.soft_volume_for_source(&source.map);
            source.push_output_soft_volume(self.idx(), v, m);
        }
        if let Some(core) = self.core() {
            core.emit(EventFacility::SourceOutput, EventKind::Change, self.idx());
        }
    }

    /// Volume doux et muet du flux, dans sa propre géométrie (le rendu
    /// de sortie est déjà dans la spec du flux).
    pub(crate) fn soft_volume_for_source(&self, _source_map: &ChannelMap) -> (CVolume, bool) {
        let ctl = self.ctl.lock();
        (ctl.volume.clone(), ctl.muted)
    }

    /// Déplace le flux vers une autre source.
    pub async fn move_to(self: &Arc<Self>, new_source: &Arc<Source>) -> Result<(), MixError> {
        {
            let ctl = self.ctl.lock();
            if !ctl.state.is_linked() {
                return Err(MixError::Unlinked);
            }
        }
        let old = self.ctl.lock().source.take();
        if let Some(old) = &old {
            let _ = old.detach_output(self.idx()).await;
        }
        let result = (|| -> Result<OutputRender, MixError> {
            let mut ctl = self.ctl.lock();
            ctl.source = Some(new_source.clone());
            self.build_render(&ctl, new_source)
        })();
        match result {
            Ok(render) => {
                new_source.attach_output(self, render)?;
                if let Some(core) = self.core() {
                    core.emit(EventFacility::SourceOutput, EventKind::Change, self.idx());
                }
                info!("source-output #{} moved to {}", self.idx(), new_source.name);
                Ok(())
            }
            Err(e) => {
                self.kill().await;
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for SourceOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceOutput")
            .field("index", &self.idx())
            .field("spec", &self.spec)
            .field("state", &self.state())
            .finish()
    }
}
