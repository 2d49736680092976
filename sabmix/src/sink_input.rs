//! Sink-input : un flux de lecture client attaché à un sink.
//!
//! Règle de verrouillage : le verrou du sink se prend toujours avant
//! celui du flux. Les méthodes du flux ne gardent donc jamais leur
//! propre verrou en appelant le sink.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use sabcore::{
    memblockq::BlockQAttr, CVolume, ChannelMap, MemBlockQ, MemChunk, Proplist, SampleSpec,
    SeekMode, Volume,
};

use crate::converter::Converter;
use crate::core::{Core, EventFacility, EventKind};
use crate::error::MixError;
use crate::sink::Sink;
use crate::types::StreamState;
use crate::worker::{InputRender, SinkMsg};

/// Événements du thread IO vers le propriétaire du flux.
#[derive(Debug)]
pub enum InputEvent {
    /// L'écrivain devrait fournir ce nombre d'octets de plus.
    RequestBytes(usize),
    /// La file s'est vidée en cours de lecture.
    Underflow,
    /// Un push a débordé la longueur maximale.
    Overflow,
    /// La lecture a effectivement démarré.
    Started,
    /// Le drain demandé avec ce tag est terminé.
    Drained(u32),
    /// Le flux a été retiré par le serveur.
    Killed,
}

/// Paramètres de construction d'un sink-input.
pub struct SinkInputNewData {
    pub spec: SampleSpec,
    pub map: ChannelMap,
    pub attr: BlockQAttr,
    pub volume: Option<CVolume>,
    pub volume_factor: Option<CVolume>,
    pub muted: bool,
    pub corked: bool,
    pub requested_latency: Option<Duration>,
    pub proplist: Proplist,
    pub client: Option<u32>,
    pub owner_module: Option<u32>,
    pub save_volume: bool,
    pub save_muted: bool,
    pub save_sink: bool,
}

impl SinkInputNewData {
    pub fn new(spec: SampleSpec) -> Result<Self, MixError> {
        spec.check()?;
        let frame = spec.frame_size();
        Ok(SinkInputNewData {
            map: ChannelMap::default_for(spec.channels)?,
            spec,
            attr: BlockQAttr {
                maxlength: frame * spec.rate as usize * 4,
                tlength: frame * spec.rate as usize / 4,
                prebuf: frame * spec.rate as usize / 10,
                minreq: frame * spec.rate as usize / 50,
            },
            volume: None,
            volume_factor: None,
            muted: false,
            corked: false,
            requested_latency: None,
            proplist: Proplist::new(),
            client: None,
            owner_module: None,
            save_volume: false,
            save_muted: false,
            save_sink: false,
        })
    }
}

pub(crate) struct InputCtl {
    pub state: StreamState,
    pub sink: Option<Arc<Sink>>,
    pub volume: CVolume,
    pub volume_factor: CVolume,
    pub reference_ratio: CVolume,
    pub real_ratio: CVolume,
    pub soft_volume: CVolume,
    pub muted: bool,
    pub save_volume: bool,
    pub save_muted: bool,
    pub save_sink: bool,
    pub requested_latency: Option<Duration>,
    pub attr: BlockQAttr,
    pub proplist: Proplist,
    pub client: Option<u32>,
    pub sync_prev: Weak<SinkInput>,
    pub sync_next: Weak<SinkInput>,
}

/// Un flux de lecture enregistré dans le cœur.
pub struct SinkInput {
    pub spec: SampleSpec,
    pub map: ChannelMap,
    pub owner_module: Option<u32>,
    core: Weak<Core>,
    index: OnceLock<u32>,
    ctl: Mutex<InputCtl>,
    events_tx: mpsc::UnboundedSender<InputEvent>,
}

impl SinkInput {
    /// Crée et enregistre le flux ; il reste `Init` jusqu'à
    /// [`SinkInput::put`]. Le récepteur retourné porte les événements
    /// du thread IO (demandes d'octets, drain, kill).
    pub fn new(
        core: &Arc<Core>,
        data: SinkInputNewData,
    ) -> Result<(Arc<SinkInput>, mpsc::UnboundedReceiver<InputEvent>), MixError> {
        data.spec.check()?;
        if !data.map.compatible_with(data.spec.channels) {
            return Err(MixError::Incompatible(
                "channel map does not match spec".into(),
            ));
        }
        let channels = data.spec.channels;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let volume = data.volume.unwrap_or_else(|| CVolume::norm(channels));
        let factor = data
            .volume_factor
            .unwrap_or_else(|| CVolume::norm(channels));
        let input = Arc::new(SinkInput {
            spec: data.spec,
            map: data.map,
            owner_module: data.owner_module,
            core: Arc::downgrade(core),
            index: OnceLock::new(),
            ctl: Mutex::new(InputCtl {
                state: StreamState::Init,
                sink: None,
                reference_ratio: volume.clone(),
                real_ratio: volume.clone(),
                soft_volume: volume.multiply(&factor),
                volume,
                volume_factor: factor,
                muted: data.muted,
                save_volume: data.save_volume,
                save_muted: data.save_muted,
                save_sink: data.save_sink,
                requested_latency: data.requested_latency,
                attr: data.attr,
                proplist: data.proplist,
                client: data.client,
                sync_prev: Weak::new(),
                sync_next: Weak::new(),
            }),
            events_tx,
        });
        let index = core.register_sink_input(&input);
        let _ = input.index.set(index);
        let corked = data.corked;
        if corked {
            input.ctl.lock().state = StreamState::Corked;
        }
        Ok((input, events_rx))
    }

    /// Attache le flux à `sink` et démarre la lecture.
    pub fn put(self: &Arc<Self>, sink: &Arc<Sink>) -> Result<(), MixError> {
        let core = self.core().ok_or(MixError::Unlinked)?;
        let render = {
            let mut ctl = self.ctl.lock();
            if ctl.sink.is_some() {
                return Err(MixError::BadState(crate::types::DeviceState::Running));
            }
            if ctl.state == StreamState::Init {
                ctl.state = StreamState::Running;
            }
            ctl.sink = Some(sink.clone());
            self.build_render(&ctl, sink, &core)?
        };
        sink.post_msg(SinkMsg::AddInput(Box::new(render)))?;
        sink.attach_input(self);
        core.emit(EventFacility::SinkInput, EventKind::New, self.idx());
        info!(
            "sink-input #{} attached to {} ({})",
            self.idx(),
            sink.name,
            self.spec
        );
        Ok(())
    }

    fn build_render(
        &self,
        ctl: &InputCtl,
        sink: &Arc<Sink>,
        core: &Arc<Core>,
    ) -> Result<InputRender, MixError> {
        let converter = if self.spec == sink.spec && self.map == sink.map {
            None
        } else {
            Some(Converter::new(self.spec, &self.map, sink.spec, &sink.map)?)
        };
        let silence = MemChunk::new(core.pool.silence_block(&self.spec));
        let memblockq = MemBlockQ::new(self.spec.frame_size(), ctl.attr, silence);
        Ok(InputRender::new(
            self.idx(),
            self.spec,
            memblockq,
            converter,
            ctl.soft_volume.remap(&self.map, &sink.map),
            ctl.muted,
            ctl.state == StreamState::Corked,
            self.events_tx.clone(),
        ))
    }

    /// Détache, retire des index, signale `Killed` au propriétaire si
    /// demandé. Idempotent.
    pub async fn unlink(self: &Arc<Self>) {
        let sink = {
            let mut ctl = self.ctl.lock();
            if ctl.state == StreamState::Unlinked {
                return;
            }
            ctl.state = StreamState::Unlinked;
            ctl.sink.take()
        };
        if let Some(sink) = &sink {
            let (tx, rx) = oneshot::channel();
            if sink
                .post_msg(SinkMsg::RemoveInput {
                    index: self.idx(),
                    reply: tx,
                })
                .is_ok()
            {
                let _ = rx.await;
            }
            sink.detach_input(self.idx());
        }
        if let Some(core) = self.core() {
            core.unregister_sink_input(self.idx());
            core.emit(EventFacility::SinkInput, EventKind::Remove, self.idx());
        }
        debug!("sink-input #{} unlinked", self.idx());
    }

    /// Retrait décidé par le serveur : événement `Killed` puis unlink.
    pub async fn kill(self: &Arc<Self>) {
        let _ = self.events_tx.send(InputEvent::Killed);
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

    pub fn sink(&self) -> Option<Arc<Sink>> {
        self.ctl.lock().sink.clone()
    }

    pub fn client(&self) -> Option<u32> {
        self.ctl.lock().client
    }

    pub fn proplist(&self) -> Proplist {
        self.ctl.lock().proplist.clone()
    }

    pub fn name(&self) -> String {
        let ctl = self.ctl.lock();
        ctl.proplist
            .get_str(sabcore::proplist::keys::MEDIA_NAME)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("input-{}", ctl.proplist.digest()))
    }

    pub fn attr(&self) -> BlockQAttr {
        self.ctl.lock().attr
    }

    /// Renomme le flux (propriété `media.name`).
    pub fn set_name(self: &Arc<Self>, name: &str) {
        self.ctl
            .lock()
            .proplist
            .set_str(sabcore::proplist::keys::MEDIA_NAME, name);
        if let Some(core) = self.core() {
            core.emit(EventFacility::SinkInput, EventKind::Change, self.idx());
        }
    }

    // ---- audio ------------------------------------------------------

    /// Pousse des données du client vers le thread IO du sink.
    pub fn write(&self, offset: i64, seek: SeekMode, chunk: MemChunk) -> Result<(), MixError> {
        let sink = self.sink().ok_or(MixError::Unlinked)?;
        sink.post_msg(SinkMsg::PostData {
            index: self.idx(),
            offset,
            seek,
            chunk,
        })
    }

    /// Demande un drain ; `Drained(tag)` arrivera sur les événements.
    pub fn drain(&self, tag: u32) -> Result<(), MixError> {
        let sink = self.sink().ok_or(MixError::Unlinked)?;
        sink.post_msg(SinkMsg::DrainInput {
            index: self.idx(),
            tag,
        })
    }

    pub fn flush(&self) -> Result<(), MixError> {
        let sink = self.sink().ok_or(MixError::Unlinked)?;
        sink.post_msg(SinkMsg::FlushInput { index: self.idx() })
    }

    pub fn prebuf_force(&self) -> Result<(), MixError> {
        let sink = self.sink().ok_or(MixError::Unlinked)?;
        sink.post_msg(SinkMsg::PrebufForce { index: self.idx() })
    }

    /// Déclenche la lecture sans attendre le pré-buffer.
    pub fn trigger(&self) -> Result<(), MixError> {
        let sink = self.sink().ok_or(MixError::Unlinked)?;
        sink.post_msg(SinkMsg::PrebufDisable { index: self.idx() })
    }

    pub fn cork(self: &Arc<Self>, corked: bool) -> Result<(), MixError> {
        let sink = {
            let mut ctl = self.ctl.lock();
            match (ctl.state, corked) {
                (StreamState::Running | StreamState::Drained, true) => {
                    ctl.state = StreamState::Corked;
                }
                (StreamState::Corked, false) => {
                    ctl.state = StreamState::Running;
                }
                _ => return Ok(()),
            }
            ctl.sink.clone()
        };
        if let Some(sink) = sink {
            sink.post_msg(SinkMsg::CorkInput {
                index: self.idx(),
                corked,
            })?;
            sink.update_status();
        }
        if let Some(core) = self.core() {
            core.emit(EventFacility::SinkInput, EventKind::Change, self.idx());
        }
        Ok(())
    }

    pub fn is_corked(&self) -> bool {
        self.ctl.lock().state == StreamState::Corked
    }

    /// Latence du flux : contenu de sa file plus latence du sink.
    pub async fn get_latency(&self) -> Result<(Duration, Duration), MixError> {
        let sink = self.sink().ok_or(MixError::Unlinked)?;
        let (tx, rx) = oneshot::channel();
        sink.send_msg(SinkMsg::GetInputLatency {
            index: self.idx(),
            reply: tx,
        })
        .await?;
        let own = rx.await.map_err(|_| MixError::Unlinked)?;
        let device = sink.get_latency().await?;
        Ok((own, device))
    }

    pub fn requested_latency(&self) -> Option<Duration> {
        self.ctl.lock().requested_latency
    }

    pub fn set_requested_latency(self: &Arc<Self>, latency: Option<Duration>) {
        self.ctl.lock().requested_latency = latency;
        if let Some(sink) = self.sink() {
            sink.update_latency();
        }
    }

    // ---- volume -----------------------------------------------------

    pub fn volume(&self) -> CVolume {
        self.ctl.lock().volume.clone()
    }

    pub fn muted(&self) -> bool {
        self.ctl.lock().muted
    }

    /// Fixe le volume du flux. En volume plat le sink resynchronise
    /// ensuite son volume réel et tous les ratios.
    pub fn set_volume(self: &Arc<Self>, volume: &CVolume, save: bool) {
        let sink = {
            let mut ctl = self.ctl.lock();
            ctl.volume = if volume.channels() == self.spec.channels {
                volume.clone()
            } else {
                CVolume::uniform(self.spec.channels, volume.max())
            };
            ctl.save_volume = save || ctl.save_volume;
            ctl.sink.clone()
        };
        if let Some(sink) = sink {
            if sink.flags.contains(crate::types::DeviceFlags::FLAT_VOLUME) {
                sink.recompute_volumes(Some(self.idx()));
            } else {
                // Hors volume plat, le ratio réel est le volume du flux
                // lui-même.
                {
                    let mut ctl = self.ctl.lock();
                    ctl.real_ratio = ctl.volume.clone();
                    ctl.reference_ratio = ctl.volume.clone();
                    ctl.soft_volume = ctl.real_ratio.multiply(&ctl.volume_factor);
                }
                sink.push_input_soft_volume(self);
            }
        }
        if let Some(core) = self.core() {
            core.emit(EventFacility::SinkInput, EventKind::Change, self.idx());
        }
    }

    pub fn set_mute(self: &Arc<Self>, muted: bool, save: bool) {
        let sink = {
            let mut ctl = self.ctl.lock();
            if ctl.muted == muted {
                return;
            }
            ctl.muted = muted;
            ctl.save_muted = save || ctl.save_muted;
            ctl.sink.clone()
        };
        if let Some(sink) = sink {
            sink.push_input_soft_volume(self);
        }
        if let Some(core) = self.core() {
            core.emit(EventFacility::SinkInput, EventKind::Change, self.idx());
        }
    }

    // Aides appelées par le sink, sous son verrou. Elles ne prennent
    // que le verrou du flux.

    pub(crate) fn volume_remapped_to(&self, sink_map: &ChannelMap) -> CVolume {
        let ctl = self.ctl.lock();
        ctl.volume.remap(&self.map, sink_map)
    }

    pub(crate) fn update_reference_ratio(&self, reference: &CVolume, sink_map: &ChannelMap) {
        let mut ctl = self.ctl.lock();
        let remapped = reference.remap(sink_map, &self.map);
        for c in 0..self.spec.channels as usize {
            let r = remapped.get(c);
            if r <= Volume::MUTED {
                continue;
            }
            if ctl.reference_ratio.get(c).multiply(r) == ctl.volume.get(c) {
                continue;
            }
            let ratio = ctl.volume.get(c).divide(r);
            ctl.reference_ratio.set(c, ratio);
        }
    }

    pub(crate) fn update_real_ratio(&self, real: &CVolume, sink_map: &ChannelMap) {
        let mut ctl = self.ctl.lock();
        let remapped = real.remap(sink_map, &self.map);
        for c in 0..self.spec.channels as usize {
            let r = remapped.get(c);
            if r <= Volume::MUTED {
                // Ratio réel inchangé, composante douce forcée au muet.
                ctl.soft_volume.set(c, Volume::MUTED);
                continue;
            }
            if ctl.real_ratio.get(c).multiply(r) != ctl.volume.get(c) {
                let ratio = ctl.volume.get(c).divide(r);
                ctl.real_ratio.set(c, ratio);
            }
            let soft = ctl.real_ratio.get(c).multiply(ctl.volume_factor.get(c));
            ctl.soft_volume.set(c, soft);
        }
    }

    /// `volume := reference ⊗ reference_ratio`. Retourne vrai si le
    /// volume du flux a changé.
    pub(crate) fn apply_reference_volume(&self, reference: &CVolume, sink_map: &ChannelMap) -> bool {
        let mut ctl = self.ctl.lock();
        let remapped = reference.remap(sink_map, &self.map);
        let new = remapped.multiply(&ctl.reference_ratio);
        if new == ctl.volume {
            return false;
        }
        ctl.volume = new;
        true
    }

    pub(crate) fn pull_reference_ratio_from_real(&self, _sink: &Arc<Sink>) {
        let mut ctl = self.ctl.lock();
        ctl.reference_ratio = ctl.real_ratio.clone();
    }

    /// Volume doux et muet à pousser au thread IO, géométrie du sink.
    pub(crate) fn soft_volume_for_sink(&self, sink_map: &ChannelMap) -> (CVolume, bool) {
        let ctl = self.ctl.lock();
        (ctl.soft_volume.remap(&self.map, sink_map), ctl.muted)
    }

    pub fn reference_ratio(&self) -> CVolume {
        self.ctl.lock().reference_ratio.clone()
    }

    pub fn real_ratio(&self) -> CVolume {
        self.ctl.lock().real_ratio.clone()
    }

    pub fn soft_volume(&self) -> CVolume {
        self.ctl.lock().soft_volume.clone()
    }

    // ---- déplacement ------------------------------------------------

    /// Déplace le flux vers un autre sink, en trois temps : détache de
    /// l'ancien (avec rembobinage de sa portion en vol), rattache au
    /// nouveau, et arme sur celui-ci un rembobinage équivalent à sa
    /// latence courante. En cas d'échec le flux est tué.
    pub async fn move_to(self: &Arc<Self>, new_sink: &Arc<Sink>) -> Result<(), MixError> {
        {
            let ctl = self.ctl.lock();
            if ctl.sync_prev.upgrade().is_some() || ctl.sync_next.upgrade().is_some() {
                return Err(MixError::SyncGroup);
            }
            if !ctl.state.is_linked() {
                return Err(MixError::Unlinked);
            }
        }

        // start_move
        let old_sink = self.ctl.lock().sink.take();
        let mut render = None;
        if let Some(old) = &old_sink {
            let (tx, rx) = oneshot::channel();
            if old
                .post_msg(SinkMsg::RemoveInput {
                    index: self.idx(),
                    reply: tx,
                })
                .is_ok()
            {
                render = rx.await.ok().flatten();
            }
            old.detach_input(self.idx());
        }

        // finish_move
        let result = self.finish_move(new_sink, render).await;
        if result.is_err() {
            // fail_move
            self.kill().await;
        }
        result
    }

    async fn finish_move(
        self: &Arc<Self>,
        new_sink: &Arc<Sink>,
        old_render: Option<Box<InputRender>>,
    ) -> Result<(), MixError> {
        let core = self.core().ok_or(MixError::Unlinked)?;
        let render = {
            let mut ctl = self.ctl.lock();
            ctl.sink = Some(new_sink.clone());
            match old_render {
                Some(mut render) => {
                    // La file survit au déplacement ; seul le
                    // convertisseur est refait pour la spec du nouveau
                    // sink.
                    render.converter = if self.spec == new_sink.spec && self.map == new_sink.map {
                        None
                    } else {
                        Some(Converter::new(
                            self.spec,
                            &self.map,
                            new_sink.spec,
                            &new_sink.map,
                        )?)
                    };
                    render.soft_volume = ctl.soft_volume.remap(&self.map, &new_sink.map);
                    *render
                }
                None => self.build_render(&ctl, new_sink, &core)?,
            }
        };
        new_sink.post_msg(SinkMsg::AddInput(Box::new(render)))?;
        new_sink.attach_input(self);
        // Le nouveau sink rejoue sa latence tamponnée pour que le flux
        // s'entende sans attendre la fin de la période en cours.
        let buffered = new_sink.spec.duration_to_bytes(new_sink.configured_latency());
        new_sink.request_rewind(buffered);
        core.emit(EventFacility::SinkInput, EventKind::Change, self.idx());
        info!("sink-input #{} moved to {}", self.idx(), new_sink.name);
        Ok(())
    }
}

impl std::fmt::Debug for SinkInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkInput")
            .field("index", &self.idx())
            .field("spec", &self.spec)
            .field("state", &self.state())
            .finish()
    }
}
