//! Sink : cible de routage côté plan de contrôle.
//!
//! L'objet principal vit sur le plan de contrôle ; tout l'état de
//! rendu est dans le [`SinkWorker`](crate::worker::SinkWorker) de son
//! thread IO et n'est touché que par messages. Les invariants de
//! volume plat suivent la règle : pour chaque flux attaché,
//! `volume = reference_volume ⊗ reference_ratio` (par canal, après
//! remap), et `real_ratio = volume ⊘ real_volume`.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use sabcore::{CVolume, ChannelMap, MemChunk, Proplist, SampleSpec};
use sabloop::{AsyncMsgQ, IoThread};

use crate::core::{Core, EventFacility, EventKind};
use crate::error::MixError;
use crate::sink_input::SinkInput;
use crate::source::Source;
use crate::types::{DeviceFlags, DeviceState, LatencySpec, SuspendCause};
use crate::worker::{SinkMsg, SinkWorker};

/// Pilote d'un sink, exécuté sur le thread IO.
#[async_trait::async_trait]
pub trait SinkBackend: Send + 'static {
    /// Appelé une fois sur le thread IO avant la première période.
    async fn start(&mut self) -> Result<(), MixError> {
        Ok(())
    }

    /// Consomme une période rendue.
    async fn write(&mut self, chunk: &MemChunk) -> Result<(), MixError>;

    /// Pousse le volume réel au matériel et retourne le résidu à
    /// appliquer en logiciel. Par défaut : tout en logiciel.
    async fn set_volume(&mut self, real: &CVolume) -> CVolume {
        real.clone()
    }

    /// Audio accepté mais pas encore joué.
    fn latency(&self) -> Duration {
        Duration::ZERO
    }

    async fn stop(&mut self) {}
}

/// Paramètres de construction d'un sink.
pub struct SinkNewData {
    pub name: String,
    pub driver: String,
    pub spec: SampleSpec,
    pub map: ChannelMap,
    pub flags: DeviceFlags,
    pub latency: LatencySpec,
    pub volume: Option<CVolume>,
    pub muted: bool,
    pub proplist: Proplist,
    pub owner_module: Option<u32>,
}

impl SinkNewData {
    pub fn new(name: &str, spec: SampleSpec) -> Result<Self, MixError> {
        Ok(SinkNewData {
            name: name.to_owned(),
            driver: "unknown".to_owned(),
            map: ChannelMap::default_for(spec.channels)?,
            spec,
            flags: DeviceFlags::FLAT_VOLUME | DeviceFlags::LATENCY,
            latency: LatencySpec::Fixed(crate::types::DEFAULT_FIXED_LATENCY),
            volume: None,
            muted: false,
            proplist: Proplist::new(),
            owner_module: None,
        })
    }
}

pub(crate) struct SinkCtl {
    pub state: DeviceState,
    pub suspend_cause: SuspendCause,
    pub reference_volume: CVolume,
    pub real_volume: CVolume,
    pub soft_volume: CVolume,
    pub muted: bool,
    pub save_volume: bool,
    pub save_muted: bool,
    pub inputs: Vec<Arc<SinkInput>>,
    pub port: Option<String>,
    pub proplist: Proplist,
    pub configured_latency: Duration,
}

/// Un sink enregistré dans le cœur.
pub struct Sink {
    pub name: String,
    pub driver: String,
    pub spec: SampleSpec,
    pub map: ChannelMap,
    pub flags: DeviceFlags,
    pub latency_spec: LatencySpec,
    pub owner_module: Option<u32>,
    core: Weak<Core>,
    index: OnceLock<u32>,
    pub(crate) ctl: Mutex<SinkCtl>,
    io: Mutex<Option<IoThread>>,
    msgq: Mutex<Option<AsyncMsgQ>>,
    monitor: Mutex<Option<Arc<Source>>>,
}

impl Sink {
    /// Crée et enregistre le sink et sa source monitor. L'objet reste
    /// en état `Init` jusqu'à [`Sink::put`].
    pub fn new(core: &Arc<Core>, data: SinkNewData) -> Result<Arc<Sink>, MixError> {
        data.spec.check()?;
        if !data.map.compatible_with(data.spec.channels) {
            return Err(MixError::Incompatible(
                "channel map does not match spec".into(),
            ));
        }
        if core.sink_by_name(&data.name).is_some() {
            return Err(MixError::Exist(data.name));
        }
        let channels = data.spec.channels;
        let volume = data
            .volume
            .unwrap_or_else(|| CVolume::norm(channels));
        let sink = Arc::new(Sink {
            name: data.name.clone(),
            driver: data.driver,
            spec: data.spec,
            map: data.map,
            flags: data.flags,
            latency_spec: data.latency,
            owner_module: data.owner_module,
            core: Arc::downgrade(core),
            index: OnceLock::new(),
            ctl: Mutex::new(SinkCtl {
                state: DeviceState::Init,
                suspend_cause: SuspendCause::empty(),
                reference_volume: volume.clone(),
                real_volume: volume.clone(),
                soft_volume: volume,
                muted: data.muted,
                save_volume: false,
                save_muted: false,
                inputs: Vec::new(),
                port: None,
                proplist: data.proplist,
                configured_latency: data.latency.default_latency(),
            }),
            io: Mutex::new(None),
            msgq: Mutex::new(None),
            monitor: Mutex::new(None),
        });
        let index = core.register_sink(&sink);
        let _ = sink.index.set(index);

        let monitor = Source::new_monitor(core, &sink)?;
        *sink.monitor.lock() = Some(monitor);
        debug!("sink {} registered as #{index}", sink.name);
        Ok(sink)
    }

    /// Démarre le thread IO avec `backend` et active le sink. Les
    /// erreurs fatales du pilote remontent sur le récepteur retourné ;
    /// le module propriétaire décide de l'escalade.
    pub fn put(
        self: &Arc<Self>,
        backend: Box<dyn SinkBackend>,
    ) -> Result<mpsc::UnboundedReceiver<SinkEvent>, MixError> {
        let period = {
            let ctl = self.ctl.lock();
            if ctl.state != DeviceState::Init {
                return Err(MixError::BadState(ctl.state));
            }
            ctl.configured_latency
        };
        let core = self.core().ok_or(MixError::Unlinked)?;
        let soft = self.ctl.lock().soft_volume.clone();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker = SinkWorker::new(
            self.spec,
            core.pool.clone(),
            backend,
            soft,
            period,
            event_tx,
        );
        let io = IoThread::spawn(&format!("sink:{}", self.name), move |rx| worker.run(rx))?;
        *self.msgq.lock() = Some(io.msgq().clone());
        *self.io.lock() = Some(io);
        self.ctl.lock().state = DeviceState::Idle;
        if let Some(monitor) = self.monitor() {
            monitor.put_as_monitor()?;
        }
        core.hooks.sink_put.fire(self);
        core.emit(EventFacility::Sink, EventKind::New, self.idx());
        info!("sink {} up ({})", self.name, self.spec);
        Ok(event_rx)
    }

    /// Détache tout, retire l'objet des index et arrête le thread IO.
    /// Idempotent.
    pub async fn unlink(self: &Arc<Self>) {
        {
            let ctl = self.ctl.lock();
            if ctl.state == DeviceState::Unlinked {
                return;
            }
        }
        // Tue d'abord les flux attachés.
        let inputs: Vec<Arc<SinkInput>> = self.ctl.lock().inputs.clone();
        for input in inputs {
            input.kill().await;
        }
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.unlink().await;
        }
        self.ctl.lock().state = DeviceState::Unlinked;
        if let Some(core) = self.core() {
            core.hooks.sink_unlink.fire(self);
            core.unregister_sink(self.idx());
            core.emit(EventFacility::Sink, EventKind::Remove, self.idx());
        }
        *self.msgq.lock() = None;
        let io = self.io.lock().take();
        if let Some(io) = io {
            let _ = tokio::task::spawn_blocking(move || io.shutdown()).await;
        }
        info!("sink {} unlinked", self.name);
    }

    pub fn idx(&self) -> u32 {
        *self.index.get().unwrap_or(&sabcore::INVALID_INDEX)
    }

    pub fn core(&self) -> Option<Arc<Core>> {
        self.core.upgrade()
    }

    pub fn state(&self) -> DeviceState {
        self.ctl.lock().state
    }

    pub fn monitor(&self) -> Option<Arc<Source>> {
        self.monitor.lock().clone()
    }

    pub fn proplist(&self) -> Proplist {
        self.ctl.lock().proplist.clone()
    }

    pub(crate) fn msgq(&self) -> Result<AsyncMsgQ, MixError> {
        self.msgq.lock().clone().ok_or(MixError::Unlinked)
    }

    pub(crate) fn post_msg(&self, msg: SinkMsg) -> Result<(), MixError> {
        self.msgq()?.post(None, 0, Some(Box::new(msg)), 0, None)?;
        Ok(())
    }

    pub(crate) async fn send_msg(&self, msg: SinkMsg) -> Result<(), MixError> {
        self.msgq()?
            .send(None, 0, Some(Box::new(msg)), 0, None)
            .await?;
        Ok(())
    }

    // ---- état, suspension -------------------------------------------

    /// Pose ou lève une cause de suspension. L'objet est suspendu tant
    /// que l'ensemble des causes est non vide.
    pub fn suspend(self: &Arc<Self>, cause: SuspendCause, suspend: bool) -> Result<(), MixError> {
        let new_state = {
            let mut ctl = self.ctl.lock();
            if !ctl.state.is_linked() {
                return Err(MixError::BadState(ctl.state));
            }
            if suspend {
                ctl.suspend_cause |= cause;
            } else {
                ctl.suspend_cause -= cause;
            }
            let new_state = if !ctl.suspend_cause.is_empty() {
                DeviceState::Suspended
            } else if ctl.inputs.iter().any(|i| !i.is_corked()) {
                DeviceState::Running
            } else {
                DeviceState::Idle
            };
            if new_state == ctl.state {
                return Ok(());
            }
            ctl.state = new_state;
            new_state
        };
        let _ = self.post_msg(SinkMsg::SetState(new_state));
        if let Some(monitor) = self.monitor() {
            monitor.track_sink_state(new_state);
        }
        self.changed();
        info!("sink {}: state -> {new_state:?}", self.name);
        Ok(())
    }

    pub fn suspend_cause(&self) -> SuspendCause {
        self.ctl.lock().suspend_cause
    }

    /// Recalcule Idle/Running d'après les flux attachés.
    pub(crate) fn update_status(self: &Arc<Self>) {
        let new_state = {
            let mut ctl = self.ctl.lock();
            if !matches!(ctl.state, DeviceState::Idle | DeviceState::Running) {
                return;
            }
            let wanted = if ctl.inputs.iter().any(|i| !i.is_corked()) {
                DeviceState::Running
            } else {
                DeviceState::Idle
            };
            if wanted == ctl.state {
                return;
            }
            ctl.state = wanted;
            wanted
        };
        let _ = self.post_msg(SinkMsg::SetState(new_state));
        self.changed();
    }

    // ---- attache des flux -------------------------------------------

    pub(crate) fn attach_input(self: &Arc<Self>, input: &Arc<SinkInput>) {
        {
            let mut ctl = self.ctl.lock();
            ctl.inputs.push(input.clone());
        }
        if self.flags.contains(DeviceFlags::FLAT_VOLUME) {
            self.recompute_volumes(None);
        } else {
            self.push_input_soft_volume(input);
        }
        self.update_status();
        self.update_latency();
    }

    pub(crate) fn detach_input(self: &Arc<Self>, index: u32) {
        {
            let mut ctl = self.ctl.lock();
            ctl.inputs.retain(|i| i.idx() != index);
        }
        if self.flags.contains(DeviceFlags::FLAT_VOLUME) {
            self.recompute_volumes(None);
        }
        self.update_status();
        self.update_latency();
    }

    pub fn linked_by(&self) -> usize {
        self.ctl.lock().inputs.len()
    }

    pub fn used_by(&self) -> usize {
        self.ctl.lock().inputs.iter().filter(|i| !i.is_corked()).count()
    }

    pub fn inputs(&self) -> Vec<Arc<SinkInput>> {
        self.ctl.lock().inputs.clone()
    }

    // ---- latence ----------------------------------------------------

    /// Latence courante mesurée sur le thread IO.
    pub async fn get_latency(&self) -> Result<Duration, MixError> {
        let (tx, rx) = oneshot::channel();
        self.send_msg(SinkMsg::GetLatency { reply: tx }).await?;
        rx.await.map_err(|_| MixError::Unlinked)
    }

    /// Latence configurée (la période de rendu).
    pub fn configured_latency(&self) -> Duration {
        self.ctl.lock().configured_latency
    }

    /// Recalcule la latence demandée : minimum des demandes des flux,
    /// borné par ce que le périphérique sait faire.
    pub(crate) fn update_latency(self: &Arc<Self>) {
        if !self.flags.contains(DeviceFlags::DYNAMIC_LATENCY) {
            return;
        }
        let new = {
            let mut ctl = self.ctl.lock();
            let wanted = ctl
                .inputs
                .iter()
                .filter_map(|i| i.requested_latency())
                .min()
                .unwrap_or_else(|| self.latency_spec.default_latency());
            let clamped = self.latency_spec.clamp(wanted);
            if clamped == ctl.configured_latency {
                return;
            }
            ctl.configured_latency = clamped;
            clamped
        };
        let _ = self.post_msg(SinkMsg::SetPeriod(new));
        debug!("sink {}: latency -> {new:?}", self.name);
    }

    /// Demande un rembobinage de `bytes` octets au thread IO.
    pub fn request_rewind(&self, bytes: usize) {
        let _ = self.post_msg(SinkMsg::RequestRewind(bytes));
    }

    // ---- volume -----------------------------------------------------

    /// Volume visible du sink.
    pub fn reference_volume(&self) -> CVolume {
        self.ctl.lock().reference_volume.clone()
    }

    pub fn real_volume(&self) -> CVolume {
        self.ctl.lock().real_volume.clone()
    }

    pub fn soft_volume(&self) -> CVolume {
        self.ctl.lock().soft_volume.clone()
    }

    pub fn muted(&self) -> bool {
        self.ctl.lock().muted
    }

    /// Fixe le volume du sink.
    ///
    /// Avec un volume : `reference_volume` prend la valeur, puis, en
    /// volume plat, chaque flux conserve son `reference_ratio` et le
    /// volume réel devient le maximum des flux. Sans volume (`None`,
    /// volume plat uniquement) : resynchronise le sink sur les volumes
    /// de flux courants.
    pub fn set_volume(self: &Arc<Self>, volume: Option<&CVolume>, save: bool) {
        let flat = self.flags.contains(DeviceFlags::FLAT_VOLUME);
        let changed = {
            let mut ctl = self.ctl.lock();
            let old = ctl.reference_volume.clone();
            if let Some(v) = volume {
                ctl.reference_volume = if v.channels() == self.spec.channels {
                    v.clone()
                } else {
                    CVolume::uniform(self.spec.channels, v.max())
                };
            }
            ctl.save_volume = save || ctl.save_volume;
            old != ctl.reference_volume
        };

        if flat {
            if volume.is_some() {
                self.propagate_reference_volume();
            }
            self.compute_real_volume(volume.is_none());
        } else {
            let mut ctl = self.ctl.lock();
            ctl.real_volume = ctl.reference_volume.clone();
        }

        self.apply_volume_to_worker();
        if changed {
            self.changed();
        }
    }

    /// Le matériel a changé de volume tout seul : on aligne le volume
    /// de référence sur le réel, les flux gardant leur volume courant
    /// (leur `reference_ratio` est tiré de leur `real_ratio`).
    pub fn volume_changed(self: &Arc<Self>, new_real: &CVolume) {
        let (changed, inputs) = {
            let mut ctl = self.ctl.lock();
            if ctl.real_volume == *new_real {
                return;
            }
            ctl.real_volume = new_real.clone();
            ctl.reference_volume = new_real.clone();
            ctl.save_volume = true;
            (true, ctl.inputs.clone())
        };
        if self.flags.contains(DeviceFlags::FLAT_VOLUME) {
            for input in &inputs {
                input.pull_reference_ratio_from_real(self);
            }
            self.propagate_reference_volume();
            self.compute_real_ratios();
        }
        self.apply_volume_to_worker();
        if changed {
            self.changed();
        }
    }

    pub fn set_mute(self: &Arc<Self>, muted: bool, save: bool) {
        {
            let mut ctl = self.ctl.lock();
            if ctl.muted == muted {
                return;
            }
            ctl.muted = muted;
            ctl.save_muted = save || ctl.save_muted;
        }
        let _ = self.post_msg(SinkMsg::SetMuted(muted));
        self.changed();
    }

    /// Recalcule tout l'édifice de volume plat après un changement de
    /// volume d'un flux ou une attache/détache.
    pub(crate) fn recompute_volumes(self: &Arc<Self>, _from_input: Option<u32>) {
        self.set_volume(None, false);
    }

    /// `real_volume` := max des volumes de flux (remappés), puis
    /// ratios réels et volumes doux de chaque flux.
    fn compute_real_volume(self: &Arc<Self>, merge_into_reference: bool) {
        let inputs = {
            let mut ctl = self.ctl.lock();
            if ctl.inputs.is_empty() {
                ctl.real_volume = ctl.reference_volume.clone();
                Vec::new()
            } else {
                let mut real = CVolume::muted(self.spec.channels);
                for input in ctl.inputs.iter() {
                    let remapped = input.volume_remapped_to(&self.map);
                    real.merge_max(&remapped);
                }
                ctl.real_volume = real;
                if merge_into_reference {
                    let real = ctl.real_volume.clone();
                    ctl.reference_volume.merge_max(&real);
                }
                ctl.inputs.clone()
            }
        };
        if merge_into_reference {
            // Les ratios de référence suivent le nouveau volume de
            // référence.
            let reference = self.reference_volume();
            for input in &inputs {
                input.update_reference_ratio(&reference, &self.map);
            }
        }
        self.compute_real_ratios();
    }

    /// `real_ratio := volume ⊘ real_volume` et volume doux par flux.
    fn compute_real_ratios(self: &Arc<Self>) {
        let (real, inputs) = {
            let ctl = self.ctl.lock();
            (ctl.real_volume.clone(), ctl.inputs.clone())
        };
        for input in &inputs {
            input.update_real_ratio(&real, &self.map);
            self.push_input_soft_volume(input);
        }
    }

    /// `volume := reference_volume ⊗ reference_ratio` pour chaque flux.
    fn propagate_reference_volume(self: &Arc<Self>) {
        let (reference, inputs) = {
            let ctl = self.ctl.lock();
            (ctl.reference_volume.clone(), ctl.inputs.clone())
        };
        for input in &inputs {
            if input.apply_reference_volume(&reference, &self.map) {
                if let Some(core) = self.core() {
                    core.emit(EventFacility::SinkInput, EventKind::Change, input.idx());
                }
            }
        }
    }

    /// Pousse le volume (réel ou doux) au thread IO.
    fn apply_volume_to_worker(self: &Arc<Self>) {
        let (real, soft) = {
            let mut ctl = self.ctl.lock();
            if self.flags.contains(DeviceFlags::HW_VOLUME) {
                ctl.soft_volume = CVolume::norm(self.spec.channels);
            } else {
                ctl.soft_volume = ctl.real_volume.clone();
            }
            (ctl.real_volume.clone(), ctl.soft_volume.clone())
        };
        if self.flags.contains(DeviceFlags::HW_VOLUME) {
            let _ = self.post_msg(SinkMsg::SetRealVolume(real));
        } else {
            let _ = self.post_msg(SinkMsg::SetSoftVolume(soft));
        }
    }

    pub(crate) fn push_input_soft_volume(self: &Arc<Self>, input: &Arc<SinkInput>) {
        let (volume, muted) = input.soft_volume_for_sink(&self.map);
        let _ = self.post_msg(SinkMsg::SetInputSoftVolume {
            index: input.idx(),
            volume,
            muted,
        });
    }

    // ---- ports ------------------------------------------------------

    pub fn set_port(self: &Arc<Self>, port: &str) {
        self.ctl.lock().port = Some(port.to_owned());
        self.changed();
    }

    pub fn port(&self) -> Option<String> {
        self.ctl.lock().port.clone()
    }

    fn changed(&self) {
        if let Some(core) = self.core() {
            core.emit(EventFacility::Sink, EventKind::Change, self.idx());
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("name", &self.name)
            .field("index", &self.idx())
            .field("spec", &self.spec)
            .field("state", &self.state())
            .finish()
    }
}

/// Événements poussés par le thread IO vers le propriétaire du sink
/// (le module qui l'a créé).
#[derive(Debug)]
pub enum SinkEvent {
    /// Le pilote a signalé une erreur fatale.
    BackendError(String),
}

impl Drop for Sink {
    fn drop(&mut self) {
        if self.state() != DeviceState::Unlinked {
            warn!("sink {} dropped without unlink", self.name);
        }
    }
}
