//! Source : origine de routage (capture).
//!
//! Deux formes : la source monitor d'un sink, dont le rendu est porté
//! par le thread IO du sink (elle en suit l'état de suspension), et la
//! source autonome avec son propre thread IO et son pilote.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use sabcore::{CVolume, ChannelMap, MemChunk, MemPool, Proplist, SampleSpec};
use sabloop::{AsyncMsgQ, IoThread};

use crate::core::{Core, EventFacility, EventKind};
use crate::error::MixError;
use crate::sink::Sink;
use crate::source_output::SourceOutput;
use crate::types::{DeviceFlags, DeviceState, LatencySpec, SuspendCause};
use crate::worker::{OutputRender, SinkMsg, SourceMsg, SourceWorker};

/// Pilote d'une source autonome, exécuté sur son thread IO.
#[async_trait::async_trait]
pub trait SourceBackend: Send + 'static {
    async fn start(&mut self) -> Result<(), MixError> {
        Ok(())
    }

    /// Produit une période d'audio capturé.
    async fn read(&mut self, period: Duration, pool: &MemPool) -> Result<MemChunk, MixError>;

    fn latency(&self) -> Duration {
        Duration::ZERO
    }

    async fn stop(&mut self) {}
}

/// Paramètres de construction d'une source autonome.
pub struct SourceNewData {
    pub name: String,
    pub driver: String,
    pub spec: SampleSpec,
    pub map: ChannelMap,
    pub flags: DeviceFlags,
    pub latency: LatencySpec,
    pub muted: bool,
    pub proplist: Proplist,
    pub owner_module: Option<u32>,
}

impl SourceNewData {
    pub fn new(name: &str, spec: SampleSpec) -> Result<Self, MixError> {
        Ok(SourceNewData {
            name: name.to_owned(),
            driver: "unknown".to_owned(),
            map: ChannelMap::default_for(spec.channels)?,
            spec,
            flags: DeviceFlags::LATENCY,
            latency: LatencySpec::Fixed(crate::types::DEFAULT_FIXED_LATENCY),
            muted: false,
            proplist: Proplist::new(),
            owner_module: None,
        })
    }
}

enum SourceKind {
    Monitor(Weak<Sink>),
    Standalone,
}

struct SourceCtl {
    state: DeviceState,
    suspend_cause: SuspendCause,
    volume: CVolume,
    muted: bool,
    outputs: Vec<Arc<SourceOutput>>,
    proplist: Proplist,
    configured_latency: Duration,
}

/// Une source enregistrée dans le cœur.
pub struct Source {
    pub name: String,
    pub driver: String,
    pub spec: SampleSpec,
    pub map: ChannelMap,
    pub flags: DeviceFlags,
    pub latency_spec: LatencySpec,
    pub owner_module: Option<u32>,
    core: Weak<Core>,
    index: OnceLock<u32>,
    kind: SourceKind,
    ctl: Mutex<SourceCtl>,
    io: Mutex<Option<IoThread>>,
    msgq: Mutex<Option<AsyncMsgQ>>,
}

impl Source {
    /// Crée et enregistre une source autonome, en état `Init`.
    pub fn new(core: &Arc<Core>, data: SourceNewData) -> Result<Arc<Source>, MixError> {
        data.spec.check()?;
        if core.source_by_name(&data.name).is_some() {
            return Err(MixError::Exist(data.name));
        }
        let source = Self::build(core, data, SourceKind::Standalone);
        let index = core.register_source(&source);
        let _ = source.index.set(index);
        debug!("source {} registered as #{index}", source.name);
        Ok(source)
    }

    /// Crée la source monitor d'un sink (appelé par `Sink::new`).
    pub(crate) fn new_monitor(core: &Arc<Core>, sink: &Arc<Sink>) -> Result<Arc<Source>, MixError> {
        let name = format!("{}.monitor", sink.name);
        if core.source_by_name(&name).is_some() {
            return Err(MixError::Exist(name));
        }
        let mut proplist = Proplist::new();
        proplist.set_str(
            sabcore::proplist::keys::DEVICE_DESCRIPTION,
            &format!("Monitor of {}", sink.name),
        );
        proplist.set_str(sabcore::proplist::keys::DEVICE_CLASS, "monitor");
        let data = SourceNewData {
            name,
            driver: sink.driver.clone(),
            spec: sink.spec,
            map: sink.map.clone(),
            flags: DeviceFlags::LATENCY,
            latency: sink.latency_spec,
            muted: false,
            proplist,
            owner_module: sink.owner_module,
        };
        let source = Self::build(core, data, SourceKind::Monitor(Arc::downgrade(sink)));
        let index = core.register_source(&source);
        let _ = source.index.set(index);
        Ok(source)
    }

    fn build(core: &Arc<Core>, data: SourceNewData, kind: SourceKind) -> Arc<Source> {
        Arc::new(Source {
            name: data.name,
            driver: data.driver,
            spec: data.spec,
            flags: data.flags,
            latency_spec: data.latency,
            owner_module: data.owner_module,
            core: Arc::downgrade(core),
            index: OnceLock::new(),
            kind,
            ctl: Mutex::new(SourceCtl {
                state: DeviceState::Init,
                suspend_cause: SuspendCause::empty(),
                volume: CVolume::norm(data.map.channels()),
                muted: data.muted,
                outputs: Vec::new(),
                proplist: data.proplist,
                configured_latency: data.latency.default_latency(),
            }),
            map: data.map,
            io: Mutex::new(None),
            msgq: Mutex::new(None),
        })
    }

    /// Démarre le thread IO d'une source autonome.
    pub fn put(self: &Arc<Self>, backend: Box<dyn SourceBackend>) -> Result<(), MixError> {
        if matches!(self.kind, SourceKind::Monitor(_)) {
            return Err(MixError::BadState(self.state()));
        }
        let period = {
            let ctl = self.ctl.lock();
            if ctl.state != DeviceState::Init {
                return Err(MixError::BadState(ctl.state));
            }
            ctl.configured_latency
        };
        let core = self.core().ok_or(MixError::Unlinked)?;
        let worker = SourceWorker::new(core.pool.clone(), backend, period);
        let io = IoThread::spawn(&format!("source:{}", self.name), move |rx| worker.run(rx))?;
        *self.msgq.lock() = Some(io.msgq().clone());
        *self.io.lock() = Some(io);
        self.ctl.lock().state = DeviceState::Idle;
        core.hooks.source_put.fire(self);
        core.emit(EventFacility::Source, EventKind::New, self.idx());
        info!("source {} up ({})", self.name, self.spec);
        Ok(())
    }

    /// Active une source monitor : elle partage le thread IO du sink.
    pub(crate) fn put_as_monitor(self: &Arc<Self>) -> Result<(), MixError> {
        let SourceKind::Monitor(sink) = &self.kind else {
            return Err(MixError::BadState(self.state()));
        };
        let sink = sink.upgrade().ok_or(MixError::Unlinked)?;
        *self.msgq.lock() = Some(sink.msgq()?);
        self.ctl.lock().state = DeviceState::Idle;
        if let Some(core) = self.core() {
            core.hooks.source_put.fire(self);
            core.emit(EventFacility::Source, EventKind::New, self.idx());
        }
        Ok(())
    }

    /// Détache tout et retire la source des index. Idempotent.
    pub async fn unlink(self: &Arc<Self>) {
        {
            let ctl = self.ctl.lock();
            if ctl.state == DeviceState::Unlinked {
                return;
            }
        }
        let outputs: Vec<Arc<SourceOutput>> = self.ctl.lock().outputs.clone();
        for output in outputs {
            output.kill().await;
        }
        self.ctl.lock().state = DeviceState::Unlinked;
        if let Some(core) = self.core() {
            core.hooks.source_unlink.fire(self);
            core.unregister_source(self.idx());
            core.emit(EventFacility::Source, EventKind::Remove, self.idx());
        }
        *self.msgq.lock() = None;
        let io = self.io.lock().take();
        if let Some(io) = io {
            let _ = tokio::task::spawn_blocking(move || io.shutdown()).await;
        }
        info!("source {} unlinked", self.name);
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

    pub fn is_monitor(&self) -> bool {
        matches!(self.kind, SourceKind::Monitor(_))
    }

    /// Le sink dont cette source est le monitor, le cas échéant.
    pub fn monitor_of(&self) -> Option<Arc<Sink>> {
        match &self.kind {
            SourceKind::Monitor(sink) => sink.upgrade(),
            SourceKind::Standalone => None,
        }
    }

    pub fn proplist(&self) -> Proplist {
        self.ctl.lock().proplist.clone()
    }

    fn msgq(&self) -> Result<AsyncMsgQ, MixError> {
        self.msgq.lock().clone().ok_or(MixError::Unlinked)
    }

    fn post_sink_msg(&self, msg: SinkMsg) -> Result<(), MixError> {
        self.msgq()?.post(None, 0, Some(Box::new(msg)), 0, None)?;
        Ok(())
    }

    fn post_source_msg(&self, msg: SourceMsg) -> Result<(), MixError> {
        self.msgq()?.post(None, 0, Some(Box::new(msg)), 0, None)?;
        Ok(())
    }

    // ---- suspension -------------------------------------------------

    /// Pose ou lève une cause de suspension. Sur un monitor, la
    /// demande est déléguée au sink sous-jacent.
    pub fn suspend(self: &Arc<Self>, cause: SuspendCause, suspend: bool) -> Result<(), MixError> {
        if let SourceKind::Monitor(sink) = &self.kind {
            let sink = sink.upgrade().ok_or(MixError::Unlinked)?;
            return sink.suspend(cause, suspend);
        }
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
            } else if ctl.outputs.iter().any(|o| !o.is_corked()) {
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
        let _ = self.post_source_msg(SourceMsg::SetState(new_state));
        self.changed();
        info!("source {}: state -> {new_state:?}", self.name);
        Ok(())
    }

    /// L'état du sink surveillé a changé : la suspension du monitor le
    /// suit.
    pub(crate) fn track_sink_state(self: &Arc<Self>, sink_state: DeviceState) {
        let mut ctl = self.ctl.lock();
        if !ctl.state.is_linked() {
            return;
        }
        ctl.state = match sink_state {
            DeviceState::Suspended => DeviceState::Suspended,
            _ if ctl.outputs.iter().any(|o| !o.is_corked()) => DeviceState::Running,
            _ => DeviceState::Idle,
        };
    }

    pub(crate) fn update_status(self: &Arc<Self>) {
        let new_state = {
            let mut ctl = self.ctl.lock();
            if !matches!(ctl.state, DeviceState::Idle | DeviceState::Running) {
                return;
            }
            let wanted = if ctl.outputs.iter().any(|o| !o.is_corked()) {
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
        if matches!(self.kind, SourceKind::Standalone) {
            let _ = self.post_source_msg(SourceMsg::SetState(new_state));
        }
        self.changed();
    }

    // ---- attache des flux -------------------------------------------

    pub(crate) fn attach_output(
        self: &Arc<Self>,
        output: &Arc<SourceOutput>,
        render: OutputRender,
    ) -> Result<(), MixError> {
        match &self.kind {
            SourceKind::Monitor(_) => {
                self.post_sink_msg(SinkMsg::AddMonitorOutput(Box::new(render)))?
            }
            SourceKind::Standalone => {
                self.post_source_msg(SourceMsg::AddOutput(Box::new(render)))?
            }
        }
        self.ctl.lock().outputs.push(output.clone());
        self.update_status();
        Ok(())
    }

    pub(crate) async fn detach_output(self: &Arc<Self>, index: u32) -> Option<Box<OutputRender>> {
        let (tx, rx) = oneshot::channel();
        let sent = match &self.kind {
            SourceKind::Monitor(_) => self
                .post_sink_msg(SinkMsg::RemoveMonitorOutput { index, reply: tx })
                .is_ok(),
            SourceKind::Standalone => self
                .post_source_msg(SourceMsg::RemoveOutput { index, reply: tx })
                .is_ok(),
        };
        self.ctl.lock().outputs.retain(|o| o.idx() != index);
        self.update_status();
        if sent {
            rx.await.ok().flatten()
        } else {
            None
        }
    }

    pub(crate) fn cork_output(&self, index: u32, corked: bool) -> Result<(), MixError> {
        match &self.kind {
            SourceKind::Monitor(_) => {
                self.post_sink_msg(SinkMsg::CorkMonitorOutput { index, corked })
            }
            SourceKind::Standalone => {
                self.post_source_msg(SourceMsg::CorkOutput { index, corked })
            }
        }
    }

    pub(crate) fn push_output_soft_volume(&self, index: u32, volume: CVolume, muted: bool) {
        // Le volume de la source compose avec celui du flux.
        let composed = volume.multiply(&self.ctl.lock().volume);
        let muted = muted || self.ctl.lock().muted;
        let _ = match &self.kind {
            SourceKind::Monitor(_) => self.post_sink_msg(SinkMsg::SetMonitorOutputSoftVolume {
                index,
                volume: composed,
                muted,
            }),
            SourceKind::Standalone => self.post_source_msg(SourceMsg::SetOutputSoftVolume {
                index,
                volume: composed,
                muted,
            }),
        };
    }

    pub fn outputs(&self) -> Vec<Arc<SourceOutput>> {
        self.ctl.lock().outputs.clone()
    }

    pub fn linked_by(&self) -> usize {
        self.ctl.lock().outputs.len()
    }

    pub fn used_by(&self) -> usize {
        self.ctl
            .lock()
            .outputs
            .iter()
            .filter(|o| !o.is_corked())
            .count()
    }

    // ---- volume -----------------------------------------------------

    pub fn volume(&self) -> CVolume {
        self.ctl.lock().volume.clone()
    }

    pub fn muted(&self) -> bool {
        self.ctl.lock().muted
    }

    pub fn set_volume(self: &Arc<Self>, volume: &CVolume, _save: bool) {
        {
            let mut ctl = self.ctl.lock();
            ctl.volume = if volume.channels() == self.spec.channels {
                volume.clone()
            } else {
                CVolume::uniform(self.spec.channels, volume.max())
            };
        }
        self.repush_output_volumes();
        self.changed();
    }

    pub fn set_mute(self: &Arc<Self>, muted: bool, _save: bool) {
        {
            let mut ctl = self.ctl.lock();
            if ctl.muted == muted {
                return;
            }
            ctl.muted = muted;
        }
        self.repush_output_volumes();
        self.changed();
    }

    fn repush_output_volumes(self: &Arc<Self>) {
        let outputs = self.outputs();
        for o in outputs {
            let (v, m) = o.soft_volume_for_source(&self.map);
            self.push_output_soft_volume(o.idx(), v, m);
        }
    }

    // ---- latence ----------------------------------------------------

    pub async fn get_latency(&self) -> Result<Duration, MixError> {
        match &self.kind {
            SourceKind::Monitor(sink) => {
                let sink = sink.upgrade().ok_or(MixError::Unlinked)?;
                sink.get_latency().await
            }
            SourceKind::Standalone => {
                let (tx, rx) = oneshot::channel();
                self.msgq()?
                    .send(None, 0, Some(Box::new(SourceMsg::GetLatency { reply: tx })), 0, None)
                    .await?;
                rx.await.map_err(|_| MixError::Unlinked)
            }
        }
    }

    pub fn configured_latency(&self) -> Duration {
        self.ctl.lock().configured_latency
    }

    fn changed(&self) {
        if let Some(core) = self.core() {
            core.emit(EventFacility::Source, EventKind::Change, self.idx());
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("index", &self.idx())
            .field("monitor", &self.is_monitor())
            .field("state", &self.state())
            .finish()
    }
}
