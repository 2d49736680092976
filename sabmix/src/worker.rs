//! Côté thread IO des sinks et sources : l'état `thread_info` et la
//! boucle de rendu.
//!
//! Tout ce qui vit ici appartient exclusivement au thread IO de
//! l'objet. Le plan de contrôle n'y accède que par messages ; les
//! parties de rendu des flux ([`InputRender`], [`OutputRender`]) sont
//! construites côté contrôle puis remises au thread IO dans le message
//! d'attache, et restituées dans la réponse du message de détache.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use sabcore::{CVolume, MemBlockQ, MemChunk, MemPool, SampleSpec, SeekMode};
use sabloop::{AsyncMsgQReceiver, RtPoll, Wakeup};

use crate::converter::Converter;
use crate::error::MixError;
use crate::mix::{self, MixInfo};
use crate::sink::{SinkBackend, SinkEvent};
use crate::sink_input::InputEvent;
use crate::source::SourceBackend;
use crate::source_output::OutputEvent;
use crate::types::DeviceState;

/// Partie rendu d'un sink-input, remise au thread IO à l'attache.
pub struct InputRender {
    pub index: u32,
    pub spec: SampleSpec,
    pub memblockq: MemBlockQ,
    pub converter: Option<Converter>,
    /// Volume doux du flux, déjà remappé dans la géométrie du sink.
    pub soft_volume: CVolume,
    pub muted: bool,
    pub corked: bool,
    pub events: mpsc::UnboundedSender<InputEvent>,
    /// Vues converties (spec du sink) en attente de mixage.
    staging: VecDeque<MemChunk>,
    staged_bytes: usize,
    underrun: bool,
    started: bool,
    drain_tag: Option<u32>,
}

impl InputRender {
    pub fn new(
        index: u32,
        spec: SampleSpec,
        memblockq: MemBlockQ,
        converter: Option<Converter>,
        soft_volume: CVolume,
        muted: bool,
        corked: bool,
        events: mpsc::UnboundedSender<InputEvent>,
    ) -> Self {
        InputRender {
            index,
            spec,
            memblockq,
            converter,
            soft_volume,
            muted,
            corked,
            events,
            staging: VecDeque::new(),
            staged_bytes: 0,
            underrun: true,
            started: false,
            drain_tag: None,
        }
    }

    /// Remplit la zone de conversion jusqu'à `want` octets (spec sink).
    fn fill_staging(&mut self, want: usize, pool: &MemPool) {
        while self.staged_bytes < want {
            let Some(chunk) = self.memblockq.peek() else {
                break;
            };
            if chunk.is_empty() {
                break;
            }
            let len = chunk.length;
            self.memblockq.drop_bytes(len);
            let converted = match &mut self.converter {
                None => chunk,
                Some(conv) => match conv.convert(&chunk, pool) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("input {}: conversion failed: {e}", self.index);
                        continue;
                    }
                },
            };
            if converted.is_empty() {
                continue;
            }
            self.staged_bytes += converted.length;
            self.staging.push_back(converted);
        }
    }

    /// Prochaine vue à mixer, au plus `want` octets. `None` en
    /// sous-alimentation.
    fn peek(&mut self, want: usize, pool: &MemPool) -> Option<MemChunk> {
        self.fill_staging(want, pool);
        let front = self.staging.front()?;
        let mut chunk = front.clone();
        chunk.truncate(want);
        if self.underrun || !self.started {
            self.started = true;
            self.underrun = false;
            let _ = self.events.send(InputEvent::Started);
        }
        Some(chunk)
    }

    /// Consomme `bytes` octets (spec sink) après mixage.
    fn drop_bytes(&mut self, mut bytes: usize) {
        while bytes > 0 {
            let Some(front) = self.staging.front_mut() else {
                break;
            };
            let n = bytes.min(front.length);
            front.advance(n);
            self.staged_bytes -= n;
            bytes -= n;
            if front.is_empty() {
                self.staging.pop_front();
            }
        }
    }

    /// Octets d'entrée équivalents à `sink_bytes` octets de sortie.
    fn to_stream_bytes(&self, sink_bytes: usize, sink_spec: &SampleSpec) -> usize {
        let d = sink_spec.bytes_to_duration(sink_bytes);
        self.spec.duration_to_bytes(d)
    }

    /// Rembobinage : la zone convertie est rejouée intégralement, plus
    /// la portion demandée par le sink, exprimée en octets du flux.
    fn process_rewind(&mut self, sink_bytes: usize, sink_spec: &SampleSpec) {
        let staged = self.staged_bytes;
        self.staging.clear();
        self.staged_bytes = 0;
        let rewind = self.to_stream_bytes(sink_bytes + staged, sink_spec);
        self.memblockq.rewind(rewind);
        trace!("input {}: rewound {} stream bytes", self.index, rewind);
    }

    /// Latence côté flux : file + conversion, en durée.
    fn latency(&self, sink_spec: &SampleSpec) -> Duration {
        self.spec.bytes_to_duration(self.memblockq.len())
            + sink_spec.bytes_to_duration(self.staged_bytes)
    }

    fn post_render(&mut self) {
        let missing = self.memblockq.pop_missing();
        if missing > 0 {
            let _ = self.events.send(InputEvent::RequestBytes(missing));
        }
        if self.memblockq.is_empty() && self.staged_bytes == 0 {
            if let Some(tag) = self.drain_tag.take() {
                let _ = self.events.send(InputEvent::Drained(tag));
            }
        }
    }
}

/// Partie rendu d'un source-output (ou d'une sortie de monitor).
pub struct OutputRender {
    pub index: u32,
    /// Spec du flux côté client.
    pub spec: SampleSpec,
    pub converter: Option<Converter>,
    pub soft_volume: CVolume,
    pub muted: bool,
    pub corked: bool,
    pub events: mpsc::UnboundedSender<OutputEvent>,
}

impl OutputRender {
    /// Pousse une vue capturée vers le propriétaire du flux.
    pub fn push(&mut self, chunk: &MemChunk, pool: &MemPool) {
        if self.corked {
            return;
        }
        let mut out = match &mut self.converter {
            None => chunk.clone(),
            Some(conv) => match conv.convert(chunk, pool) {
                Ok(c) => c,
                Err(e) => {
                    warn!("output {}: conversion failed: {e}", self.index);
                    return;
                }
            },
        };
        if out.is_empty() {
            return;
        }
        if self.muted {
            if out.silence(&self.spec, pool).is_err() {
                return;
            }
        } else if !self.soft_volume.is_norm() {
            if out.make_writable(pool, out.length).is_ok() {
                if let Some(data) = out.bytes_mut() {
                    mix::apply_volume(data, &self.spec, &self.soft_volume);
                }
            }
        }
        let _ = self.events.send(OutputEvent::Data(out));
    }
}

/// Messages du plan de contrôle vers le thread IO d'un sink.
pub enum SinkMsg {
    AddInput(Box<InputRender>),
    RemoveInput {
        index: u32,
        reply: oneshot::Sender<Option<Box<InputRender>>>,
    },
    PostData {
        index: u32,
        offset: i64,
        seek: SeekMode,
        chunk: MemChunk,
    },
    FlushInput {
        index: u32,
    },
    PrebufForce {
        index: u32,
    },
    PrebufDisable {
        index: u32,
    },
    CorkInput {
        index: u32,
        corked: bool,
    },
    DrainInput {
        index: u32,
        tag: u32,
    },
    SetInputSoftVolume {
        index: u32,
        volume: CVolume,
        muted: bool,
    },
    SetSoftVolume(CVolume),
    /// Volume réel à pousser au pilote (sinks à volume matériel) ; le
    /// pilote retourne le résidu à appliquer en logiciel.
    SetRealVolume(CVolume),
    SetMuted(bool),
    SetState(DeviceState),
    SetPeriod(Duration),
    GetLatency {
        reply: oneshot::Sender<Duration>,
    },
    GetInputLatency {
        index: u32,
        reply: oneshot::Sender<Duration>,
    },
    RequestRewind(usize),
    AddMonitorOutput(Box<OutputRender>),
    RemoveMonitorOutput {
        index: u32,
        reply: oneshot::Sender<Option<Box<OutputRender>>>,
    },
    CorkMonitorOutput {
        index: u32,
        corked: bool,
    },
    SetMonitorOutputSoftVolume {
        index: u32,
        volume: CVolume,
        muted: bool,
    },
}

/// Boucle de rendu d'un sink, exécutée sur son thread IO.
pub struct SinkWorker {
    spec: SampleSpec,
    pool: MemPool,
    backend: Box<dyn SinkBackend>,
    inputs: HashMap<u32, InputRender>,
    monitor_outputs: HashMap<u32, OutputRender>,
    soft_volume: CVolume,
    soft_muted: bool,
    state: DeviceState,
    period: Duration,
    rewind_request: usize,
    silence: MemChunk,
    events: mpsc::UnboundedSender<SinkEvent>,
}

impl SinkWorker {
    pub fn new(
        spec: SampleSpec,
        pool: MemPool,
        backend: Box<dyn SinkBackend>,
        soft_volume: CVolume,
        period: Duration,
        events: mpsc::UnboundedSender<SinkEvent>,
    ) -> Self {
        let silence = MemChunk::new(pool.silence_block(&spec));
        SinkWorker {
            spec,
            pool,
            backend,
            inputs: HashMap::new(),
            monitor_outputs: HashMap::new(),
            soft_volume,
            soft_muted: false,
            state: DeviceState::Idle,
            period,
            rewind_request: 0,
            silence,
            events,
        }
    }

    /// Boucle principale : messages, timer de rendu, arrêt.
    pub async fn run(mut self, rx: AsyncMsgQReceiver) {
        let mut poll = RtPoll::new();
        poll.attach_msgq(rx);
        if let Err(e) = self.backend.start().await {
            warn!("sink backend failed to start: {e}");
        }
        poll.set_timer_absolute(Instant::now() + self.period);
        loop {
            match poll.run().await {
                Ok(Wakeup::Msg(msg)) => {
                    if msg.is_shutdown() {
                        break;
                    }
                    let mut msg = msg;
                    let body = msg
                        .payload
                        .take()
                        .and_then(|p| p.downcast::<SinkMsg>().ok());
                    if let Some(body) = body {
                        self.handle(*body, &mut poll).await;
                    }
                    // La réponse du send part une fois le message
                    // réellement traité : barrière de synchronisation.
                    msg.dispatch().await;
                }
                Ok(Wakeup::Timer) => {
                    if self.state.is_opened() {
                        if let Err(e) = self.render_cycle().await {
                            warn!("sink render failed: {e}");
                            let _ = self.events.send(SinkEvent::BackendError(e.to_string()));
                        }
                    }
                    if self.state.is_opened() {
                        poll.set_timer_absolute(Instant::now() + self.period);
                    }
                }
                Ok(Wakeup::Quit) | Err(_) => break,
                Ok(_) => {}
            }
        }
        self.backend.stop().await;
        debug!("sink worker stopped");
    }

    async fn handle(&mut self, msg: SinkMsg, poll: &mut RtPoll) {
        match msg {
            SinkMsg::AddInput(render) => {
                self.inputs.insert(render.index, *render);
            }
            SinkMsg::RemoveInput { index, reply } => {
                let mut render = self.inputs.remove(&index);
                if let Some(r) = render.as_mut() {
                    // Le détache rejoue ce qui était déjà converti :
                    // la portion en vol revient dans la file du flux.
                    let staged = r.staged_bytes;
                    if staged > 0 {
                        r.process_rewind(0, &self.spec);
                    }
                }
                let _ = reply.send(render.map(Box::new));
            }
            SinkMsg::PostData {
                index,
                offset,
                seek,
                chunk,
            } => {
                if let Some(r) = self.inputs.get_mut(&index) {
                    if offset != 0 || seek != SeekMode::Relative {
                        r.memblockq.seek(offset, seek);
                    }
                    if let Err(e) = r.memblockq.push(chunk) {
                        trace!("input {index}: push refused: {e}");
                        let _ = r.events.send(InputEvent::Overflow);
                    }
                }
            }
            SinkMsg::FlushInput { index } => {
                if let Some(r) = self.inputs.get_mut(&index) {
                    r.memblockq.flush_write();
                    r.staging.clear();
                    r.staged_bytes = 0;
                }
            }
            SinkMsg::PrebufForce { index } => {
                if let Some(r) = self.inputs.get_mut(&index) {
                    r.memblockq.prebuf_force();
                }
            }
            SinkMsg::PrebufDisable { index } => {
                if let Some(r) = self.inputs.get_mut(&index) {
                    r.memblockq.prebuf_disable();
                }
            }
            SinkMsg::CorkInput { index, corked } => {
                if let Some(r) = self.inputs.get_mut(&index) {
                    r.corked = corked;
                }
            }
            SinkMsg::DrainInput { index, tag } => {
                if let Some(r) = self.inputs.get_mut(&index) {
                    if r.memblockq.is_empty() && r.staged_bytes == 0 {
                        let _ = r.events.send(InputEvent::Drained(tag));
                    } else {
                        r.drain_tag = Some(tag);
                    }
                }
            }
            SinkMsg::SetInputSoftVolume {
                index,
                volume,
                muted,
            } => {
                if let Some(r) = self.inputs.get_mut(&index) {
                    r.soft_volume = volume;
                    r.muted = muted;
                }
            }
            SinkMsg::SetSoftVolume(v) => {
                self.soft_volume = v;
            }
            SinkMsg::SetRealVolume(v) => {
                self.soft_volume = self.backend.set_volume(&v).await;
            }
            SinkMsg::SetMuted(m) => {
                self.soft_muted = m;
            }
            SinkMsg::SetState(s) => {
                let was_open = self.state.is_opened();
                self.state = s;
                if !was_open && s.is_opened() {
                    poll.set_timer_absolute(Instant::now() + self.period);
                } else if !s.is_opened() {
                    poll.set_timer_disabled();
                }
            }
            SinkMsg::SetPeriod(p) => {
                self.period = p;
            }
            SinkMsg::GetLatency { reply } => {
                let backend = self.backend.latency();
                let staged: usize = self.inputs.values().map(|i| i.staged_bytes).sum();
                let _ = reply.send(backend + self.spec.bytes_to_duration(staged));
            }
            SinkMsg::GetInputLatency { index, reply } => {
                let latency = self
                    .inputs
                    .get(&index)
                    .map(|r| r.latency(&self.spec))
                    .unwrap_or(Duration::ZERO);
                let _ = reply.send(latency);
            }
            SinkMsg::RequestRewind(bytes) => {
                self.rewind_request = self.rewind_request.max(bytes);
            }
            SinkMsg::AddMonitorOutput(render) => {
                self.monitor_outputs.insert(render.index, *render);
            }
            SinkMsg::RemoveMonitorOutput { index, reply } => {
                let _ = reply.send(self.monitor_outputs.remove(&index).map(Box::new));
            }
            SinkMsg::CorkMonitorOutput { index, corked } => {
                if let Some(o) = self.monitor_outputs.get_mut(&index) {
                    o.corked = corked;
                }
            }
            SinkMsg::SetMonitorOutputSoftVolume {
                index,
                volume,
                muted,
            } => {
                if let Some(o) = self.monitor_outputs.get_mut(&index) {
                    o.soft_volume = volume;
                    o.muted = muted;
                }
            }
        }
    }

    /// Une période de rendu : rewind en attente, peek des flux, mixage,
    /// drop, monitor, écriture pilote.
    async fn render_cycle(&mut self) -> Result<(), MixError> {
        if self.rewind_request > 0 {
            let n = self.rewind_request;
            self.rewind_request = 0;
            for r in self.inputs.values_mut() {
                r.process_rewind(n, &self.spec);
            }
        }

        let mut length = self
            .spec
            .align_down(self.spec.duration_to_bytes(self.period))
            .max(self.spec.frame_size());
        length = length.min(self.spec.align_down(self.pool.block_size_max()));

        // Peek de chaque flux actif ; la longueur se resserre sur la
        // plus courte contribution non vide. Les vues de silence sont
        // écartées du mixage mais consommées comme les autres.
        let mut contributors: Vec<(u32, MemChunk)> = Vec::new();
        let mut peeked: Vec<u32> = Vec::new();
        let mut underruns: Vec<u32> = Vec::new();
        for (idx, r) in self.inputs.iter_mut() {
            if r.corked {
                continue;
            }
            match r.peek(length, &self.pool) {
                Some(chunk) if !chunk.is_silence() => {
                    length = length.min(chunk.length);
                    peeked.push(*idx);
                    contributors.push((*idx, chunk));
                }
                Some(_) => peeked.push(*idx),
                None => underruns.push(*idx),
            }
        }
        for idx in underruns {
            if let Some(r) = self.inputs.get_mut(&idx) {
                if !r.underrun && r.started {
                    r.underrun = true;
                    let _ = r.events.send(InputEvent::Underflow);
                }
            }
        }

        let result = match contributors.len() {
            0 => {
                let mut chunk = self.silence.clone();
                chunk.truncate(length);
                chunk
            }
            1 => {
                let (idx, chunk) = &contributors[0];
                let r = &self.inputs[idx];
                let volume = mix::effective_volume(&r.soft_volume, &self.soft_volume, r.muted);
                if self.soft_muted || mix::is_effectively_muted(&volume) {
                    let mut c = self.silence.clone();
                    c.truncate(length);
                    c
                } else {
                    let mut c = chunk.clone();
                    c.truncate(length);
                    if !volume.is_norm() {
                        c.make_writable(&self.pool, c.length)?;
                        if let Some(data) = c.bytes_mut() {
                            mix::apply_volume(data, &self.spec, &volume);
                        }
                    }
                    c
                }
            }
            _ => {
                let infos: Vec<MixInfo> = contributors
                    .iter()
                    .map(|(idx, chunk)| {
                        let r = &self.inputs[idx];
                        let mut c = chunk.clone();
                        c.truncate(length);
                        MixInfo {
                            chunk: c,
                            volume: r.soft_volume.clone(),
                            muted: r.muted,
                        }
                    })
                    .collect();
                let mut block = match self.pool.alloc(length) {
                    Ok(b) => b,
                    Err(_) => self.pool.alloc_appended(length),
                };
                {
                    let data = block.try_mut().ok_or_else(|| {
                        MixError::Incompatible("fresh mix block not writable".into())
                    })?;
                    mix::mix_into(
                        &infos,
                        &self.spec,
                        data,
                        &self.soft_volume,
                        self.soft_muted,
                    );
                }
                MemChunk::new(block)
            }
        };

        for idx in &peeked {
            if let Some(r) = self.inputs.get_mut(idx) {
                r.drop_bytes(length);
            }
        }

        for o in self.monitor_outputs.values_mut() {
            o.push(&result, &self.pool);
        }

        self.backend.write(&result).await?;

        for r in self.inputs.values_mut() {
            if !r.corked {
                r.post_render();
            }
        }
        Ok(())
    }
}

/// Messages du plan de contrôle vers le thread IO d'une source
/// autonome.
pub enum SourceMsg {
    AddOutput(Box<OutputRender>),
    RemoveOutput {
        index: u32,
        reply: oneshot::Sender<Option<Box<OutputRender>>>,
    },
    CorkOutput {
        index: u32,
        corked: bool,
    },
    SetOutputSoftVolume {
        index: u32,
        volume: CVolume,
        muted: bool,
    },
    SetState(DeviceState),
    SetPeriod(Duration),
    GetLatency {
        reply: oneshot::Sender<Duration>,
    },
}

/// Boucle de capture d'une source autonome (non-monitor).
pub struct SourceWorker {
    pool: MemPool,
    backend: Box<dyn SourceBackend>,
    outputs: HashMap<u32, OutputRender>,
    state: DeviceState,
    period: Duration,
}

impl SourceWorker {
    pub fn new(pool: MemPool, backend: Box<dyn SourceBackend>, period: Duration) -> Self {
        SourceWorker {
            pool,
            backend,
            outputs: HashMap::new(),
            state: DeviceState::Idle,
            period,
        }
    }

    pub async fn run(mut self, rx: AsyncMsgQReceiver) {
        let mut poll = RtPoll::new();
        poll.attach_msgq(rx);
        if let Err(e) = self.backend.start().await {
            warn!("source backend failed to start: {e}");
        }
        poll.set_timer_absolute(Instant::now() + self.period);
        loop {
            match poll.run().await {
                Ok(Wakeup::Msg(msg)) => {
                    if msg.is_shutdown() {
                        break;
                    }
                    let mut msg = msg;
                    let body = msg
                        .payload
                        .take()
                        .and_then(|p| p.downcast::<SourceMsg>().ok());
                    if let Some(body) = body {
                        self.handle(*body, &mut poll);
                    }
                    msg.dispatch().await;
                }
                Ok(Wakeup::Timer) => {
                    if self.state.is_opened() {
                        match self.backend.read(self.period, &self.pool).await {
                            Ok(chunk) if !chunk.is_empty() => {
                                for o in self.outputs.values_mut() {
                                    o.push(&chunk, &self.pool);
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!("source read failed: {e}"),
                        }
                        poll.set_timer_absolute(Instant::now() + self.period);
                    }
                }
                Ok(Wakeup::Quit) | Err(_) => break,
                Ok(_) => {}
            }
        }
        self.backend.stop().await;
        debug!("source worker stopped");
    }

    fn handle(&mut self, msg: SourceMsg, poll: &mut RtPoll) {
        match msg {
            SourceMsg::AddOutput(render) => {
                self.outputs.insert(render.index, *render);
            }
            SourceMsg::RemoveOutput { index, reply } => {
                let _ = reply.send(self.outputs.remove(&index).map(Box::new));
            }
            SourceMsg::CorkOutput { index, corked } => {
                if let Some(o) = self.outputs.get_mut(&index) {
                    o.corked = corked;
                }
            }
            SourceMsg::SetOutputSoftVolume {
                index,
                volume,
                muted,
            } => {
                if let Some(o) = self.outputs.get_mut(&index) {
                    o.soft_volume = volume;
                    o.muted = muted;
                }
            }
            SourceMsg::SetState(s) => {
                let was_open = self.state.is_opened();
                self.state = s;
                if !was_open && s.is_opened() {
                    poll.set_timer_absolute(Instant::now() + self.period);
                } else if !s.is_opened() {
                    poll.set_timer_disabled();
                }
            }
            SourceMsg::SetPeriod(p) => {
                self.period = p;
            }
            SourceMsg::GetLatency { reply } => {
                let _ = reply.send(self.backend.latency());
            }
        }
    }
}
