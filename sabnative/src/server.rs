//! Server side of the native protocol.
//!
//! One task per connection. Inbound control packets go through the
//! dispatcher's command table; audio frames are routed to the playback
//! stream owning their channel. Outbound traffic (replies, server
//! events, record data) goes back over the same packet stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sabcore::{memblockq::BlockQAttr, SeekMode, UpdateMode, INVALID_INDEX};
use sabmix::{
    ChangeEvent, Client, Core, HookSlot, InputEvent, OutputEvent, Sink, SinkInput,
    SinkInputNewData, Source, SourceOutput, SourceOutputNewData, SuspendCause,
};
use sabwire::{
    cookie, Command, ErrCode, PDispatch, PStream, PStreamEvent, TagStruct, COOKIE_SIZE,
    PROTOCOL_VERSION,
};

use crate::address::ServerAddress;
use crate::error::NativeError;

/// Name advertised in GET_SERVER_INFO.
const SERVER_NAME: &str = "sabine";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The protocol listener.
pub struct NativeServer {
    address: ServerAddress,
    exit: CancellationToken,
    stop: CancellationToken,
    bound_port: Option<u16>,
}

impl NativeServer {
    /// Binds and starts accepting connections.
    pub async fn bind(
        core: Arc<Core>,
        address: ServerAddress,
        auth_cookie: [u8; COOKIE_SIZE],
    ) -> Result<NativeServer, NativeError> {
        let exit = CancellationToken::new();
        let stop = CancellationToken::new();
        let bound_port;
        match &address {
            ServerAddress::Unix(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                bound_port = None;
                accept_loop(listener, core, auth_cookie, exit.clone(), stop.clone());
            }
            ServerAddress::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                bound_port = Some(listener.local_addr()?.port());
                accept_loop_tcp(listener, core, auth_cookie, exit.clone(), stop.clone());
            }
        }
        info!("native protocol listening on {address}");
        Ok(NativeServer {
            address,
            exit,
            stop,
            bound_port,
        })
    }

    /// The TCP port actually bound (for ephemeral binds).
    pub fn port(&self) -> Option<u16> {
        self.bound_port
    }

    /// Cancelled once a client has requested server exit.
    pub fn exit_requested(&self) -> CancellationToken {
        self.exit.clone()
    }

    pub fn shutdown(&self) {
        self.stop.cancel();
        if let ServerAddress::Unix(path) = &self.address {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn accept_loop(
    listener: UnixListener,
    core: Arc<Core>,
    auth_cookie: [u8; COOKIE_SIZE],
    exit: CancellationToken,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => spawn_connection(core.clone(), stream, auth_cookie, exit.clone()),
                    Err(e) => {
                        warn!("accept failed: {e}");
                        break;
                    }
                },
                _ = stop.cancelled() => break,
            }
        }
    });
}

fn accept_loop_tcp(
    listener: TcpListener,
    core: Arc<Core>,
    auth_cookie: [u8; COOKIE_SIZE],
    exit: CancellationToken,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("connection from {peer}");
                        let _ = stream.set_nodelay(true);
                        spawn_connection(core.clone(), stream, auth_cookie, exit.clone());
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        break;
                    }
                },
                _ = stop.cancelled() => break,
            }
        }
    });
}

fn spawn_connection<S>(
    core: Arc<Core>,
    stream: S,
    auth_cookie: [u8; COOKIE_SIZE],
    exit: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        let connection = Connection::new(core, stream, auth_cookie, exit);
        connection.run().await;
    });
}

/// Internal events funnelled into the connection task.
enum ConnEvent {
    Command(u32, u32, TagStruct),
    Input(u32, InputEvent),
    Output(u32, OutputEvent),
    Change(ChangeEvent),
}

struct Connection {
    core: Arc<Core>,
    auth_cookie: [u8; COOKIE_SIZE],
    exit: CancellationToken,
    pstream: PStream,
    pstream_rx: mpsc::UnboundedReceiver<PStreamEvent>,
    pdispatch: PDispatch,
    conn_rx: mpsc::UnboundedReceiver<ConnEvent>,
    conn_tx: mpsc::UnboundedSender<ConnEvent>,
    authed: bool,
    client: Option<Arc<Client>>,
    playback: HashMap<u32, Arc<SinkInput>>,
    record: HashMap<u32, Arc<SourceOutput>>,
    next_channel: u32,
    server_tag: u32,
    /// Drain en attente : tag interne → tag client.
    drains: HashMap<u32, u32>,
    next_drain: u32,
    subscribe_mask: u32,
    subscription: Option<HookSlot<ChangeEvent>>,
}

impl Connection {
    fn new<S>(
        core: Arc<Core>,
        stream: S,
        auth_cookie: [u8; COOKIE_SIZE],
        exit: CancellationToken,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (pstream, pstream_rx) = PStream::new(stream, core.pool.clone());
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let pdispatch = PDispatch::new();
        // Toute commande entrante est reroutée vers la boucle de la
        // connexion ; le repli attrape aussi les codes inconnus.
        let tx = conn_tx.clone();
        pdispatch.set_fallback(move |code, tag, ts| {
            let _ = tx.send(ConnEvent::Command(code, tag, ts));
        });
        Connection {
            core,
            auth_cookie,
            exit,
            pstream,
            pstream_rx,
            pdispatch,
            conn_rx,
            conn_tx,
            authed: false,
            client: None,
            playback: HashMap::new(),
            record: HashMap::new(),
            next_channel: 0,
            server_tag: 0,
            drains: HashMap::new(),
            next_drain: 0,
            subscribe_mask: 0,
            subscription: None,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.pstream_rx.recv() => match event {
                    Some(PStreamEvent::Packet(packet)) => {
                        if let Err(e) = self.pdispatch.run(&packet) {
                            warn!("protocol violation: {e}");
                            break;
                        }
                    }
                    Some(PStreamEvent::MemBlock { channel, offset, seek, chunk }) => {
                        self.handle_audio(channel, offset, seek, chunk);
                    }
                    Some(PStreamEvent::Drained) => {}
                    Some(PStreamEvent::Died(e)) => {
                        debug!("connection died: {e}");
                        break;
                    }
                    None => break,
                },
                event = self.conn_rx.recv() => match event {
                    Some(ev) => {
                        if !self.handle_event(ev).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        self.teardown().await;
    }

    async fn teardown(mut self) {
        self.subscription.take();
        let playback: Vec<_> = self.playback.drain().map(|(_, i)| i).collect();
        for input in playback {
            input.unlink().await;
        }
        let record: Vec<_> = self.record.drain().map(|(_, o)| o).collect();
        for output in record {
            output.unlink().await;
        }
        if let Some(client) = self.client.take() {
            client.unlink();
        }
        debug!("connection closed");
    }

    /// `false` termine la connexion.
    async fn handle_event(&mut self, event: ConnEvent) -> bool {
        match event {
            ConnEvent::Command(code, tag, ts) => self.handle_command(code, tag, ts).await,
            ConnEvent::Input(channel, event) => {
                self.handle_input_event(channel, event);
                true
            }
            ConnEvent::Output(channel, event) => {
                self.handle_output_event(channel, event);
                true
            }
            ConnEvent::Change(change) => {
                if self.subscribe_mask & (1u32 << change.facility as u32) != 0 {
                    let mut ts = self.event_tagstruct(Command::SubscribeEvent);
                    ts.put_u32(change.facility as u32)
                        .put_u32(change.kind as u32)
                        .put_u32(change.index);
                    let _ = self.pstream.send_packet(ts.into_packet());
                }
                true
            }
        }
    }

    fn handle_audio(&mut self, channel: u32, offset: i64, seek: SeekMode, chunk: sabcore::MemChunk) {
        match self.playback.get(&channel) {
            Some(input) => {
                if let Err(e) = input.write(offset, seek, chunk) {
                    debug!("channel {channel}: write failed: {e}");
                }
            }
            None => debug!("audio frame for unknown channel {channel}"),
        }
    }

    fn handle_input_event(&mut self, channel: u32, event: InputEvent) {
        match event {
            InputEvent::RequestBytes(bytes) => {
                let mut ts = self.event_tagstruct(Command::Request);
                ts.put_u32(channel).put_u32(bytes as u32);
                let _ = self.pstream.send_packet(ts.into_packet());
            }
            InputEvent::Underflow => {
                let mut ts = self.event_tagstruct(Command::PlaybackStreamUnderflow);
                ts.put_u32(channel);
                let _ = self.pstream.send_packet(ts.into_packet());
            }
            InputEvent::Overflow => {
                let mut ts = self.event_tagstruct(Command::PlaybackStreamOverflow);
                ts.put_u32(channel);
                let _ = self.pstream.send_packet(ts.into_packet());
            }
            InputEvent::Started => {
                let mut ts = self.event_tagstruct(Command::PlaybackStreamStarted);
                ts.put_u32(channel);
                let _ = self.pstream.send_packet(ts.into_packet());
            }
            InputEvent::Drained(drain_tag) => {
                if let Some(client_tag) = self.drains.remove(&drain_tag) {
                    self.send_reply_empty(client_tag);
                }
            }
            InputEvent::Killed => {
                if self.playback.remove(&channel).is_some() {
                    let mut ts = self.event_tagstruct(Command::PlaybackStreamKilled);
                    ts.put_u32(channel);
                    let _ = self.pstream.send_packet(ts.into_packet());
                }
            }
        }
    }

    fn handle_output_event(&mut self, channel: u32, event: OutputEvent) {
        match event {
            OutputEvent::Data(chunk) => {
                let _ = self
                    .pstream
                    .send_memblock(channel, 0, SeekMode::Relative, chunk);
            }
            OutputEvent::Killed => {
                if self.record.remove(&channel).is_some() {
                    let mut ts = self.event_tagstruct(Command::RecordStreamKilled);
                    ts.put_u32(channel);
                    let _ = self.pstream.send_packet(ts.into_packet());
                }
            }
        }
    }

    // ---- émission ---------------------------------------------------

    fn reply_tagstruct(&self, tag: u32) -> TagStruct {
        let mut ts = TagStruct::new();
        ts.put_u32(Command::Reply as u32).put_u32(tag);
        ts
    }

    fn event_tagstruct(&mut self, command: Command) -> TagStruct {
        self.server_tag = self.server_tag.wrapping_add(1);
        let mut ts = TagStruct::new();
        ts.put_u32(command as u32).put_u32(self.server_tag);
        ts
    }

    fn send_reply(&self, ts: TagStruct) {
        let _ = self.pstream.send_packet(ts.into_packet());
    }

    fn send_reply_empty(&self, tag: u32) {
        self.send_reply(self.reply_tagstruct(tag));
    }

    fn send_error(&self, tag: u32, code: ErrCode) {
        let mut ts = TagStruct::new();
        ts.put_u32(Command::Error as u32)
            .put_u32(tag)
            .put_u32(code as u32);
        let _ = self.pstream.send_packet(ts.into_packet());
    }

    fn finish(&self, tag: u32, result: Result<TagStruct, ErrCode>) {
        match result {
            Ok(reply) => self.send_reply(reply),
            Err(code) => self.send_error(tag, code),
        }
    }

    // ---- aiguillage -------------------------------------------------

    /// `false` termine la connexion.
    async fn handle_command(&mut self, code: u32, tag: u32, ts: TagStruct) -> bool {
        let command = Command::from_wire(code);
        if !self.authed && command != Some(Command::Auth) {
            self.send_error(tag, ErrCode::Access);
            return false;
        }
        use Command::*;
        match command {
            Some(Auth) => self.cmd_auth(tag, ts),
            Some(SetClientName) => {
                let r = self.cmd_set_client_name(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(CreatePlaybackStream) => {
                let r = self.cmd_create_playback(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(DeletePlaybackStream) => {
                let r = self.cmd_delete_playback(tag, ts).await;
                self.finish(tag, r);
                true
            }
            Some(CreateRecordStream) => {
                let r = self.cmd_create_record(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(DeleteRecordStream) => {
                let r = self.cmd_delete_record(tag, ts).await;
                self.finish(tag, r);
                true
            }
            Some(DrainPlaybackStream) => {
                if let Err(code) = self.cmd_drain_playback(tag, ts) {
                    self.send_error(tag, code);
                }
                // La réponse part quand la file est vide.
                true
            }
            Some(Stat) => {
                let r = self.cmd_stat(tag);
                self.finish(tag, r);
                true
            }
            Some(GetPlaybackLatency) => {
                let r = self.cmd_playback_latency(tag, ts).await;
                self.finish(tag, r);
                true
            }
            Some(GetRecordLatency) => {
                let r = self.cmd_record_latency(tag, ts).await;
                self.finish(tag, r);
                true
            }
            Some(LookupSink) => {
                let r = self.cmd_lookup_sink(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(LookupSource) => {
                let r = self.cmd_lookup_source(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(GetServerInfo) => {
                let r = self.cmd_server_info(tag);
                self.finish(tag, r);
                true
            }
            Some(GetSinkInfo) => {
                let r = self.cmd_sink_info(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(GetSinkInfoList) => {
                let mut reply = self.reply_tagstruct(tag);
                for sink in self.core.sinks() {
                    put_sink_info(&mut reply, &sink);
                }
                self.send_reply(reply);
                true
            }
            Some(GetSourceInfo) => {
                let r = self.cmd_source_info(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(GetSourceInfoList) => {
                let mut reply = self.reply_tagstruct(tag);
                for source in self.core.sources() {
                    put_source_info(&mut reply, &source);
                }
                self.send_reply(reply);
                true
            }
            Some(GetClientInfo) => {
                let r = self.cmd_client_info(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(GetClientInfoList) => {
                let mut reply = self.reply_tagstruct(tag);
                for client in self.core.clients() {
                    put_client_info(&mut reply, &client);
                }
                self.send_reply(reply);
                true
            }
            Some(GetSinkInputInfo) => {
                let r = self.cmd_sink_input_info(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(GetSinkInputInfoList) => {
                let mut reply = self.reply_tagstruct(tag);
                for input in self.core.sink_inputs() {
                    put_sink_input_info(&mut reply, &input);
                }
                self.send_reply(reply);
                true
            }
            Some(GetSourceOutputInfo) => {
                let r = self.cmd_source_output_info(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(GetSourceOutputInfoList) => {
                let mut reply = self.reply_tagstruct(tag);
                for output in self.core.source_outputs() {
                    put_source_output_info(&mut reply, &output);
                }
                self.send_reply(reply);
                true
            }
            Some(GetModuleInfo) => {
                let r = self.cmd_module_info(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(GetModuleInfoList) => {
                let mut reply = self.reply_tagstruct(tag);
                for module in self.core.modules() {
                    put_module_info(&mut reply, &module);
                }
                self.send_reply(reply);
                true
            }
            Some(Subscribe) => {
                let r = self.cmd_subscribe(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(SetSinkVolume) => {
                let r = self.cmd_set_sink_volume(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(SetSinkMute) => {
                let r = self.cmd_set_sink_mute(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(SetSourceVolume) => {
                let r = self.cmd_set_source_volume(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(SetSourceMute) => {
                let r = self.cmd_set_source_mute(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(SetSinkInputVolume) => {
                let r = self.cmd_set_sink_input_volume(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(SetSinkInputMute) => {
                let r = self.cmd_set_sink_input_mute(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(CorkPlaybackStream) => {
                let r = self.cmd_cork_playback(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(FlushPlaybackStream) => {
                let r = self.playback_simple_op(tag, ts, |input| input.flush());
                self.finish(tag, r);
                true
            }
            Some(TriggerPlaybackStream) => {
                let r = self.playback_simple_op(tag, ts, |input| input.trigger());
                self.finish(tag, r);
                true
            }
            Some(PrebufPlaybackStream) => {
                let r = self.playback_simple_op(tag, ts, |input| input.prebuf_force());
                self.finish(tag, r);
                true
            }
            Some(CorkRecordStream) => {
                let r = self.cmd_cork_record(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(FlushRecordStream) => {
                // La capture n'a pas de file côté serveur.
                let r = self.require_record(ts).map(|_| self.reply_tagstruct(tag));
                self.finish(tag, r);
                true
            }
            Some(MoveSinkInput) => {
                let r = self.cmd_move_sink_input(tag, ts).await;
                self.finish(tag, r);
                true
            }
            Some(MoveSourceOutput) => {
                let r = self.cmd_move_source_output(tag, ts).await;
                self.finish(tag, r);
                true
            }
            Some(SuspendSink) => {
                let r = self.cmd_suspend_sink(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(SuspendSource) => {
                let r = self.cmd_suspend_source(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(SetDefaultSink) => {
                let r = self.cmd_set_default(tag, ts, true);
                self.finish(tag, r);
                true
            }
            Some(SetDefaultSource) => {
                let r = self.cmd_set_default(tag, ts, false);
                self.finish(tag, r);
                true
            }
            Some(KillClient) => {
                let r = self.cmd_kill_client(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(KillSinkInput) => {
                let r = self.cmd_kill_sink_input(tag, ts).await;
                self.finish(tag, r);
                true
            }
            Some(KillSourceOutput) => {
                let r = self.cmd_kill_source_output(tag, ts).await;
                self.finish(tag, r);
                true
            }
            Some(SetStreamBufferAttr) => {
                let r = self.cmd_set_buffer_attr(tag, ts);
                self.finish(tag, r);
                true
            }
            Some(SetPlaybackStreamName) => {
                let r = self.cmd_set_stream_name(tag, ts, true);
                self.finish(tag, r);
                true
            }
            Some(SetRecordStreamName) => {
                let r = self.cmd_set_stream_name(tag, ts, false);
                self.finish(tag, r);
                true
            }
            Some(Exit) => {
                self.send_reply_empty(tag);
                info!("client requested server exit");
                self.exit.cancel();
                true
            }
            // Le cache d'échantillons est un collaborateur externe.
            Some(
                CreateUploadStream | DeleteUploadStream | FinishUploadStream | PlaySample
                | RemoveSample,
            ) => {
                self.send_error(tag, ErrCode::NotSupported);
                true
            }
            _ => {
                self.send_error(tag, ErrCode::Command);
                true
            }
        }
    }

    // ---- implémentations --------------------------------------------

    /// AUTH : version du client puis cookie de 256 octets, comparé à
    /// temps constant. `false` ferme la connexion.
    fn cmd_auth(&mut self, tag: u32, mut ts: TagStruct) -> bool {
        let parsed = (|| -> Result<(u32, Vec<u8>), ErrCode> {
            let version = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
            let blob = ts.get_arbitrary().map_err(|_| ErrCode::Protocol)?;
            Ok((version, blob))
        })();
        match parsed {
            Ok((version, blob)) => {
                if blob.len() != COOKIE_SIZE || !cookie::matches(&blob, &self.auth_cookie) {
                    warn!("auth failure (client version {version})");
                    self.send_error(tag, ErrCode::Access);
                    return false;
                }
                let mut reply = self.reply_tagstruct(tag);
                reply.put_u32(PROTOCOL_VERSION).put_u32(0);
                self.send_reply(reply);
                self.authed = true;
                debug!("client authenticated (version {version})");
                true
            }
            Err(code) => {
                self.send_error(tag, code);
                false
            }
        }
    }

    fn cmd_set_client_name(&mut self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let props = ts.get_proplist().map_err(|_| ErrCode::Protocol)?;
        let index = match &self.client {
            Some(client) => {
                client.update_proplist(UpdateMode::Replace, &props);
                client.idx()
            }
            None => {
                let client = Client::new(&self.core, "native", props);
                let index = client.idx();
                self.client = Some(client);
                index
            }
        };
        let mut reply = self.reply_tagstruct(tag);
        reply.put_u32(index);
        Ok(reply)
    }

    fn cmd_create_playback(&mut self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let sink_name = ts.get_string().map_err(|_| ErrCode::Protocol)?;
        let spec = ts.get_sample_spec().map_err(|_| ErrCode::Protocol)?;
        let map = ts.get_channel_map().map_err(|_| ErrCode::Protocol)?;
        let maxlength = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let tlength = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let prebuf = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let minreq = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let volume = ts.get_cvolume().map_err(|_| ErrCode::Protocol)?;
        let corked = ts.get_bool().map_err(|_| ErrCode::Protocol)?;
        let props = ts.get_proplist().map_err(|_| ErrCode::Protocol)?;

        let sink = match &sink_name {
            Some(name) => self.core.sink_by_name(name).ok_or(ErrCode::NoEntity)?,
            None => self.core.default_sink().ok_or(ErrCode::NoEntity)?,
        };

        let mut data = SinkInputNewData::new(spec).map_err(|_| ErrCode::Invalid)?;
        data.map = map;
        data.attr = BlockQAttr {
            maxlength: maxlength as usize,
            tlength: tlength as usize,
            prebuf: prebuf as usize,
            minreq: minreq as usize,
        }
        .sanitize(spec.frame_size());
        data.volume = Some(volume);
        data.corked = corked;
        data.proplist = props;
        data.client = self.client.as_ref().map(|c| c.idx());

        let (input, mut events) = SinkInput::new(&self.core, data).map_err(|_| ErrCode::Invalid)?;
        input.put(&sink).map_err(|e| {
            debug!("playback stream rejected: {e}");
            ErrCode::Invalid
        })?;

        let channel = self.next_channel;
        self.next_channel += 1;
        // Les événements du thread IO rejoignent la boucle de la
        // connexion, étiquetés par canal.
        let tx = self.conn_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                if tx.send(ConnEvent::Input(channel, ev)).is_err() {
                    break;
                }
            }
        });

        let attr = input.attr();
        self.playback.insert(channel, input.clone());

        let mut reply = self.reply_tagstruct(tag);
        reply
            .put_u32(channel)
            .put_u32(input.idx())
            .put_u32(sink.idx())
            .put_u32(attr.maxlength as u32)
            .put_u32(attr.tlength as u32)
            .put_u32(attr.prebuf as u32)
            .put_u32(attr.minreq as u32)
            .put_string(Some(&sink.name));
        // Première demande d'octets, sans attendre le cycle de rendu.
        let mut request = self.event_tagstruct(Command::Request);
        request.put_u32(channel).put_u32(attr.tlength as u32);
        let _ = self.pstream.send_packet(request.into_packet());
        Ok(reply)
    }

    async fn cmd_delete_playback(&mut self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let channel = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let input = self.playback.remove(&channel).ok_or(ErrCode::NoEntity)?;
        input.unlink().await;
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_create_record(&mut self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let source_name = ts.get_string().map_err(|_| ErrCode::Protocol)?;
        let spec = ts.get_sample_spec().map_err(|_| ErrCode::Protocol)?;
        let map = ts.get_channel_map().map_err(|_| ErrCode::Protocol)?;
        let _maxlength = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let fragsize = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let corked = ts.get_bool().map_err(|_| ErrCode::Protocol)?;
        let props = ts.get_proplist().map_err(|_| ErrCode::Protocol)?;

        let source = match &source_name {
            Some(name) => self.core.source_by_name(name).ok_or(ErrCode::NoEntity)?,
            None => self.core.default_source().ok_or(ErrCode::NoEntity)?,
        };

        let mut data = SourceOutputNewData::new(spec).map_err(|_| ErrCode::Invalid)?;
        data.map = map;
        data.corked = corked;
        data.proplist = props;
        data.client = self.client.as_ref().map(|c| c.idx());

        let (output, mut events) =
            SourceOutput::new(&self.core, data).map_err(|_| ErrCode::Invalid)?;
        output.put(&source).map_err(|e| {
            debug!("record stream rejected: {e}");
            ErrCode::Invalid
        })?;

        let channel = self.next_channel;
        self.next_channel += 1;
        let tx = self.conn_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                if tx.send(ConnEvent::Output(channel, ev)).is_err() {
                    break;
                }
            }
        });
        self.record.insert(channel, output.clone());

        let mut reply = self.reply_tagstruct(tag);
        reply
            .put_u32(channel)
            .put_u32(output.idx())
            .put_u32(source.idx())
            .put_u32(_maxlength)
            .put_u32(fragsize)
            .put_string(Some(&source.name));
        Ok(reply)
    }

    async fn cmd_delete_record(&mut self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let channel = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let output = self.record.remove(&channel).ok_or(ErrCode::NoEntity)?;
        output.unlink().await;
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_drain_playback(&mut self, tag: u32, mut ts: TagStruct) -> Result<(), ErrCode> {
        let channel = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let input = self.playback.get(&channel).ok_or(ErrCode::NoEntity)?;
        let drain_tag = self.next_drain;
        self.next_drain = self.next_drain.wrapping_add(1);
        input.drain(drain_tag).map_err(|_| ErrCode::Internal)?;
        self.drains.insert(drain_tag, tag);
        Ok(())
    }

    fn cmd_stat(&self, tag: u32) -> Result<TagStruct, ErrCode> {
        let stats = self.core.pool.stats();
        let mut reply = self.reply_tagstruct(tag);
        reply
            .put_u32(stats.total_allocated() as u32)
            .put_u32(stats.total_size() as u32)
            .put_u32(stats.total_accumulated() as u32)
            .put_u32(stats.total_accumulated_size() as u32)
            .put_u32(0);
        Ok(reply)
    }

    async fn cmd_playback_latency(&mut self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let channel = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let (sec, usec) = ts.get_timeval().map_err(|_| ErrCode::Protocol)?;
        let input = self.playback.get(&channel).ok_or(ErrCode::NoEntity)?.clone();
        let (own, device) = input.get_latency().await.map_err(|_| ErrCode::Internal)?;
        let mut reply = self.reply_tagstruct(tag);
        reply
            .put_u64(own.as_micros() as u64)
            .put_u64(device.as_micros() as u64)
            .put_bool(input.state() == sabmix::StreamState::Running)
            .put_timeval(sec, usec);
        Ok(reply)
    }

    async fn cmd_record_latency(&mut self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let channel = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let (sec, usec) = ts.get_timeval().map_err(|_| ErrCode::Protocol)?;
        let output = self.record.get(&channel).ok_or(ErrCode::NoEntity)?.clone();
        let source = output.source().ok_or(ErrCode::NoEntity)?;
        let device = source.get_latency().await.map_err(|_| ErrCode::Internal)?;
        let mut reply = self.reply_tagstruct(tag);
        reply
            .put_u64(0)
            .put_u64(device.as_micros() as u64)
            .put_bool(output.state() == sabmix::StreamState::Running)
            .put_timeval(sec, usec);
        Ok(reply)
    }

    fn cmd_lookup_sink(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let name = ts.get_string_non_null().map_err(|_| ErrCode::Protocol)?;
        let sink = self.core.sink_by_name(&name).ok_or(ErrCode::NoEntity)?;
        let mut reply = self.reply_tagstruct(tag);
        reply.put_u32(sink.idx());
        Ok(reply)
    }

    fn cmd_lookup_source(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let name = ts.get_string_non_null().map_err(|_| ErrCode::Protocol)?;
        let source = self.core.source_by_name(&name).ok_or(ErrCode::NoEntity)?;
        let mut reply = self.reply_tagstruct(tag);
        reply.put_u32(source.idx());
        Ok(reply)
    }

    fn cmd_server_info(&self, tag: u32) -> Result<TagStruct, ErrCode> {
        let mut reply = self.reply_tagstruct(tag);
        reply
            .put_string(Some(SERVER_NAME))
            .put_string(Some(SERVER_VERSION))
            .put_string(self.core.default_sink().map(|s| s.name.clone()).as_deref())
            .put_string(self.core.default_source().map(|s| s.name.clone()).as_deref())
            .put_u32(PROTOCOL_VERSION);
        Ok(reply)
    }

    fn cmd_sink_info(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let sink = self.lookup_sink_ref(&mut ts)?;
        let mut reply = self.reply_tagstruct(tag);
        put_sink_info(&mut reply, &sink);
        Ok(reply)
    }

    fn cmd_source_info(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let source = self.lookup_source_ref(&mut ts)?;
        let mut reply = self.reply_tagstruct(tag);
        put_source_info(&mut reply, &source);
        Ok(reply)
    }

    fn cmd_client_info(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let index = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let client = self.core.client_by_index(index).ok_or(ErrCode::NoEntity)?;
        let mut reply = self.reply_tagstruct(tag);
        put_client_info(&mut reply, &client);
        Ok(reply)
    }

    fn cmd_sink_input_info(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let index = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let input = self
            .core
            .sink_input_by_index(index)
            .ok_or(ErrCode::NoEntity)?;
        let mut reply = self.reply_tagstruct(tag);
        put_sink_input_info(&mut reply, &input);
        Ok(reply)
    }

    fn cmd_source_output_info(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let index = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let output = self
            .core
            .source_output_by_index(index)
            .ok_or(ErrCode::NoEntity)?;
        let mut reply = self.reply_tagstruct(tag);
        put_source_output_info(&mut reply, &output);
        Ok(reply)
    }

    fn cmd_module_info(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let index = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let module = self.core.module_by_index(index).ok_or(ErrCode::NoEntity)?;
        let mut reply = self.reply_tagstruct(tag);
        put_module_info(&mut reply, &module);
        Ok(reply)
    }

    fn cmd_subscribe(&mut self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let mask = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        self.subscribe_mask = mask;
        if mask != 0 && self.subscription.is_none() {
            let tx = self.conn_tx.clone();
            self.subscription = Some(self.core.hooks.events.connect(move |event| {
                let _ = tx.send(ConnEvent::Change(*event));
            }));
        } else if mask == 0 {
            self.subscription = None;
        }
        Ok(self.reply_tagstruct(tag))
    }

    fn lookup_sink_ref(&self, ts: &mut TagStruct) -> Result<Arc<Sink>, ErrCode> {
        let index = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let name = ts.get_string().map_err(|_| ErrCode::Protocol)?;
        match name {
            Some(name) => self.core.sink_by_name(&name).ok_or(ErrCode::NoEntity),
            None if index != INVALID_INDEX => {
                self.core.sink_by_index(index).ok_or(ErrCode::NoEntity)
            }
            None => self.core.default_sink().ok_or(ErrCode::NoEntity),
        }
    }

    fn lookup_source_ref(&self, ts: &mut TagStruct) -> Result<Arc<Source>, ErrCode> {
        let index = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let name = ts.get_string().map_err(|_| ErrCode::Protocol)?;
        match name {
            Some(name) => self.core.source_by_name(&name).ok_or(ErrCode::NoEntity),
            None if index != INVALID_INDEX => {
                self.core.source_by_index(index).ok_or(ErrCode::NoEntity)
            }
            None => self.core.default_source().ok_or(ErrCode::NoEntity),
        }
    }

    fn cmd_set_sink_volume(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let sink = self.lookup_sink_ref(&mut ts)?;
        let volume = ts.get_cvolume().map_err(|_| ErrCode::Protocol)?;
        sink.set_volume(Some(&volume), true);
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_set_sink_mute(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let sink = self.lookup_sink_ref(&mut ts)?;
        let muted = ts.get_bool().map_err(|_| ErrCode::Protocol)?;
        sink.set_mute(muted, true);
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_set_source_volume(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let source = self.lookup_source_ref(&mut ts)?;
        let volume = ts.get_cvolume().map_err(|_| ErrCode::Protocol)?;
        source.set_volume(&volume, true);
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_set_source_mute(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let source = self.lookup_source_ref(&mut ts)?;
        let muted = ts.get_bool().map_err(|_| ErrCode::Protocol)?;
        source.set_mute(muted, true);
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_set_sink_input_volume(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let index = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let volume = ts.get_cvolume().map_err(|_| ErrCode::Protocol)?;
        let input = self
            .core
            .sink_input_by_index(index)
            .ok_or(ErrCode::NoEntity)?;
        input.set_volume(&volume, true);
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_set_sink_input_mute(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let index = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let muted = ts.get_bool().map_err(|_| ErrCode::Protocol)?;
        let input = self
            .core
            .sink_input_by_index(index)
            .ok_or(ErrCode::NoEntity)?;
        input.set_mute(muted, true);
        Ok(self.reply_tagstruct(tag))
    }

    fn playback_simple_op(
        &self,
        tag: u32,
        mut ts: TagStruct,
        op: impl Fn(&Arc<SinkInput>) -> Result<(), sabmix::MixError>,
    ) -> Result<TagStruct, ErrCode> {
        let channel = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let input = self.playback.get(&channel).ok_or(ErrCode::NoEntity)?;
        op(input).map_err(|_| ErrCode::Internal)?;
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_cork_playback(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let channel = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let corked = ts.get_bool().map_err(|_| ErrCode::Protocol)?;
        let input = self.playback.get(&channel).ok_or(ErrCode::NoEntity)?;
        input.cork(corked).map_err(|_| ErrCode::Internal)?;
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_cork_record(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let channel = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let corked = ts.get_bool().map_err(|_| ErrCode::Protocol)?;
        let output = self.record.get(&channel).ok_or(ErrCode::NoEntity)?;
        output.cork(corked).map_err(|_| ErrCode::Internal)?;
        Ok(self.reply_tagstruct(tag))
    }

    fn require_record(&self, mut ts: TagStruct) -> Result<u32, ErrCode> {
        let channel = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        if self.record.contains_key(&channel) {
            Ok(channel)
        } else {
            Err(ErrCode::NoEntity)
        }
    }

    async fn cmd_move_sink_input(&mut self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let index = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let input = self
            .core
            .sink_input_by_index(index)
            .ok_or(ErrCode::NoEntity)?;
        let sink = self.lookup_sink_ref(&mut ts)?;
        input.move_to(&sink).await.map_err(|e| match e {
            sabmix::MixError::SyncGroup => ErrCode::Busy,
            _ => ErrCode::Invalid,
        })?;
        Ok(self.reply_tagstruct(tag))
    }

    async fn cmd_move_source_output(&mut self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let index = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let output = self
            .core
            .source_output_by_index(index)
            .ok_or(ErrCode::NoEntity)?;
        let source = self.lookup_source_ref(&mut ts)?;
        output
            .move_to(&source)
            .await
            .map_err(|_| ErrCode::Invalid)?;
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_suspend_sink(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let sink = self.lookup_sink_ref(&mut ts)?;
        let suspend = ts.get_bool().map_err(|_| ErrCode::Protocol)?;
        sink.suspend(SuspendCause::USER, suspend)
            .map_err(|_| ErrCode::Busy)?;
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_suspend_source(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let source = self.lookup_source_ref(&mut ts)?;
        let suspend = ts.get_bool().map_err(|_| ErrCode::Protocol)?;
        source
            .suspend(SuspendCause::USER, suspend)
            .map_err(|_| ErrCode::Busy)?;
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_set_default(&self, tag: u32, mut ts: TagStruct, sink: bool) -> Result<TagStruct, ErrCode> {
        let name = ts.get_string().map_err(|_| ErrCode::Protocol)?;
        if sink {
            self.core.set_default_sink(name);
        } else {
            self.core.set_default_source(name);
        }
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_kill_client(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let index = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let client = self.core.client_by_index(index).ok_or(ErrCode::NoEntity)?;
        client.unlink();
        Ok(self.reply_tagstruct(tag))
    }

    async fn cmd_kill_sink_input(&mut self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let index = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let input = self
            .core
            .sink_input_by_index(index)
            .ok_or(ErrCode::NoEntity)?;
        input.kill().await;
        Ok(self.reply_tagstruct(tag))
    }

    async fn cmd_kill_source_output(&mut self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let index = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let output = self
            .core
            .source_output_by_index(index)
            .ok_or(ErrCode::NoEntity)?;
        output.kill().await;
        Ok(self.reply_tagstruct(tag))
    }

    fn cmd_set_buffer_attr(&self, tag: u32, mut ts: TagStruct) -> Result<TagStruct, ErrCode> {
        let channel = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let maxlength = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let tlength = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let prebuf = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let minreq = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let input = self.playback.get(&channel).ok_or(ErrCode::NoEntity)?;
        let attr = BlockQAttr {
            maxlength: maxlength as usize,
            tlength: tlength as usize,
            prebuf: prebuf as usize,
            minreq: minreq as usize,
        }
        .sanitize(input.spec.frame_size());
        // La nouvelle géométrie ne s'applique qu'aux données à venir ;
        // la file existante du thread IO garde la sienne.
        let mut reply = self.reply_tagstruct(tag);
        reply
            .put_u32(attr.maxlength as u32)
            .put_u32(attr.tlength as u32)
            .put_u32(attr.prebuf as u32)
            .put_u32(attr.minreq as u32);
        Ok(reply)
    }

    fn cmd_set_stream_name(&self, tag: u32, mut ts: TagStruct, playback: bool) -> Result<TagStruct, ErrCode> {
        let channel = ts.get_u32().map_err(|_| ErrCode::Protocol)?;
        let name = ts.get_string_non_null().map_err(|_| ErrCode::Protocol)?;
        if playback {
            let input = self.playback.get(&channel).ok_or(ErrCode::NoEntity)?;
            input.set_name(&name);
        } else {
            let output = self.record.get(&channel).ok_or(ErrCode::NoEntity)?;
            output.set_name(&name);
        }
        Ok(self.reply_tagstruct(tag))
    }
}

// ---- encodage des infos d'objets -----------------------------------

fn put_sink_info(ts: &mut TagStruct, sink: &Arc<Sink>) {
    ts.put_u32(sink.idx())
        .put_string(Some(&sink.name))
        .put_string(Some(&sink.driver))
        .put_sample_spec(&sink.spec)
        .put_channel_map(&sink.map)
        .put_cvolume(&sink.reference_volume())
        .put_bool(sink.muted())
        .put_u32(sink.monitor().map(|m| m.idx()).unwrap_or(INVALID_INDEX))
        .put_u32(device_state_code(sink.state()))
        .put_u32(sink.flags.bits())
        .put_u64(sink.configured_latency().as_micros() as u64)
        .put_proplist(&sink.proplist());
}

fn put_source_info(ts: &mut TagStruct, source: &Arc<Source>) {
    ts.put_u32(source.idx())
        .put_string(Some(&source.name))
        .put_string(Some(&source.driver))
        .put_sample_spec(&source.spec)
        .put_channel_map(&source.map)
        .put_cvolume(&source.volume())
        .put_bool(source.muted())
        .put_u32(
            source
                .monitor_of()
                .map(|s| s.idx())
                .unwrap_or(INVALID_INDEX),
        )
        .put_u32(device_state_code(source.state()))
        .put_u32(source.flags.bits())
        .put_u64(source.configured_latency().as_micros() as u64)
        .put_proplist(&source.proplist());
}

fn put_client_info(ts: &mut TagStruct, client: &Arc<Client>) {
    ts.put_u32(client.idx())
        .put_string(Some(&client.name()))
        .put_string(Some(&client.driver))
        .put_proplist(&client.proplist());
}

fn put_sink_input_info(ts: &mut TagStruct, input: &Arc<SinkInput>) {
    ts.put_u32(input.idx())
        .put_string(Some(&input.name()))
        .put_u32(input.client().unwrap_or(INVALID_INDEX))
        .put_u32(input.sink().map(|s| s.idx()).unwrap_or(INVALID_INDEX))
        .put_sample_spec(&input.spec)
        .put_channel_map(&input.map)
        .put_cvolume(&input.volume())
        .put_bool(input.muted())
        .put_bool(input.is_corked())
        .put_proplist(&input.proplist());
}

fn put_source_output_info(ts: &mut TagStruct, output: &Arc<SourceOutput>) {
    ts.put_u32(output.idx())
        .put_u32(output.client().unwrap_or(INVALID_INDEX))
        .put_u32(output.source().map(|s| s.idx()).unwrap_or(INVALID_INDEX))
        .put_sample_spec(&output.spec)
        .put_channel_map(&output.map)
        .put_cvolume(&output.volume())
        .put_bool(output.muted())
        .put_bool(output.is_corked())
        .put_proplist(&output.proplist());
}

fn put_module_info(ts: &mut TagStruct, module: &Arc<sabmix::Module>) {
    ts.put_u32(module.idx())
        .put_string(Some(&module.name))
        .put_string(Some(&module.argument))
        .put_u32(module.used_by() as u32);
}

fn device_state_code(state: sabmix::DeviceState) -> u32 {
    match state {
        sabmix::DeviceState::Running => 0,
        sabmix::DeviceState::Idle => 1,
        sabmix::DeviceState::Suspended => 2,
        sabmix::DeviceState::Init => 3,
        sabmix::DeviceState::Unlinked => 4,
    }
}

/// Now as the protocol timeval pair.
pub fn timeval_now() -> (u32, u32) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs() as u32, now.subsec_micros())
}
