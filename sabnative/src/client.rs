//! Client side of the native protocol: context and streams.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use sabcore::{
    memblockq::BlockQAttr, CVolume, ChannelMap, MemChunk, MemPool, Proplist, SampleSpec, SeekMode,
    INVALID_INDEX,
};
use sabwire::{
    cookie, Command, ErrCode, PDispatch, PStream, PStreamEvent, ReplyEvent, TagStruct,
    COOKIE_SIZE, PROTOCOL_VERSION,
};

use crate::address::ServerAddress;
use crate::error::NativeError;
use crate::DEFAULT_TIMEOUT;

/// Server-initiated playback stream events.
#[derive(Debug)]
pub enum PlaybackEvent {
    /// The server asks for this many more bytes.
    Request(u32),
    Started,
    Underflow,
    Overflow,
    Killed,
    Died,
}

/// Server-initiated record stream events.
#[derive(Debug)]
pub enum RecordEvent {
    Data(MemChunk),
    Killed,
    Died,
}

/// One subscription event `(facility, kind, index)`.
pub type SubscribeEvent = (u32, u32, u32);

enum StreamHandle {
    Playback(mpsc::UnboundedSender<PlaybackEvent>),
    Record(mpsc::UnboundedSender<RecordEvent>),
}

struct ContextInner {
    pool: MemPool,
    pstream: PStream,
    pdispatch: PDispatch,
    tag: AtomicU32,
    streams: Mutex<HashMap<u32, StreamHandle>>,
    /// REQUEST arrivés avant l'enregistrement du canal.
    pending_requests: Mutex<HashMap<u32, u32>>,
    subscription: Mutex<Option<mpsc::UnboundedSender<SubscribeEvent>>>,
}

impl ContextInner {
    fn next_tag(&self) -> u32 {
        self.tag.fetch_add(1, Ordering::Relaxed)
    }

    fn route_playback(&self, channel: u32, event: PlaybackEvent) {
        let streams = self.streams.lock();
        match streams.get(&channel) {
            Some(StreamHandle::Playback(tx)) => {
                let _ = tx.send(event);
            }
            _ => {
                if let PlaybackEvent::Request(bytes) = event {
                    *self
                        .pending_requests
                        .lock()
                        .entry(channel)
                        .or_insert(0) += bytes;
                }
            }
        }
    }

    fn route_record(&self, channel: u32, event: RecordEvent) {
        let streams = self.streams.lock();
        if let Some(StreamHandle::Record(tx)) = streams.get(&channel) {
            let _ = tx.send(event);
        }
    }

    fn broadcast_death(&self) {
        self.pdispatch.fail_all();
        let streams = self.streams.lock();
        for handle in streams.values() {
            match handle {
                StreamHandle::Playback(tx) => {
                    let _ = tx.send(PlaybackEvent::Died);
                }
                StreamHandle::Record(tx) => {
                    let _ = tx.send(RecordEvent::Died);
                }
            }
        }
    }
}

/// A connected, authenticated protocol context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

impl Context {
    /// Connects, authenticates with the cookie and registers the
    /// client name.
    pub async fn connect(
        address: &ServerAddress,
        app_name: &str,
        cookie_path: Option<&Path>,
    ) -> Result<Context, NativeError> {
        let auth_cookie = match cookie_path {
            Some(path) => cookie::load(path)?,
            None => cookie::load_or_create(&cookie::default_path())?,
        };
        Self::connect_with_cookie(address, app_name, auth_cookie).await
    }

    /// Same, with the cookie provided directly.
    pub async fn connect_with_cookie(
        address: &ServerAddress,
        app_name: &str,
        auth_cookie: [u8; COOKIE_SIZE],
    ) -> Result<Context, NativeError> {
        let pool = MemPool::new(sabcore::memblock::DEFAULT_SLAB_SIZE, 256);
        let (pstream, events) = match address {
            ServerAddress::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                PStream::new(stream, pool.clone())
            }
            ServerAddress::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                PStream::new(stream, pool.clone())
            }
        };

        let inner = Arc::new(ContextInner {
            pool,
            pstream,
            pdispatch: PDispatch::new(),
            tag: AtomicU32::new(0),
            streams: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
            subscription: Mutex::new(None),
        });
        Self::install_handlers(&inner);
        Self::spawn_router(inner.clone(), events);

        let context = Context { inner };
        context.authenticate(auth_cookie).await?;
        context.set_client_name(app_name).await?;
        Ok(context)
    }

    fn install_handlers(inner: &Arc<ContextInner>) {
        let pd = &inner.pdispatch;
        for (command, is_playback) in [
            (Command::Request, true),
            (Command::PlaybackStreamUnderflow, true),
            (Command::PlaybackStreamOverflow, true),
            (Command::PlaybackStreamStarted, true),
            (Command::PlaybackStreamKilled, true),
            (Command::RecordStreamKilled, false),
        ] {
            let weak = Arc::downgrade(inner);
            pd.set_handler(command, move |cmd, _tag, mut ts| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let Ok(channel) = ts.get_u32() else {
                    return;
                };
                if is_playback {
                    let event = match cmd {
                        Command::Request => match ts.get_u32() {
                            Ok(bytes) => PlaybackEvent::Request(bytes),
                            Err(_) => return,
                        },
                        Command::PlaybackStreamUnderflow => PlaybackEvent::Underflow,
                        Command::PlaybackStreamOverflow => PlaybackEvent::Overflow,
                        Command::PlaybackStreamStarted => PlaybackEvent::Started,
                        Command::PlaybackStreamKilled => PlaybackEvent::Killed,
                        _ => return,
                    };
                    inner.route_playback(channel, event);
                } else {
                    inner.route_record(channel, RecordEvent::Killed);
                }
            });
        }
        let weak = Arc::downgrade(inner);
        pd.set_handler(Command::SubscribeEvent, move |_cmd, _tag, mut ts| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let (Ok(facility), Ok(kind), Ok(index)) =
                (ts.get_u32(), ts.get_u32(), ts.get_u32())
            else {
                return;
            };
            let guard = inner.subscription.lock();
            if let Some(tx) = &*guard {
                let _ = tx.send((facility, kind, index));
            }
        });
    }

    fn spawn_router(inner: Arc<ContextInner>, mut events: mpsc::UnboundedReceiver<PStreamEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PStreamEvent::Packet(packet) => {
                        if let Err(e) = inner.pdispatch.run(&packet) {
                            warn!("client protocol error: {e}");
                            inner.broadcast_death();
                            return;
                        }
                    }
                    PStreamEvent::MemBlock { channel, chunk, .. } => {
                        inner.route_record(channel, RecordEvent::Data(chunk));
                    }
                    PStreamEvent::Drained => {}
                    PStreamEvent::Died(e) => {
                        debug!("client connection died: {e}");
                        inner.broadcast_death();
                        return;
                    }
                }
            }
        });
    }

    /// Sends a request and awaits its reply tag-struct.
    pub async fn request(
        &self,
        command: Command,
        build: impl FnOnce(&mut TagStruct),
    ) -> Result<TagStruct, NativeError> {
        let tag = self.inner.next_tag();
        let mut ts = TagStruct::new();
        ts.put_u32(command as u32).put_u32(tag);
        build(&mut ts);
        let rx = self.inner.pdispatch.register_reply(tag, DEFAULT_TIMEOUT);
        self.inner.pstream.send_packet(ts.into_packet())?;
        match rx.await {
            Ok(ReplyEvent::Reply(ts)) => Ok(ts),
            Ok(ReplyEvent::Error(code)) => Err(NativeError::Server(code)),
            Ok(ReplyEvent::Timeout) => Err(NativeError::Server(ErrCode::Timeout)),
            Ok(ReplyEvent::Died) | Err(_) => {
                Err(NativeError::Server(ErrCode::ConnectionTerminated))
            }
        }
    }

    async fn authenticate(&self, auth_cookie: [u8; COOKIE_SIZE]) -> Result<(), NativeError> {
        let mut reply = self
            .request(Command::Auth, |ts| {
                ts.put_u32(PROTOCOL_VERSION).put_arbitrary(&auth_cookie);
            })
            .await?;
        let server_version = reply.get_u32()?;
        let _features = reply.get_u32()?;
        debug!("authenticated against server protocol {server_version}");
        Ok(())
    }

    async fn set_client_name(&self, app_name: &str) -> Result<(), NativeError> {
        let props = Proplist::from_pairs([(sabcore::proplist::keys::APPLICATION_NAME, app_name)]);
        let mut reply = self
            .request(Command::SetClientName, |ts| {
                ts.put_proplist(&props);
            })
            .await?;
        let index = reply.get_u32()?;
        debug!("registered as client #{index}");
        Ok(())
    }

    /// Subscribes to change events for the facilities in `mask`
    /// (bit `1 << facility`).
    pub async fn subscribe(
        &self,
        mask: u32,
    ) -> Result<mpsc::UnboundedReceiver<SubscribeEvent>, NativeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.subscription.lock() = Some(tx);
        self.request(Command::Subscribe, |ts| {
            ts.put_u32(mask);
        })
        .await?;
        Ok(rx)
    }

    pub async fn lookup_sink(&self, name: &str) -> Result<u32, NativeError> {
        let mut reply = self
            .request(Command::LookupSink, |ts| {
                ts.put_string(Some(name));
            })
            .await?;
        Ok(reply.get_u32()?)
    }

    pub async fn lookup_source(&self, name: &str) -> Result<u32, NativeError> {
        let mut reply = self
            .request(Command::LookupSource, |ts| {
                ts.put_string(Some(name));
            })
            .await?;
        Ok(reply.get_u32()?)
    }

    /// Moves a sink-input onto the named sink.
    pub async fn move_sink_input(&self, index: u32, sink: &str) -> Result<(), NativeError> {
        self.request(Command::MoveSinkInput, |ts| {
            ts.put_u32(index)
                .put_u32(INVALID_INDEX)
                .put_string(Some(sink));
        })
        .await?;
        Ok(())
    }

    pub async fn set_sink_volume(&self, name: &str, volume: &CVolume) -> Result<(), NativeError> {
        self.request(Command::SetSinkVolume, |ts| {
            ts.put_u32(INVALID_INDEX)
                .put_string(Some(name))
                .put_cvolume(volume);
        })
        .await?;
        Ok(())
    }

    pub async fn set_sink_input_volume(
        &self,
        index: u32,
        volume: &CVolume,
    ) -> Result<(), NativeError> {
        self.request(Command::SetSinkInputVolume, |ts| {
            ts.put_u32(index).put_cvolume(volume);
        })
        .await?;
        Ok(())
    }

    pub async fn kill_sink_input(&self, index: u32) -> Result<(), NativeError> {
        self.request(Command::KillSinkInput, |ts| {
            ts.put_u32(index);
        })
        .await?;
        Ok(())
    }

    /// Memory pool statistics of the server: (blocks, bytes,
    /// accumulated blocks, accumulated bytes).
    pub async fn stat(&self) -> Result<(u32, u32, u32, u32), NativeError> {
        let mut reply = self.request(Command::Stat, |_| {}).await?;
        Ok((
            reply.get_u32()?,
            reply.get_u32()?,
            reply.get_u32()?,
            reply.get_u32()?,
        ))
    }

    /// Asks the server to exit.
    pub async fn exit(&self) -> Result<(), NativeError> {
        self.request(Command::Exit, |_| {}).await?;
        Ok(())
    }

    /// Opens a playback stream.
    pub async fn create_playback_stream(
        &self,
        sink_name: Option<&str>,
        stream_name: &str,
        spec: SampleSpec,
        attr: BlockQAttr,
    ) -> Result<PlaybackStream, NativeError> {
        let map = ChannelMap::default_for(spec.channels)?;
        let props =
            Proplist::from_pairs([(sabcore::proplist::keys::MEDIA_NAME, stream_name)]);
        let volume = CVolume::norm(spec.channels);
        let mut reply = self
            .request(Command::CreatePlaybackStream, |ts| {
                ts.put_string(sink_name)
                    .put_sample_spec(&spec)
                    .put_channel_map(&map)
                    .put_u32(attr.maxlength as u32)
                    .put_u32(attr.tlength as u32)
                    .put_u32(attr.prebuf as u32)
                    .put_u32(attr.minreq as u32)
                    .put_cvolume(&volume)
                    .put_bool(false)
                    .put_proplist(&props);
            })
            .await?;
        let channel = reply.get_u32()?;
        let stream_index = reply.get_u32()?;
        let sink_index = reply.get_u32()?;
        let actual = BlockQAttr {
            maxlength: reply.get_u32()? as usize,
            tlength: reply.get_u32()? as usize,
            prebuf: reply.get_u32()? as usize,
            minreq: reply.get_u32()? as usize,
        };
        let actual_sink = reply.get_string()?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .streams
            .lock()
            .insert(channel, StreamHandle::Playback(tx));
        // Les demandes arrivées avant l'enregistrement du canal.
        let credit = self
            .inner
            .pending_requests
            .lock()
            .remove(&channel)
            .unwrap_or(0);

        Ok(PlaybackStream {
            context: self.clone(),
            channel,
            stream_index,
            sink_index,
            sink_name: actual_sink,
            attr: actual,
            spec,
            events: rx,
            credit: credit as usize,
            write_index: 0,
        })
    }

    /// Opens a record stream.
    pub async fn create_record_stream(
        &self,
        source_name: Option<&str>,
        stream_name: &str,
        spec: SampleSpec,
    ) -> Result<RecordStream, NativeError> {
        let map = ChannelMap::default_for(spec.channels)?;
        let props =
            Proplist::from_pairs([(sabcore::proplist::keys::MEDIA_NAME, stream_name)]);
        let fragsize = spec.bytes_per_second() / 10;
        let mut reply = self
            .request(Command::CreateRecordStream, |ts| {
                ts.put_string(source_name)
                    .put_sample_spec(&spec)
                    .put_channel_map(&map)
                    .put_u32((spec.bytes_per_second() * 4) as u32)
                    .put_u32(fragsize as u32)
                    .put_bool(false)
                    .put_proplist(&props);
            })
            .await?;
        let channel = reply.get_u32()?;
        let stream_index = reply.get_u32()?;
        let source_index = reply.get_u32()?;
        let _maxlength = reply.get_u32()?;
        let _fragsize = reply.get_u32()?;
        let source_name = reply.get_string()?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .streams
            .lock()
            .insert(channel, StreamHandle::Record(tx));

        Ok(RecordStream {
            context: self.clone(),
            channel,
            stream_index,
            source_index,
            source_name,
            spec,
            events: rx,
            staged: None,
        })
    }

    fn unregister_channel(&self, channel: u32) {
        self.inner.streams.lock().remove(&channel);
    }
}

/// A playback stream bound to a server-side sink-input.
pub struct PlaybackStream {
    context: Context,
    channel: u32,
    pub stream_index: u32,
    pub sink_index: u32,
    pub sink_name: Option<String>,
    pub attr: BlockQAttr,
    pub spec: SampleSpec,
    events: mpsc::UnboundedReceiver<PlaybackEvent>,
    credit: usize,
    write_index: i64,
}

impl PlaybackStream {
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Bytes the server has asked for and not yet received.
    pub fn writable_size(&self) -> usize {
        self.credit
    }

    /// Processes stream events until the server grants write credit.
    pub async fn wait_writable(&mut self) -> Result<usize, NativeError> {
        while self.credit == 0 {
            match self.events.recv().await {
                Some(PlaybackEvent::Request(bytes)) => {
                    self.credit += bytes as usize;
                }
                Some(PlaybackEvent::Killed) => return Err(NativeError::Killed),
                Some(PlaybackEvent::Died) => {
                    return Err(NativeError::Server(ErrCode::ConnectionTerminated))
                }
                Some(_) => continue,
                None => return Err(NativeError::Server(ErrCode::ConnectionTerminated)),
            }
        }
        Ok(self.credit)
    }

    /// Queues `data` at the current write position.
    pub fn write(&mut self, data: &[u8]) -> Result<(), NativeError> {
        self.write_at(data, 0, SeekMode::Relative)
    }

    /// Queues `data` at the tag-supplied offset.
    pub fn write_at(
        &mut self,
        data: &[u8],
        offset: i64,
        seek: SeekMode,
    ) -> Result<(), NativeError> {
        let pool = &self.context.inner.pool;
        let mut first = true;
        for piece in data.chunks(pool.block_size_max().max(1)) {
            let mut block = match pool.alloc(piece.len()) {
                Ok(b) => b,
                Err(_) => pool.alloc_appended(piece.len()),
            };
            if let Some(slot) = block.try_mut() {
                slot.copy_from_slice(piece);
            }
            let (o, s) = if first {
                (offset, seek)
            } else {
                (0, SeekMode::Relative)
            };
            first = false;
            self.context
                .inner
                .pstream
                .send_memblock(self.channel, o, s, MemChunk::new(block))?;
        }
        self.credit = self.credit.saturating_sub(data.len());
        self.write_index += data.len() as i64;
        Ok(())
    }

    /// Next server-side event, if any arrived.
    pub fn try_next_event(&mut self) -> Option<PlaybackEvent> {
        self.events.try_recv().ok()
    }

    /// Waits until the server played everything queued so far.
    pub async fn drain(&mut self) -> Result<(), NativeError> {
        let channel = self.channel;
        self.context
            .request(Command::DrainPlaybackStream, |ts| {
                ts.put_u32(channel);
            })
            .await?;
        Ok(())
    }

    pub async fn cork(&self, corked: bool) -> Result<(), NativeError> {
        let channel = self.channel;
        self.context
            .request(Command::CorkPlaybackStream, |ts| {
                ts.put_u32(channel).put_bool(corked);
            })
            .await?;
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), NativeError> {
        let channel = self.channel;
        self.context
            .request(Command::FlushPlaybackStream, |ts| {
                ts.put_u32(channel);
            })
            .await?;
        Ok(())
    }

    pub async fn trigger(&self) -> Result<(), NativeError> {
        let channel = self.channel;
        self.context
            .request(Command::TriggerPlaybackStream, |ts| {
                ts.put_u32(channel);
            })
            .await?;
        Ok(())
    }

    /// Stream and device latency, microseconds.
    pub async fn latency(&self) -> Result<(u64, u64), NativeError> {
        let channel = self.channel;
        let now = crate::server::timeval_now();
        let mut reply = self
            .context
            .request(Command::GetPlaybackLatency, |ts| {
                ts.put_u32(channel).put_timeval(now.0, now.1);
            })
            .await?;
        Ok((reply.get_u64()?, reply.get_u64()?))
    }

    /// Deletes the server-side stream.
    pub async fn delete(self) -> Result<(), NativeError> {
        let channel = self.channel;
        let result = self
            .context
            .request(Command::DeletePlaybackStream, |ts| {
                ts.put_u32(channel);
            })
            .await;
        self.context.unregister_channel(channel);
        result.map(|_| ())
    }
}

impl Drop for PlaybackStream {
    fn drop(&mut self) {
        self.context.unregister_channel(self.channel);
    }
}

/// A record stream bound to a server-side source-output.
pub struct RecordStream {
    context: Context,
    channel: u32,
    pub stream_index: u32,
    pub source_index: u32,
    pub source_name: Option<String>,
    pub spec: SampleSpec,
    events: mpsc::UnboundedReceiver<RecordEvent>,
    /// Vue en cours de lecture partielle (paire peek/drop).
    staged: Option<MemChunk>,
}

impl RecordStream {
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// The captured view currently at the head of the stream; waits
    /// for data when none is staged. Dropping part of it advances the
    /// cursor.
    pub async fn peek(&mut self) -> Result<MemChunk, NativeError> {
        if let Some(chunk) = &self.staged {
            return Ok(chunk.clone());
        }
        loop {
            match self.events.recv().await {
                Some(RecordEvent::Data(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.staged = Some(chunk.clone());
                    return Ok(chunk);
                }
                Some(RecordEvent::Killed) => return Err(NativeError::Killed),
                Some(RecordEvent::Died) | None => {
                    return Err(NativeError::Server(ErrCode::ConnectionTerminated))
                }
            }
        }
    }

    /// Consumes `bytes` of the staged view.
    pub fn drop_bytes(&mut self, bytes: usize) {
        if let Some(chunk) = &mut self.staged {
            chunk.advance(bytes);
            if chunk.is_empty() {
                self.staged = None;
            }
        }
    }

    pub async fn cork(&self, corked: bool) -> Result<(), NativeError> {
        let channel = self.channel;
        self.context
            .request(Command::CorkRecordStream, |ts| {
                ts.put_u32(channel).put_bool(corked);
            })
            .await?;
        Ok(())
    }

    /// Deletes the server-side stream.
    pub async fn delete(self) -> Result<(), NativeError> {
        let channel = self.channel;
        let result = self
            .context
            .request(Command::DeleteRecordStream, |ts| {
                ts.put_u32(channel);
            })
            .await;
        self.context.unregister_channel(channel);
        result.map(|_| ())
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        self.context.unregister_channel(self.channel);
    }
}
