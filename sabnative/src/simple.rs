//! Blocking facade over the client: connect, write, read, drain.
//!
//! Owns a private single-threaded runtime; every call blocks the
//! calling thread until the server answered. Reads are pull-based
//! over the record stream's peek/drop pair.

use sabcore::{memblockq::BlockQAttr, SampleSpec};

use crate::address::ServerAddress;
use crate::client::{Context, PlaybackStream, RecordStream};
use crate::error::NativeError;

/// Stream direction of a [`Simple`] connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Playback,
    Record,
}

enum SimpleStream {
    Playback(PlaybackStream),
    Record(RecordStream),
}

/// A blocking, single-stream connection.
pub struct Simple {
    runtime: tokio::runtime::Runtime,
    _context: Context,
    stream: SimpleStream,
}

impl Simple {
    /// Connects and opens one stream in the given direction.
    ///
    /// `server` falls back to `SABINE_SERVER`, then the default
    /// address; `device` picks a sink/source by name, `None` the
    /// default one.
    pub fn new(
        server: Option<&str>,
        app_name: &str,
        direction: StreamDirection,
        device: Option<&str>,
        stream_name: &str,
        spec: SampleSpec,
    ) -> Result<Simple, NativeError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let address = match server {
            Some(s) => ServerAddress::parse(s)?,
            None => ServerAddress::from_env()?,
        };
        let (context, stream) = runtime.block_on(async {
            let context = Context::connect(&address, app_name, None).await?;
            let stream = match direction {
                StreamDirection::Playback => {
                    let attr = default_attr(&spec);
                    SimpleStream::Playback(
                        context
                            .create_playback_stream(device, stream_name, spec, attr)
                            .await?,
                    )
                }
                StreamDirection::Record => SimpleStream::Record(
                    context
                        .create_record_stream(device, stream_name, spec)
                        .await?,
                ),
            };
            Ok::<_, NativeError>((context, stream))
        })?;
        Ok(Simple {
            runtime,
            _context: context,
            stream,
        })
    }

    /// Writes all of `data`, honouring the server's requests.
    pub fn write(&mut self, data: &[u8]) -> Result<(), NativeError> {
        let SimpleStream::Playback(stream) = &mut self.stream else {
            return Err(NativeError::BadState("not a playback stream".into()));
        };
        self.runtime.block_on(async {
            let mut rest = data;
            while !rest.is_empty() {
                let writable = stream.wait_writable().await?;
                let n = writable.min(rest.len());
                stream.write(&rest[..n])?;
                rest = &rest[n..];
            }
            Ok(())
        })
    }

    /// Blocks until everything written has been played.
    pub fn drain(&mut self) -> Result<(), NativeError> {
        let SimpleStream::Playback(stream) = &mut self.stream else {
            return Err(NativeError::BadState("not a playback stream".into()));
        };
        self.runtime.block_on(stream.drain())
    }

    /// Fills `data` from the capture stream.
    pub fn read(&mut self, data: &mut [u8]) -> Result<(), NativeError> {
        let SimpleStream::Record(stream) = &mut self.stream else {
            return Err(NativeError::BadState("not a record stream".into()));
        };
        self.runtime.block_on(async {
            let mut filled = 0;
            while filled < data.len() {
                let chunk = stream.peek().await?;
                let n = chunk.length.min(data.len() - filled);
                {
                    let bytes = chunk.bytes();
                    data[filled..filled + n].copy_from_slice(&bytes[..n]);
                }
                stream.drop_bytes(n);
                filled += n;
            }
            Ok(())
        })
    }

    /// Current stream latency in microseconds (playback only).
    pub fn latency(&mut self) -> Result<u64, NativeError> {
        let SimpleStream::Playback(stream) = &mut self.stream else {
            return Err(NativeError::BadState("not a playback stream".into()));
        };
        self.runtime
            .block_on(stream.latency())
            .map(|(own, device)| own + device)
    }
}

fn default_attr(spec: &SampleSpec) -> BlockQAttr {
    let bps = spec.bytes_per_second();
    BlockQAttr {
        maxlength: bps * 4,
        tlength: bps / 4,
        prebuf: bps / 10,
        minreq: bps / 50,
    }
    .sanitize(spec.frame_size())
}
