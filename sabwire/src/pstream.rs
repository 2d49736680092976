//! Packet stream: frames control packets and memblock references over
//! a bidirectional byte channel.
//!
//! Wire layout, per frame:
//!
//! ```text
//! offset  field
//! 0..4    u32 BE  payload length
//! 4..8    u32 BE  channel (0xFFFFFFFF = control packet)
//! 8..12   u32 BE  offset, high word
//! 12..16  u32 BE  offset, low word
//! 16..20  u32 BE  flags (seek mode in the low bits)
//! 20..    payload
//! ```
//!
//! The stream is split into a reader and a writer task; inbound frames
//! surface on an event channel, outbound frames are queued without
//! blocking. A fatal error on either side emits [`PStreamEvent::Died`]
//! once and stops both tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use sabcore::{MemChunk, MemPool, SeekMode};

use crate::error::WireError;
use crate::packet::Packet;

/// Channel id marking a control packet.
pub const CHANNEL_CONTROL: u32 = 0xFFFF_FFFF;

/// Frame descriptor size on the wire.
pub const DESCRIPTOR_SIZE: usize = 20;

/// Largest accepted payload. Anything bigger kills the stream.
pub const FRAME_SIZE_MAX: u32 = 1024 * 1024;

/// Inbound events of a packet stream.
#[derive(Debug)]
pub enum PStreamEvent {
    /// A control packet arrived.
    Packet(Packet),
    /// An audio frame arrived on `channel`.
    MemBlock {
        channel: u32,
        offset: i64,
        seek: SeekMode,
        chunk: MemChunk,
    },
    /// The outbound queue ran empty.
    Drained,
    /// The stream died; no further events will follow.
    Died(WireError),
}

/// One outbound frame.
pub enum SendItem {
    Packet(Packet),
    MemBlock {
        channel: u32,
        offset: i64,
        seek: SeekMode,
        chunk: MemChunk,
    },
}

impl SendItem {
    fn encode(&self) -> Vec<u8> {
        match self {
            SendItem::Packet(p) => {
                let mut frame = Vec::with_capacity(DESCRIPTOR_SIZE + p.len());
                frame.extend_from_slice(&(p.len() as u32).to_be_bytes());
                frame.extend_from_slice(&CHANNEL_CONTROL.to_be_bytes());
                frame.extend_from_slice(&0u32.to_be_bytes());
                frame.extend_from_slice(&0u32.to_be_bytes());
                frame.extend_from_slice(&0u32.to_be_bytes());
                frame.extend_from_slice(p.data());
                frame
            }
            SendItem::MemBlock {
                channel,
                offset,
                seek,
                chunk,
            } => {
                let mut frame = Vec::with_capacity(DESCRIPTOR_SIZE + chunk.length);
                let offset = *offset as u64;
                frame.extend_from_slice(&(chunk.length as u32).to_be_bytes());
                frame.extend_from_slice(&channel.to_be_bytes());
                frame.extend_from_slice(&((offset >> 32) as u32).to_be_bytes());
                frame.extend_from_slice(&(offset as u32).to_be_bytes());
                frame.extend_from_slice(&(*seek as u32).to_be_bytes());
                frame.extend_from_slice(&chunk.bytes());
                frame
            }
        }
    }
}

/// The sending half plus task supervision. Dropping it closes the
/// outbound direction; the reader side lives until the peer goes away.
pub struct PStream {
    tx: mpsc::UnboundedSender<SendItem>,
    dead: Arc<AtomicBool>,
}

impl PStream {
    /// Layers a packet stream over `stream`. Inbound frames arrive on
    /// the returned event receiver; memblock payloads are allocated
    /// from `pool`.
    pub fn new<S>(stream: S, pool: MemPool) -> (PStream, mpsc::UnboundedReceiver<PStreamEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::unbounded_channel::<SendItem>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<PStreamEvent>();
        let dead = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(
            write_half,
            out_rx,
            event_tx.clone(),
            dead.clone(),
        ));
        tokio::spawn(read_loop(read_half, pool, event_tx, dead.clone()));

        (PStream { tx: out_tx, dead }, event_rx)
    }

    /// Queues a control packet. Never blocks.
    pub fn send_packet(&self, packet: Packet) -> Result<(), WireError> {
        self.tx
            .send(SendItem::Packet(packet))
            .map_err(|_| WireError::Died)
    }

    /// Queues an audio frame. Never blocks.
    pub fn send_memblock(
        &self,
        channel: u32,
        offset: i64,
        seek: SeekMode,
        chunk: MemChunk,
    ) -> Result<(), WireError> {
        self.tx
            .send(SendItem::MemBlock {
                channel,
                offset,
                seek,
                chunk,
            })
            .map_err(|_| WireError::Died)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

async fn write_loop<W>(
    mut w: W,
    mut rx: mpsc::UnboundedReceiver<SendItem>,
    events: mpsc::UnboundedSender<PStreamEvent>,
    dead: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    'outer: while let Some(first) = rx.recv().await {
        if dead.load(Ordering::Acquire) {
            return;
        }
        // Écrit tout ce qui est déjà en file, puis signale le drain.
        let mut item = first;
        loop {
            let frame = item.encode();
            if let Err(e) = w.write_all(&frame).await {
                die(&dead, &events, e.into());
                return;
            }
            trace!("pstream: wrote frame of {} bytes", frame.len());
            match rx.try_recv() {
                Ok(next) => item = next,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if let Err(e) = w.flush().await {
                        die(&dead, &events, e.into());
                        return;
                    }
                    break 'outer;
                }
            }
        }
        if let Err(e) = w.flush().await {
            die(&dead, &events, e.into());
            return;
        }
        let _ = events.send(PStreamEvent::Drained);
    }
    // Sender dropped: orderly shutdown of the outbound direction.
    let _ = w.shutdown().await;
}

async fn read_loop<R>(
    mut r: R,
    pool: MemPool,
    events: mpsc::UnboundedSender<PStreamEvent>,
    dead: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let mut descriptor = [0u8; DESCRIPTOR_SIZE];
        match r.read_exact(&mut descriptor).await {
            Ok(_) => {}
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    die(&dead, &events, e.into());
                } else {
                    debug!("pstream: peer closed");
                    die(&dead, &events, WireError::Died);
                }
                return;
            }
        }
        let length = u32::from_be_bytes(descriptor[0..4].try_into().unwrap());
        let channel = u32::from_be_bytes(descriptor[4..8].try_into().unwrap());
        let offset_hi = u32::from_be_bytes(descriptor[8..12].try_into().unwrap());
        let offset_lo = u32::from_be_bytes(descriptor[12..16].try_into().unwrap());
        let flags = u32::from_be_bytes(descriptor[16..20].try_into().unwrap());

        if length > FRAME_SIZE_MAX {
            die(&dead, &events, WireError::FrameTooLarge(length));
            return;
        }

        if channel == CHANNEL_CONTROL {
            let mut payload = vec![0u8; length as usize];
            if let Err(e) = r.read_exact(&mut payload).await {
                die(&dead, &events, e.into());
                return;
            }
            if events.send(PStreamEvent::Packet(Packet::new(payload))).is_err() {
                return;
            }
        } else {
            let Some(seek) = SeekMode::from_wire(flags & 0x3) else {
                die(
                    &dead,
                    &events,
                    WireError::Malformed(format!("bad seek flags {flags:#x}")),
                );
                return;
            };
            let mut block = match pool.alloc(length as usize) {
                Ok(b) => b,
                Err(_) => pool.alloc_appended(length as usize),
            };
            {
                let Some(data) = block.try_mut() else {
                    die(
                        &dead,
                        &events,
                        WireError::Malformed("fresh block not writable".into()),
                    );
                    return;
                };
                if let Err(e) = r.read_exact(data).await {
                    die(&dead, &events, e.into());
                    return;
                }
            }
            let offset = (((offset_hi as u64) << 32) | offset_lo as u64) as i64;
            let event = PStreamEvent::MemBlock {
                channel,
                offset,
                seek,
                chunk: MemChunk::new(block),
            };
            if events.send(event).is_err() {
                return;
            }
        }
    }
}

fn die(dead: &AtomicBool, events: &mpsc::UnboundedSender<PStreamEvent>, err: WireError) {
    if !dead.swap(true, Ordering::AcqRel) {
        let _ = events.send(PStreamEvent::Died(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> MemPool {
        MemPool::new(64 * 1024, 32)
    }

    fn chunk_of(pool: &MemPool, data: &[u8]) -> MemChunk {
        let mut b = pool.alloc(data.len()).unwrap();
        b.try_mut().unwrap().copy_from_slice(data);
        MemChunk::new(b)
    }

    #[tokio::test]
    async fn control_packet_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let (ps_a, _ev_a) = PStream::new(a, pool());
        let (_ps_b, mut ev_b) = PStream::new(b, pool());

        ps_a.send_packet(Packet::new(vec![1, 2, 3, 4])).unwrap();
        match ev_b.recv().await.unwrap() {
            PStreamEvent::Packet(p) => assert_eq!(p.data(), &[1, 2, 3, 4]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn memblock_frame_carries_metadata() {
        let p = pool();
        let (a, b) = tokio::io::duplex(4096);
        let (ps_a, _ev_a) = PStream::new(a, p.clone());
        let (_ps_b, mut ev_b) = PStream::new(b, pool());

        ps_a.send_memblock(3, 0x1_0000_0002, SeekMode::Absolute, chunk_of(&p, &[9; 16]))
            .unwrap();
        match ev_b.recv().await.unwrap() {
            PStreamEvent::MemBlock {
                channel,
                offset,
                seek,
                chunk,
            } => {
                assert_eq!(channel, 3);
                assert_eq!(offset, 0x1_0000_0002);
                assert_eq!(seek, SeekMode::Absolute);
                assert_eq!(&*chunk.bytes(), &[9u8; 16]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn wire_overhead_is_twenty_bytes_per_frame() {
        // Writes N packets into one duplex half and counts raw bytes on
        // the other end.
        let (a, b) = tokio::io::duplex(1 << 20);
        let (ps_a, _ev_a) = PStream::new(a, pool());
        let lengths = [0usize, 1, 7, 100];
        for l in lengths {
            ps_a.send_packet(Packet::new(vec![0xabu8; l])).unwrap();
        }
        // Give the writer task a chance to flush everything.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(ps_a);
        let mut raw = Vec::new();
        let mut b = b;
        tokio::io::AsyncReadExt::read_to_end(&mut b, &mut raw)
            .await
            .unwrap();
        let expected: usize =
            lengths.iter().sum::<usize>() + DESCRIPTOR_SIZE * lengths.len();
        assert_eq!(raw.len(), expected);
    }

    #[tokio::test]
    async fn dying_stream_reports_once() {
        let p = pool();
        let (a, b) = tokio::io::duplex(4096);
        let (ps_a, mut ev_a) = PStream::new(a, p.clone());
        drop(b);
        ps_a.send_packet(Packet::new(vec![1])).unwrap();
        // Either the writer or the reader notices first; exactly one
        // Died event must surface.
        loop {
            match ev_a.recv().await {
                Some(PStreamEvent::Died(_)) => break,
                Some(_) => continue,
                None => panic!("event channel closed without Died"),
            }
        }
        assert!(ps_a.is_dead());
    }

    #[tokio::test]
    async fn drained_fires_when_queue_empties() {
        let (a, b) = tokio::io::duplex(4096);
        let (ps_a, mut ev_a) = PStream::new(a, pool());
        let (_ps_b, _ev_b) = PStream::new(b, pool());
        ps_a.send_packet(Packet::new(vec![1, 2])).unwrap();
        loop {
            match ev_a.recv().await.unwrap() {
                PStreamEvent::Drained => break,
                PStreamEvent::Died(e) => panic!("died: {e}"),
                _ => continue,
            }
        }
    }
}
