//! # sabraop - RAOP/AirTunes client sink
//!
//! Speaks the Apple RAOP extensions to RTSP: session establishment
//! (OPTIONS/ANNOUNCE/SETUP/RECORD), AES-encrypted ALAC audio over TCP
//! or UDP, and the UDP auxiliary channels (sync, timing, retransmit).
//!
//! [`RaopSink`] bridges a session into the routing core as a sink
//! back-end.

pub mod alac;
pub mod client;
pub mod crypto;
pub mod error;
pub mod ntp;
pub mod packet_buffer;
pub mod rtsp;
pub mod sink;

pub use client::{RaopClient, RaopProtocol};
pub use error::RaopError;
pub use ntp::NtpTimestamp;
pub use packet_buffer::PacketBuffer;
pub use rtsp::{RtspClient, RtspResponse, RtspStatus};
pub use sink::RaopSink;

/// Default RTSP port of an AirTunes receiver.
pub const DEFAULT_PORT: u16 = 5000;

/// Frames carried by one UDP audio packet.
pub const FRAMES_PER_PACKET: usize = 352;

/// Fixed receiver-side delay, in samples at 44100 Hz.
pub const LATENCY_SAMPLES: u32 = 88200;
