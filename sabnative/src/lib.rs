//! # sabnative - The native client/server protocol
//!
//! Server side: a listener (UNIX or TCP socket) accepting framed
//! packet streams, authenticating against the cookie, and mapping
//! protocol commands onto the routing core.
//!
//! Client side: [`Context`] speaks the same dialect from the other
//! end, with playback and record streams; [`Simple`] wraps it into a
//! blocking facade.

pub mod address;
pub mod client;
pub mod error;
pub mod server;
pub mod simple;

pub use address::ServerAddress;
pub use client::{Context, PlaybackStream, RecordStream};
pub use error::NativeError;
pub use server::NativeServer;
pub use simple::{Simple, StreamDirection};

/// Default TCP port of the native protocol.
pub const DEFAULT_PORT: u16 = 4713;

/// Reply timeout applied by the client to every request.
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
