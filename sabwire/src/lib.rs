//! # sabwire - Native wire protocol plumbing
//!
//! Everything that frames, serialises and routes control traffic
//! between a Sabine client and server:
//!
//! - [`Packet`]: a reference-counted wire packet
//! - [`TagStruct`]: the typed, self-describing payload serialiser
//! - [`PStream`]: packet + memblock framing over a byte channel
//! - [`PDispatch`]: command dispatch and reply routing with timeouts
//! - [`Command`] / [`ErrCode`]: the protocol command and error codes
//! - [`cookie`]: the authentication cookie file
//!
//! The audio payload path stays in `sabcore`; this crate only moves
//! references to memory blocks around.

pub mod command;
pub mod cookie;
pub mod errcode;
pub mod error;
pub mod packet;
pub mod pdispatch;
pub mod pstream;
pub mod tagstruct;

pub use command::Command;
pub use errcode::ErrCode;
pub use error::WireError;
pub use packet::Packet;
pub use pdispatch::{PDispatch, ReplyEvent};
pub use pstream::{PStream, PStreamEvent, SendItem};
pub use tagstruct::TagStruct;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 8;

/// Size of the authentication cookie, bytes.
pub const COOKIE_SIZE: usize = 256;
