//! # sabrtp - Transport RTP et annonces SAP
//!
//! L'envoi découpe une file mémoire en paquets RTP (en-tête RFC 3550,
//! charge PCM) ; la réception reconstruit des vues mémoire datées. Les
//! sessions sont annoncées périodiquement en SAP/SDP sur le groupe
//! multicast dédié.
//!
//! Les deux ponts vers le cœur de routage : [`RtpSendStream`] (un
//! source-output qui émet ce qu'il capture) et [`RtpRecvStream`] (un
//! sink-input qui joue ce qu'il reçoit).

pub mod error;
pub mod recv;
pub mod rtp;
pub mod sap;
pub mod sdp;
pub mod send;
pub mod sockutil;

pub use error::RtpError;
pub use recv::RtpRecvStream;
pub use rtp::{RtpHeader, RtpReceiver, RtpSender, MAX_IOVECS, PAYLOAD_DYNAMIC};
pub use sap::{SapPacket, SapSender, SAP_MULTICAST_ADDR, SAP_PORT};
pub use sdp::SdpInfo;
pub use send::RtpSendStream;
