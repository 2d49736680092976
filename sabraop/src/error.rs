use crate::rtsp::RtspStatus;

#[derive(thiserror::Error, Debug)]
pub enum RaopError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("RTSP error reply: {0:?}")]
    Rtsp(RtspStatus),
    #[error("malformed RTSP response: {0}")]
    BadResponse(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("session is not streaming")]
    NotStreaming,
    #[error("invalid packet on {channel} channel")]
    BadPacket { channel: &'static str },
}
