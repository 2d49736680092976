#[derive(thiserror::Error, Debug)]
pub enum RtpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid RTP packet: {0}")]
    BadPacket(String),
    #[error("unexpected SSRC {got:#x}, session is {want:#x}")]
    SsrcMismatch { got: u32, want: u32 },
    #[error("unexpected payload type {0}")]
    BadPayload(u8),
    #[error("invalid SDP: {0}")]
    BadSdp(String),
    #[error(transparent)]
    Mix(#[from] sabmix::MixError),
    #[error(transparent)]
    Core(#[from] sabcore::CoreError),
}
