use sabwire::ErrCode;

#[derive(thiserror::Error, Debug)]
pub enum NativeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] sabwire::WireError),
    #[error(transparent)]
    Mix(#[from] sabmix::MixError),
    #[error(transparent)]
    Core(#[from] sabcore::CoreError),
    #[error(transparent)]
    Loop(#[from] sabloop::LoopError),
    #[error("server replied with error: {0}")]
    Server(ErrCode),
    #[error("invalid server address: {0}")]
    BadAddress(String),
    #[error("connection is not in the required state: {0}")]
    BadState(String),
    #[error("stream killed by the server")]
    Killed,
}

impl NativeError {
    /// Wire error code to report back for this failure.
    pub fn errcode(&self) -> ErrCode {
        match self {
            NativeError::Io(_) => ErrCode::Io,
            NativeError::Wire(w) => w.errcode(),
            NativeError::Mix(m) => match m {
                sabmix::MixError::NoEntity(_) => ErrCode::NoEntity,
                sabmix::MixError::Exist(_) => ErrCode::Exist,
                sabmix::MixError::BadState(_) => ErrCode::Busy,
                sabmix::MixError::SyncGroup => ErrCode::Busy,
                sabmix::MixError::Incompatible(_) => ErrCode::Invalid,
                sabmix::MixError::Unlinked => ErrCode::NoEntity,
                _ => ErrCode::Internal,
            },
            NativeError::Core(_) => ErrCode::Invalid,
            NativeError::Loop(_) => ErrCode::Internal,
            NativeError::Server(code) => *code,
            NativeError::BadAddress(_) => ErrCode::Invalid,
            NativeError::BadState(_) => ErrCode::Busy,
            NativeError::Killed => ErrCode::Killed,
        }
    }
}
