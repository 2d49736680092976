use crate::errcode::ErrCode;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed wire data: {0}")]
    Malformed(String),
    #[error("frame of {0} bytes exceeds the allowed maximum")]
    FrameTooLarge(u32),
    #[error("packet stream died")]
    Died,
    #[error("peer reported error: {0:?}")]
    Remote(ErrCode),
    #[error("request timed out")]
    Timeout,
    #[error("cookie file invalid: {0}")]
    BadCookie(String),
}

impl WireError {
    /// Protocol error code to report for this failure.
    pub fn errcode(&self) -> ErrCode {
        match self {
            WireError::Io(_) => ErrCode::Io,
            WireError::Malformed(_) => ErrCode::Protocol,
            WireError::FrameTooLarge(_) => ErrCode::TooLarge,
            WireError::Died => ErrCode::ConnectionTerminated,
            WireError::Remote(code) => *code,
            WireError::Timeout => ErrCode::Timeout,
            WireError::BadCookie(_) => ErrCode::AuthKey,
        }
    }
}
