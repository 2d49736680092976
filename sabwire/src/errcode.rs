//! Protocol-visible error codes.
//!
//! These values travel on the wire inside `ERROR` replies and must not
//! change.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrCode {
    Ok = 0,
    /// Cookie mismatch or missing capability.
    Access = 1,
    /// Unknown command code or unimplemented operation.
    Command = 2,
    /// Decode failure or out-of-range argument.
    Invalid = 3,
    /// An object with the chosen name already exists.
    Exist = 4,
    /// Named sink/source/index does not exist.
    NoEntity = 5,
    /// Transport-level refusal.
    ConnectionRefused = 6,
    /// Wire framing violated.
    Protocol = 7,
    /// Reply timer expired.
    Timeout = 8,
    /// Cookie file missing or malformed.
    AuthKey = 9,
    /// Assertion-class failure.
    Internal = 10,
    /// The packet stream died mid-session.
    ConnectionTerminated = 11,
    /// Stream removed by server-side policy.
    Killed = 12,
    /// Object state rejects the operation.
    Busy = 13,
    /// Underlying read/write failed.
    Io = 14,
    /// Operation deliberately not provided.
    NotSupported = 15,
    /// Request exceeds a hard size bound.
    TooLarge = 16,
    /// Anything the peer sent that we cannot classify.
    Unknown = 17,
}

impl ErrCode {
    pub fn from_wire(v: u32) -> ErrCode {
        match v {
            0 => ErrCode::Ok,
            1 => ErrCode::Access,
            2 => ErrCode::Command,
            3 => ErrCode::Invalid,
            4 => ErrCode::Exist,
            5 => ErrCode::NoEntity,
            6 => ErrCode::ConnectionRefused,
            7 => ErrCode::Protocol,
            8 => ErrCode::Timeout,
            9 => ErrCode::AuthKey,
            10 => ErrCode::Internal,
            11 => ErrCode::ConnectionTerminated,
            12 => ErrCode::Killed,
            13 => ErrCode::Busy,
            14 => ErrCode::Io,
            15 => ErrCode::NotSupported,
            16 => ErrCode::TooLarge,
            _ => ErrCode::Unknown,
        }
    }
}

impl std::fmt::Display for ErrCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
