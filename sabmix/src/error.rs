use sabcore::CoreError;
use sabloop::LoopError;

#[derive(thiserror::Error, Debug)]
pub enum MixError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Loop(#[from] LoopError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no such entity: {0}")]
    NoEntity(String),
    #[error("an object named {0} already exists")]
    Exist(String),
    #[error("operation invalid in state {0:?}")]
    BadState(crate::types::DeviceState),
    #[error("stream is part of a synchronised group")]
    SyncGroup,
    #[error("incompatible specification: {0}")]
    Incompatible(String),
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("object already unlinked")]
    Unlinked,
}
