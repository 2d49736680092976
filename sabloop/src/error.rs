#[derive(thiserror::Error, Debug)]
pub enum LoopError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message queue closed")]
    QueueClosed,
    #[error("message target gone before replying")]
    NoReply,
    #[error("message refused by target: {0}")]
    Refused(String),
    #[error("io thread failed to start: {0}")]
    Spawn(String),
}
