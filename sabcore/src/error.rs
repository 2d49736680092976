#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("memory pool exhausted")]
    PoolExhausted,
    #[error("requested {requested} bytes, pool maximum is {max}")]
    TooLarge { requested: usize, max: usize },
    #[error("block is read-only")]
    ReadOnly,
    #[error("invalid sample specification: {0}")]
    InvalidSpec(String),
    #[error("invalid channel map: {0}")]
    InvalidMap(String),
    #[error("invalid argument: {0}")]
    InvalidArg(String),
}
