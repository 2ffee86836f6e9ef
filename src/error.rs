use thiserror::Error;

/// Errors produced by the serializer seam.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("payload is not valid UTF-8: {0}")]
    NotText(#[from] std::str::Utf8Error),
}

/// Errors produced by an exchange session or the wire itself.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("exchange code must not be zero")]
    ZeroExchangeCode,

    #[error("no stream attached to this session")]
    NotConnected,

    #[error("peer closed the stream")]
    PeerClosed,

    #[error("session has been closed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
