use std::io;

use thiserror::Error;

/// Errors surfaced while decoding a stream or profiling its events.
///
/// End of stream is not an error; the decoder and the stream orchestrator
/// report it as a distinct non-error value.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid stream signature")]
    InvalidSignature,

    #[error("unexpected tag 0x{tag:02x} at offset {offset}")]
    UnexpectedTag { tag: u8, offset: u64 },

    #[error("unknown object type {0:?}")]
    UnknownObjectType(String),

    #[error("event references unknown metadata id {0}")]
    MissingMetadata(i32),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("decode: {0}")]
    Decode(#[from] binrw::Error),

    #[error("handler: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps a foreign error returned by an [`EventSink`] implementation.
    ///
    /// [`EventSink`]: crate::nettrace::EventSink
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Handler(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
