/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload is not the expected JSON document.
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// The value could not be serialized.
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// A text frame carried bytes that are not UTF-8.
    #[error("text frame payload is not valid UTF-8")]
    InvalidUtf8,

    /// A control message (ping, pong, close) was handed to the codec.
    #[error("control messages carry no application payload")]
    UnexpectedControl,
}

pub type Result<T> = std::result::Result<T, FrameError>;
