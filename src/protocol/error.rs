use std::str::Utf8Error;

/// An error raised while decoding backend messages.
///
/// A conforming server never triggers these; when one occurs the
/// connection is unusable and is marked failed.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type (0x{0:02x})")]
    UnknownMessage(u8),
    #[error("unknown authentication request ({0})")]
    UnknownAuth(i32),
    #[error("unexpected message (0x{0:02x}) while {1}")]
    Unexpected(u8, &'static str),
    #[error("message body ended before the nul terminator")]
    MissingNul,
    #[error("message body is not utf8: {0}")]
    NonUtf8(#[from] Utf8Error),
    #[error("message body shorter than its layout requires")]
    Truncated,
}
