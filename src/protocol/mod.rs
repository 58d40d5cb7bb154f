//! Postgres frontend and backend wire protocol.
//!
//! All communication is a stream of messages. The first byte identifies the
//! message type, the next four bytes are the length of the rest of the
//! message in network order. The length counts itself but not the type byte.
//!
//! ```text
//! | u8 |        i32        | body
//! |----|-------------------|-----
//! | 51 | 00 | 00 | 00 | 0B |  ..
//! ```
//!
//! For historical reasons the very first message sent by the client (the
//! startup message) and the cancel request have no type byte; they are
//! recognized by context, not by registry lookup.
//!
//! [`buffer::FrameBuffer`] reassembles complete frames out of arbitrary
//! network chunks, [`frontend`] encodes outbound messages and [`backend`]
//! decodes inbound ones.

pub mod buffer;
pub mod frontend;
pub mod backend;

mod error;

pub use backend::{BackendMessage, BackendProtocol};
pub use error::ProtocolError;
pub use frontend::FrontendProtocol;

/// The protocol major/minor version sent in the startup message, `3 << 16`.
pub const PROTOCOL_VERSION: i32 = 0x0003_0000;

/// The magic request code of a cancel request, chosen to collide with no
/// protocol version.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
