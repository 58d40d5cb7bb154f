//! Postgres backend messages.
use bytes::{Buf, Bytes};
use std::collections::HashMap;

use super::error::ProtocolError;
use crate::ext::BytesExt;

/// A type that can be decoded from a postgres backend message.
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Every backend message the engine consumes.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    CopyBothResponse(CopyBothResponse),
    CopyInResponse(CopyInResponse),
    CopyOutResponse(CopyOutResponse),
    DataRow(DataRow),
    EmptyQueryResponse(EmptyQueryResponse),
    ErrorResponse(ErrorResponse),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! registry {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }
        }

        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::UnknownMessage(msgtype)),
                };
                Ok(message)
            }
        }
    };
}

registry! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    CopyBothResponse,
    CopyInResponse,
    CopyOutResponse,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    NoData,
    NoticeResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

macro_rules! assert_msgtype {
    ($self:ident, $typ:ident) => {
        if $self::MSGTYPE != $typ {
            return Err(ProtocolError::Unexpected($typ, concat!("decoding ", stringify!($self))));
        }
    };
}

macro_rules! need {
    ($body:ident, $n:expr) => {
        if $body.remaining() < $n {
            return Err(ProtocolError::Truncated);
        }
    };
}

/// An authentication request, sub-dispatched on the leading `Int32`.
#[derive(Debug)]
pub enum Authentication {
    /// Authentication succeeded, or none was required.
    Ok,
    /// Kerberos V5 authentication is required.
    KerberosV5,
    /// A clear-text password is required.
    CleartextPassword,
    /// An MD5-encrypted password is required; the four salt bytes follow.
    Md5Password { salt: [u8; 4] },
    /// An SCM credentials message is required.
    ScmCredential,
    /// GSSAPI authentication is required.
    Gss,
    /// Continuation data for a GSSAPI or SSPI exchange.
    GssContinue { data: Bytes },
    /// SSPI authentication is required.
    Sspi,
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';

    /// Name of the mechanism, for unsupported-auth diagnostics.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Ok => "trust",
            Self::KerberosV5 => "kerberos v5",
            Self::CleartextPassword => "cleartext password",
            Self::Md5Password { .. } => "md5 password",
            Self::ScmCredential => "scm credential",
            Self::Gss => "gssapi",
            Self::GssContinue { .. } => "gssapi continuation",
            Self::Sspi => "sspi",
        }
    }
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Authentication, msgtype);
        need!(body, 4);
        let auth = match body.get_i32() {
            0 => Self::Ok,
            2 => Self::KerberosV5,
            3 => Self::CleartextPassword,
            5 => {
                need!(body, 4);
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Self::Md5Password { salt }
            }
            6 => Self::ScmCredential,
            7 => Self::Gss,
            8 => Self::GssContinue { data: body },
            9 => Self::Sspi,
            kind => return Err(ProtocolError::UnknownAuth(kind)),
        };
        Ok(auth)
    }
}

/// Cancellation key data. The frontend must save these values to be able
/// to issue `CancelRequest` messages later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    pub process_id: i32,
    pub secret_key: i32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(BackendKeyData, msgtype);
        need!(body, 8);
        Ok(Self { process_id: body.get_i32(), secret_key: body.get_i32() })
    }
}

/// A run-time parameter status report.
#[derive(Debug)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ParameterStatus, msgtype);
        Ok(Self { name: body.get_str_nul()?, value: body.get_str_nul()? })
    }
}

/// The backend is ready for a new query cycle. The status byte reports the
/// transaction state: `'I'` idle, `'T'` inside a transaction block, `'E'`
/// inside a failed transaction block.
#[derive(Debug)]
pub struct ReadyForQuery {
    pub status: u8,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ReadyForQuery, msgtype);
        need!(body, 1);
        Ok(Self { status: body.get_u8() })
    }
}

/// The tagged field list shared by [`ErrorResponse`] and
/// [`NoticeResponse`]: `{tag byte, nul string}` records terminated by a
/// single zero byte. Unknown tags are preserved verbatim.
#[derive(Debug, Clone, Default)]
pub struct Fields(Vec<(u8, String)>);

impl Fields {
    pub(crate) fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        let mut fields = Vec::new();
        loop {
            need!(body, 1);
            let tag = body.get_u8();
            if tag == 0 {
                break;
            }
            fields.push((tag, body.get_str_nul()?));
        }
        Ok(Self(fields))
    }

    /// Value of the field with the given tag byte, if present.
    pub fn get(&self, tag: u8) -> Option<&str> {
        self.0.iter().find(|(t, _)| *t == tag).map(|(_, v)| v.as_str())
    }

    /// All fields keyed by their long names. Unknown tags keep their
    /// single-character tag as key.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.0
            .iter()
            .map(|(tag, value)| {
                let key = match field_name(*tag) {
                    Some(name) => name.to_owned(),
                    None => (*tag as char).to_string(),
                };
                (key, value.clone())
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &str)> {
        self.0.iter().map(|(t, v)| (*t, v.as_str()))
    }
}

/// Long name of an error/notice field tag.
pub fn field_name(tag: u8) -> Option<&'static str> {
    Some(match tag {
        b'S' => "Severity",
        b'C' => "Code",
        b'M' => "Message",
        b'D' => "Detail",
        b'H' => "Hint",
        b'P' => "Position",
        b'p' => "Internal position",
        b'q' => "Internal query",
        b'W' => "Where",
        b'F' => "File",
        b'L' => "Line",
        b'R' => "Routine",
        _ => return None,
    })
}

/// An error report. Ends the operation it refers to; recovery depends on
/// the phase it arrives in.
#[derive(Debug)]
pub struct ErrorResponse {
    pub fields: Fields,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ErrorResponse, msgtype);
        Ok(Self { fields: Fields::decode(&mut body)? })
    }
}

/// A warning. Never ends an operation; the engine attaches it to the
/// result being accumulated.
#[derive(Debug)]
pub struct NoticeResponse {
    pub fields: Fields,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(NoticeResponse, msgtype);
        Ok(Self { fields: Fields::decode(&mut body)? })
    }
}

/// One column of a [`RowDescription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// The field name.
    pub name: String,
    /// Oid of the originating table, zero when the field is computed.
    pub table_oid: i32,
    /// Attribute number within the originating table, zero when computed.
    pub attribute: i16,
    /// Oid of the field's data type.
    pub type_oid: i32,
    /// Data type size; negative values denote variable-width types.
    pub type_size: i16,
    /// Type modifier, e.g. declared varchar length plus four.
    pub type_modifier: i32,
    /// Format code, zero (text) or one (binary).
    pub format: i16,
}

/// Column layout of the rows about to be returned.
#[derive(Debug)]
pub struct RowDescription {
    pub columns: Vec<Column>,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(RowDescription, msgtype);
        need!(body, 2);
        let len = body.get_u16();
        let mut columns = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let name = body.get_str_nul()?;
            need!(body, 18);
            columns.push(Column {
                name,
                table_oid: body.get_i32(),
                attribute: body.get_i16(),
                type_oid: body.get_i32(),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: body.get_i16(),
            });
        }
        Ok(Self { columns })
    }
}

/// One row of a result set. Values stay raw; `-1` lengths decode to `None`.
#[derive(Debug)]
pub struct DataRow {
    pub values: Vec<Option<Bytes>>,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(DataRow, msgtype);
        need!(body, 2);
        let len = body.get_u16();
        let mut values = Vec::with_capacity(len as usize);
        for _ in 0..len {
            need!(body, 4);
            match body.get_i32() {
                -1 => values.push(None),
                n => {
                    need!(body, n as usize);
                    values.push(Some(body.split_to(n as usize)));
                }
            }
        }
        Ok(Self { values })
    }
}

/// A command completed normally; the tag names the command and usually a
/// processed-row count, e.g. `DELETE 10`.
#[derive(Debug)]
pub struct CommandComplete {
    pub tag: String,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(CommandComplete, msgtype);
        Ok(Self { tag: body.get_str_nul()? })
    }
}

/// Parameter types of a described prepared statement.
#[derive(Debug)]
pub struct ParameterDescription {
    pub oids: Vec<i32>,
}

impl ParameterDescription {
    pub const MSGTYPE: u8 = b't';
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ParameterDescription, msgtype);
        need!(body, 2);
        let len = body.get_u16();
        let mut oids = Vec::with_capacity(len as usize);
        for _ in 0..len {
            need!(body, 4);
            oids.push(body.get_i32());
        }
        Ok(Self { oids })
    }
}

macro_rules! copy_response {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name {
            /// Overall format: zero textual, one binary.
            pub format: i8,
            /// Per-column format codes.
            pub column_formats: Vec<i16>,
        }

        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!($name, msgtype);
                need!(body, 3);
                let format = body.get_i8();
                let len = body.get_u16();
                let mut column_formats = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    need!(body, 2);
                    column_formats.push(body.get_i16());
                }
                Ok(Self { format, column_formats })
            }
        }
    )*};
}

copy_response! {
    /// The backend wants to start a copy-in stream. Unsupported; the engine
    /// fails the connection when one arrives.
    struct CopyInResponse, b'G';

    /// The backend wants to start a copy-out stream. Unsupported.
    struct CopyOutResponse, b'H';

    /// The backend wants to start a copy-both stream. Unsupported.
    struct CopyBothResponse, b'W';
}

macro_rules! bodyless {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!($name, msgtype);
                Ok(Self)
            }
        }
    )*};
}

bodyless! {
    /// A Parse step completed.
    struct ParseComplete, b'1';

    /// A Bind step completed.
    struct BindComplete, b'2';

    /// A Close step completed.
    struct CloseComplete, b'3';

    /// The query string was empty. Substitutes for `CommandComplete`.
    struct EmptyQueryResponse, b'I';

    /// A statement-variant Describe matched a statement returning no rows.
    struct NoData, b'n';

    /// An Execute row limit was reached before the portal ran dry.
    struct PortalSuspended, b's';
}
