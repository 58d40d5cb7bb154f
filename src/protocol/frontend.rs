//! Postgres frontend messages.
//!
//! Struct fields mirror the actual message bodies sent to the backend.
use bytes::{BufMut, Bytes, BytesMut};

use super::{CANCEL_REQUEST_CODE, PROTOCOL_VERSION};
use crate::ext::{BufMutExt, StrExt, UsizeExt};

/// Write a frontend message into `buf`, header included.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size = msg.size_hint();
    buf.reserve(PREFIX + size as usize);

    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_i32(4 + size);

    msg.encode(&mut *buf);

    debug_assert_eq!(
        buf.len() - offset,
        PREFIX + size as usize,
        "frontend message body not equal to its size hint",
    );
}

/// A type which can be encoded into a postgres frontend message.
///
/// [`Startup`] and [`CancelRequest`] carry no type byte and therefore do
/// not implement this trait; they expose `write` directly.
pub trait FrontendProtocol {
    /// Message type byte.
    const MSGTYPE: u8;

    /// Size of the message body, excluding the header.
    fn size_hint(&self) -> i32;

    /// Write the message body.
    fn encode(self, buf: impl BufMut);
}

/// The startup packet opening a session.
///
/// For historical reasons this very first message has no type byte.
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required, there is no default.
    pub user: &'a str,
    /// The database to connect to. The server defaults it to the user name.
    pub database: Option<&'a str>,
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let mut size = 4 + 4 + "user".nul_len() + self.user.nul_len() + 1;
        if let Some(db) = self.database {
            size += "database".nul_len() + db.nul_len();
        }

        buf.reserve(size as usize);
        buf.put_i32(size);
        buf.put_i32(PROTOCOL_VERSION);
        buf.put_str_nul("user");
        buf.put_str_nul(self.user);
        if let Some(db) = self.database {
            buf.put_str_nul("database");
            buf.put_str_nul(db);
        }
        // terminator after the last name/value pair
        buf.put_u8(b'\0');
    }
}

/// Out-of-band request to cancel the query in progress on another
/// connection. Sent on a fresh connection instead of a startup packet;
/// carries no type byte.
#[derive(Debug)]
pub struct CancelRequest {
    /// Process id of the target backend.
    pub process_id: i32,
    /// Secret key for the target backend, from `BackendKeyData`.
    pub secret_key: i32,
}

impl CancelRequest {
    pub fn write(self, buf: &mut BytesMut) {
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

/// A password response, cleartext or md5-hashed depending on what the
/// authentication request asked for.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.password.nul_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_str_nul(self.password);
    }
}

/// A simple query. The sql may hold several semicolon separated statements.
#[derive(Debug)]
pub struct Query<'a> {
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> i32 {
        self.sql.nul_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_str_nul(self.sql);
    }
}

/// Create a prepared statement out of a textual query.
#[derive(Debug)]
pub struct Parse<'a> {
    /// Statement name, empty selects the unnamed statement.
    pub statement: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Parameter type oids the frontend wants to prespecify. May be fewer
    /// than the parameters appearing in the query; zero leaves a type
    /// unspecified.
    pub param_oids: &'a [i32],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> i32 {
        self.statement.nul_len() + self.sql.nul_len() + 2 + self.param_oids.len().to_i32() * 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_str_nul(self.statement);
        buf.put_str_nul(self.sql);
        buf.put_i16(self.param_oids.len() as i16);
        for oid in self.param_oids {
            buf.put_i32(*oid);
        }
    }
}

/// Create a portal from a prepared statement and parameter values.
///
/// Format code lists may be empty (everything text), hold a single code
/// applied to all columns, or one code per column. `None` values encode as
/// the NULL length `-1`.
#[derive(Debug)]
pub struct Bind<'a> {
    /// Destination portal name, empty selects the unnamed portal.
    pub portal: &'a str,
    /// Source prepared statement name.
    pub statement: &'a str,
    pub param_formats: &'a [i16],
    pub params: &'a [Option<Bytes>],
    pub result_formats: &'a [i16],
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn size_hint(&self) -> i32 {
        self.portal.nul_len()
            + self.statement.nul_len()
            + 2
            + self.param_formats.len().to_i32() * 2
            + 2
            + self
                .params
                .iter()
                .fold(0i32, |acc, p| acc + 4 + p.as_ref().map_or(0, |v| v.len().to_i32()))
            + 2
            + self.result_formats.len().to_i32() * 2
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_str_nul(self.portal);
        buf.put_str_nul(self.statement);

        buf.put_i16(self.param_formats.len() as i16);
        for format in self.param_formats {
            buf.put_i16(*format);
        }

        buf.put_i16(self.params.len() as i16);
        for param in self.params {
            match param {
                Some(value) => {
                    buf.put_i32(value.len().to_i32());
                    buf.put_slice(value);
                }
                None => buf.put_i32(-1),
            }
        }

        buf.put_i16(self.result_formats.len() as i16);
        for format in self.result_formats {
            buf.put_i16(*format);
        }
    }
}

/// Request the description of a prepared statement (`'S'`) or a portal
/// (`'P'`).
#[derive(Debug)]
pub struct Describe<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_str_nul(self.name);
    }
}

/// Run a portal's query.
#[derive(Debug)]
pub struct Execute<'a> {
    /// Portal name, empty selects the unnamed portal.
    pub portal: &'a str,
    /// Maximum number of rows to return before suspending the portal.
    /// Zero denotes no limit.
    pub max_rows: i32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> i32 {
        self.portal.nul_len() + 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_str_nul(self.portal);
        buf.put_i32(self.max_rows);
    }
}

/// Close a prepared statement (`'S'`) or a portal (`'P'`).
#[derive(Debug)]
pub struct Close<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_str_nul(self.name);
    }
}

macro_rules! bodyless {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl FrontendProtocol for $name {
            const MSGTYPE: u8 = $ty;

            fn size_hint(&self) -> i32 { 0 }

            fn encode(self, _: impl BufMut) { }
        }
    )*};
}

bodyless! {
    /// Force the backend to deliver every response queued for the current
    /// extended-query step without closing the cycle.
    struct Flush, b'H';

    /// Close the current extended-query cycle; discards any error state and
    /// elicits `ReadyForQuery`.
    struct Sync, b'S';

    /// Gracefully end the session.
    struct Terminate, b'X';
}

#[cfg(test)]
mod test {
    use super::*;

    fn encoded<F: FrontendProtocol>(msg: F) -> BytesMut {
        let mut buf = BytesMut::new();
        write(msg, &mut buf);
        buf
    }

    #[test]
    fn encode_query() {
        let buf = encoded(Query { sql: "select * from people" });
        assert_eq!(&buf[..], b"Q\x00\x00\x00\x19select * from people\0");
    }

    #[test]
    fn encode_parse() {
        let buf = encoded(Parse {
            statement: "statement1",
            sql: "select * from users where id = $1",
            param_oids: &[23],
        });
        assert_eq!(
            &buf[..],
            &b"P\x00\x00\x00\x37statement1\0select * from users where id = $1\0\x00\x01\x00\x00\x00\x17"[..],
        );
    }

    #[test]
    fn encode_bind_all_text() {
        let buf = encoded(Bind {
            portal: "port1",
            statement: "stmt1",
            param_formats: &[],
            params: &[
                Some(Bytes::from_static(b"this is a test")),
                Some(Bytes::from_static(b"hello")),
            ],
            result_formats: &[],
        });
        assert_eq!(
            &buf[..],
            &b"B\x00\x00\x00\x31port1\0stmt1\0\x00\x00\x00\x02\
               \x00\x00\x00\x0ethis is a test\x00\x00\x00\x05hello\x00\x00"[..],
        );
    }

    #[test]
    fn encode_bind_null() {
        let buf = encoded(Bind {
            portal: "",
            statement: "",
            param_formats: &[],
            params: &[None],
            result_formats: &[],
        });
        assert_eq!(&buf[..], &b"B\x00\x00\x00\x10\0\0\x00\x00\x00\x01\xff\xff\xff\xff\x00\x00"[..]);
    }

    #[test]
    fn encode_password() {
        let buf = encoded(PasswordMessage { password: "this is a test" });
        assert_eq!(&buf[..], b"p\x00\x00\x00\x13this is a test\0");
    }

    #[test]
    fn encode_describe() {
        let buf = encoded(Describe { kind: b'S', name: "statement1" });
        assert_eq!(&buf[..], b"D\x00\x00\x00\x10Sstatement1\0");

        let buf = encoded(Describe { kind: b'P', name: "portal1" });
        assert_eq!(&buf[..], b"D\x00\x00\x00\x0dPportal1\0");
    }

    #[test]
    fn encode_execute() {
        let buf = encoded(Execute { portal: "portal1", max_rows: 100 });
        assert_eq!(&buf[..], b"E\x00\x00\x00\x10portal1\0\x00\x00\x00\x64");
    }

    #[test]
    fn encode_bodyless() {
        assert_eq!(&encoded(Flush)[..], b"H\x00\x00\x00\x04");
        assert_eq!(&encoded(Sync)[..], b"S\x00\x00\x00\x04");
        assert_eq!(&encoded(Terminate)[..], b"X\x00\x00\x00\x04");
    }

    #[test]
    fn encode_cancel_request() {
        let mut buf = BytesMut::new();
        CancelRequest { process_id: 123, secret_key: 456 }.write(&mut buf);
        assert_eq!(
            &buf[..],
            &b"\x00\x00\x00\x10\x04\xd2\x16\x2e\x00\x00\x00\x7b\x00\x00\x01\xc8"[..],
        );
    }

    #[test]
    fn encode_startup() {
        let mut buf = BytesMut::new();
        Startup { user: "jim", database: Some("inventory") }.write(&mut buf);
        assert_eq!(
            &buf[..],
            &b"\x00\x00\x00\x25\x00\x03\x00\x00user\0jim\0database\0inventory\0\0"[..],
        );
    }
}
