use bytes::{Buf, BufMut, Bytes};

use crate::protocol::ProtocolError;

pub trait UsizeExt {
    /// Lengths are `usize` in rust while the protocol wants `i32`,
    /// panic on overflow instead of wrapping.
    fn to_i32(self) -> i32;
}

impl UsizeExt for usize {
    fn to_i32(self) -> i32 {
        match i32::try_from(self) {
            Ok(ok) => ok,
            Err(err) => panic!("message too large for protocol: {err}"),
        }
    }
}

pub trait StrExt {
    /// Encoded length of self as a nul terminated protocol string.
    fn nul_len(&self) -> i32;
}

impl StrExt for str {
    fn nul_len(&self) -> i32 {
        self.len().to_i32() + 1
    }
}

pub trait BufMutExt {
    /// Protocol strings are nul terminated.
    fn put_str_nul(&mut self, string: &str);
}

impl<B: BufMut> BufMutExt for B {
    fn put_str_nul(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }
}

pub trait BytesExt {
    /// Split off a nul terminated string, consuming the terminator.
    fn get_str_nul(&mut self) -> Result<String, ProtocolError>;
}

impl BytesExt for Bytes {
    fn get_str_nul(&mut self) -> Result<String, ProtocolError> {
        let Some(nul) = self.iter().position(|b| *b == b'\0') else {
            return Err(ProtocolError::MissingNul);
        };
        let string = self.split_to(nul);
        self.advance(1);
        String::from_utf8(string.into()).map_err(|err| ProtocolError::NonUtf8(err.utf8_error()))
    }
}
