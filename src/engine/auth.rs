//! Password authentication responses.
use md5::{Digest, Md5};

/// Build the response to an md5 authentication request:
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub(crate) fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = hex::encode(Md5::new().chain_update(password).chain_update(user).finalize());
    let outer = hex::encode(Md5::new().chain_update(inner).chain_update(salt).finalize());
    format!("md5{outer}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn md5_response() {
        let response = md5_password("mosespg", "secret", *b"abcd");
        assert_eq!(response, "md56acb18ff26bb044bc3c5b7ade3695281");
    }
}
