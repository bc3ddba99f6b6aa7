//! Namespace signature verification and admin credential checks.
//!
//! Namespaces are signed with an HMAC over the namespace string using a
//! pre-shared secret (`web.mac_secret`). The admin credential
//! (`web.admin_auth`) is compared the same way. Both comparisons run in
//! constant time with respect to the compared value: see `constant_time_eq`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub struct Signer {
    mac_secret: Vec<u8>,
    admin_auth: String,
}

impl Signer {
    pub fn new(mac_secret: Vec<u8>, admin_auth: String) -> Self {
        Self {
            mac_secret,
            admin_auth,
        }
    }

    /// Recomputes the MAC over `namespace` and compares it against
    /// `signature` (a lowercase hex string) in constant time.
    pub fn validate_signature(&self, namespace: &str, signature: &str) -> Result<()> {
        let mut mac = HmacSha256::new_from_slice(&self.mac_secret).expect("HMAC accepts any key length");
        mac.update(namespace.as_bytes());
        let expected = hex_encode(&mac.finalize().into_bytes());

        if constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            Ok(())
        } else {
            Err(Error::BadSignature)
        }
    }

    /// Constant-time comparison of a caller-supplied admin credential
    /// against the configured one.
    pub fn check_admin(&self, token: &str) -> bool {
        constant_time_eq(self.admin_auth.as_bytes(), token.as_bytes())
    }
}

/// Compares two byte slices without branching on the first mismatch: XORs
/// each corresponding byte into an accumulator, folds in a length-mismatch
/// flag, and only inspects the accumulator once both slices have been fully
/// walked (to the length of the longer one).
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut acc: u8 = if a.len() != b.len() { 1 } else { 0 };
    let longest = a.len().max(b.len());
    for i in 0..longest {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        acc |= x ^ y;
    }
    acc == 0
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to String cannot fail");
    }
    out
}
