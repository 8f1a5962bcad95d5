//! Stateless HMAC helpers.
//!
//! - inbound download/measure URLs carry `s` (signature) and `e` (expiry,
//!   base-36 milliseconds) query parameters checked by [`check_sign`]
//! - the token challenge is signed with [`create_hmac_sha256`]
//! - downloaded content is verified with [`validate_file`]

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::{Digest, Sha1};
use sha2::Sha256;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Verify the `s`/`e` pair of a signed URL for `hash` against the wall clock.
pub fn check_sign(hash: &str, secret: &str, s: Option<&str>, e: Option<&str>) -> bool {
    check_sign_at(hash, secret, s, e, now_millis())
}

/// Same as [`check_sign`] with an explicit `now` in milliseconds.
pub fn check_sign_at(
    hash: &str,
    secret: &str,
    s: Option<&str>,
    e: Option<&str>,
    now_ms: i64,
) -> bool {
    let (Some(s), Some(e)) = (s, e) else {
        return false;
    };

    let Ok(expires_at) = i64::from_str_radix(e, 36) else {
        return false;
    };
    if now_ms >= expires_at {
        return false;
    }

    let Ok(signature) = URL_SAFE_NO_PAD.decode(s) else {
        return false;
    };

    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(secret.as_bytes());
    mac.update(hash.as_bytes());
    mac.update(e.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

/// Produce the `(s, e)` pair that [`check_sign`] accepts until `expires_at_ms`.
pub fn sign_url(hash: &str, secret: &str, expires_at_ms: i64) -> (String, String) {
    let e = to_radix36(expires_at_ms);
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC takes keys of any size");
    mac.update(secret.as_bytes());
    mac.update(hash.as_bytes());
    mac.update(e.as_bytes());
    let s = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    (s, e)
}

/// Hex encoded `HMAC-SHA256(secret, data)`.
pub fn create_hmac_sha256(secret: &str, data: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC takes keys of any size");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Compare `data` against a hex digest; MD5 when the digest is 32
/// characters long, SHA-1 otherwise.
pub fn validate_file(data: &[u8], hash: &str) -> bool {
    let digest = if hash.len() == 32 {
        hex::encode(Md5::digest(data))
    } else {
        hex::encode(Sha1::digest(data))
    };
    digest.eq_ignore_ascii_case(hash)
}

/// Content-addressed storage path: `hash[0:2]/hash`.
pub fn hash_to_filename(hash: &str) -> String {
    let prefix = hash.get(0..2).unwrap_or(hash);
    format!("{}/{}", prefix, hash)
}

fn to_radix36(mut value: i64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let negative = value < 0;
    let mut out = Vec::new();
    while value != 0 {
        out.push(DIGITS[(value % 36).unsigned_abs() as usize]);
        value /= 36;
    }
    if negative {
        out.push(b'-');
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
