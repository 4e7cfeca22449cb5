//! Optional authenticity proof on webhook callbacks.
//!
//! When a webhook secret is configured, every callback carries
//! [`TIMESTAMP_HEADER`] (unix seconds) and [`SIGNATURE_HEADER`], the hex
//! HMAC-SHA256 of `"{timestamp}.{signedMessage}"`. Receivers recompute it
//! with [`compute_signature`].

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-Callback-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Callback-Timestamp";

type HmacSha256 = Hmac<Sha256>;

pub(crate) struct CallbackHeaders {
    pub signature: String,
    pub timestamp: String,
}

pub(crate) fn build_callback_headers(secret: &[u8], signed_message: &str) -> CallbackHeaders {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string();

    CallbackHeaders {
        signature: compute_signature(secret, &timestamp, signed_message),
        timestamp,
    }
}

fn mac_over(secret: &[u8], timestamp: &str, signed_message: &str) -> HmacSha256 {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret).unwrap_or_else(|_| unreachable!());
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(signed_message.as_bytes());
    mac
}

/// Hex HMAC-SHA256 over `"{timestamp}.{signed_message}"`.
pub fn compute_signature(secret: &[u8], timestamp: &str, signed_message: &str) -> String {
    hex::encode(mac_over(secret, timestamp, signed_message).finalize().into_bytes())
}
