//! Provider webhook signature checks.

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

/// Twilio scheme: base64 HMAC-SHA1 over the full callback URL followed by
/// every form parameter as `key + value`, sorted by key.
pub fn verify_sms_signature(
    url: &str,
    params: &[(String, String)],
    signature_header: &str,
    auth_token: &str,
) -> bool {
    if auth_token.is_empty() {
        return false;
    }

    let Ok(expected) = STANDARD.decode(signature_header.trim()) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(auth_token.as_bytes()) else {
        return false;
    };

    mac.update(sms_signing_payload(url, params).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn sms_signing_payload(url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    let mut payload = url.to_string();
    for (key, value) in sorted {
        payload.push_str(key);
        payload.push_str(value);
    }
    payload
}

/// Mailgun scheme: hex HMAC-SHA256 of `timestamp + token` keyed by the
/// webhook signing key. An unset or empty key rejects everything.
pub fn verify_email_signature(
    signing_key: Option<&str>,
    timestamp: &str,
    token: &str,
    signature: &str,
) -> bool {
    let Some(key) = signing_key.filter(|k| !k.is_empty()) else {
        return false;
    };

    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(key.as_bytes()) else {
        return false;
    };

    mac.update(timestamp.as_bytes());
    mac.update(token.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Computes the Twilio signature; used to sign requests in tests and tools.
pub fn sign_sms(url: &str, params: &[(String, String)], auth_token: &str) -> Option<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(auth_token.as_bytes()).ok()?;
    mac.update(sms_signing_payload(url, params).as_bytes());
    Some(STANDARD.encode(mac.finalize().into_bytes()))
}

pub fn sign_email(signing_key: &str, timestamp: &str, token: &str) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(signing_key.as_bytes()).ok()?;
    mac.update(timestamp.as_bytes());
    mac.update(token.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}
