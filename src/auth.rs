//! Authentication
//!
//! HMAC-SHA256 signatures for private/presence channel subscriptions and
//! for the signed HTTP API. Both are keyed by the app secret.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::app::App;
use crate::channel::ChannelType;
use crate::connection::SocketId;
use crate::error::{BrokerError, Result};

type HmacSha256 = Hmac<Sha256>;

fn hmac_hex(secret: &str, message: &str) -> String {
    // HMAC accepts keys of any length, so new_from_slice cannot fail.
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// The string a subscription signature covers:
/// `<socket_id>:<channel>` for private channels,
/// `<socket_id>:<channel>:<channel_data>` for presence channels.
fn subscription_message(
    socket_id: &SocketId,
    channel: &str,
    channel_data: Option<&str>,
) -> String {
    match channel_data {
        Some(data) => format!("{}:{}:{}", socket_id, channel, data),
        None => format!("{}:{}", socket_id, channel),
    }
}

/// Produces the `<app_key>:<hex_signature>` auth string clients present on
/// subscribe. Server-side counterpart used by tests and auth endpoints.
pub fn subscription_auth(
    app: &App,
    socket_id: &SocketId,
    channel: &str,
    channel_data: Option<&str>,
) -> String {
    let message = subscription_message(socket_id, channel, channel_data);
    format!("{}:{}", app.key, hmac_hex(&app.secret, &message))
}

/// Verifies a subscribe request against the channel's auth requirements.
///
/// Public channels always pass. Private and presence channels require a
/// valid `<key>:<signature>` auth string; presence channels additionally
/// require `channel_data` since the signature covers it.
pub fn verify_subscription(
    app: &App,
    socket_id: &SocketId,
    channel: &str,
    auth: Option<&str>,
    channel_data: Option<&str>,
) -> Result<()> {
    let kind = ChannelType::from_name(channel);
    if !kind.requires_auth() {
        return Ok(());
    }
    if kind == ChannelType::Presence && channel_data.is_none() {
        return Err(BrokerError::PresenceDataMissing);
    }

    let auth = auth.ok_or(BrokerError::InvalidSignature)?;
    let (key, signature) = auth.split_once(':').ok_or(BrokerError::InvalidSignature)?;
    if key != app.key {
        return Err(BrokerError::InvalidSignature);
    }

    let message = subscription_message(socket_id, channel, channel_data);
    let expected = hmac_hex(&app.secret, &message);
    if signature.eq_ignore_ascii_case(&expected) {
        Ok(())
    } else {
        Err(BrokerError::InvalidSignature)
    }
}

// ---------------------------------------------------------------------------
// Signed HTTP API
// ---------------------------------------------------------------------------

/// Query keys that never participate in the canonical string.
const EXCLUDED_PARAMS: [&str; 5] = [
    "auth_signature",
    "body_md5",
    "appId",
    "appKey",
    "channelName",
];

/// Builds the canonical string for a signed API request:
/// `<METHOD>\n<path>\nkey1=value1&key2=value2...` with lexicographically
/// sorted keys. A non-empty body contributes a computed `body_md5` pair.
pub fn canonical_request<'a, I>(method: &str, path: &str, params: I, body: &[u8]) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut sorted: BTreeMap<String, String> = params
        .into_iter()
        .filter(|(key, _)| !EXCLUDED_PARAMS.contains(key))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

    if !body.is_empty() {
        let digest = Md5::digest(body);
        sorted.insert("body_md5".to_string(), hex::encode(digest));
    }

    let query = sorted
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}\n{}\n{}", method.to_uppercase(), path, query)
}

/// Signs a canonical API request under the app secret.
pub fn sign_api_request<'a, I>(
    secret: &str,
    method: &str,
    path: &str,
    params: I,
    body: &[u8],
) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    hmac_hex(secret, &canonical_request(method, path, params, body))
}

/// Verifies the `auth_signature` query parameter of a signed API request.
pub fn verify_api_signature<'a, I>(
    app: &App,
    method: &str,
    path: &str,
    params: I,
    provided_signature: Option<&str>,
    body: &[u8],
) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let provided = provided_signature.ok_or(BrokerError::InvalidSignature)?;
    let expected = sign_api_request(&app.secret, method, path, params, body);
    if provided.eq_ignore_ascii_case(&expected) {
        Ok(())
    } else {
        Err(BrokerError::InvalidSignature)
    }
}
