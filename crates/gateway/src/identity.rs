//! Device identity seam for the connect handshake.
//!
//! The long-term keypair and signature scheme live in an external identity
//! module; the client only needs the id, the public key, and a signature
//! over the canonical connect payload built here.

use std::collections::BTreeSet;

/// Provider of the relay's long-term device identity.
pub trait DeviceIdentity: Send + Sync {
    fn device_id(&self) -> &str;
    fn public_key(&self) -> &str;
    /// Sign the canonical connect payload; the returned string goes into
    /// `device.signature` verbatim.
    fn sign(&self, payload: &str) -> String;
}

/// Canonical payload the Gateway verifies the device signature against.
///
/// Format: `v2|deviceId|clientId|clientMode|role|sortedScopesCsv|signedAtMs|token|nonce`
/// with scopes sorted and deduped, and absent token/nonce serialized as
/// empty segments.
pub fn canonical_connect_payload(
    device_id: &str,
    client_id: &str,
    client_mode: &str,
    role: &str,
    scopes: &[String],
    signed_at_ms: u64,
    token: Option<&str>,
    nonce: Option<&str>,
) -> String {
    let scopes_csv = sorted_scopes_csv(scopes);
    format!(
        "v2|{device_id}|{client_id}|{client_mode}|{role}|{scopes_csv}|{signed_at_ms}|{}|{}",
        token.unwrap_or(""),
        nonce.unwrap_or("")
    )
}

fn sorted_scopes_csv(scopes: &[String]) -> String {
    let sorted: BTreeSet<&str> = scopes.iter().map(String::as_str).collect();
    sorted.into_iter().collect::<Vec<_>>().join(",")
}
