//! Session state: credentials, sync cursor, endpoint pinning, snapshots.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::transport::{CookieRecord, Transport};

/// Hosts the service load-balances browsers onto. One is pinned per session.
const WX_ENDPOINTS: [&str; 2] = ["wx.qq.com", "wx2.qq.com"];

// ─── SyncKey ──────────────────────────────────────────────────────────────────

/// The server-issued sync cursor: an ordered list of `(key, value)` pairs.
///
/// Opaque to the client apart from its two renderings — the JSON wire shape
/// `{"Count": n, "List": [{"Key": k, "Val": v}]}` for sync bodies and the
/// compact `k_v|k_v` string for the status-check query. Always replaced
/// wholesale with whatever the server returns, never merged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncKey {
    pairs: Vec<(i64, i64)>,
}

impl SyncKey {
    pub fn new(pairs: Vec<(i64, i64)>) -> Self {
        Self { pairs }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Compact query rendering, e.g. `1_654321|2_654322`.
    pub fn render(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{k}_{v}"))
            .collect::<Vec<_>>()
            .join("|")
    }
}

#[derive(Serialize, Deserialize)]
struct WireSyncKey {
    #[serde(rename = "Count")]
    count: usize,
    #[serde(rename = "List")]
    list: Vec<WirePair>,
}

#[derive(Serialize, Deserialize)]
struct WirePair {
    #[serde(rename = "Key")]
    key: i64,
    #[serde(rename = "Val")]
    val: i64,
}

impl Serialize for SyncKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = WireSyncKey {
            count: self.pairs.len(),
            list: self.pairs.iter().map(|&(key, val)| WirePair { key, val }).collect(),
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SyncKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireSyncKey::deserialize(deserializer)?;
        Ok(Self { pairs: wire.list.into_iter().map(|p| (p.key, p.val)).collect() })
    }
}

// ─── WxSession ────────────────────────────────────────────────────────────────

/// Credentials handed out by the login page, plus the current sync cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WxSession {
    pub skey: String,
    pub pass_ticket: String,
    pub wxsid: String,
    pub wxuin: i64,
    pub isgrayscale: bool,
    #[serde(default)]
    pub sync_key: SyncKey,
}

// ─── Session manager ──────────────────────────────────────────────────────────

/// Tracks where the client stands: which endpoint it is pinned to, whether
/// the QR scan was confirmed (`authorized`) and whether the server-side
/// session is live (`online`).
pub struct Session {
    transport: Arc<dyn Transport>,
    wx_session: Option<WxSession>,
    endpoint: Option<String>,
    authorized: bool,
    online: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("authorized", &self.authorized)
            .field("online", &self.online)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            wx_session: None,
            endpoint: None,
            authorized: false,
            online: false,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The pinned endpoint host, picking one pseudo-randomly on first use.
    ///
    /// A session must keep talking to the host that issued it; the only
    /// legitimate migration is the redirect host recorded by
    /// [`finish_authorize`](Self::finish_authorize).
    pub fn wx_endpoint(&mut self) -> &str {
        if self.endpoint.is_none() {
            let mut byte = [0u8; 1];
            let idx = match getrandom::getrandom(&mut byte) {
                Ok(()) => byte[0] as usize % WX_ENDPOINTS.len(),
                Err(_) => 0,
            };
            self.endpoint = Some(WX_ENDPOINTS[idx].to_string());
        }
        self.endpoint.as_deref().unwrap_or(WX_ENDPOINTS[0])
    }

    /// Record a confirmed QR scan and the server-assigned redirect host.
    pub fn finish_authorize(&mut self, host: &str) {
        debug!(host, "authorization confirmed");
        self.endpoint = Some(host.to_string());
        self.authorized = true;
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    /// A live, initialized server-side session exists.
    pub fn is_active(&self) -> bool {
        self.online && self.wx_session.is_some()
    }

    /// Install freshly minted credentials. No-op while a session is active;
    /// re-initializing a live session would desynchronize the cursor.
    pub fn initialize(&mut self, wx_session: WxSession) {
        if self.is_active() {
            return;
        }
        self.wx_session = Some(wx_session);
    }

    pub fn wx_session(&self) -> Option<&WxSession> {
        self.wx_session.as_ref()
    }

    /// Replace the sync cursor wholesale. Marks the session online; the
    /// flag never goes back down except through [`close`](Self::close) or
    /// [`load`](Self::load).
    pub fn advance_sync_key(&mut self, sync_key: SyncKey) {
        if let Some(ws) = self.wx_session.as_mut() {
            ws.sync_key = sync_key;
            self.online = true;
        }
    }

    pub fn dump(&self) -> SessionSnapshot {
        SessionSnapshot {
            wx_session: self.wx_session.clone(),
            cookies: self.transport.export_cookies(),
            endpoint: self.endpoint.clone(),
        }
    }

    /// Restore from a snapshot.
    ///
    /// A snapshot carrying credentials is assumed to come from a session
    /// that was both authorized and initialized; the flat format cannot
    /// express "authorized but never logged in".
    pub fn load(&mut self, snapshot: SessionSnapshot) {
        self.transport.import_cookies(&snapshot.cookies);
        self.endpoint = snapshot.endpoint;
        let populated = snapshot.wx_session.is_some();
        self.wx_session = snapshot.wx_session;
        self.authorized = populated;
        self.online = populated;
    }

    pub fn close(&mut self) {
        self.wx_session = None;
        self.endpoint = None;
        self.authorized = false;
        self.online = false;
    }
}

/// Flat, serializable image of a [`Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub wx_session: Option<WxSession>,
    pub cookies: Vec<CookieRecord>,
    pub endpoint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_key_renders_in_wire_order() {
        let key = SyncKey::new(vec![(1, 654_321), (2, 654_322), (3, 7)]);
        assert_eq!(key.render(), "1_654321|2_654322|3_7");
        assert_eq!(SyncKey::default().render(), "");
    }

    #[test]
    fn sync_key_wire_shape() {
        let key = SyncKey::new(vec![(1, 10), (2, 20)]);
        let value = serde_json::to_value(&key).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "Count": 2,
                "List": [{"Key": 1, "Val": 10}, {"Key": 2, "Val": 20}],
            })
        );
        let back: SyncKey = serde_json::from_value(value).unwrap();
        assert_eq!(back, key);
    }
}
