//! Request context captured at connect time and the persisted session
//! snapshot used for reconnect continuity.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Header carrying the id of a previous session to restore.
pub const RESTORE_SID_HEADER: &str = "x-restore-sid";

/// Request path and headers of a connection. Immutable after connect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnv {
    /// Request path (including query string).
    pub path: String,
    /// Request headers with lower-cased names.
    pub headers: HashMap<String, String>,
}

impl SessionEnv {
    /// Creates an environment, normalising header names to lower case.
    #[must_use]
    pub fn new<I, K, V>(path: impl Into<String>, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            path: path.into(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
        }
    }

    /// Looks up a header case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Session id the client asks to restore, if any.
    #[must_use]
    pub fn restore_sid(&self) -> Option<&str> {
        self.header(RESTORE_SID_HEADER).filter(|sid| !sid.is_empty())
    }
}

/// Serializable protocol state committed to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Connection identifiers returned by authentication.
    pub identifiers: String,
    /// Channel identifier → attached streams.
    pub subscriptions: BTreeMap<String, BTreeSet<String>>,
}

impl SessionSnapshot {
    /// Encodes the snapshot as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a snapshot previously produced by [`Self::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns the JSON error if `raw` is not a snapshot.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let env = SessionEnv::new("/ws", [("X-Restore-Sid", "abc"), ("Cookie", "a=1")]);
        assert_eq!(env.header("cookie"), Some("a=1"));
        assert_eq!(env.restore_sid(), Some("abc"));
    }

    #[test]
    fn empty_restore_header_is_ignored() {
        let env = SessionEnv::new("/ws", [(RESTORE_SID_HEADER, "")]);
        assert_eq!(env.restore_sid(), None);
    }

    #[test]
    fn snapshot_bytes_are_json() {
        let mut snapshot = SessionSnapshot {
            identifiers: "user:1".to_string(),
            ..SessionSnapshot::default()
        };
        snapshot
            .subscriptions
            .entry("chat".to_string())
            .or_default()
            .insert("room:1".to_string());

        let bytes = snapshot.to_bytes().unwrap_or_default();
        let restored = SessionSnapshot::from_bytes(&bytes).ok();
        assert_eq!(restored, Some(snapshot));
    }
}
