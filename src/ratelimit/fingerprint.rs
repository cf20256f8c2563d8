//! Caller identity and fingerprint derivation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{FloodgateError, Result};

/// Placeholder used for any identity attribute the caller could not supply.
pub const UNKNOWN: &str = "unknown";

/// Default prefix for storage entry names.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit_";

/// Length of a hex-encoded SHA-256 digest.
const FINGERPRINT_LEN: usize = 64;

/// Attributes describing who is making a request.
///
/// Built by whatever sits in front of the limiter (an HTTP handler, a CLI).
/// Missing or empty attributes are replaced by [`UNKNOWN`] when hashed, so a
/// fingerprint can always be derived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    address: Option<String>,
    user_agent: Option<String>,
    token: Option<String>,
}

impl Identity {
    /// Create an identity from a network address and a user agent.
    pub fn new(address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self::default().address(address).user_agent(user_agent)
    }

    /// Set the network address.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = non_empty(address.into());
        self
    }

    /// Set the user agent string.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = non_empty(user_agent.into());
        self
    }

    /// Attach a long-lived caller token (e.g. from a cookie).
    ///
    /// The token is carried for continuity only. It never contributes to the
    /// fingerprint: a caller can drop a cookie at will, and doing so must not
    /// reset their history.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = non_empty(token.into());
        self
    }

    pub fn address_or_unknown(&self) -> &str {
        self.address.as_deref().unwrap_or(UNKNOWN)
    }

    pub fn user_agent_or_unknown(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(UNKNOWN)
    }

    /// The supplemental token, if any.
    pub fn caller_token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// A stable key identifying one caller performing one action.
///
/// The key is the lowercase hex SHA-256 digest of
/// `action + "_" + address + "_" + user_agent`.
///
/// Deserialization applies the same validation as [`Fingerprint::parse`], so a
/// deserialized fingerprint is always safe to use in a storage entry name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive the fingerprint for an action performed by an identity.
    pub fn new(action: &str, identity: &Identity) -> Self {
        let action = if action.is_empty() { UNKNOWN } else { action };

        let mut hasher = Sha256::new();
        hasher.update(action.as_bytes());
        hasher.update(b"_");
        hasher.update(identity.address_or_unknown().as_bytes());
        hasher.update(b"_");
        hasher.update(identity.user_agent_or_unknown().as_bytes());

        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a fingerprint previously produced by [`Fingerprint::new`].
    pub fn from_hex(value: &str) -> Option<Self> {
        if value.len() == FINGERPRINT_LEN && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(value.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Like [`Fingerprint::from_hex`] but reports the offending input.
    pub fn parse(value: &str) -> Result<Self> {
        Self::from_hex(value).ok_or_else(|| FloodgateError::InvalidFingerprint(value.to_string()))
    }

    /// Recover a fingerprint from a storage entry name, e.g. `ratelimit_<hex>`.
    ///
    /// Only the exact name [`Fingerprint::storage_key`] produces is accepted,
    /// so every recovered fingerprint maps back to the same entry.
    pub fn from_storage_key(key: &str, prefix: &str) -> Option<Self> {
        let hex = key.strip_prefix(prefix)?;
        let canonical = hex.len() == FINGERPRINT_LEN
            && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        canonical.then(|| Self(hex.to_string()))
    }

    /// The deterministic storage entry name for this fingerprint.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FloodgateError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.0
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
