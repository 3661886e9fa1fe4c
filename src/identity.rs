use std::{fmt::Display, str::FromStr};

use data_encoding::{BASE64URL_NOPAD, HEXLOWER};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::IdError;

const COMPOSITE_SEPARATOR: char = '.';

fn hash_pair(first: &str, second: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(first.as_bytes());
    // NUL can't appear in either half, so ("ab", "c") and ("a", "bc") stay distinct.
    hasher.update([0u8]);
    hasher.update(second.as_bytes());
    HEXLOWER.encode(&hasher.finalize())
}

/// Identity of an SSH session, derived from the resolved user and dial address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(user: &str, dial_address: &str) -> Self {
        SessionId(hash_pair(user, dial_address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        SessionId(value)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a forward within its session, derived from its address pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForwardId(String);

impl ForwardId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ForwardId {
    fn from(value: String) -> Self {
        ForwardId(value)
    }
}

impl Display for ForwardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A local listening address and the remote address it relays to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressPair {
    pub local: String,
    pub remote: String,
}

impl AddressPair {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        AddressPair {
            local: local.into(),
            remote: remote.into(),
        }
    }

    pub fn id(&self) -> ForwardId {
        ForwardId(hash_pair(&self.local, &self.remote))
    }
}

impl Display for AddressPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// Externally visible forward identifier, combining the session and forward identities.
///
/// Serialized as `base64url(session).base64url(forward)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeId {
    pub session: SessionId,
    pub forward: ForwardId,
}

impl CompositeId {
    pub fn new(session: SessionId, forward: ForwardId) -> Self {
        CompositeId { session, forward }
    }
}

impl Display for CompositeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            BASE64URL_NOPAD.encode(self.session.0.as_bytes()),
            COMPOSITE_SEPARATOR,
            BASE64URL_NOPAD.encode(self.forward.0.as_bytes())
        )
    }
}

fn decode_half(half: &str) -> Result<String, IdError> {
    let bytes = BASE64URL_NOPAD
        .decode(half.as_bytes())
        .map_err(|error| IdError::Encoding(error.to_string()))?;
    String::from_utf8(bytes).map_err(|error| IdError::Encoding(error.to_string()))
}

impl FromStr for CompositeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (session, forward) = s
            .split_once(COMPOSITE_SEPARATOR)
            .ok_or(IdError::MissingSeparator)?;
        Ok(CompositeId {
            session: SessionId(decode_half(session)?),
            forward: ForwardId(decode_half(forward)?),
        })
    }
}
