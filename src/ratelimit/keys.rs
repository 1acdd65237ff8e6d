//! Key derivation for attempt state.

use sha2::{Digest, Sha256};
use std::borrow::Cow;

/// Identifiers up to this length are embedded in store keys as-is.
pub const MAX_VERBATIM_IDENTIFIER_LEN: usize = 20;

/// Hex characters kept from the identifier digest.
const DIGEST_HEX_LEN: usize = 32;

/// Separates the segments of a store key.
const KEY_SEPARATOR: char = ':';

/// A key that uniquely identifies an (identifier, action) pair in memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub identifier: String,
    pub action: String,
}

impl PairKey {
    /// Create a new pair key.
    pub fn new(identifier: &str, action: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            action: action.to_string(),
        }
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.identifier, self.action)
    }
}

/// Bound the identifier length inside store keys.
///
/// Short identifiers such as IPv4 addresses stay readable; longer ones
/// (emails, UUIDs, tokens) and any containing the key separator are replaced
/// by a truncated SHA-256 hex digest. The component never contains `:`, so
/// the last separator in a key always splits action from identifier.
pub fn identifier_component(identifier: &str) -> Cow<'_, str> {
    if identifier.len() <= MAX_VERBATIM_IDENTIFIER_LEN && !identifier.contains(KEY_SEPARATOR) {
        return Cow::Borrowed(identifier);
    }
    let digest = format!("{:x}", Sha256::digest(identifier.as_bytes()));
    Cow::Owned(digest[..DIGEST_HEX_LEN].to_string())
}

/// The pair of store keys holding one pair's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    /// Attempt counter, expires at window end
    pub counter: String,
    /// Block marker holding the unblock Unix timestamp, expires with the block
    pub block: String,
}

impl StoreKeys {
    /// Derive keys under `prefix`, scoped by action.
    ///
    /// Format: `{prefix}:c:{action}:{identifier}` and `{prefix}:b:{action}:{identifier}`
    pub fn new(prefix: &str, identifier: &str, action: &str) -> Self {
        let id = identifier_component(identifier);
        Self {
            counter: format!("{}:c:{}:{}", prefix, action, id),
            block: format!("{}:b:{}:{}", prefix, action, id),
        }
    }
}

/// Glob matching every counter key under `prefix`.
pub fn counter_pattern(prefix: &str) -> String {
    format!("{}:c:*", prefix)
}

/// Glob matching every block key under `prefix`.
pub fn block_pattern(prefix: &str) -> String {
    format!("{}:b:*", prefix)
}
