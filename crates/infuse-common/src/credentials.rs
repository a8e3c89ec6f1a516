//! Network credential store.
//!
//! Network root keys are provisioned out-of-band and stored in a TOML file
//! keyed by 24-bit network id. Production keys never appear in source; test
//! fixtures construct stores in memory.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

/// 32-byte root key material for a network.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkKey(pub [u8; 32]);

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material is never logged.
        f.write_str("NetworkKey(..)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to read credential store: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse credential store: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("network {network_id:#08x}: {reason}")]
    InvalidKey { network_id: u32, reason: String },
}

#[derive(Deserialize)]
struct StoreFile {
    #[serde(default)]
    networks: HashMap<String, NetworkEntry>,
}

#[derive(Deserialize)]
struct NetworkEntry {
    /// 32-byte key, hex encoded.
    key: String,
}

/// In-memory view of the credential store.
#[derive(Debug, Default)]
pub struct CredentialStore {
    networks: HashMap<u32, NetworkKey>,
}

impl CredentialStore {
    /// Load from the TOML store file. Network ids are `network-%06x` table
    /// keys or plain decimal/hex strings.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let raw = std::fs::read_to_string(path)?;
        let file: StoreFile = toml::from_str(&raw)?;

        let mut networks = HashMap::new();
        for (name, entry) in file.networks {
            let network_id = parse_network_id(&name).ok_or_else(|| {
                CredentialError::InvalidKey {
                    network_id: 0,
                    reason: format!("unparseable network id {name:?}"),
                }
            })?;
            let bytes = hex::decode(&entry.key).map_err(|e| CredentialError::InvalidKey {
                network_id,
                reason: e.to_string(),
            })?;
            let key: [u8; 32] =
                bytes
                    .try_into()
                    .map_err(|v: Vec<u8>| CredentialError::InvalidKey {
                        network_id,
                        reason: format!("expected 32 key bytes, got {}", v.len()),
                    })?;
            networks.insert(network_id, NetworkKey(key));
        }

        tracing::debug!(networks = networks.len(), "Credential store loaded");
        Ok(Self { networks })
    }

    /// Build a store from explicit entries. Intended for tests and tooling.
    pub fn from_entries(entries: impl IntoIterator<Item = (u32, NetworkKey)>) -> Self {
        Self {
            networks: entries.into_iter().collect(),
        }
    }

    pub fn network_key(&self, network_id: u32) -> Option<&NetworkKey> {
        self.networks.get(&network_id)
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

fn parse_network_id(name: &str) -> Option<u32> {
    if let Some(hex_part) = name.strip_prefix("network-") {
        return u32::from_str_radix(hex_part, 16).ok();
    }
    if let Some(hex_part) = name.strip_prefix("0x") {
        return u32::from_str_radix(hex_part, 16).ok();
    }
    name.parse().ok()
}
