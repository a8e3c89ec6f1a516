//! # infuse-db
//!
//! Registry of current device state for a gateway process: which devices
//! have been observed, which networks they belong to, their Bluetooth
//! addresses, public keys and cloud shared secrets, plus the derived-key
//! cache every interface codec pulls from.
//!
//! The registry is a plain value owned by the gateway service; workers share
//! it behind a mutex. Records live for the process lifetime.

pub mod keys;

use std::collections::HashMap;

use infuse_common::{BtAddr, InfuseId, Interface};

use crate::keys::{DerivedKeyCache, KeyRoot};
pub use infuse_common::credentials::{CredentialStore, NetworkKey};

/// Key-material failures surfaced to the decode path. The gateway reacts to
/// each differently: ping for unknown networks, handshake synthesis for
/// unknown device keys, record poisoning for a changed key id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("device {0} has never been observed")]
    UnknownDevice(InfuseId),

    #[error("no key material configured for network {network_id:#08x}")]
    UnknownNetwork { network_id: u32 },

    #[error("no shared secret for device {0} yet")]
    UnknownDeviceKey(InfuseId),

    #[error("device key for {0} has changed")]
    DeviceKeyChanged(InfuseId),
}

/// Failure to obtain a cloud shared secret.
#[derive(Debug, thiserror::Error)]
#[error("shared secret resolution failed: {0}")]
pub struct ResolveError(pub String);

/// Seam to the cloud endpoint that exchanges a device public key for the
/// device/cloud shared secret. The production implementation lives with the
/// cloud tooling; tests install canned resolvers.
pub trait SecretResolver: Send {
    fn shared_secret(&self, device_public_key: &[u8; 32]) -> Result<[u8; 32], ResolveError>;
}

/// Resolver that refuses every request. Useful where device-authenticated
/// traffic is not expected.
pub struct NoResolver;

impl SecretResolver for NoResolver {
    fn shared_secret(&self, _device_public_key: &[u8; 32]) -> Result<[u8; 32], ResolveError> {
        Err(ResolveError("no cloud resolver configured".into()))
    }
}

/// State tracked per observed device.
#[derive(Debug)]
pub struct DeviceState {
    pub infuse_id: InfuseId,
    /// 24-bit network id, learned from NETWORK-auth packet headers.
    pub network_id: Option<u32>,
    /// 24-bit CRC of the device's public key pair, learned from DEVICE-auth
    /// packet headers or a handshake.
    pub device_key_id: Option<u32>,
    pub bt_addr: Option<BtAddr>,
    pub public_key: Option<[u8; 32]>,
    shared_secret: Option<[u8; 32]>,
    /// Transmit-side sequence counter for GATT hops.
    gatt_seq: u16,
}

impl DeviceState {
    fn new(infuse_id: InfuseId) -> Self {
        Self {
            infuse_id,
            network_id: None,
            device_key_id: None,
            bt_addr: None,
            public_key: None,
            shared_secret: None,
            gatt_seq: 0,
        }
    }
}

/// Compute the 24-bit device key identifier from a handshake key pair.
///
/// The CRC runs over `cloud_pub || device_pub`, the order current device
/// firmware emits. (Older firmware is said to have used the reverse order;
/// this SDK tracks current firmware.)
pub fn device_key_id(cloud_pub: &[u8; 32], device_pub: &[u8; 32]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(cloud_pub);
    hasher.update(device_pub);
    hasher.finalize() & 0x00FF_FFFF
}

/// Database of current device state.
pub struct DeviceDatabase {
    devices: HashMap<InfuseId, DeviceState>,
    credentials: CredentialStore,
    cache: DerivedKeyCache,
    resolver: Box<dyn SecretResolver>,
}

impl DeviceDatabase {
    pub fn new(credentials: CredentialStore, resolver: Box<dyn SecretResolver>) -> Self {
        Self {
            devices: HashMap::new(),
            credentials,
            cache: DerivedKeyCache::default(),
            resolver,
        }
    }

    /// Update device state from an observed packet header.
    ///
    /// Fails with [`KeyError::DeviceKeyChanged`] if a different 24-bit key id
    /// was previously recorded for this device. That record is poisoned and
    /// the offending frame must be dropped.
    pub fn observe(
        &mut self,
        infuse_id: InfuseId,
        network_id: Option<u32>,
        device_key_id: Option<u32>,
        bt_addr: Option<BtAddr>,
    ) -> Result<(), KeyError> {
        let state = self
            .devices
            .entry(infuse_id)
            .or_insert_with(|| DeviceState::new(infuse_id));

        if let Some(network_id) = network_id {
            state.network_id = Some(network_id);
        }
        if let Some(key_id) = device_key_id {
            match state.device_key_id {
                Some(existing) if existing != key_id => {
                    tracing::error!(device = %infuse_id, "Device key id changed, record poisoned");
                    return Err(KeyError::DeviceKeyChanged(infuse_id));
                }
                _ => state.device_key_id = Some(key_id),
            }
        }
        if let Some(addr) = bt_addr {
            state.bt_addr = Some(addr);
        }
        Ok(())
    }

    /// Record a `security_state` handshake response and fetch the cloud
    /// shared secret for the device.
    pub fn record_handshake(
        &mut self,
        infuse_id: InfuseId,
        cloud_pub: &[u8; 32],
        device_pub: &[u8; 32],
        network_id: u32,
    ) -> Result<(), KeyError> {
        let key_id = device_key_id(cloud_pub, device_pub);
        self.observe(infuse_id, Some(network_id), Some(key_id), None)?;

        let secret = match self.resolver.shared_secret(device_pub) {
            Ok(secret) => secret,
            Err(err) => {
                tracing::warn!(device = %infuse_id, error = %err, "Shared secret unavailable");
                return Err(KeyError::UnknownDeviceKey(infuse_id));
            }
        };

        let state = self
            .devices
            .get_mut(&infuse_id)
            .expect("record created by observe");
        state.public_key = Some(*device_pub);
        state.shared_secret = Some(secret);
        tracing::info!(device = %infuse_id, key_id = format_args!("{key_id:#08x}"),
            "Handshake recorded");
        Ok(())
    }

    /// Derived network key for `interface` at `gps_time`.
    pub fn network_key(
        &mut self,
        infuse_id: InfuseId,
        interface: Interface,
        gps_time: u32,
    ) -> Result<[u8; 32], KeyError> {
        let state = self
            .devices
            .get(&infuse_id)
            .ok_or(KeyError::UnknownDevice(infuse_id))?;
        // A record without a network association is as useless as no record.
        let network_id = state.network_id.ok_or(KeyError::UnknownDevice(infuse_id))?;
        let root = self
            .credentials
            .network_key(network_id)
            .ok_or(KeyError::UnknownNetwork { network_id })?
            .clone();
        Ok(self.cache.get_or_derive(
            KeyRoot::Network(network_id),
            &root.0,
            interface.label(),
            gps_time,
        ))
    }

    /// Derived device key for `interface` at `gps_time`. Requires a
    /// completed handshake.
    pub fn device_key(
        &mut self,
        infuse_id: InfuseId,
        interface: Interface,
        gps_time: u32,
    ) -> Result<[u8; 32], KeyError> {
        let state = self
            .devices
            .get(&infuse_id)
            .ok_or(KeyError::UnknownDeviceKey(infuse_id))?;
        let (key_id, secret) = match (state.device_key_id, state.shared_secret) {
            (Some(key_id), Some(secret)) => (key_id, secret),
            _ => return Err(KeyError::UnknownDeviceKey(infuse_id)),
        };
        Ok(self
            .cache
            .get_or_derive(KeyRoot::Device(key_id), &secret, interface.label(), gps_time))
    }

    /// Does the database hold the device's public key (i.e. has a handshake
    /// completed)?
    pub fn has_public_key(&self, infuse_id: InfuseId) -> bool {
        self.devices
            .get(&infuse_id)
            .is_some_and(|d| d.public_key.is_some())
    }

    /// Resolve a Bluetooth address back to the device that advertised it.
    pub fn infuse_id_for_bluetooth(&self, addr: BtAddr) -> Option<InfuseId> {
        self.devices
            .values()
            .find(|d| d.bt_addr == Some(addr))
            .map(|d| d.infuse_id)
    }

    /// Next transmit sequence number for a GATT hop to this device.
    pub fn next_gatt_seq(&mut self, infuse_id: InfuseId) -> u16 {
        let state = self
            .devices
            .entry(infuse_id)
            .or_insert_with(|| DeviceState::new(infuse_id));
        let seq = state.gatt_seq;
        state.gatt_seq = state.gatt_seq.wrapping_add(1);
        seq
    }

    pub fn device(&self, infuse_id: InfuseId) -> Option<&DeviceState> {
        self.devices.get(&infuse_id)
    }

    pub fn network_id_of(&self, infuse_id: InfuseId) -> Option<u32> {
        self.devices.get(&infuse_id).and_then(|d| d.network_id)
    }

    pub fn device_key_id_of(&self, infuse_id: InfuseId) -> Option<u32> {
        self.devices.get(&infuse_id).and_then(|d| d.device_key_id)
    }

    pub fn bt_addr_of(&self, infuse_id: InfuseId) -> Option<BtAddr> {
        self.devices.get(&infuse_id).and_then(|d| d.bt_addr)
    }
}

impl std::fmt::Debug for DeviceDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDatabase")
            .field("devices", &self.devices.len())
            .field("cached_keys", &self.cache.len())
            .finish()
    }
}

/// Fixture helpers for tests across the workspace. Never used by the
/// gateway: production network keys come from the credential store.
pub mod test_fixtures {
    use super::*;

    /// The byte-ramp network key used throughout the test suites.
    pub fn ramp_network_key() -> NetworkKey {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        NetworkKey(key)
    }

    /// Store containing only network 0 with the ramp key.
    pub fn network_zero_store() -> CredentialStore {
        CredentialStore::from_entries([(0, ramp_network_key())])
    }

    /// Resolver returning a fixed secret for any public key.
    pub struct FixedResolver(pub [u8; 32]);

    impl SecretResolver for FixedResolver {
        fn shared_secret(&self, _device_public_key: &[u8; 32]) -> Result<[u8; 32], ResolveError> {
            Ok(self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;

    fn db() -> DeviceDatabase {
        DeviceDatabase::new(network_zero_store(), Box::new(FixedResolver([9u8; 32])))
    }

    const ID: InfuseId = InfuseId(0x0011_2233_4455_6677);

    #[test]
    fn observe_then_network_key() {
        let mut db = db();
        db.observe(ID, Some(0), None, None).unwrap();
        let key = db.network_key(ID, Interface::Serial, 86_400 * 10).unwrap();
        let expected = keys::derive_key(&ramp_network_key().0, "serial", 10);
        assert_eq!(key, expected);
    }

    #[test]
    fn unknown_network_is_reported() {
        let mut db = db();
        db.observe(ID, Some(0x1234), None, None).unwrap();
        assert_eq!(
            db.network_key(ID, Interface::Serial, 0),
            Err(KeyError::UnknownNetwork { network_id: 0x1234 })
        );
    }

    #[test]
    fn unobserved_device_has_no_keys() {
        let mut db = db();
        assert_eq!(
            db.network_key(ID, Interface::Serial, 0),
            Err(KeyError::UnknownDevice(ID))
        );
        assert_eq!(
            db.device_key(ID, Interface::Serial, 0),
            Err(KeyError::UnknownDeviceKey(ID))
        );
    }

    #[test]
    fn device_key_requires_handshake() {
        let mut db = db();
        db.observe(ID, None, Some(0x00AB_CDEF), None).unwrap();
        assert_eq!(
            db.device_key(ID, Interface::BtCentral, 0),
            Err(KeyError::UnknownDeviceKey(ID))
        );

        let cloud = [1u8; 32];
        let device = [2u8; 32];
        // A handshake reporting a different key pair must poison the record.
        assert_eq!(
            db.record_handshake(ID, &cloud, &device, 0),
            Err(KeyError::DeviceKeyChanged(ID))
        );
    }

    #[test]
    fn handshake_enables_device_keys() {
        let mut db = db();
        let cloud = [1u8; 32];
        let device = [2u8; 32];
        db.record_handshake(ID, &cloud, &device, 0).unwrap();
        assert!(db.has_public_key(ID));
        assert_eq!(db.device_key_id_of(ID), Some(device_key_id(&cloud, &device)));

        let key = db.device_key(ID, Interface::BtCentral, 86_400 * 3).unwrap();
        assert_eq!(key, keys::derive_key(&[9u8; 32], "bt_gatt", 3));
    }

    #[test]
    fn key_id_is_24_bits_of_crc32() {
        let cloud = [0xAAu8; 32];
        let device = [0xBBu8; 32];
        let mut concat = Vec::new();
        concat.extend_from_slice(&cloud);
        concat.extend_from_slice(&device);
        assert_eq!(
            device_key_id(&cloud, &device),
            crc32fast::hash(&concat) & 0x00FF_FFFF
        );
    }

    #[test]
    fn changed_key_id_is_fatal_for_record() {
        let mut db = db();
        db.observe(ID, None, Some(1), None).unwrap();
        assert_eq!(
            db.observe(ID, None, Some(2), None),
            Err(KeyError::DeviceKeyChanged(ID))
        );
        // Re-observing the original id still works.
        db.observe(ID, None, Some(1), None).unwrap();
    }

    #[test]
    fn bluetooth_reverse_lookup() {
        use infuse_common::BtAddrKind;
        let mut db = db();
        let addr = BtAddr::new(BtAddrKind::Random, 0x665544332211);
        db.observe(ID, None, None, Some(addr)).unwrap();
        assert_eq!(db.infuse_id_for_bluetooth(addr), Some(ID));
        assert_eq!(
            db.infuse_id_for_bluetooth(BtAddr::new(BtAddrKind::Public, 1)),
            None
        );
    }

    #[test]
    fn gatt_sequence_increments() {
        let mut db = db();
        assert_eq!(db.next_gatt_seq(ID), 0);
        assert_eq!(db.next_gatt_seq(ID), 1);
        assert_eq!(db.next_gatt_seq(ID), 2);
    }
}
