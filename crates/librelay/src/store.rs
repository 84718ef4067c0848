use crate::config::StorageConfig;
use crate::errors::RelayError;
use async_trait::async_trait;
use librelay_protocol::keys::StoredIdentityKeyPair;
use librelay_protocol::{
    IdentityKeyPair, PreKeyRecord, ProtocolAddress, ProtocolError, ProtocolStore, SessionRecord,
    SignedPreKeyRecord,
};
use librelay_store::Backend;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

const NS_STATE: &str = "state";
const NS_SESSIONS: &str = "sessions";
const NS_IDENTITIES: &str = "identities";
const NS_PREKEYS: &str = "prekeys";
const NS_SIGNED_PREKEYS: &str = "signedprekeys";

pub const STATE_ADDR: &str = "addr";
pub const STATE_DEVICE_ID: &str = "deviceId";
pub const STATE_SIGNALING_KEY: &str = "signalingKey";
pub const STATE_REGISTRATION_ID: &str = "registrationId";
pub const STATE_IDENTITY_KEY: &str = "identityKey";
pub const STATE_BLOCKED: &str = "blocked";

#[derive(Clone)]
pub struct SignalStore {
    backend: Arc<dyn Backend>,
    write_lock: Arc<Mutex<()>>,
}

impl SignalStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn open(config: &StorageConfig) -> Self {
        Self::new(config.open_backend())
    }

    pub async fn initialize(&self) -> Result<(), RelayError> {
        self.backend.initialize().map_err(|_| RelayError::Storage)
    }

    pub async fn shutdown(&self) -> Result<(), RelayError> {
        self.backend.shutdown().map_err(|_| RelayError::Storage)
    }

    pub fn protocol_store(&self) -> Arc<dyn ProtocolStore> {
        Arc::new(self.clone())
    }

    fn read_json<T: DeserializeOwned>(&self, ns: &str, key: &str) -> Result<Option<T>, RelayError> {
        let bytes = self
            .backend
            .get(ns, key)
            .map_err(|_| RelayError::Storage)?;
        match bytes {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|_| RelayError::Storage)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn write_json<T: Serialize>(&self, ns: &str, key: &str, value: &T) -> Result<(), RelayError> {
        let bytes = serde_json::to_vec(value).map_err(|_| RelayError::Storage)?;
        self.backend
            .put(ns, key, &bytes)
            .map_err(|_| RelayError::Storage)
    }

    pub async fn get_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RelayError> {
        self.read_json(NS_STATE, key)
    }

    pub async fn put_state<T: Serialize>(&self, key: &str, value: &T) -> Result<(), RelayError> {
        self.write_json(NS_STATE, key, value)
    }

    pub async fn own_addr(&self) -> Result<String, RelayError> {
        self.get_state(STATE_ADDR)
            .await?
            .ok_or(RelayError::MissingState(STATE_ADDR))
    }

    pub async fn own_device_id(&self) -> Result<u32, RelayError> {
        self.get_state(STATE_DEVICE_ID)
            .await?
            .ok_or(RelayError::MissingState(STATE_DEVICE_ID))
    }

    pub async fn signaling_key(&self) -> Result<Vec<u8>, RelayError> {
        self.get_state(STATE_SIGNALING_KEY)
            .await?
            .ok_or(RelayError::MissingState(STATE_SIGNALING_KEY))
    }

    pub async fn is_provisioned(&self) -> Result<bool, RelayError> {
        Ok(self.get_state::<String>(STATE_ADDR).await?.is_some())
    }

    /// Seeds the process state a fresh install gets from device registration.
    pub async fn provision(
        &self,
        addr: &str,
        device_id: u32,
        signaling_key: &[u8],
    ) -> Result<(), RelayError> {
        let identity = IdentityKeyPair::generate();
        let registration_id: u32 = rand::thread_rng().gen_range(1..16384);
        self.put_state(STATE_ADDR, &addr.to_string()).await?;
        self.put_state(STATE_DEVICE_ID, &device_id).await?;
        self.put_state(STATE_SIGNALING_KEY, &signaling_key.to_vec())
            .await?;
        self.put_state(STATE_REGISTRATION_ID, &registration_id)
            .await?;
        self.put_state(STATE_IDENTITY_KEY, &identity.to_stored())
            .await
    }

    pub async fn get_device_ids(&self, addr: &str) -> Result<Vec<u32>, RelayError> {
        let prefix = format!("{}.", addr);
        let keys = self
            .backend
            .keys(NS_SESSIONS, &prefix)
            .map_err(|_| RelayError::Storage)?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(suffix) = key.strip_prefix(&prefix) {
                if let Ok(id) = suffix.parse::<u32>() {
                    out.push(id);
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    pub async fn has_open_session(&self, encoded_addr: &str) -> Result<bool, RelayError> {
        let record: Option<SessionRecord> = self.read_json(NS_SESSIONS, encoded_addr)?;
        Ok(record.map(|r| r.is_open()).unwrap_or(false))
    }

    pub async fn close_open_session(&self, encoded_addr: &str) -> Result<(), RelayError> {
        let _guard = self.write_lock.lock().await;
        let record: Option<SessionRecord> = self.read_json(NS_SESSIONS, encoded_addr)?;
        if let Some(mut record) = record {
            record.close();
            self.write_json(NS_SESSIONS, encoded_addr, &record)?;
        }
        Ok(())
    }

    pub async fn remove_session(&self, encoded_addr: &str) -> Result<(), RelayError> {
        self.backend
            .delete(NS_SESSIONS, encoded_addr)
            .map_err(|_| RelayError::Storage)
    }

    pub async fn get_identity(&self, addr: &str) -> Result<Option<Vec<u8>>, RelayError> {
        self.read_json(NS_IDENTITIES, addr)
    }

    pub async fn remove_identity(&self, addr: &str) -> Result<(), RelayError> {
        self.backend
            .delete(NS_IDENTITIES, addr)
            .map_err(|_| RelayError::Storage)
    }

    pub async fn is_blocked(&self, addr: &str) -> Result<bool, RelayError> {
        let blocked: Option<Vec<String>> = self.get_state(STATE_BLOCKED).await?;
        Ok(blocked
            .map(|list| list.iter().any(|a| a == addr))
            .unwrap_or(false))
    }

    pub async fn save_prekey(&self, record: &PreKeyRecord) -> Result<(), RelayError> {
        self.write_json(NS_PREKEYS, &record.id.to_string(), record)
    }

    pub async fn save_signed_prekey(&self, record: &SignedPreKeyRecord) -> Result<(), RelayError> {
        self.write_json(NS_SIGNED_PREKEYS, &record.id.to_string(), record)
    }
}

fn storage_err(err: RelayError) -> ProtocolError {
    ProtocolError::Storage(err.to_string())
}

#[async_trait]
impl ProtocolStore for SignalStore {
    async fn identity_key_pair(&self) -> librelay_protocol::Result<IdentityKeyPair> {
        let stored: StoredIdentityKeyPair = self
            .get_state(STATE_IDENTITY_KEY)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| ProtocolError::Storage("missing identity key".to_string()))?;
        Ok(IdentityKeyPair::from_stored(&stored))
    }

    async fn local_registration_id(&self) -> librelay_protocol::Result<u32> {
        self.get_state(STATE_REGISTRATION_ID)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| ProtocolError::Storage("missing registration id".to_string()))
    }

    async fn is_trusted_identity(
        &self,
        addr: &str,
        identity_key: &[u8],
    ) -> librelay_protocol::Result<bool> {
        let existing: Option<Vec<u8>> = self.read_json(NS_IDENTITIES, addr).map_err(storage_err)?;
        Ok(match existing {
            Some(existing) => existing == identity_key,
            None => true,
        })
    }

    async fn save_identity(
        &self,
        addr: &str,
        identity_key: &[u8],
    ) -> librelay_protocol::Result<bool> {
        let _guard = self.write_lock.lock().await;
        let existing: Option<Vec<u8>> = self.read_json(NS_IDENTITIES, addr).map_err(storage_err)?;
        let changed = existing
            .map(|existing| existing != identity_key)
            .unwrap_or(false);
        self.write_json(NS_IDENTITIES, addr, &identity_key.to_vec())
            .map_err(storage_err)?;
        Ok(changed)
    }

    async fn load_session(
        &self,
        addr: &ProtocolAddress,
    ) -> librelay_protocol::Result<Option<SessionRecord>> {
        self.read_json(NS_SESSIONS, &addr.encoded())
            .map_err(storage_err)
    }

    async fn store_session(
        &self,
        addr: &ProtocolAddress,
        record: &SessionRecord,
    ) -> librelay_protocol::Result<()> {
        self.write_json(NS_SESSIONS, &addr.encoded(), record)
            .map_err(storage_err)
    }

    async fn load_prekey(&self, id: u32) -> librelay_protocol::Result<Option<PreKeyRecord>> {
        self.read_json(NS_PREKEYS, &id.to_string())
            .map_err(storage_err)
    }

    async fn remove_prekey(&self, id: u32) -> librelay_protocol::Result<()> {
        self.backend
            .delete(NS_PREKEYS, &id.to_string())
            .map_err(|_| ProtocolError::Storage("prekey delete".to_string()))
    }

    async fn load_signed_prekey(
        &self,
        id: u32,
    ) -> librelay_protocol::Result<Option<SignedPreKeyRecord>> {
        self.read_json(NS_SIGNED_PREKEYS, &id.to_string())
            .map_err(storage_err)
    }
}
