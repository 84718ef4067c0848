use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use librelay_protocol::{IdentityPublic, PreKeyBundle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("status {code}")]
    Protocol { code: u16, response: Value },
    #[error("network {0}")]
    Network(String),
    #[error("codec")]
    Codec,
}

impl HubError {
    pub fn code(&self) -> Option<u16> {
        match self {
            HubError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyEntity {
    pub key_id: u32,
    pub public_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyEntity {
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeys {
    pub device_id: u32,
    pub registration_id: u32,
    #[serde(default)]
    pub pre_key: Option<PreKeyEntity>,
    pub signed_pre_key: SignedPreKeyEntity,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundleResponse {
    pub identity_key: String,
    #[serde(default)]
    pub devices: Vec<DeviceKeys>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageWire {
    #[serde(rename = "type")]
    pub message_type: u32,
    pub destination_device_id: u32,
    pub destination_registration_id: u32,
    pub content: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchedDevices {
    #[serde(default)]
    pub extra_devices: Vec<u32>,
    #[serde(default)]
    pub missing_devices: Vec<u32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleDevices {
    #[serde(default)]
    pub stale_devices: Vec<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestEnvelope {
    #[serde(rename = "type")]
    pub envelope_type: u32,
    pub source: String,
    pub source_device: u32,
    pub timestamp: u64,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesPage {
    #[serde(default)]
    pub messages: Vec<RestEnvelope>,
    #[serde(default)]
    pub more: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterKeysRequest {
    pub identity_key: String,
    pub pre_keys: Vec<PreKeyEntity>,
    pub signed_pre_key: SignedPreKeyEntity,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_seen: Option<u64>,
}

#[async_trait]
pub trait SignalClient: Send + Sync {
    async fn get_keys_for_addr(
        &self,
        addr: &str,
        device_id: Option<u32>,
    ) -> Result<KeyBundleResponse, HubError>;
    async fn send_messages(
        &self,
        addr: &str,
        messages: &[MessageWire],
        timestamp: u64,
    ) -> Result<(), HubError>;
    async fn get_messages(&self) -> Result<MessagesPage, HubError>;
    async fn delete_message(&self, source: &str, timestamp: u64) -> Result<(), HubError>;
    async fn register_keys(&self, keys: &RegisterKeysRequest) -> Result<(), HubError>;
    async fn get_devices(&self) -> Result<Vec<DeviceInfo>, HubError>;
    async fn get_attachment(&self, id: &str) -> Result<Vec<u8>, HubError>;
    async fn get_message_websocket_url(&self) -> Result<String, HubError>;
}

fn decode_key(value: &str) -> Result<[u8; 32], HubError> {
    let bytes = STANDARD.decode(value).map_err(|_| HubError::Codec)?;
    if bytes.len() != 32 {
        return Err(HubError::Codec);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub fn prekey_bundle(identity_key: &str, device: &DeviceKeys) -> Result<PreKeyBundle, HubError> {
    let identity_bytes = STANDARD.decode(identity_key).map_err(|_| HubError::Codec)?;
    let identity = IdentityPublic::decode(&identity_bytes).map_err(|_| HubError::Codec)?;
    let prekey = match &device.pre_key {
        Some(entity) => Some((entity.key_id, decode_key(&entity.public_key)?)),
        None => None,
    };
    Ok(PreKeyBundle {
        registration_id: device.registration_id,
        device_id: device.device_id,
        prekey,
        signed_prekey_id: device.signed_pre_key.key_id,
        signed_prekey: decode_key(&device.signed_pre_key.public_key)?,
        signed_prekey_signature: STANDARD
            .decode(&device.signed_pre_key.signature)
            .map_err(|_| HubError::Codec)?,
        identity_key: identity,
    })
}
