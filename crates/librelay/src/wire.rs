use crate::errors::RelayError;
use crate::hub::RestEnvelope;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

pub const END_SESSION_FLAG: u32 = 1;

const FRAME_CONTEXT: &[u8] = b"librelay:signaling:v1";
const FRAME_NONCE_LEN: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum EnvelopeType {
    Unknown,
    Ciphertext,
    KeyExchange,
    PrekeyBundle,
    Receipt,
}

impl TryFrom<u32> for EnvelopeType {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EnvelopeType::Unknown),
            1 => Ok(EnvelopeType::Ciphertext),
            2 => Ok(EnvelopeType::KeyExchange),
            3 => Ok(EnvelopeType::PrekeyBundle),
            5 => Ok(EnvelopeType::Receipt),
            other => Err(format!("unknown envelope type {}", other)),
        }
    }
}

impl From<EnvelopeType> for u32 {
    fn from(value: EnvelopeType) -> Self {
        match value {
            EnvelopeType::Unknown => 0,
            EnvelopeType::Ciphertext => 1,
            EnvelopeType::KeyExchange => 2,
            EnvelopeType::PrekeyBundle => 3,
            EnvelopeType::Receipt => 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,
    pub source: String,
    pub source_device: u32,
    pub timestamp: u64,
    #[serde(default)]
    pub content: Option<Vec<u8>>,
    #[serde(default)]
    pub legacy_message: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub data_message: Option<DataMessage>,
    #[serde(default)]
    pub sync_message: Option<SyncMessage>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPointer>,
    #[serde(default)]
    pub flags: u32,
    /// Timestamp of a message the peer is asked to send again after a
    /// session reset.
    #[serde(default)]
    pub retransmit: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPointer {
    pub id: String,
    #[serde(default)]
    pub key: Vec<u8>,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    #[serde(default)]
    pub sent: Option<SentSync>,
    #[serde(default)]
    pub read: Vec<ReadEntry>,
    #[serde(default)]
    pub blocked: Option<serde_json::Value>,
    #[serde(default)]
    pub contacts: Option<serde_json::Value>,
    #[serde(default)]
    pub groups: Option<serde_json::Value>,
    #[serde(default)]
    pub request: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentSync {
    #[serde(default)]
    pub destination: Option<String>,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadEntry {
    pub sender: String,
    pub timestamp: u64,
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, RelayError> {
    serde_json::from_slice(bytes).map_err(|_| RelayError::Codec("envelope decode"))
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, RelayError> {
    serde_json::to_vec(envelope).map_err(|_| RelayError::Codec("envelope encode"))
}

pub fn decode_content(bytes: &[u8]) -> Result<Content, RelayError> {
    serde_json::from_slice(bytes).map_err(|_| RelayError::Codec("content decode"))
}

pub fn decode_data_message(bytes: &[u8]) -> Result<DataMessage, RelayError> {
    serde_json::from_slice(bytes).map_err(|_| RelayError::Codec("data message decode"))
}

pub fn envelope_from_rest(rest: RestEnvelope) -> Result<Envelope, RelayError> {
    let envelope_type =
        EnvelopeType::try_from(rest.envelope_type).map_err(|_| RelayError::Codec("envelope type"))?;
    let content = rest
        .content
        .map(|value| STANDARD.decode(value))
        .transpose()
        .map_err(|_| RelayError::Codec("envelope content"))?;
    let legacy_message = rest
        .message
        .map(|value| STANDARD.decode(value))
        .transpose()
        .map_err(|_| RelayError::Codec("envelope legacy message"))?;
    Ok(Envelope {
        envelope_type,
        source: rest.source,
        source_device: rest.source_device,
        timestamp: rest.timestamp,
        content,
        legacy_message,
    })
}

fn frame_key(signaling_key: &[u8]) -> Result<[u8; 32], RelayError> {
    let hkdf = Hkdf::<Sha256>::new(None, signaling_key);
    let mut okm = [0u8; 32];
    hkdf.expand(FRAME_CONTEXT, &mut okm)
        .map_err(|_| RelayError::Codec("signaling key"))?;
    Ok(okm)
}

pub fn seal_frame(signaling_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, RelayError> {
    let key = frame_key(signaling_key)?;
    let cipher =
        XChaCha20Poly1305::new_from_slice(&key).map_err(|_| RelayError::Codec("signaling key"))?;
    let mut nonce = [0u8; FRAME_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| RelayError::Codec("frame seal"))?;
    let mut out = Vec::with_capacity(FRAME_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open_frame(signaling_key: &[u8], frame: &[u8]) -> Result<Vec<u8>, RelayError> {
    if frame.len() < FRAME_NONCE_LEN {
        return Err(RelayError::Codec("frame too short"));
    }
    let key = frame_key(signaling_key)?;
    let cipher =
        XChaCha20Poly1305::new_from_slice(&key).map_err(|_| RelayError::Codec("signaling key"))?;
    cipher
        .decrypt(
            XNonce::from_slice(&frame[..FRAME_NONCE_LEN]),
            &frame[FRAME_NONCE_LEN..],
        )
        .map_err(|_| RelayError::Codec("frame open"))
}
