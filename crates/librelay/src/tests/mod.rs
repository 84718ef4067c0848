
use crate::event::{Event, EventListener, ListenerError};
use crate::hub::{
    DeviceKeys, HubError, KeyBundleResponse, MessageWire, MessagesPage, RegisterKeysRequest,
    SignalClient,
};
use crate::keys::generate_keys;
use crate::store::{SignalStore, STATE_IDENTITY_KEY, STATE_REGISTRATION_ID};
use crate::stream::{StreamConnection, StreamEvent, StreamTransport};
use async_trait::async_trait;
use librelay_protocol::keys::IdentityKeyPair;
use librelay_protocol::{ProtocolAddress, SessionBuilder};
use librelay_store::KvBackend;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

pub const SIGNALING_KEY: [u8; 52] = [7u8; 52];

pub async fn memory_store() -> SignalStore {
    SignalStore::new(Arc::new(KvBackend::new("")))
}

pub async fn provisioned_store(addr: &str, device_id: u32) -> SignalStore {
    let store = memory_store().await;
    store
        .provision(addr, device_id, &SIGNALING_KEY)
        .await
        .expect("provision");
    store
}

pub fn random_addr() -> String {
    Uuid::new_v4().to_string()
}

/// One remote device with its own store, sharing the peer's identity key.
pub struct PeerDevice {
    pub device_id: u32,
    pub store: SignalStore,
    pub keys: DeviceKeys,
}

pub struct TestPeer {
    pub addr: String,
    pub identity_key: String,
    pub devices: Vec<PeerDevice>,
}

impl TestPeer {
    pub async fn new(addr: &str, device_ids: &[u32]) -> Self {
        let identity = IdentityKeyPair::generate();
        let mut devices = Vec::new();
        let mut identity_key = String::new();
        for id in device_ids {
            let store = provisioned_store(addr, *id).await;
            store
                .put_state(STATE_IDENTITY_KEY, &identity.to_stored())
                .await
                .expect("identity");
            let request = generate_keys(&store).await.expect("keys");
            let registration_id: u32 = store
                .get_state(STATE_REGISTRATION_ID)
                .await
                .expect("state")
                .expect("registration id");
            identity_key = request.identity_key.clone();
            devices.push(PeerDevice {
                device_id: *id,
                store,
                keys: DeviceKeys {
                    device_id: *id,
                    registration_id,
                    pre_key: Some(request.pre_keys[0].clone()),
                    signed_pre_key: request.signed_pre_key.clone(),
                },
            });
        }
        Self {
            addr: addr.to_string(),
            identity_key,
            devices,
        }
    }

    pub fn bundle(&self) -> KeyBundleResponse {
        KeyBundleResponse {
            identity_key: self.identity_key.clone(),
            devices: self.devices.iter().map(|d| d.keys.clone()).collect(),
        }
    }

    pub fn device(&self, device_id: u32) -> &PeerDevice {
        self.devices
            .iter()
            .find(|d| d.device_id == device_id)
            .expect("peer device")
    }
}

/// Key bundle for a locally provisioned store, as the service would serve it.
pub async fn local_bundle(store: &SignalStore, device_id: u32) -> KeyBundleResponse {
    let request = generate_keys(store).await.expect("keys");
    let registration_id: u32 = store
        .get_state(STATE_REGISTRATION_ID)
        .await
        .expect("state")
        .expect("registration id");
    KeyBundleResponse {
        identity_key: request.identity_key.clone(),
        devices: vec![DeviceKeys {
            device_id,
            registration_id,
            pre_key: Some(request.pre_keys[0].clone()),
            signed_pre_key: request.signed_pre_key.clone(),
        }],
    }
}

pub async fn establish_session(
    store: &SignalStore,
    addr: &str,
    device_id: u32,
    bundle: &KeyBundleResponse,
) {
    let device = bundle
        .devices
        .iter()
        .find(|d| d.device_id == device_id)
        .expect("bundle device");
    let parsed = crate::hub::prekey_bundle(&bundle.identity_key, device).expect("bundle");
    SessionBuilder::new(
        store.protocol_store(),
        ProtocolAddress::new(addr.to_string(), device_id),
    )
    .process_prekey_bundle(&parsed)
    .await
    .expect("session build");
}

/// Decrypts a captured per-device ciphertext on the addressed peer device.
pub async fn peer_decrypt(
    device: &PeerDevice,
    sender_addr: &str,
    sender_device: u32,
    wire: &MessageWire,
) -> Vec<u8> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use librelay_protocol::SessionCipher;
    let body = STANDARD.decode(&wire.content).expect("content b64");
    let cipher = SessionCipher::new(
        device.store.protocol_store(),
        ProtocolAddress::new(sender_addr.to_string(), sender_device),
    );
    let padded = match wire.message_type {
        3 => cipher.decrypt_prekey(&body).await.expect("decrypt prekey"),
        _ => cipher.decrypt_whisper(&body).await.expect("decrypt whisper"),
    };
    crate::padding::unpad_message_buffer(&padded).expect("unpad")
}

pub enum SendScript {
    Ok,
    Status(u16, serde_json::Value),
    Network,
}

#[derive(Default)]
pub struct MockSignalClient {
    pub bundles: Mutex<HashMap<String, KeyBundleResponse>>,
    pub key_fetch_errors: Mutex<HashMap<(String, u32), u16>>,
    pub key_requests: Mutex<Vec<(String, Option<u32>)>>,
    pub send_scripts: Mutex<VecDeque<SendScript>>,
    pub sends: Mutex<Vec<(String, Vec<MessageWire>, u64)>>,
    pub messages_pages: Mutex<VecDeque<MessagesPage>>,
    pub deletes: Mutex<Vec<(String, u64)>>,
    pub registered_keys: Mutex<Vec<RegisterKeysRequest>>,
    pub devices_fail: AtomicBool,
}

impl MockSignalClient {
    pub async fn add_peer(&self, peer: &TestPeer) {
        self.bundles
            .lock()
            .await
            .insert(peer.addr.clone(), peer.bundle());
    }

    pub async fn script_send(&self, script: SendScript) {
        self.send_scripts.lock().await.push_back(script);
    }
}

#[async_trait]
impl SignalClient for MockSignalClient {
    async fn get_keys_for_addr(
        &self,
        addr: &str,
        device_id: Option<u32>,
    ) -> Result<KeyBundleResponse, HubError> {
        self.key_requests
            .lock()
            .await
            .push((addr.to_string(), device_id));
        if let Some(id) = device_id {
            if let Some(code) = self
                .key_fetch_errors
                .lock()
                .await
                .get(&(addr.to_string(), id))
            {
                return Err(HubError::Protocol {
                    code: *code,
                    response: serde_json::json!({}),
                });
            }
        }
        let bundle = self
            .bundles
            .lock()
            .await
            .get(addr)
            .cloned()
            .ok_or(HubError::Protocol {
                code: 404,
                response: serde_json::json!({}),
            })?;
        match device_id {
            None => Ok(bundle),
            Some(id) => {
                let devices: Vec<DeviceKeys> = bundle
                    .devices
                    .iter()
                    .filter(|d| d.device_id == id)
                    .cloned()
                    .collect();
                if devices.is_empty() {
                    return Err(HubError::Protocol {
                        code: 404,
                        response: serde_json::json!({}),
                    });
                }
                Ok(KeyBundleResponse {
                    identity_key: bundle.identity_key,
                    devices,
                })
            }
        }
    }

    async fn send_messages(
        &self,
        addr: &str,
        messages: &[MessageWire],
        timestamp: u64,
    ) -> Result<(), HubError> {
        self.sends
            .lock()
            .await
            .push((addr.to_string(), messages.to_vec(), timestamp));
        match self.send_scripts.lock().await.pop_front() {
            None | Some(SendScript::Ok) => Ok(()),
            Some(SendScript::Status(code, response)) => {
                Err(HubError::Protocol { code, response })
            }
            Some(SendScript::Network) => Err(HubError::Network("connection reset".to_string())),
        }
    }

    async fn get_messages(&self) -> Result<MessagesPage, HubError> {
        Ok(self
            .messages_pages
            .lock()
            .await
            .pop_front()
            .unwrap_or_default())
    }

    async fn delete_message(&self, source: &str, timestamp: u64) -> Result<(), HubError> {
        self.deletes
            .lock()
            .await
            .push((source.to_string(), timestamp));
        Ok(())
    }

    async fn register_keys(&self, keys: &RegisterKeysRequest) -> Result<(), HubError> {
        self.registered_keys.lock().await.push(keys.clone());
        Ok(())
    }

    async fn get_devices(&self) -> Result<Vec<crate::hub::DeviceInfo>, HubError> {
        if self.devices_fail.load(Ordering::SeqCst) {
            return Err(HubError::Network("unreachable".to_string()));
        }
        Ok(Vec::new())
    }

    async fn get_attachment(&self, _id: &str) -> Result<Vec<u8>, HubError> {
        Ok(Vec::new())
    }

    async fn get_message_websocket_url(&self) -> Result<String, HubError> {
        Ok("wss://hub.invalid/v1/websocket/".to_string())
    }
}

#[derive(Default)]
pub struct Collector {
    pub events: Mutex<Vec<Event>>,
    pub accept_key_changes: AtomicBool,
}

impl Collector {
    pub async fn all(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    pub async fn messages(&self) -> Vec<crate::event::MessageEvent> {
        self.all()
            .await
            .into_iter()
            .filter_map(|e| match e {
                Event::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub async fn errors(&self) -> Vec<crate::event::ErrorEvent> {
        self.all()
            .await
            .into_iter()
            .filter_map(|e| match e {
                Event::Error(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub async fn key_changes(&self) -> usize {
        self.all()
            .await
            .iter()
            .filter(|e| matches!(e, Event::KeyChange(_)))
            .count()
    }

    pub async fn sent(&self) -> Vec<crate::event::SentEvent> {
        self.all()
            .await
            .into_iter()
            .filter_map(|e| match e {
                Event::Sent(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventListener for Collector {
    async fn on_event(&self, event: &Event) -> Result<(), ListenerError> {
        if let Event::KeyChange(change) = event {
            if self.accept_key_changes.load(Ordering::SeqCst) {
                change.accept();
            }
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

pub struct TestCtx {
    pub addr: String,
    pub store: SignalStore,
    pub client: Arc<MockSignalClient>,
    pub events: crate::event::EventDispatcher,
    pub sender: crate::outgoing::MessageSender,
    pub collector: Arc<Collector>,
}

pub async fn test_ctx() -> TestCtx {
    let addr = random_addr();
    let store = provisioned_store(&addr, 1).await;
    let client = Arc::new(MockSignalClient::default());
    let events = crate::event::EventDispatcher::new();
    let collector = Arc::new(Collector::default());
    events.add_listener(collector.clone()).await;
    let sender =
        crate::outgoing::MessageSender::new(client.clone(), store.clone(), events.clone());
    TestCtx {
        addr,
        store,
        client,
        events,
        sender,
        collector,
    }
}

pub async fn test_receiver(ctx: &TestCtx) -> crate::incoming::MessageReceiver {
    crate::incoming::MessageReceiver::new(
        ctx.client.clone(),
        ctx.store.clone(),
        ctx.events.clone(),
        ctx.sender.clone(),
        None,
    )
    .await
    .expect("receiver")
}

#[derive(Default)]
pub struct MockStreamTransport {
    pub tx: std::sync::Mutex<Option<mpsc::Sender<StreamEvent>>>,
    pub connects: AtomicU32,
}

#[async_trait]
impl StreamTransport for MockStreamTransport {
    async fn connect(
        &self,
        _url: &str,
        _keepalive: &crate::stream::KeepaliveConfig,
    ) -> Result<StreamConnection, crate::errors::RelayError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, _shutdown_rx) = oneshot::channel();
        *self.tx.lock().expect("lock") = Some(tx);
        Ok(StreamConnection::new(rx, shutdown_tx))
    }
}
