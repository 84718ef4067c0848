use crate::errors::{OutgoingError, RelayError};
use crate::event::{ErrorEvent, Event, EventDispatcher, KeyChangeEvent, SentEvent};
use crate::hub::{
    prekey_bundle, HubError, MessageWire, MismatchedDevices, SignalClient, StaleDevices,
};
use crate::padding::pad_message_buffer;
use crate::store::SignalStore;
use crate::time::now_ms;
use crate::wire::{Content, DataMessage, END_SESSION_FLAG};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use librelay_protocol::{ProtocolAddress, ProtocolError, SessionBuilder, SessionCipher};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct SentEntry {
    pub addr: String,
    pub timestamp: u64,
}

#[derive(Clone, Debug)]
pub struct ErrorEntry {
    pub addr: String,
    pub timestamp: u64,
    pub error: OutgoingError,
}

struct SendContext {
    keychange_emitted: bool,
}

pub struct OutgoingMessage {
    client: Arc<dyn SignalClient>,
    store: SignalStore,
    events: EventDispatcher,
    timestamp: u64,
    message: Vec<u8>,
    created: u64,
    sent: Mutex<Vec<SentEntry>>,
    errors: Mutex<Vec<ErrorEntry>>,
}

impl OutgoingMessage {
    pub fn new(
        client: Arc<dyn SignalClient>,
        store: SignalStore,
        events: EventDispatcher,
        timestamp: u64,
        padded_message: Vec<u8>,
    ) -> Self {
        Self {
            client,
            store,
            events,
            timestamp,
            message: padded_message,
            created: now_ms(),
            sent: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub async fn sent_entries(&self) -> Vec<SentEntry> {
        self.sent.lock().await.clone()
    }

    pub async fn error_entries(&self) -> Vec<ErrorEntry> {
        self.errors.lock().await.clone()
    }

    /// Runs the full per-address send flow. Never fails outward: the result
    /// lands as exactly one journal entry plus a `sent` or `error` event.
    pub async fn send_to_addr(&self, addr: &str) {
        let mut ctx = SendContext {
            keychange_emitted: false,
        };
        match self.try_send(addr, &mut ctx).await {
            Ok(()) => self.journal_sent(addr).await,
            Err(error) => self.journal_error(addr, error).await,
        }
    }

    async fn try_send(&self, addr: &str, ctx: &mut SendContext) -> Result<(), OutgoingError> {
        let our_addr = self
            .store
            .own_addr()
            .await
            .map_err(|e| fault(addr, &e))?;
        let mut device_ids = self
            .store
            .get_device_ids(addr)
            .await
            .map_err(|e| fault(addr, &e))?;
        if device_ids.is_empty() {
            if addr == our_addr {
                // Nothing to sync to: we are the only device.
                return Ok(());
            }
            device_ids = vec![1];
        }
        let mut update_devices = Vec::new();
        for id in &device_ids {
            let encoded = encoded_addr(addr, *id);
            let open = self
                .store
                .has_open_session(&encoded)
                .await
                .map_err(|e| fault(addr, &e))?;
            if !open {
                update_devices.push(*id);
            }
        }
        if !update_devices.is_empty() {
            self.update_keys_with_retry(addr, Some(update_devices), ctx)
                .await?;
        }
        self.transmit(addr, ctx).await
    }

    async fn update_keys_with_retry(
        &self,
        addr: &str,
        devices: Option<Vec<u32>>,
        ctx: &mut SendContext,
    ) -> Result<(), OutgoingError> {
        loop {
            match self.refresh_keys(addr, devices.clone()).await {
                Ok(()) => return Ok(()),
                Err(RelayError::Protocol(ProtocolError::UntrustedIdentity {
                    identity_key,
                    ..
                })) => {
                    if ctx.keychange_emitted {
                        return Err(OutgoingError::IdentityKeyChanged {
                            addr: addr.to_string(),
                            identity_key,
                        });
                    }
                    ctx.keychange_emitted = true;
                    let change = KeyChangeEvent::new(addr.to_string(), identity_key);
                    self.events.emit(&Event::KeyChange(change.clone())).await;
                    if change.accepted() {
                        let _ = self.store.remove_identity(addr).await;
                    }
                }
                Err(RelayError::Hub(HubError::Protocol { code: 404, .. })) => {
                    return Err(OutgoingError::UnregisteredUser(addr.to_string()));
                }
                Err(err) => {
                    return Err(OutgoingError::Fault {
                        addr: addr.to_string(),
                        cause: err.to_string(),
                    });
                }
            }
        }
    }

    pub(crate) async fn refresh_keys(
        &self,
        addr: &str,
        devices: Option<Vec<u32>>,
    ) -> Result<(), RelayError> {
        match devices {
            None => {
                let response = self.client.get_keys_for_addr(addr, None).await?;
                for device in &response.devices {
                    self.build_session(addr, &response.identity_key, device)
                        .await?;
                }
                Ok(())
            }
            Some(ids) => {
                // The service only answers one device per keyed request.
                for id in ids {
                    match self.client.get_keys_for_addr(addr, Some(id)).await {
                        Ok(response) => {
                            for device in &response.devices {
                                self.build_session(addr, &response.identity_key, device)
                                    .await?;
                            }
                        }
                        Err(HubError::Protocol { code: 404, .. }) if id != 1 => {
                            self.store.remove_session(&encoded_addr(addr, id)).await?;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(())
            }
        }
    }

    async fn build_session(
        &self,
        addr: &str,
        identity_key: &str,
        device: &crate::hub::DeviceKeys,
    ) -> Result<(), RelayError> {
        let bundle = prekey_bundle(identity_key, device)?;
        let remote = ProtocolAddress::new(addr.to_string(), device.device_id);
        SessionBuilder::new(self.store.protocol_store(), remote)
            .process_prekey_bundle(&bundle)
            .await?;
        Ok(())
    }

    async fn transmit(&self, addr: &str, ctx: &mut SendContext) -> Result<(), OutgoingError> {
        let mut retries = 0u32;
        loop {
            let messages = self.encrypt_to_devices(addr).await.map_err(|e| {
                OutgoingError::EncryptFailure {
                    addr: addr.to_string(),
                    cause: e.to_string(),
                }
            })?;
            match self
                .client
                .send_messages(addr, &messages, self.timestamp)
                .await
            {
                Ok(()) => return Ok(()),
                Err(HubError::Protocol {
                    code: 409,
                    response,
                }) => {
                    if retries >= 1 {
                        return Err(OutgoingError::RetryLimit(addr.to_string()));
                    }
                    retries += 1;
                    let mismatch: MismatchedDevices =
                        serde_json::from_value(response).unwrap_or_default();
                    for id in &mismatch.extra_devices {
                        self.store
                            .remove_session(&encoded_addr(addr, *id))
                            .await
                            .map_err(|e| fault(addr, &e))?;
                    }
                    if !mismatch.missing_devices.is_empty() {
                        self.update_keys_with_retry(addr, Some(mismatch.missing_devices), ctx)
                            .await?;
                    }
                }
                Err(HubError::Protocol {
                    code: 410,
                    response,
                }) => {
                    if retries >= 1 {
                        return Err(OutgoingError::RetryLimit(addr.to_string()));
                    }
                    retries += 1;
                    let stale: StaleDevices = serde_json::from_value(response).unwrap_or_default();
                    for id in &stale.stale_devices {
                        // Stale sessions are closed but kept so late inbound
                        // messages can still decrypt.
                        self.store
                            .close_open_session(&encoded_addr(addr, *id))
                            .await
                            .map_err(|e| fault(addr, &e))?;
                    }
                    if !stale.stale_devices.is_empty() {
                        self.update_keys_with_retry(addr, Some(stale.stale_devices), ctx)
                            .await?;
                    }
                }
                Err(HubError::Protocol { code: 404, .. }) => {
                    return Err(OutgoingError::UnregisteredUser(addr.to_string()));
                }
                Err(err) => {
                    return Err(OutgoingError::SendFailure {
                        addr: addr.to_string(),
                        cause: err.to_string(),
                    });
                }
            }
        }
    }

    async fn encrypt_to_devices(&self, addr: &str) -> Result<Vec<MessageWire>, RelayError> {
        let device_ids = self.store.get_device_ids(addr).await?;
        let mut out = Vec::with_capacity(device_ids.len());
        for id in device_ids {
            let remote = ProtocolAddress::new(addr.to_string(), id);
            let cipher = SessionCipher::new(self.store.protocol_store(), remote);
            let ciphertext = cipher.encrypt(&self.message).await?;
            out.push(MessageWire {
                message_type: ciphertext.message_type.wire_type(),
                destination_device_id: id,
                destination_registration_id: ciphertext.registration_id,
                content: STANDARD.encode(&ciphertext.body),
            });
        }
        Ok(out)
    }

    async fn journal_sent(&self, addr: &str) {
        let entry = SentEntry {
            addr: addr.to_string(),
            timestamp: self.timestamp,
        };
        self.sent.lock().await.push(entry);
        self.events
            .emit(&Event::Sent(SentEvent {
                addr: addr.to_string(),
                timestamp: self.timestamp,
            }))
            .await;
    }

    async fn journal_error(&self, addr: &str, error: OutgoingError) {
        log::warn!("outgoing send failed: {}", error);
        let entry = ErrorEntry {
            addr: addr.to_string(),
            timestamp: self.timestamp,
            error: error.clone(),
        };
        self.errors.lock().await.push(entry);
        self.events
            .emit(&Event::Error(ErrorEvent {
                error: error.to_string(),
                addr: Some(addr.to_string()),
                timestamp: Some(self.timestamp),
                envelope: None,
            }))
            .await;
    }
}

fn encoded_addr(addr: &str, device_id: u32) -> String {
    format!("{}.{}", addr, device_id)
}

fn fault(addr: &str, err: &RelayError) -> OutgoingError {
    OutgoingError::Fault {
        addr: addr.to_string(),
        cause: err.to_string(),
    }
}

#[derive(Clone)]
pub struct MessageSender {
    client: Arc<dyn SignalClient>,
    store: SignalStore,
    events: EventDispatcher,
}

impl MessageSender {
    pub fn new(client: Arc<dyn SignalClient>, store: SignalStore, events: EventDispatcher) -> Self {
        Self {
            client,
            store,
            events,
        }
    }

    /// Pads the content once and fans it out to every listed address.
    pub async fn send(
        &self,
        addrs: &[String],
        content: &[u8],
        timestamp: Option<u64>,
    ) -> Arc<OutgoingMessage> {
        let timestamp = timestamp.unwrap_or_else(now_ms);
        let padded = pad_message_buffer(content);
        let message = Arc::new(OutgoingMessage::new(
            self.client.clone(),
            self.store.clone(),
            self.events.clone(),
            timestamp,
            padded,
        ));
        for addr in addrs {
            message.send_to_addr(addr).await;
        }
        message
    }

    /// Sends an end-session marker, optionally asking the peer to retransmit
    /// a message we could not decrypt, then closes our local sessions.
    pub async fn close_session(
        &self,
        addr: &str,
        retransmit: Option<u64>,
    ) -> Result<Arc<OutgoingMessage>, RelayError> {
        let content = Content {
            data_message: Some(DataMessage {
                body: None,
                attachments: Vec::new(),
                flags: END_SESSION_FLAG,
                retransmit,
            }),
            sync_message: None,
        };
        let bytes = serde_json::to_vec(&content).map_err(|_| RelayError::Codec("content encode"))?;
        let message = self.send(&[addr.to_string()], &bytes, None).await;
        for id in self.store.get_device_ids(addr).await? {
            self.store
                .close_open_session(&format!("{}.{}", addr, id))
                .await?;
        }
        Ok(message)
    }
}
