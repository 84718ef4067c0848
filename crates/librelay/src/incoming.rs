use crate::errors::RelayError;
use crate::event::{ErrorEvent, Event, EventDispatcher, KeyChangeEvent, MessageEvent, ReadEvent, ReceiptEvent, SentEvent};
use crate::hub::SignalClient;
use crate::keys::refresh_prekeys;
use crate::outgoing::MessageSender;
use crate::padding::unpad_message_buffer;
use crate::queue::SerialQueue;
use crate::store::SignalStore;
use crate::stream::{KeepaliveConfig, StreamConnection, StreamEvent, StreamRequest, StreamTransport};
use crate::wire::{
    decode_content, decode_data_message, decode_envelope, open_frame, DataMessage, Envelope,
    EnvelopeType, SyncMessage, END_SESSION_FLAG,
};
use librelay_protocol::{ProtocolAddress, ProtocolError, SessionCipher};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::oneshot;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct ReceiverInner {
    client: Arc<dyn SignalClient>,
    store: SignalStore,
    events: EventDispatcher,
    sender: MessageSender,
    transport: Option<Arc<dyn StreamTransport>>,
    queue: SerialQueue,
    addr: String,
    device_id: u32,
    signaling_key: Vec<u8>,
    closing: AtomicBool,
    running: Mutex<bool>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

#[derive(Clone)]
pub struct MessageReceiver {
    inner: Arc<ReceiverInner>,
}

impl MessageReceiver {
    pub async fn new(
        client: Arc<dyn SignalClient>,
        store: SignalStore,
        events: EventDispatcher,
        sender: MessageSender,
        transport: Option<Arc<dyn StreamTransport>>,
    ) -> Result<Self, RelayError> {
        let addr = store.own_addr().await?;
        let device_id = store.own_device_id().await?;
        let signaling_key = store.signaling_key().await?;
        Ok(Self {
            inner: Arc::new(ReceiverInner {
                client,
                store,
                events,
                sender,
                transport,
                queue: SerialQueue::new(),
                addr,
                device_id,
                signaling_key,
                closing: AtomicBool::new(false),
                running: Mutex::new(false),
                shutdown: Mutex::new(None),
            }),
        })
    }

    /// Establishes the message stream, retrying until it comes up. Repeat
    /// calls while connected (or while another call is still connecting)
    /// simply join the existing attempt.
    pub async fn connect(&self) -> Result<(), RelayError> {
        let transport = self
            .inner
            .transport
            .clone()
            .ok_or_else(|| RelayError::Transport("streaming disabled".to_string()))?;
        self.inner.closing.store(false, Ordering::SeqCst);
        let mut running = self.inner.running.lock().await;
        if *running {
            return Ok(());
        }
        let connection = self.connect_loop(transport.as_ref()).await?;
        *running = true;
        drop(running);
        let this = self.clone();
        tokio::spawn(async move {
            this.run(connection, transport).await;
        });
        Ok(())
    }

    pub async fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        if let Some(tx) = self.inner.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
    }

    async fn connect_loop(
        &self,
        transport: &dyn StreamTransport,
    ) -> Result<StreamConnection, RelayError> {
        loop {
            if self.inner.closing.load(Ordering::SeqCst) {
                return Err(RelayError::Transport("receiver closed".to_string()));
            }
            let url = match self.inner.client.get_message_websocket_url().await {
                Ok(url) => url,
                Err(err) => {
                    log::warn!("message stream url fetch failed: {}", err);
                    self.check_registration().await;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            match transport.connect(&url, &KeepaliveConfig::default()).await {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    log::warn!("message stream connect failed: {}", err);
                    self.check_registration().await;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    async fn run(&self, first: StreamConnection, transport: Arc<dyn StreamTransport>) {
        let mut connection = Some(first);
        loop {
            let mut current = match connection.take() {
                Some(current) => current,
                None => match self.connect_loop(transport.as_ref()).await {
                    Ok(current) => current,
                    Err(_) => break,
                },
            };
            if let Some(shutdown) = current.take_shutdown() {
                *self.inner.shutdown.lock().await = Some(shutdown);
            }
            self.pump(&mut current).await;
            if self.inner.closing.load(Ordering::SeqCst) {
                break;
            }
            log::warn!("message stream closed; reconnecting");
            self.check_registration().await;
        }
        *self.inner.running.lock().await = false;
    }

    async fn pump(&self, connection: &mut StreamConnection) {
        while let Some(event) = connection.events.recv().await {
            match event {
                StreamEvent::Request(request) => {
                    let this = self.clone();
                    let _ = self
                        .inner
                        .queue
                        .run(async move { this.handle_request(request).await })
                        .await;
                }
                StreamEvent::Closed { code, reason } => {
                    log::info!("message stream closed ({} {})", code, reason);
                    break;
                }
                StreamEvent::Error(err) => {
                    log::warn!("message stream error: {}", err);
                }
            }
        }
    }

    async fn check_registration(&self) {
        if let Err(err) = self.inner.client.get_devices().await {
            let error = format!("registration check failed: {}", err);
            log::error!("{}", error);
            self.inner
                .events
                .emit(&Event::Error(ErrorEvent {
                    error,
                    addr: None,
                    timestamp: None,
                    envelope: None,
                }))
                .await;
        }
    }

    pub async fn handle_request(&self, mut request: StreamRequest) {
        if request.verb == "PUT" && request.path == "/api/v1/message" {
            let data = match open_frame(&self.inner.signaling_key, &request.body) {
                Ok(data) => data,
                Err(err) => {
                    self.emit_decode_error(&err).await;
                    request.respond(500, "Bad encrypted websocket message");
                    return;
                }
            };
            let envelope = match decode_envelope(&data) {
                Ok(envelope) => envelope,
                Err(err) => {
                    self.emit_decode_error(&err).await;
                    request.respond(500, "Bad encrypted websocket message");
                    return;
                }
            };
            self.handle_envelope(envelope, false, false).await;
            request.respond(200, "OK");
        } else if request.verb == "GET" && request.path == "/api/v1/queue/empty" {
            log::debug!("message queue drained");
            request.respond(200, "OK");
        } else {
            log::warn!("unexpected stream request {} {}", request.verb, request.path);
            request.respond(404, "Invalid Resource");
        }
    }

    async fn emit_decode_error(&self, err: &RelayError) {
        self.inner
            .events
            .emit(&Event::Error(ErrorEvent {
                error: err.to_string(),
                addr: None,
                timestamp: None,
                envelope: None,
            }))
            .await;
    }

    /// Classifies and absorbs every envelope fault; nothing propagates past
    /// this point except through `error` events.
    pub fn handle_envelope(
        &self,
        envelope: Envelope,
        reentrant: bool,
        key_change: bool,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let blocked = self
                .inner
                .store
                .is_blocked(&envelope.source)
                .await
                .unwrap_or(false);
            if blocked {
                log::debug!("dropping envelope from blocked sender {}", envelope.source);
                return;
            }
            match self.dispatch_envelope(&envelope, key_change).await {
                Ok(()) => {}
                Err(RelayError::Protocol(ProtocolError::DuplicateMessage(counter))) => {
                    log::warn!(
                        "dropping duplicate message from {}.{} (counter {})",
                        envelope.source,
                        envelope.source_device,
                        counter
                    );
                }
                Err(RelayError::Protocol(ProtocolError::UntrustedIdentity {
                    addr,
                    identity_key,
                })) => {
                    if reentrant {
                        self.emit_envelope_error(
                            &envelope,
                            format!("untrusted identity key for {}", addr),
                        )
                        .await;
                    } else {
                        let change = KeyChangeEvent::new(addr.clone(), identity_key);
                        self.inner
                            .events
                            .emit(&Event::KeyChange(change.clone()))
                            .await;
                        if change.accepted() {
                            let _ = self.inner.store.remove_identity(&addr).await;
                            self.handle_envelope(envelope, true, true).await;
                        }
                    }
                }
                Err(RelayError::Protocol(ProtocolError::PreKey(reason))) => {
                    log::warn!("prekey fault ({}); regenerating keys", reason);
                    if let Err(err) =
                        refresh_prekeys(&self.inner.store, self.inner.client.as_ref()).await
                    {
                        log::error!("prekey refresh failed: {}", err);
                    }
                    self.reset_session(&envelope).await;
                }
                Err(RelayError::Protocol(ProtocolError::Session(reason))) => {
                    log::warn!(
                        "session fault for {}.{} ({}); resetting",
                        envelope.source,
                        envelope.source_device,
                        reason
                    );
                    self.reset_session(&envelope).await;
                }
                Err(err) => {
                    self.emit_envelope_error(&envelope, err.to_string()).await;
                }
            }
        })
    }

    async fn emit_envelope_error(&self, envelope: &Envelope, error: String) {
        log::warn!("envelope handling failed: {}", error);
        self.inner
            .events
            .emit(&Event::Error(ErrorEvent {
                error,
                addr: Some(envelope.source.clone()),
                timestamp: Some(envelope.timestamp),
                envelope: Some(envelope.clone()),
            }))
            .await;
    }

    async fn reset_session(&self, envelope: &Envelope) {
        let encoded = format!("{}.{}", envelope.source, envelope.source_device);
        if let Err(err) = self.inner.store.close_open_session(&encoded).await {
            log::error!("session close failed for {}: {}", encoded, err);
        }
        if let Err(err) = self
            .inner
            .sender
            .close_session(&envelope.source, Some(envelope.timestamp))
            .await
        {
            log::error!("session reset send failed for {}: {}", envelope.source, err);
        }
    }

    async fn dispatch_envelope(
        &self,
        envelope: &Envelope,
        key_change: bool,
    ) -> Result<(), RelayError> {
        if envelope.envelope_type == EnvelopeType::Receipt {
            self.inner
                .events
                .emit(&Event::Receipt(ReceiptEvent {
                    source: envelope.source.clone(),
                    source_device: envelope.source_device,
                    timestamp: envelope.timestamp,
                }))
                .await;
            return Ok(());
        }
        if let Some(content) = envelope.content.clone() {
            self.handle_content_message(envelope, &content, key_change)
                .await
        } else if let Some(legacy) = envelope.legacy_message.clone() {
            self.handle_legacy_message(envelope, &legacy, key_change)
                .await
        } else {
            Err(RelayError::Codec("envelope has no content"))
        }
    }

    async fn handle_content_message(
        &self,
        envelope: &Envelope,
        body: &[u8],
        key_change: bool,
    ) -> Result<(), RelayError> {
        let plaintext = self.decrypt(envelope, body).await?;
        let content = decode_content(&plaintext)?;
        let mut handled = false;
        if let Some(data) = content.data_message {
            self.handle_data_message(envelope, data, key_change).await?;
            handled = true;
        }
        if let Some(sync) = content.sync_message {
            self.handle_sync_message(envelope, sync).await?;
            handled = true;
        }
        if !handled {
            return Err(RelayError::Codec("content without data or sync message"));
        }
        Ok(())
    }

    async fn handle_legacy_message(
        &self,
        envelope: &Envelope,
        body: &[u8],
        key_change: bool,
    ) -> Result<(), RelayError> {
        let plaintext = self.decrypt(envelope, body).await?;
        let data = decode_data_message(&plaintext)?;
        self.handle_data_message(envelope, data, key_change).await
    }

    async fn decrypt(&self, envelope: &Envelope, body: &[u8]) -> Result<Vec<u8>, RelayError> {
        let remote = ProtocolAddress::new(envelope.source.clone(), envelope.source_device);
        let cipher = SessionCipher::new(self.inner.store.protocol_store(), remote);
        let plaintext = match envelope.envelope_type {
            EnvelopeType::Ciphertext => cipher.decrypt_whisper(body).await?,
            EnvelopeType::PrekeyBundle => cipher.decrypt_prekey(body).await?,
            _ => return Err(RelayError::Codec("unknown message type")),
        };
        unpad_message_buffer(&plaintext)
    }

    async fn handle_data_message(
        &self,
        envelope: &Envelope,
        data: DataMessage,
        key_change: bool,
    ) -> Result<(), RelayError> {
        if data.flags & END_SESSION_FLAG != 0 {
            return self.handle_end_session(&envelope.source).await;
        }
        self.inner
            .events
            .emit(&Event::Message(MessageEvent {
                source: envelope.source.clone(),
                source_device: envelope.source_device,
                timestamp: envelope.timestamp,
                data,
                key_change,
            }))
            .await;
        Ok(())
    }

    async fn handle_end_session(&self, addr: &str) -> Result<(), RelayError> {
        for id in self.inner.store.get_device_ids(addr).await? {
            self.inner
                .store
                .close_open_session(&format!("{}.{}", addr, id))
                .await?;
        }
        log::info!("closed sessions for {}", addr);
        Ok(())
    }

    async fn handle_sync_message(
        &self,
        envelope: &Envelope,
        sync: SyncMessage,
    ) -> Result<(), RelayError> {
        if envelope.source != self.inner.addr {
            return Err(RelayError::Codec("sync message from foreign source"));
        }
        if envelope.source_device == self.inner.device_id {
            return Err(RelayError::Codec("sync message from our own device"));
        }
        if let Some(sent) = sync.sent {
            self.inner
                .events
                .emit(&Event::Sent(SentEvent {
                    addr: sent.destination.unwrap_or_default(),
                    timestamp: sent.timestamp,
                }))
                .await;
        }
        for entry in sync.read {
            self.inner
                .events
                .emit(&Event::Read(ReadEvent {
                    sender: entry.sender,
                    timestamp: entry.timestamp,
                }))
                .await;
        }
        if sync.blocked.is_some() {
            return Err(RelayError::Codec("blocked sync is unsupported"));
        }
        if sync.contacts.is_some() {
            return Err(RelayError::Codec("deprecated contact sync"));
        }
        if sync.groups.is_some() {
            return Err(RelayError::Codec("deprecated group sync"));
        }
        if sync.request.is_some() {
            return Err(RelayError::Codec("deprecated sync request"));
        }
        Ok(())
    }

    /// Pulls every queued envelope over the REST messages API, dispatching
    /// each through the same serialized handler the stream uses.
    pub async fn drain(&self) -> Result<(), RelayError> {
        if self.inner.transport.is_some() {
            return Err(RelayError::Transport(
                "drain unavailable while streaming".to_string(),
            ));
        }
        let mut deletions = Vec::new();
        loop {
            let page = self.inner.client.get_messages().await?;
            let more = page.more;
            for rest in page.messages {
                let envelope = crate::wire::envelope_from_rest(rest)?;
                let source = envelope.source.clone();
                let timestamp = envelope.timestamp;
                let this = self.clone();
                self.inner
                    .queue
                    .run(async move { this.handle_envelope(envelope, false, false).await })
                    .await?;
                let client = self.inner.client.clone();
                deletions.push(tokio::spawn(async move {
                    if let Err(err) = client.delete_message(&source, timestamp).await {
                        log::warn!("message delete failed for {}: {}", source, err);
                    }
                }));
            }
            if !more {
                break;
            }
        }
        for deletion in deletions {
            let _ = deletion.await;
        }
        Ok(())
    }
}
