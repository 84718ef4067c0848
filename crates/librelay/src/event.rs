use crate::wire::{DataMessage, Envelope};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

#[derive(Clone, Debug)]
pub enum Event {
    Message(MessageEvent),
    Sent(SentEvent),
    Receipt(ReceiptEvent),
    Read(ReadEvent),
    KeyChange(KeyChangeEvent),
    Error(ErrorEvent),
}

#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub source: String,
    pub source_device: u32,
    pub timestamp: u64,
    pub data: DataMessage,
    pub key_change: bool,
}

#[derive(Clone, Debug)]
pub struct SentEvent {
    pub addr: String,
    pub timestamp: u64,
}

#[derive(Clone, Debug)]
pub struct ReceiptEvent {
    pub source: String,
    pub source_device: u32,
    pub timestamp: u64,
}

#[derive(Clone, Debug)]
pub struct ReadEvent {
    pub sender: String,
    pub timestamp: u64,
}

#[derive(Clone, Debug)]
pub struct KeyChangeEvent {
    pub addr: String,
    pub identity_key: Vec<u8>,
    accepted: Arc<AtomicBool>,
}

impl KeyChangeEvent {
    pub fn new(addr: String, identity_key: Vec<u8>) -> Self {
        Self {
            addr,
            identity_key,
            accepted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn accept(&self) {
        self.accepted.store(true, Ordering::SeqCst);
    }

    pub fn accepted(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct ErrorEvent {
    pub error: String,
    pub addr: Option<String>,
    pub timestamp: Option<u64>,
    pub envelope: Option<Envelope>,
}

#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &Event) -> Result<(), ListenerError>;
}

/// Listeners run sequentially in registration order; a failing listener is
/// logged and never interrupts the others.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().await.push(listener);
    }

    pub async fn emit(&self, event: &Event) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            if let Err(err) = listener.on_event(event).await {
                log::warn!("event listener failed: {}", err);
            }
        }
    }
}
