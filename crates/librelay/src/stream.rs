use crate::errors::RelayError;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub path: String,
    pub disconnect_on_miss: bool,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            path: "/v1/keepalive".to_string(),
            disconnect_on_miss: true,
        }
    }
}

pub struct StreamRequest {
    pub verb: String,
    pub path: String,
    pub body: Vec<u8>,
    responder: Option<oneshot::Sender<(u16, String)>>,
}

impl StreamRequest {
    pub fn new(
        verb: impl Into<String>,
        path: impl Into<String>,
        body: Vec<u8>,
    ) -> (Self, oneshot::Receiver<(u16, String)>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                verb: verb.into(),
                path: path.into(),
                body,
                responder: Some(tx),
            },
            rx,
        )
    }

    pub fn respond(&mut self, code: u16, reason: &str) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send((code, reason.to_string()));
        }
    }
}

pub enum StreamEvent {
    Request(StreamRequest),
    Closed { code: u16, reason: String },
    Error(String),
}

pub struct StreamConnection {
    pub events: mpsc::Receiver<StreamEvent>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl StreamConnection {
    pub fn new(events: mpsc::Receiver<StreamEvent>, shutdown: oneshot::Sender<()>) -> Self {
        Self {
            events,
            shutdown: Some(shutdown),
        }
    }

    pub fn take_shutdown(&mut self) -> Option<oneshot::Sender<()>> {
        self.shutdown.take()
    }
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        keepalive: &KeepaliveConfig,
    ) -> Result<StreamConnection, RelayError>;
}
