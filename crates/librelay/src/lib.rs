pub mod config;
pub mod errors;
pub mod event;
pub mod hub;
pub mod incoming;
pub mod keys;
pub mod outgoing;
pub mod padding;
pub mod queue;
pub mod store;
pub mod stream;
pub mod time;
pub mod wire;

pub use config::{StorageBacking, StorageConfig};
pub use errors::{OutgoingError, RelayError};
pub use event::{Event, EventDispatcher, EventListener};
pub use hub::SignalClient;
pub use incoming::MessageReceiver;
pub use outgoing::{MessageSender, OutgoingMessage};
pub use store::SignalStore;
pub use stream::StreamTransport;

pub use librelay_protocol::ProtocolAddress;

#[cfg(test)]
mod tests;
