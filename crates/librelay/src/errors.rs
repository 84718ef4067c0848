use crate::hub::HubError;
use librelay_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("storage")]
    Storage,
    #[error("missing state {0}")]
    MissingState(&'static str),
    #[error("codec {0}")]
    Codec(&'static str),
    #[error("transport {0}")]
    Transport(String),
    #[error("configuration {0}")]
    Config(String),
    #[error("{0}")]
    Hub(#[from] HubError),
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Clone, Debug, Error)]
pub enum OutgoingError {
    #[error("unregistered user {0}")]
    UnregisteredUser(String),
    #[error("identity key changed for {addr}")]
    IdentityKeyChanged { addr: String, identity_key: Vec<u8> },
    #[error("failed to create message for {addr}: {cause}")]
    EncryptFailure { addr: String, cause: String },
    #[error("send failed for {addr}: {cause}")]
    SendFailure { addr: String, cause: String },
    #[error("outgoing fault for {addr}: {cause}")]
    Fault { addr: String, cause: String },
    #[error("retry limit reached for {0}")]
    RetryLimit(String),
}

impl OutgoingError {
    pub fn addr(&self) -> &str {
        match self {
            OutgoingError::UnregisteredUser(addr) => addr,
            OutgoingError::IdentityKeyChanged { addr, .. } => addr,
            OutgoingError::EncryptFailure { addr, .. } => addr,
            OutgoingError::SendFailure { addr, .. } => addr,
            OutgoingError::Fault { addr, .. } => addr,
            OutgoingError::RetryLimit(addr) => addr,
        }
    }
}
