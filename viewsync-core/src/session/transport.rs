//! Outbound byte channel to the peer

use std::sync::mpsc;
use thiserror::Error;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        SyncError::Transport(err.to_string())
    }
}

/// Raw bytes out; whatever receives bytes from the peer calls
/// `SessionHandle::receive`
pub trait Transport: Send {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;
}

impl Transport for mpsc::Sender<Vec<u8>> {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        mpsc::Sender::send(self, bytes).map_err(|_| TransportError::Closed)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        (**self).send(bytes)
    }
}
