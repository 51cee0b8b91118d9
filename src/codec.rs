//! Seals and opens one record per frame.
//!
//! Wire format after the handshake, both directions:
//! `Fernet(key, JSON-UTF8(record))`. Decode failures are non-fatal for the
//! session; callers reply with a generic `error` record and keep reading.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::crypto::Fernet;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame does not decrypt")]
    Decrypt,
    #[error("record encode failed: {0}")]
    Encode(String),
    #[error("malformed record: {0}")]
    Parse(String),
}

/// Per-connection record codec bound to the handshake-derived key.
#[derive(Debug, Clone)]
pub struct RecordCipher {
    fernet: Fernet,
}

impl RecordCipher {
    pub fn new(fernet: Fernet) -> Self {
        Self { fernet }
    }

    /// Serializes and encrypts a record into a ready-to-frame payload.
    pub fn seal<T: Serialize>(&self, record: &T) -> Result<Bytes, CodecError> {
        let json = serde_json::to_vec(record).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(self.fernet.encrypt(&json)))
    }

    /// Decrypts and parses one inbound frame.
    pub fn open<T: DeserializeOwned>(&self, frame: &[u8]) -> Result<T, CodecError> {
        let token = std::str::from_utf8(frame).map_err(|_| CodecError::Decrypt)?;
        let json = self.fernet.decrypt(token).map_err(|_| CodecError::Decrypt)?;
        serde_json::from_slice(&json).map_err(|e| CodecError::Parse(e.to_string()))
    }
}
