//! Switch-profile wire message
//!
//! A single fixed message shape travels over the waiter channel. Each
//! message occupies one datagram, so framing is free and a partial read can
//! never split a request.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::registry::RegistryError;

/// Upper bound on the encoded size of one message, in bytes.
pub const MESSAGE_LIMIT: usize = 512;

/// Request sent by a setter to the live waiter: make `profile` from the file
/// at `config_path` the active one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchProfileRequest {
    pub profile: String,
    pub config_path: PathBuf,
}

impl SwitchProfileRequest {
    pub fn new(profile: impl Into<String>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            profile: profile.into(),
            config_path: config_path.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RegistryError> {
        let bytes = serde_json::to_vec(self).map_err(RegistryError::Malformed)?;
        if bytes.len() > MESSAGE_LIMIT {
            return Err(RegistryError::MessageTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RegistryError> {
        serde_json::from_slice(bytes).map_err(RegistryError::Malformed)
    }
}
