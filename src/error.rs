//! Error types and result definitions for the tuyalink crate.
//! Packet-level errors carry the command, sequence number and raw bytes of the
//! offending packet so they can be diagnosed after the fact.

use std::time::Duration;
use thiserror::Error;

/// Represents all possible errors that can occur when talking to a Tuya device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TuyaError {
    /// Transport-level failure (connect, read, write).
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Missing or misplaced magic markers, or a truncated packet.
    #[error("Framing error: {reason}")]
    Framing { reason: String, raw: Vec<u8> },

    /// CRC-32 check failed (revisions up to 3.3 and discovery broadcasts).
    #[error("CRC mismatch on cmd 0x{cmd:02X} (seq {seqno}): expected {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch {
        cmd: u32,
        seqno: u32,
        expected: u32,
        actual: u32,
        raw: Vec<u8>,
    },

    /// HMAC-SHA256 check failed (revision 3.4).
    #[error("HMAC mismatch on cmd 0x{cmd:02X} (seq {seqno})")]
    HmacMismatch { cmd: u32, seqno: u32, raw: Vec<u8> },

    /// AES decryption failed (wrong key, bad padding or misaligned input).
    #[error("Decryption failed")]
    DecryptionFailed,

    /// A packet passed its integrity check but its payload could not be decrypted.
    #[error("Undecryptable payload on cmd 0x{cmd:02X} (seq {seqno})")]
    UndecryptablePayload { cmd: u32, seqno: u32, raw: Vec<u8> },

    /// Failed to encrypt a message for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Keys must be exactly 16 bytes.
    #[error("Invalid key length {0}, expected 16 bytes")]
    InvalidKey(usize),

    /// A required option was empty or zero.
    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Unsupported protocol version '{0}'")]
    UnsupportedVersion(String),

    /// The device's proof of the static key did not verify.
    #[error("Session negotiation failed: device HMAC does not match local nonce")]
    HandshakeAuthentication,

    /// The session negotiation exchange was malformed or out of order.
    #[error("Session negotiation failed: {0}")]
    HandshakeFailed(String),

    /// The device answered with a non-zero return code.
    #[error("Device returned code {return_code} for cmd 0x{cmd:02X} (seq {seqno})")]
    Protocol {
        cmd: u32,
        seqno: u32,
        return_code: u32,
        payload: Vec<u8>,
    },

    /// No heartbeat reply within twice the heartbeat interval.
    #[error("No heartbeat reply within {0:?}")]
    HeartbeatTimeout(Duration),

    /// Device is not connected, or its connection task is gone.
    #[error("Device offline")]
    Offline,
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl TuyaError {
    pub fn code(&self) -> u32 {
        match self {
            TuyaError::Io(_) => ERR_CONNECT,
            TuyaError::Json(_) => ERR_JSON,
            TuyaError::Framing { .. } => ERR_PAYLOAD,
            TuyaError::CrcMismatch { .. } => ERR_KEY_OR_VER,
            TuyaError::HmacMismatch { .. } => ERR_KEY_OR_VER,
            TuyaError::DecryptionFailed => ERR_KEY_OR_VER,
            TuyaError::UndecryptablePayload { .. } => ERR_KEY_OR_VER,
            TuyaError::EncryptionFailed => ERR_KEY_OR_VER,
            TuyaError::InvalidKey(_) => ERR_PARAMS,
            TuyaError::MissingParameter(_) => ERR_PARAMS,
            TuyaError::UnsupportedVersion(_) => ERR_PARAMS,
            TuyaError::HandshakeAuthentication => ERR_KEY_OR_VER,
            TuyaError::HandshakeFailed(_) => ERR_KEY_OR_VER,
            TuyaError::Protocol { .. } => ERR_STATE,
            TuyaError::HeartbeatTimeout(_) => ERR_TIMEOUT,
            TuyaError::Offline => ERR_OFFLINE,
        }
    }

    /// True for CRC and HMAC failures.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            TuyaError::CrcMismatch { .. } | TuyaError::HmacMismatch { .. }
        )
    }

    pub fn is_framing(&self) -> bool {
        matches!(self, TuyaError::Framing { .. })
    }

    /// Raw packet bytes attached to packet-level errors.
    pub fn raw_packet(&self) -> Option<&[u8]> {
        match self {
            TuyaError::Framing { raw, .. }
            | TuyaError::CrcMismatch { raw, .. }
            | TuyaError::HmacMismatch { raw, .. }
            | TuyaError::UndecryptablePayload { raw, .. } => Some(raw),
            _ => None,
        }
    }

    pub(crate) fn framing(reason: impl Into<String>, raw: &[u8]) -> Self {
        TuyaError::Framing {
            reason: reason.into(),
            raw: raw.to_vec(),
        }
    }
}

// TinyTuya Error Response Codes
define_error_codes! {
    ERR_SUCCESS = 0 => "Connection Successful",
    ERR_JSON = 900 => "Invalid JSON Response from Device",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_STATE = 906 => "Device in Unknown State",
    ERR_PARAMS = 912 => "Missing Function Parameters",
    ERR_KEY_OR_VER = 914 => "Check device key or version",
}
