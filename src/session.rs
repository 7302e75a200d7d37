//! Session key negotiation for protocol 3.4.
//!
//! The exchange is three frames, all under the static device key:
//! `SessKeyNegStart` carries our nonce, `SessKeyNegResp` carries the device's
//! nonce plus its proof of the static key, and `SessKeyNegFinish` carries our
//! proof of the device's nonce. Both sides then derive the same session key.
//! This module holds no I/O; the connection task feeds it payloads.

use crate::crypto::{HMAC_LEN, KEY_LEN, TuyaCipher, hmac_sha256, verify_hmac_sha256};
use crate::error::{Result, TuyaError};
use log::debug;
use rand::RngCore;

pub const NONCE_LEN: usize = 16;
/// Remote nonce followed by HMAC-SHA256 of our nonce.
pub const RESPONSE_LEN: usize = NONCE_LEN + HMAC_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingResponse,
    Established,
    Failed,
}

/// Outcome of a completed negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub local_nonce: [u8; NONCE_LEN],
    pub remote_nonce: [u8; NONCE_LEN],
    pub session_key: [u8; KEY_LEN],
}

/// What the caller must do after a valid response: send `finish_payload` as
/// `SessKeyNegFinish`, then switch to `session.session_key`.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub finish_payload: Vec<u8>,
    pub session: SessionState,
}

/// Client side of the 3.4 session key exchange.
pub struct SessionNegotiator {
    static_key: [u8; KEY_LEN],
    local_nonce: [u8; NONCE_LEN],
    state: NegotiationState,
}

impl SessionNegotiator {
    /// Negotiator with a fresh random nonce.
    pub fn new(static_key: &[u8]) -> Result<Self> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        Self::with_nonce(static_key, nonce)
    }

    pub fn with_nonce(static_key: &[u8], local_nonce: [u8; NONCE_LEN]) -> Result<Self> {
        let cipher = TuyaCipher::new(static_key)?;
        Ok(Self {
            static_key: *cipher.key(),
            local_nonce,
            state: NegotiationState::Idle,
        })
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_nonce(&self) -> &[u8; NONCE_LEN] {
        &self.local_nonce
    }

    /// Payload of the `SessKeyNegStart` frame.
    pub fn start(&mut self) -> Vec<u8> {
        self.state = NegotiationState::AwaitingResponse;
        debug!("Session negotiation started, local nonce {}", hex::encode(self.local_nonce));
        self.local_nonce.to_vec()
    }

    /// Verify the device's `SessKeyNegResp` payload and derive the session key.
    pub fn handle_response(&mut self, payload: &[u8]) -> Result<Handshake> {
        if self.state != NegotiationState::AwaitingResponse {
            return Err(TuyaError::HandshakeFailed(format!(
                "unexpected negotiation response in state {:?}",
                self.state
            )));
        }

        if payload.len() < RESPONSE_LEN {
            self.state = NegotiationState::Failed;
            return Err(TuyaError::HandshakeFailed(format!(
                "response of {} bytes, expected at least {}",
                payload.len(),
                RESPONSE_LEN
            )));
        }

        let mut remote_nonce = [0u8; NONCE_LEN];
        remote_nonce.copy_from_slice(&payload[..NONCE_LEN]);
        let proof = &payload[NONCE_LEN..RESPONSE_LEN];

        if !verify_hmac_sha256(&self.static_key, &self.local_nonce, proof)? {
            self.state = NegotiationState::Failed;
            return Err(TuyaError::HandshakeAuthentication);
        }

        let finish_payload = hmac_sha256(&self.static_key, &remote_nonce)?.to_vec();
        let session_key = derive_session_key(&self.static_key, &self.local_nonce, &remote_nonce)?;
        self.state = NegotiationState::Established;
        debug!("Session negotiation complete, remote nonce {}", hex::encode(remote_nonce));

        Ok(Handshake {
            finish_payload,
            session: SessionState {
                local_nonce: self.local_nonce,
                remote_nonce,
                session_key,
            },
        })
    }
}

/// XOR the two nonces and encrypt the resulting block, unpadded, under the
/// static key.
pub fn derive_session_key(
    static_key: &[u8],
    local_nonce: &[u8; NONCE_LEN],
    remote_nonce: &[u8; NONCE_LEN],
) -> Result<[u8; KEY_LEN]> {
    let mut mixed = [0u8; NONCE_LEN];
    for (out, (l, r)) in mixed.iter_mut().zip(local_nonce.iter().zip(remote_nonce)) {
        *out = l ^ r;
    }

    let encrypted = TuyaCipher::new(static_key)?.encrypt(&mixed, false)?;
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&encrypted[..KEY_LEN]);
    Ok(key)
}
