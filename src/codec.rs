//! Frame codec: turns logical frames into packets and back for one protocol
//! revision and one key.
//!
//! The per-revision rules (version header placement, padding, integrity
//! algorithm) are chosen once, when the codec is built, as a [`Scheme`].

use crate::crypto::{TuyaCipher, decrypt_with_fallback, legacy_payload_tag, pad_block};
use crate::error::{Result, TuyaError};
use crate::protocol::{
    CommandType, TuyaMessage, VERSION_HEADER_LEN, Version, pack_message, split_packets,
    unpack_message,
};
use base64::{Engine as _, engine::general_purpose};
use byteorder::{BigEndian, ByteOrder};
use log::debug;

/// Encoding rules for a group of protocol revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// 3.1 and 3.2: only `Control` payloads are encrypted, base64 encoded and
    /// tagged with an MD5 digest. CRC-32 integrity.
    Legacy,
    /// 3.3: every payload is encrypted; versioned commands carry the version
    /// header in the clear ahead of the ciphertext. CRC-32 integrity.
    Ecb,
    /// 3.4: the version header is encrypted along with the payload, which is
    /// block padded by the caller. HMAC-SHA256 integrity.
    Hmac,
}

impl Scheme {
    pub fn for_version(version: Version) -> Self {
        match version {
            Version::V3_1 | Version::V3_2 => Scheme::Legacy,
            Version::V3_3 => Scheme::Ecb,
            Version::V3_4 => Scheme::Hmac,
        }
    }
}

/// Encoder/decoder bound to a revision and a key.
///
/// A 3.4 connection replaces its codec once the session key is known; the codec
/// itself never changes key.
#[derive(Clone)]
pub struct FrameCodec {
    version: Version,
    scheme: Scheme,
    cipher: TuyaCipher,
    fallback: Option<TuyaCipher>,
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("version", &self.version)
            .field("scheme", &self.scheme)
            .field("fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

impl FrameCodec {
    pub fn new(version: Version, key: &[u8]) -> Result<Self> {
        Ok(Self {
            version,
            scheme: Scheme::for_version(version),
            cipher: TuyaCipher::new(key)?,
            fallback: None,
        })
    }

    /// Key to retry with when decryption under the primary key fails.
    pub fn with_fallback_key(mut self, key: &[u8]) -> Result<Self> {
        self.fallback = Some(TuyaCipher::new(key)?);
        Ok(self)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn key(&self) -> &[u8] {
        self.cipher.key()
    }

    fn version_header(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(VERSION_HEADER_LEN);
        header.extend_from_slice(self.version.as_bytes());
        header.resize(VERSION_HEADER_LEN, 0);
        header
    }

    fn hmac_key(&self, cmd: u32) -> Option<&[u8]> {
        (self.scheme == Scheme::Hmac && !CommandType::is_discovery_code(cmd))
            .then_some(&self.cipher.key()[..])
    }

    /// Encode a frame into a packet.
    pub fn encode(&self, msg: &TuyaMessage) -> Result<Vec<u8>> {
        if msg.version != self.version {
            return Err(TuyaError::UnsupportedVersion(format!(
                "{} (codec is {})",
                msg.version, self.version
            )));
        }

        let versioned = CommandType::is_versioned_code(msg.cmd);
        let body = match self.scheme {
            Scheme::Hmac => {
                let mut plain = if versioned {
                    self.version_header()
                } else {
                    Vec::with_capacity(msg.payload.len())
                };
                plain.extend_from_slice(&msg.payload);
                self.cipher.encrypt(&pad_block(&plain), false)?
            }
            Scheme::Ecb => {
                let encrypted = self.cipher.encrypt(&msg.payload, true)?;
                if versioned {
                    let mut body = self.version_header();
                    body.extend_from_slice(&encrypted);
                    body
                } else {
                    encrypted
                }
            }
            Scheme::Legacy if msg.cmd == CommandType::Control as u32 => {
                let encrypted = self.cipher.encrypt(&msg.payload, true)?;
                let b64 = general_purpose::STANDARD.encode(encrypted);
                let tag = legacy_payload_tag(&b64, self.version, self.cipher.key());
                format!("{}{}{}", self.version, tag, b64).into_bytes()
            }
            Scheme::Legacy => msg.payload.clone(),
        };

        let wire = TuyaMessage {
            version: msg.version,
            seqno: msg.seqno,
            cmd: msg.cmd,
            retcode: msg.retcode,
            payload: body,
        };
        let packet = pack_message(&wire, self.hmac_key(msg.cmd))?;
        debug!(
            "Encoded cmd=0x{:02X} seq={:?} ({} bytes): {}",
            msg.cmd,
            msg.seqno,
            packet.len(),
            hex::encode(&packet)
        );
        Ok(packet)
    }

    /// Decode exactly one packet.
    pub fn decode(&self, packet: &[u8]) -> Result<TuyaMessage> {
        let cmd = packet.get(8..12).map(BigEndian::read_u32).unwrap_or_default();
        let mut msg = unpack_message(packet, self.version, self.hmac_key(cmd))?;

        if !msg.payload.is_empty()
            && (self.version >= Version::V3_3 || msg.payload.starts_with(self.version.as_bytes()))
        {
            msg.payload = self.decrypt_payload(&msg, packet)?;
        }

        debug!(
            "Decoded cmd=0x{:02X} seq={:?} retcode={:?}: {}",
            msg.cmd,
            msg.seqno,
            msg.retcode,
            String::from_utf8_lossy(&msg.payload)
        );
        Ok(msg)
    }

    fn decrypt_payload(&self, msg: &TuyaMessage, packet: &[u8]) -> Result<Vec<u8>> {
        match decrypt_with_fallback(&self.cipher, self.fallback.as_ref(), &msg.payload, self.version)
        {
            Ok(mut plain) => {
                if self.version >= Version::V3_3
                    && plain.len() >= VERSION_HEADER_LEN
                    && plain.starts_with(self.version.as_bytes())
                {
                    plain.drain(..VERSION_HEADER_LEN);
                }
                Ok(plain)
            }
            Err(_) if self.scheme == Scheme::Ecb && msg.payload.first() == Some(&b'{') => {
                debug!("Accepting unencrypted JSON payload on cmd 0x{:02X}", msg.cmd);
                Ok(msg.payload.clone())
            }
            Err(_) => Err(TuyaError::UndecryptablePayload {
                cmd: msg.cmd,
                seqno: msg.seqno.unwrap_or_default(),
                raw: packet.to_vec(),
            }),
        }
    }

    /// Split a read buffer and decode every packet independently.
    pub fn decode_stream(&self, bytes: &[u8]) -> Vec<Result<TuyaMessage>> {
        split_packets(bytes)
            .into_iter()
            .map(|packet| self.decode(packet))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HEADER_SIZE;

    const KEY: &[u8] = b"0123456789abcdef";

    fn control(version: Version, payload: &[u8]) -> TuyaMessage {
        TuyaMessage::new(version, CommandType::Control, payload).with_seqno(3)
    }

    #[test]
    fn scheme_is_chosen_from_version() {
        assert_eq!(Scheme::for_version(Version::V3_1), Scheme::Legacy);
        assert_eq!(Scheme::for_version(Version::V3_2), Scheme::Legacy);
        assert_eq!(Scheme::for_version(Version::V3_3), Scheme::Ecb);
        assert_eq!(Scheme::for_version(Version::V3_4), Scheme::Hmac);
    }

    #[test]
    fn rejects_frames_of_another_version() {
        let codec = FrameCodec::new(Version::V3_3, KEY).unwrap();
        let err = codec.encode(&control(Version::V3_4, b"{}")).unwrap_err();
        assert!(matches!(err, TuyaError::UnsupportedVersion(_)));
    }

    #[test]
    fn ecb_puts_version_header_in_the_clear() {
        let codec = FrameCodec::new(Version::V3_3, KEY).unwrap();
        let packet = codec.encode(&control(Version::V3_3, b"{\"dps\":{}}")).unwrap();

        let body = &packet[HEADER_SIZE..packet.len() - 8];
        assert_eq!(&body[..3], b"3.3");
        assert!(body[3..VERSION_HEADER_LEN].iter().all(|&b| b == 0));
        assert_eq!((body.len() - VERSION_HEADER_LEN) % 16, 0);
    }

    #[test]
    fn hmac_hides_version_header_inside_ciphertext() {
        let codec = FrameCodec::new(Version::V3_4, KEY).unwrap();
        let packet = codec.encode(&control(Version::V3_4, b"{\"dps\":{}}")).unwrap();

        let body = &packet[HEADER_SIZE..packet.len() - 36];
        assert_eq!(body.len() % 16, 0);
        let inner = TuyaCipher::new(KEY).unwrap().decrypt_raw(body).unwrap();
        assert_eq!(&inner[..3], b"3.4");
        assert_eq!(&inner[VERSION_HEADER_LEN..], b"{\"dps\":{}}");
    }

    #[test]
    fn legacy_control_is_tagged_base64() {
        let codec = FrameCodec::new(Version::V3_1, KEY).unwrap();
        let packet = codec.encode(&control(Version::V3_1, b"{\"dps\":{\"1\":true}}")).unwrap();
        let body = &packet[HEADER_SIZE..packet.len() - 8];
        assert_eq!(&body[..3], b"3.1");
        assert!(body[3..19].iter().all(|b| b.is_ascii_hexdigit()));

        let decoded = codec.decode(&packet).unwrap();
        assert_eq!(decoded.payload, b"{\"dps\":{\"1\":true}}");
    }

    #[test]
    fn legacy_query_travels_in_plaintext() {
        let codec = FrameCodec::new(Version::V3_1, KEY).unwrap();
        let msg = TuyaMessage::new(Version::V3_1, CommandType::DpQuery, b"{\"gwId\":\"x\"}".to_vec());
        let packet = codec.encode(&msg).unwrap();
        assert_eq!(&packet[HEADER_SIZE..HEADER_SIZE + 12], b"{\"gwId\":\"x\"}");
    }

    #[test]
    fn pushed_status_with_filled_header_decodes() {
        let mut body = b"3.3".to_vec();
        body.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1, 0xea, 0x1d, 0, 0]);
        body.extend_from_slice(
            &TuyaCipher::new(KEY)
                .unwrap()
                .encrypt(b"{\"dps\":{\"1\":true}}", true)
                .unwrap(),
        );
        let wire = TuyaMessage::new(Version::V3_3, CommandType::Status, body)
            .with_seqno(3)
            .with_retcode(0);
        let packet = pack_message(&wire, None).unwrap();

        let codec = FrameCodec::new(Version::V3_3, KEY).unwrap();
        let msg = codec.decode(&packet).unwrap();
        assert_eq!(msg.seqno, Some(3));
        assert_eq!(msg.payload, b"{\"dps\":{\"1\":true}}");
    }

    #[test]
    fn unencrypted_json_is_accepted_at_3_3() {
        let plain = TuyaMessage::new(Version::V3_3, CommandType::Status, b"{\"dps\":{\"1\":1}}".to_vec())
            .with_seqno(1);
        let packet = pack_message(&plain, None).unwrap();

        let codec = FrameCodec::new(Version::V3_3, KEY).unwrap();
        assert_eq!(codec.decode(&packet).unwrap().payload, b"{\"dps\":{\"1\":1}}");
    }

    #[test]
    fn undecryptable_payload_reports_context() {
        let other = FrameCodec::new(Version::V3_3, b"fedcba9876543210").unwrap();
        let packet = other
            .encode(&TuyaMessage::new(Version::V3_3, CommandType::Status, vec![b'x'; 40]).with_seqno(9))
            .unwrap();

        let codec = FrameCodec::new(Version::V3_3, KEY).unwrap();
        match codec.decode(&packet) {
            Err(TuyaError::UndecryptablePayload { cmd, seqno, raw }) => {
                assert_eq!(cmd, CommandType::Status as u32);
                assert_eq!(seqno, 9);
                assert_eq!(raw, packet);
            }
            // A wrong key occasionally unpads cleanly; it must still not
            // reproduce the plaintext.
            Ok(msg) => assert_ne!(msg.payload, vec![b'x'; 40]),
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn fallback_key_decodes_foreign_packets() {
        let universal = crate::crypto::md5(b"yGAdlopoPVldABfn");
        let sender = FrameCodec::new(Version::V3_3, &universal).unwrap();
        let packet = sender
            .encode(&TuyaMessage::new(Version::V3_3, CommandType::UdpNew, b"{\"ip\":\"1.2.3.4\"}".to_vec()))
            .unwrap();

        let codec = FrameCodec::new(Version::V3_3, KEY)
            .unwrap()
            .with_fallback_key(&universal)
            .unwrap();
        assert_eq!(codec.decode(&packet).unwrap().payload, b"{\"ip\":\"1.2.3.4\"}");
    }

    #[test]
    fn discovery_commands_stay_crc_framed_at_3_4() {
        let codec = FrameCodec::new(Version::V3_4, KEY).unwrap();
        let msg = TuyaMessage::new(Version::V3_4, CommandType::UdpNew, b"{}".to_vec());
        let packet = codec.encode(&msg).unwrap();
        // Version header and payload pad out to two blocks, then the CRC trailer.
        assert_eq!(packet.len(), HEADER_SIZE + 32 + 8);
        assert_eq!(codec.decode(&packet).unwrap().payload, b"{}");
    }

    #[test]
    fn decode_stream_isolates_bad_packets() {
        let codec = FrameCodec::new(Version::V3_3, KEY).unwrap();
        let good = codec.encode(&control(Version::V3_3, b"{\"a\":1}")).unwrap();
        let mut bad = good.clone();
        bad[20] ^= 0x55;

        let mut buf = bad;
        buf.extend_from_slice(&good);
        let results = codec.decode_stream(&buf);
        assert_eq!(results.len(), 2);
        assert!(results[0].as_ref().unwrap_err().is_integrity());
        assert_eq!(results[1].as_ref().unwrap().payload, b"{\"a\":1}");
    }
}
