//! Tuya protocol encryption primitives.
//! AES-128-ECB for every revision, HMAC-SHA256 for 3.4 integrity and session
//! negotiation, MD5 for the legacy payload tag and the discovery key.

use crate::error::{Result, TuyaError};
use crate::protocol::{VERSION_HEADER_LEN, Version};
use aes::Aes128;
use base64::{Engine as _, engine::general_purpose};
use cipher::block_padding::{NoPadding, Pkcs7};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use ecb::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use log::debug;
use md5::{Digest, Md5};
use sha2::Sha256;
use std::borrow::Cow;

pub const BLOCK_SIZE: usize = 16;
pub const KEY_LEN: usize = 16;
pub const HMAC_LEN: usize = 32;
/// MD5 hex characters that follow the version digits in legacy (< 3.3) payloads.
pub const LEGACY_TAG_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// TuyaCipher provides AES-128-ECB encryption and decryption under one key.
#[derive(Clone)]
pub struct TuyaCipher {
    /// 16-byte encryption key
    key: [u8; KEY_LEN],
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key (raw bytes or 16 ASCII characters).
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| TuyaError::InvalidKey(key.len()))?;
        Ok(Self { key })
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Encrypt data in ECB mode.
    /// * `cipher_padding`: if true the cipher applies PKCS#7 itself (revisions up
    ///   to 3.3). If false the caller has already padded the input with
    ///   [`pad_block`] (revision 3.4) and it must be block aligned.
    pub fn encrypt(&self, data: &[u8], cipher_padding: bool) -> Result<Vec<u8>> {
        let encryptor = Encryptor::<Aes128>::new(&self.key.into());
        let len = data.len();

        if cipher_padding {
            let mut buf = vec![0u8; (len / BLOCK_SIZE + 1) * BLOCK_SIZE];
            buf[..len].copy_from_slice(data);
            let written = encryptor
                .encrypt_padded_mut::<Pkcs7>(&mut buf, len)
                .map_err(|_| TuyaError::EncryptionFailed)?
                .len();
            buf.truncate(written);
            Ok(buf)
        } else {
            if len % BLOCK_SIZE != 0 {
                return Err(TuyaError::EncryptionFailed);
            }
            let mut buf = data.to_vec();
            encryptor
                .encrypt_padded_mut::<NoPadding>(&mut buf, len)
                .map_err(|_| TuyaError::EncryptionFailed)?;
            Ok(buf)
        }
    }

    /// Decrypt ECB ciphertext and strip its PKCS#7 padding.
    ///
    /// A wrong key shows up as `DecryptionFailed` (invalid padding), never a panic.
    pub fn decrypt_raw(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
            return Err(TuyaError::DecryptionFailed);
        }
        let mut buf = data.to_vec();
        let plain_len = Decryptor::<Aes128>::new(&self.key.into())
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|_| TuyaError::DecryptionFailed)?
            .len();
        buf.truncate(plain_len);
        Ok(buf)
    }

    /// Decrypt a payload as received from a device of the given revision.
    ///
    /// A leading version tag is removed before decrypting: either the 15-byte
    /// `"3.x"` + zero header, or the legacy `"3.x"` + MD5 tag followed by base64.
    pub fn decrypt(&self, data: &[u8], version: Version) -> Result<Vec<u8>> {
        let body = strip_version_tag(data, version)?;
        if body.is_empty() {
            return Ok(Vec::new());
        }
        self.decrypt_raw(&body)
    }
}

fn strip_version_tag(data: &[u8], version: Version) -> Result<Cow<'_, [u8]>> {
    let digits = version.as_bytes();
    if !data.starts_with(digits) {
        return Ok(Cow::Borrowed(data));
    }

    // From 3.3 on the 12 bytes after the digits are not always zero; devices
    // put sequence and CRC data there on pushed status frames.
    if version >= Version::V3_3 {
        let body = data.get(VERSION_HEADER_LEN..).unwrap_or(data);
        return Ok(Cow::Borrowed(body));
    }

    if data.len() >= VERSION_HEADER_LEN
        && data[digits.len()..VERSION_HEADER_LEN].iter().all(|&b| b == 0)
    {
        return Ok(Cow::Borrowed(&data[VERSION_HEADER_LEN..]));
    }

    let start = digits.len() + LEGACY_TAG_LEN;
    if data.len() < start {
        return Err(TuyaError::DecryptionFailed);
    }
    general_purpose::STANDARD
        .decode(&data[start..])
        .map(Cow::Owned)
        .map_err(|_| TuyaError::DecryptionFailed)
}

/// Decrypt with `primary`, retrying once with `fallback` (the universal
/// discovery key) before giving up.
pub fn decrypt_with_fallback(
    primary: &TuyaCipher,
    fallback: Option<&TuyaCipher>,
    data: &[u8],
    version: Version,
) -> Result<Vec<u8>> {
    match primary.decrypt(data, version) {
        Ok(plain) => Ok(plain),
        Err(e) => match fallback {
            Some(alt) if alt.key != primary.key => {
                debug!("Primary key failed to decrypt, retrying with fallback key");
                alt.decrypt(data, version)
            }
            _ => Err(e),
        },
    }
}

/// Pads to a whole number of blocks with value-equals-length bytes. An input
/// that is already aligned gets a full extra block of `0x10`.
pub fn pad_block(data: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    out.resize(data.len() + pad_len, pad_len as u8);
    out
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; HMAC_LEN]> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
    mac.update(data);
    let mut out = [0u8; HMAC_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Constant-time comparison of `tag` against `HMAC-SHA256(key, data)`.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
    mac.update(data);
    Ok(mac.verify_slice(tag).is_ok())
}

pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md5::digest(data));
    out
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5(data))
}

/// The 16-character tag legacy (< 3.3) devices expect between the version
/// digits and the base64 ciphertext.
pub fn legacy_payload_tag(b64_payload: &str, version: Version, key: &[u8]) -> String {
    let pre = format!(
        "data={}||lpv={}||{}",
        b64_payload,
        version,
        String::from_utf8_lossy(key)
    );
    md5_hex(pre.as_bytes())[8..8 + LEGACY_TAG_LEN].to_string()
}
