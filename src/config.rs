//! Device configuration.
//!
//! [`DeviceOptions`] can be deserialized from JSON (camelCase keys, as Tuya
//! tooling exports them) or assembled with [`DeviceBuilder`].

use crate::crypto::KEY_LEN;
use crate::device::Device;
use crate::error::{Result, TuyaError};
use crate::protocol::Version;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6668;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Local keys are usually 16 printable characters, but any 16 bytes are valid.
/// Written as a string when the bytes are UTF-8, otherwise as a byte array.
mod local_key {
    use super::*;

    pub fn serialize<S: Serializer>(key: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        match std::str::from_utf8(key) {
            Ok(text) => s.serialize_str(text),
            Err(_) => s.serialize_bytes(key),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        d.deserialize_any(KeyVisitor)
    }

    struct KeyVisitor;

    impl<'de> Visitor<'de> for KeyVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a key string or an array of bytes")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Vec<u8>, E> {
            Ok(v.as_bytes().to_vec())
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Vec<u8>, A::Error> {
            let mut key = Vec::with_capacity(KEY_LEN);
            while let Some(b) = seq.next_element::<u8>()? {
                key.push(b);
            }
            Ok(key)
        }
    }
}

/// Everything needed to reach and talk to one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOptions {
    /// Device ID (`devId`)
    pub id: String,
    /// Gateway ID, the device ID unless the device sits behind a gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw_id: Option<String>,
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 16-byte local key
    #[serde(with = "local_key")]
    pub key: Vec<u8>,
    #[serde(default)]
    pub version: Version,
    #[serde(
        default = "default_heartbeat_interval",
        rename = "heartbeatIntervalMs",
        with = "millis"
    )]
    pub heartbeat_interval: Duration,
}

impl DeviceOptions {
    pub fn new(id: impl Into<String>, ip: impl Into<String>, key: impl AsRef<[u8]>) -> Self {
        Self {
            id: id.into(),
            gw_id: None,
            ip: ip.into(),
            port: DEFAULT_PORT,
            key: key.as_ref().to_vec(),
            version: Version::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn gw_id(&self) -> &str {
        self.gw_id.as_deref().unwrap_or(&self.id)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(TuyaError::MissingParameter("id"));
        }
        if self.ip.is_empty() {
            return Err(TuyaError::MissingParameter("ip"));
        }
        if self.key.len() != KEY_LEN {
            return Err(TuyaError::InvalidKey(self.key.len()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(TuyaError::MissingParameter("heartbeat_interval"));
        }
        Ok(())
    }
}

/// Builder for [`Device`].
///
/// ```no_run
/// # async fn demo() -> tuyalink::Result<()> {
/// let device = tuyalink::DeviceBuilder::new("bfbee61e344c952b34gfia", "0123456789abcdef")
///     .ip("192.168.1.40")
///     .version("3.4".parse()?)
///     .build()?;
/// assert_eq!(device.version(), tuyalink::Version::V3_4);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DeviceBuilder {
    options: DeviceOptions,
}

impl DeviceBuilder {
    /// `key` is the local key as text or as raw bytes.
    pub fn new(id: impl Into<String>, key: impl AsRef<[u8]>) -> Self {
        Self {
            options: DeviceOptions::new(id, "", key),
        }
    }

    /// Replace the local key with raw bytes, for keys that are not printable.
    pub fn raw_key(mut self, key: [u8; KEY_LEN]) -> Self {
        self.options.key = key.to_vec();
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.options.ip = ip.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    pub fn gw_id(mut self, gw_id: impl Into<String>) -> Self {
        self.options.gw_id = Some(gw_id.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.options.version = version;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.options.heartbeat_interval = interval;
        self
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Validate the options and spawn the device task. Must be called inside a
    /// tokio runtime.
    pub fn build(self) -> Result<Device> {
        Device::new(self.options)
    }
}

/// Options for a single [`Device::connect`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Send a data point query as soon as the connection is usable
    pub query_on_connect: bool,
    pub enable_heartbeat: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            query_on_connect: true,
            enable_heartbeat: true,
        }
    }
}
