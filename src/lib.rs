//! # tuyalink
//!
//! Asynchronous client for the Tuya local LAN protocol (versions 3.1 to 3.4).
//! It covers frame encoding, the 3.4 session key negotiation, a connection
//! manager per device and UDP discovery.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuyalink::{ConnectOptions, Device, DeviceEvent};
//!
//! # async fn demo() -> tuyalink::Result<()> {
//! let device = Device::builder("DEVICE_ID", "0123456789abcdef")
//!     .ip("192.168.1.40")
//!     .build()?;
//! let mut events = device.subscribe();
//! device.connect(ConnectOptions::default()).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let DeviceEvent::StateChanged(dps) = event {
//!         println!("{:?}", dps);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod device;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod session;

pub use codec::{FrameCodec, Scheme};
pub use config::{ConnectOptions, DeviceBuilder, DeviceOptions};
pub use device::{ConnectionState, DataPointSet, Device, DeviceEvent};
pub use discovery::{Discovery, DiscoveryEvent, DiscoveryMessage};
pub use error::{Result, TuyaError};
pub use protocol::{CommandType, TuyaMessage, Version};
pub use session::SessionNegotiator;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
