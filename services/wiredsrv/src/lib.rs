//! Wired bus service
//!
//! Configures devices on a half-duplex wired bus through their device
//! descriptions: parameter sets are read from and written to the devices'
//! block-addressed configuration memory, command parameters are sent as
//! request frames, and unsolicited messages update the central's view of
//! the device.
//!
//! - **`core`**: bus packets and transport, the bus endpoint, the
//!   configuration block store and peers
//! - **`storage`**: SQLite persistence of parameter slots and cached blocks
//! - **`config`** / **`bootstrap`**: service configuration and start-up

pub mod bootstrap;
pub mod config;
pub mod core;
pub mod error;
pub mod storage;

pub use config::{BusTimings, PeerConfig, WiredsrvConfig};
pub use core::{
    BusPacket, ConfigBlockStore, ItemOutcome, LinkPeer, PacketKind, PutParamsetReport, WiredBus,
    WiredPeer, BROADCAST,
};
pub use error::{Result, WiredError};
pub use storage::PeerRepository;
