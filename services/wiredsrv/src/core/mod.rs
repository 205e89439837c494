//! Bus protocol, configuration memory and peers

pub mod bus;
pub mod packet;
pub mod peer;
pub mod store;
pub mod transport;

pub use bus::{BusBlockSource, WiredBus};
pub use packet::{BusPacket, PacketKind, BROADCAST};
pub use peer::{ItemOutcome, LinkPeer, PutParamsetReport, SlotKey, StoredSlot, WiredPeer};
pub use store::{BlockSource, ConfigBlockStore, ConfigurationBlock, BLOCK_SIZE};
