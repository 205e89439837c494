//! Bus transport layer
//!
//! [`BusTransport`] is the seam between the wired bus endpoint and the
//! physical medium. [`MockBus`] simulates devices in-process.

pub mod mock;
pub mod traits;

pub use mock::{MockBus, MockDevice};
pub use traits::{BusTransport, TransportError, TransportStats};
