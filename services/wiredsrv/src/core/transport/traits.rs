//! Bus transport traits
//!
//! A transport moves already-framed [`BusPacket`]s on and off the physical
//! medium. Start markers, escaping and checksums belong to the transport;
//! everything above it only sees header fields and payload bytes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

use crate::core::packet::BusPacket;

/// Transport layer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Receive operation failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The transport was shut down
    #[error("Transport closed")]
    Closed,

    /// Frame could not be decoded
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Transport statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
    /// Last frame in either direction
    pub last_activity: Option<SystemTime>,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.frames_sent += 1;
        self.bytes_sent += bytes as u64;
        self.last_activity = Some(SystemTime::now());
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.frames_received += 1;
        self.bytes_received += bytes as u64;
        self.last_activity = Some(SystemTime::now());
    }

    pub fn record_send_failure(&mut self) {
        self.send_failures += 1;
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Half-duplex bus access shared by the endpoint's send path and receive loop
#[async_trait]
pub trait BusTransport: Send + Sync + fmt::Debug {
    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Put one frame on the bus
    async fn send(&self, packet: &BusPacket) -> Result<(), TransportError>;

    /// Wait for the next inbound frame.
    ///
    /// Returns [`TransportError::Closed`] once no more frames can arrive.
    async fn receive(&self) -> Result<BusPacket, TransportError>;

    async fn is_connected(&self) -> bool;

    async fn stats(&self) -> TransportStats;
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_stats_recording() {
        let mut stats = TransportStats::new();
        stats.record_sent(13);
        stats.record_sent(9);
        stats.record_received(25);
        stats.record_send_failure();

        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.bytes_sent, 22);
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.bytes_received, 25);
        assert_eq!(stats.send_failures, 1);
        assert!(stats.last_activity.is_some());

        stats.reset();
        assert_eq!(stats.frames_sent, 0);
        assert!(stats.last_activity.is_none());
    }
}
