//! Mock bus for testing
//!
//! Simulates wired devices behind an in-process bus. Each device owns an
//! EEPROM image, answers `0x52` block reads with its contents, applies `0x57`
//! block writes and acknowledges everything else unless a canned response is
//! registered for the message type. Every sent frame is recorded.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::traits::{BusTransport, TransportError, TransportStats};
use crate::core::packet::{BusPacket, PacketKind};

/// Simulated device
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub address: u32,
    pub eeprom: Vec<u8>,
    /// Never answers
    pub silent: bool,
    /// Answer block reads with this many bytes instead of the requested length
    pub read_length: Option<usize>,
    responses: HashMap<u8, Vec<u8>>,
    counter: u8,
}

impl MockDevice {
    /// Erased EEPROM reads as `0xFF`
    pub fn new(address: u32, eeprom_size: usize) -> Self {
        Self {
            address,
            eeprom: vec![0xFF; eeprom_size],
            silent: false,
            read_length: None,
            responses: HashMap::new(),
            counter: 0,
        }
    }

    fn answer(&mut self, request: &BusPacket) -> BusPacket {
        let payload = &request.payload;
        let start = |p: &[u8]| usize::from(u16::from_be_bytes([p[1], p[2]]));

        let reply = match payload.first() {
            Some(0x52) if payload.len() >= 4 => {
                let from = start(payload);
                let len = self.read_length.unwrap_or(usize::from(payload[3]));
                Some(
                    (0..len)
                        .map(|i| self.eeprom.get(from + i).copied().unwrap_or(0xFF))
                        .collect(),
                )
            },
            Some(0x57) if payload.len() >= 4 => {
                let from = start(payload);
                let len = usize::from(payload[3]);
                for (i, byte) in payload[4..].iter().take(len).enumerate() {
                    if let Some(cell) = self.eeprom.get_mut(from + i) {
                        *cell = *byte;
                    }
                }
                None
            },
            Some(message_type) => self.responses.get(message_type).cloned(),
            None => None,
        };

        self.counter = (self.counter + 1) & 0x03;
        match reply {
            Some(payload) => BusPacket {
                sender_counter: self.counter,
                receiver_counter: request.sender_counter,
                ack_required: false,
                ..BusPacket::message(self.address, request.sender, payload)
            },
            None => BusPacket::ack(self.address, request.sender, request.sender_counter),
        }
    }
}

#[derive(Debug, Default)]
struct MockBusState {
    devices: HashMap<u32, MockDevice>,
    sent: Vec<BusPacket>,
    stats: TransportStats,
}

/// In-process bus with simulated devices
#[derive(Debug)]
pub struct MockBus {
    name: String,
    state: Arc<Mutex<MockBusState>>,
    inbound_tx: mpsc::UnboundedSender<BusPacket>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BusPacket>>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            name: "Mock Bus".to_string(),
            state: Arc::new(Mutex::new(MockBusState::default())),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn add_device(&self, address: u32, eeprom_size: usize) {
        self.state
            .lock()
            .devices
            .insert(address, MockDevice::new(address, eeprom_size));
    }

    pub fn set_silent(&self, address: u32, silent: bool) {
        if let Some(device) = self.state.lock().devices.get_mut(&address) {
            device.silent = silent;
        }
    }

    pub fn set_read_length(&self, address: u32, length: Option<usize>) {
        if let Some(device) = self.state.lock().devices.get_mut(&address) {
            device.read_length = length;
        }
    }

    /// Answer requests of `message_type` with `payload` instead of an ACK
    pub fn set_response(&self, address: u32, message_type: u8, payload: Vec<u8>) {
        if let Some(device) = self.state.lock().devices.get_mut(&address) {
            device.responses.insert(message_type, payload);
        }
    }

    pub fn write_eeprom(&self, address: u32, offset: usize, bytes: &[u8]) {
        if let Some(device) = self.state.lock().devices.get_mut(&address) {
            let end = (offset + bytes.len()).min(device.eeprom.len());
            if offset < end {
                device.eeprom[offset..end].copy_from_slice(&bytes[..end - offset]);
            }
        }
    }

    pub fn eeprom(&self, address: u32) -> Option<Vec<u8>> {
        self.state
            .lock()
            .devices
            .get(&address)
            .map(|d| d.eeprom.clone())
    }

    /// Deliver an unsolicited frame to the receiver (for testing)
    pub fn inject(&self, packet: BusPacket) {
        self.state
            .lock()
            .stats
            .record_received(packet.to_bytes().len());
        let _ = self.inbound_tx.send(packet);
    }

    /// All frames sent so far (for testing)
    pub fn sent_frames(&self) -> Vec<BusPacket> {
        self.state.lock().sent.clone()
    }

    /// Information messages sent to one destination (for testing)
    pub fn messages_to(&self, address: u32) -> Vec<BusPacket> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|p| p.destination == address && p.kind == PacketKind::Message)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }
}

#[async_trait]
impl BusTransport for MockBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, packet: &BusPacket) -> Result<(), TransportError> {
        let reply = {
            let mut state = self.state.lock();
            state.stats.record_sent(packet.to_bytes().len());
            state.sent.push(packet.clone());

            if packet.kind != PacketKind::Message {
                return Ok(());
            }
            match state.devices.get_mut(&packet.destination) {
                Some(device) if !device.silent => Some(device.answer(packet)),
                _ => None,
            }
        };

        if let Some(reply) = reply {
            debug!(
                "Mock device 0x{:08X} answers {} payload bytes",
                reply.sender,
                reply.payload.len()
            );
            self.inject(reply);
        }
        Ok(())
    }

    async fn receive(&self) -> Result<BusPacket, TransportError> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn stats(&self) -> TransportStats {
        self.state.lock().stats.clone()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::time::Duration;

    const CENTRAL: u32 = 0x0000_0001;
    const DEVICE: u32 = 0x0000_0042;

    #[tokio::test]
    async fn test_block_read_answers_eeprom_bytes() {
        let bus = MockBus::new();
        bus.add_device(DEVICE, 64);
        bus.write_eeprom(DEVICE, 0x10, &[1, 2, 3]);

        let mut request = BusPacket::message(CENTRAL, DEVICE, vec![0x52, 0x00, 0x10, 0x10]);
        request.sender_counter = 2;
        bus.send(&request).await.unwrap();

        let reply = bus.receive().await.unwrap();
        assert_eq!(reply.sender, DEVICE);
        assert_eq!(reply.destination, CENTRAL);
        assert_eq!(reply.receiver_counter, 2);
        assert_eq!(reply.payload.len(), 16);
        assert_eq!(&reply.payload[..4], &[1, 2, 3, 0xFF]);
    }

    #[tokio::test]
    async fn test_block_write_updates_eeprom_and_acks() {
        let bus = MockBus::new();
        bus.add_device(DEVICE, 64);

        let request = BusPacket::message(CENTRAL, DEVICE, vec![0x57, 0x00, 0x02, 0x02, 0xAA, 0xBB]);
        bus.send(&request).await.unwrap();

        let reply = bus.receive().await.unwrap();
        assert!(reply.is_ack());
        assert_eq!(&bus.eeprom(DEVICE).unwrap()[..5], &[0xFF, 0xFF, 0xAA, 0xBB, 0xFF]);
    }

    #[tokio::test]
    async fn test_silent_device_never_answers() {
        let bus = MockBus::new();
        bus.add_device(DEVICE, 64);
        bus.set_silent(DEVICE, true);

        bus.send(&BusPacket::message(CENTRAL, DEVICE, vec![0x52, 0, 0, 16]))
            .await
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(20), bus.receive())
            .await
            .is_err());
        assert_eq!(bus.messages_to(DEVICE).len(), 1);
        assert_eq!(bus.stats().await.frames_sent, 1);
    }

    #[tokio::test]
    async fn test_canned_response() {
        let bus = MockBus::new();
        bus.add_device(DEVICE, 64);
        bus.set_response(DEVICE, b'S', vec![b'i', 0x00, 0xC8]);

        bus.send(&BusPacket::message(CENTRAL, DEVICE, vec![b'S', 0x00]))
            .await
            .unwrap();
        let reply = bus.receive().await.unwrap();
        assert_eq!(reply.payload, vec![b'i', 0x00, 0xC8]);
        assert!(!reply.ack_required);
    }
}
