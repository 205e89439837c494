//! Wired bus packet
//!
//! Logical layout used for field positions, independent of what the wire
//! actually carries:
//!
//! | bytes | field |
//! |---|---|
//! | 0..4 | destination address (big-endian) |
//! | 4 | control byte |
//! | 5..9 | sender address (big-endian) |
//! | 9.. | payload, first byte is the message type |
//!
//! Control byte: bit 0 clear marks an information message with the sender
//! counter in bits 1-2, the sender-address-present flag in bit 3 and the
//! receiver counter in bits 5-6. `01` in bits 0-1 is an acknowledgement,
//! `11` a discovery probe. Bit 7 is the sync bit.

use device_model::bits::{self, BitAddress, BitSize};
use device_model::frame::{self, PacketFields, PAYLOAD_OFFSET};
use std::time::Instant;
use tracing::warn;

use crate::core::transport::TransportError;

/// Broadcast destination
pub const BROADCAST: u32 = 0xFFFF_FFFF;

const SENDER_PRESENT: u8 = 0x08;
const SYNC: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Information message carrying both counters
    Message,
    Ack,
    Discovery,
    /// Message without a sender address (bus control frames)
    System,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusPacket {
    pub kind: PacketKind,
    pub destination: u32,
    pub sender: u32,
    pub sync: bool,
    /// 2-bit counter of the originator
    pub sender_counter: u8,
    /// Echo of the counter being answered
    pub receiver_counter: u8,
    /// Cleared for frames the receiver must not acknowledge
    pub ack_required: bool,
    pub payload: Vec<u8>,
    /// Set by the receive loop
    pub time_received: Option<Instant>,
}

impl BusPacket {
    pub fn message(sender: u32, destination: u32, payload: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Message,
            destination,
            sender,
            sync: false,
            sender_counter: 0,
            receiver_counter: 0,
            ack_required: true,
            payload,
            time_received: None,
        }
    }

    pub fn ack(sender: u32, destination: u32, receiver_counter: u8) -> Self {
        Self {
            kind: PacketKind::Ack,
            receiver_counter: receiver_counter & 0x03,
            ack_required: false,
            ..Self::message(sender, destination, Vec::new())
        }
    }

    /// Broadcast control frame with the sync bit set
    pub fn system(payload: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::System,
            sync: true,
            ack_required: false,
            ..Self::message(0, BROADCAST, payload)
        }
    }

    pub fn discovery(sender: u32, destination: u32) -> Self {
        Self {
            kind: PacketKind::Discovery,
            ack_required: false,
            ..Self::message(sender, destination, Vec::new())
        }
    }

    pub fn is_ack(&self) -> bool {
        self.kind == PacketKind::Ack
    }

    pub fn control_byte(&self) -> u8 {
        let sync = if self.sync { SYNC } else { 0 };
        match self.kind {
            PacketKind::Message => {
                ((self.sender_counter & 0x03) << 1)
                    | SENDER_PRESENT
                    | ((self.receiver_counter & 0x03) << 5)
                    | sync
            },
            PacketKind::System => {
                ((self.sender_counter & 0x03) << 1) | ((self.receiver_counter & 0x03) << 5) | sync
            },
            PacketKind::Ack => 0x01 | SENDER_PRESENT | ((self.receiver_counter & 0x03) << 5) | sync,
            PacketKind::Discovery => 0x03,
        }
    }

    /// Header in logical layout; absent sender reads as zero
    pub fn header(&self) -> [u8; 9] {
        let mut header = [0u8; 9];
        header[..4].copy_from_slice(&self.destination.to_be_bytes());
        header[4] = self.control_byte();
        header[5..].copy_from_slice(&self.sender.to_be_bytes());
        header
    }

    /// Wire form: the sender address is only present when the control byte says so
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = self.header();
        let mut bytes = Vec::with_capacity(9 + self.payload.len());
        let sender_present = self.kind != PacketKind::Discovery && header[4] & SENDER_PRESENT != 0;
        if sender_present {
            bytes.extend_from_slice(&header);
        } else {
            bytes.extend_from_slice(&header[..5]);
        }
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < 5 {
            return Err(TransportError::InvalidFrame(format!(
                "{} bytes is shorter than a header",
                data.len()
            )));
        }
        let destination = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let control = data[4];
        let sync = control & SYNC != 0;

        let kind = match control & 0x03 {
            0 | 2 if control & SENDER_PRESENT != 0 => PacketKind::Message,
            0 | 2 => PacketKind::System,
            1 => PacketKind::Ack,
            _ => PacketKind::Discovery,
        };
        let has_sender = kind != PacketKind::Discovery && control & SENDER_PRESENT != 0;
        let (sender, payload) = if has_sender {
            if data.len() < 9 {
                return Err(TransportError::InvalidFrame(
                    "sender address truncated".to_string(),
                ));
            }
            (
                u32::from_be_bytes([data[5], data[6], data[7], data[8]]),
                data[9..].to_vec(),
            )
        } else {
            (0, data[5..].to_vec())
        };

        let counters = matches!(kind, PacketKind::Message | PacketKind::System);
        Ok(Self {
            kind,
            destination,
            sender,
            sync,
            sender_counter: if counters { (control >> 1) & 0x03 } else { 0 },
            receiver_counter: if kind == PacketKind::Discovery {
                0
            } else {
                (control >> 5) & 0x03
            },
            ack_required: kind == PacketKind::Message,
            payload,
            time_received: None,
        })
    }

    /// Write a payload field by packet position
    pub fn set_position(
        &mut self,
        index: BitAddress,
        size: BitSize,
        value: &[u8],
    ) -> device_model::Result<()> {
        frame::write_payload_position(&mut self.payload, index, size, value)
    }
}

impl PacketFields for BusPacket {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn get_position(&self, index: BitAddress, size: BitSize, mask: Option<u32>) -> Vec<u8> {
        if index.byte >= PAYLOAD_OFFSET {
            return frame::read_payload_position(&self.payload, index, size, mask);
        }
        let mut bytes = self.header().to_vec();
        bytes.extend_from_slice(&self.payload);
        bits::read_field(&bytes, index, size, mask).unwrap_or_else(|e| {
            warn!("Cannot read header position {}: {}", index, e);
            vec![0]
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_message_control_byte() {
        let mut packet = BusPacket::message(0x0000_0001, 0x0000_1234, vec![0x52, 0x00, 0x10, 0x10]);
        packet.sender_counter = 2;
        packet.receiver_counter = 1;
        packet.sync = true;
        assert_eq!(packet.control_byte(), 0b1010_1100);

        let parsed = BusPacket::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(parsed.kind, PacketKind::Message);
        assert_eq!(parsed.sender, 1);
        assert_eq!(parsed.destination, 0x1234);
        assert_eq!(parsed.sender_counter, 2);
        assert_eq!(parsed.receiver_counter, 1);
        assert!(parsed.sync);
        assert!(parsed.ack_required);
        assert_eq!(parsed.payload, vec![0x52, 0x00, 0x10, 0x10]);
    }

    #[test]
    fn test_ack_and_system_frames() {
        let ack = BusPacket::ack(1, 0x42, 3);
        assert_eq!(ack.control_byte() & 0x03, 0x01);
        let parsed = BusPacket::from_bytes(&ack.to_bytes()).unwrap();
        assert!(parsed.is_ack());
        assert_eq!(parsed.receiver_counter, 3);
        assert!(!parsed.ack_required);

        let lock = BusPacket::system(vec![0x7A]);
        let bytes = lock.to_bytes();
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[..4], &[0xFF; 4]);
        let parsed = BusPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.kind, PacketKind::System);
        assert!(parsed.sync);
        assert_eq!(parsed.payload, vec![0x7A]);
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(matches!(
            BusPacket::from_bytes(&[0, 0, 0]),
            Err(TransportError::InvalidFrame(_))
        ));
        assert!(BusPacket::from_bytes(&[0, 0, 0, 1, 0x08, 0]).is_err());
    }

    #[test]
    fn test_positions_cover_header_and_payload() {
        let packet = BusPacket::message(0x0000_ABCD, 0x0000_0001, vec![b'i', 0x02, 0xC8]);
        let sender = packet.get_position(BitAddress::new(5, 0), BitSize::new(4, 0), None);
        assert_eq!(bits::read_be(&sender), 0xABCD);
        assert_eq!(
            packet.get_position(BitAddress::new(10, 0), BitSize::ONE_BYTE, None),
            vec![0x02]
        );
        assert_eq!(packet.message_type(), Some(b'i'));

        let mut packet = BusPacket::message(1, 2, vec![b'x']);
        packet
            .set_position(BitAddress::new(11, 0), BitSize::ONE_BYTE, &[0xC8])
            .unwrap();
        assert_eq!(packet.payload, vec![b'x', 0x00, 0xC8]);
    }
}
