//! Wire message shapes
//!
//! Frame field positions are packet positions: 0..9 is the bus header
//! (destination, control byte, sender) and the payload starts at 9. The
//! first payload byte is the message type.

use crate::bits::{self, BitAddress, BitSize};
use crate::error::Result;
use crate::paramset::ParameterSetKind;
use crate::parameter::Parameter;
use tracing::warn;

/// Packet position where the payload begins
pub const PAYLOAD_OFFSET: u32 = 9;

/// Read access to a received packet by packet position
pub trait PacketFields {
    fn payload(&self) -> &[u8];

    /// Bytes at a packet position (header or payload)
    fn get_position(&self, index: BitAddress, size: BitSize, mask: Option<u32>) -> Vec<u8>;

    fn message_type(&self) -> Option<u8> {
        self.payload().first().copied()
    }
}

/// A bare payload; header positions read as zero
impl PacketFields for [u8] {
    fn payload(&self) -> &[u8] {
        self
    }

    fn get_position(&self, index: BitAddress, size: BitSize, mask: Option<u32>) -> Vec<u8> {
        read_payload_position(self, index, size, mask)
    }
}

/// Read a payload field by packet position
pub fn read_payload_position(
    payload: &[u8],
    index: BitAddress,
    size: BitSize,
    mask: Option<u32>,
) -> Vec<u8> {
    let Some(byte) = index.byte.checked_sub(PAYLOAD_OFFSET) else {
        return vec![0];
    };
    bits::read_field(payload, BitAddress::new(byte, index.bit), size, mask)
        .unwrap_or_else(|e| {
            warn!("Cannot read packet position {}: {}", index, e);
            vec![0]
        })
}

/// Write a payload field by packet position
pub fn write_payload_position(
    payload: &mut Vec<u8>,
    index: BitAddress,
    size: BitSize,
    value: &[u8],
) -> Result<()> {
    let Some(byte) = index.byte.checked_sub(PAYLOAD_OFFSET) else {
        warn!("Packet position {} is inside the header, not written", index);
        return Ok(());
    };
    bits::write_field(payload, BitAddress::new(byte, index.bit), size, value)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrameDirection {
    #[default]
    None,
    ToDevice,
    FromDevice,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllowedReceivers {
    pub broadcast: bool,
    pub central: bool,
    pub other: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FixedChannel {
    #[default]
    None,
    Channel(u32),
    /// `*`: the frame applies to every channel
    Any,
}

/// A byte field position in packet coordinates with its width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPosition {
    pub index: u32,
    pub size: BitSize,
}

/// A parameter a frame carries, resolved after load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociatedValue {
    pub channel: u32,
    pub set: ParameterSetKind,
    pub parameter: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceFrame {
    pub id: String,
    pub direction: FrameDirection,
    pub allowed_receivers: AllowedReceivers,
    pub event: bool,
    pub message_type: Option<u8>,
    pub subtype: Option<i32>,
    pub subtype_index: Option<FieldPosition>,
    pub channel_field: Option<FieldPosition>,
    pub receiver_channel_field: Option<FieldPosition>,
    pub fixed_channel: FixedChannel,
    pub size: Option<u32>,
    pub double_send: bool,
    pub max_packets: Option<u32>,
    pub split_after: Option<u32>,
    pub response_type: Option<i32>,
    pub response_subtype: Option<i32>,
    pub parameters: Vec<Parameter>,
    /// Subtracted from the channel field of received frames
    pub channel_index_offset: i32,
    pub associated_values: Vec<AssociatedValue>,
}

impl DeviceFrame {
    /// Build a payload for this frame.
    ///
    /// `channel` is the wire channel number. `resolve` supplies the raw bytes
    /// for each non-constant field; fields it cannot resolve are left zero.
    pub fn build_payload<F>(&self, channel: Option<i32>, mut resolve: F) -> Result<Vec<u8>>
    where
        F: FnMut(&Parameter) -> Option<Vec<u8>>,
    {
        let mut payload = vec![self.message_type.unwrap_or(0)];

        if let (Some(subtype), Some(position)) = (self.subtype, self.subtype_index) {
            write_payload_position(
                &mut payload,
                BitAddress::new(position.index, 0),
                position.size,
                &bits::to_be_minimal(subtype),
            )?;
        }
        if let (Some(channel), Some(position)) = (channel, self.channel_field) {
            write_payload_position(
                &mut payload,
                BitAddress::new(position.index, 0),
                position.size,
                &[channel as u8],
            )?;
        }

        for field in &self.parameters {
            let value = match field.const_value {
                Some(constant) => Some(bits::to_be_minimal(constant)),
                None => resolve(field),
            };
            match value {
                Some(value) => write_payload_position(&mut payload, field.index, field.size, &value)?,
                None => warn!(frame = %self.id, field = %field.param, "Frame field not resolved"),
            }
        }
        Ok(payload)
    }

    /// Raw bytes of one field of a received packet
    pub fn read_field<P: PacketFields + ?Sized>(&self, packet: &P, field: &Parameter) -> Vec<u8> {
        packet.get_position(field.index, field.size, None)
    }

    /// Whether a received packet has this frame's type, subtype and constants
    pub fn matches<P: PacketFields + ?Sized>(&self, packet: &P) -> bool {
        let payload = packet.payload();
        if payload.is_empty() || packet.message_type() != self.message_type {
            return false;
        }
        if let (Some(subtype), Some(position)) = (self.subtype, self.subtype_index) {
            let offset = position.index.saturating_sub(PAYLOAD_OFFSET) as usize;
            if position.index >= PAYLOAD_OFFSET {
                if let Some(actual) = payload.get(offset) {
                    if i32::from(*actual) != subtype {
                        return false;
                    }
                }
            }
        }
        self.parameters.iter().all(|field| match field.const_value {
            Some(constant) if !field.size.is_zero() => {
                if field.index.byte >= PAYLOAD_OFFSET
                    && (field.index.byte - PAYLOAD_OFFSET) as usize >= payload.len()
                {
                    return true;
                }
                let data = self.read_field(packet, field);
                i64::from(bits::read_be(&data)) == i64::from(constant)
            },
            _ => true,
        })
    }

    /// Logical channel a received packet addresses, if the frame has a channel field
    pub fn channel_from<P: PacketFields + ?Sized>(&self, packet: &P) -> Option<i32> {
        if let FixedChannel::Channel(c) = self.fixed_channel {
            return Some(c as i32);
        }
        let position = self.channel_field?;
        let offset = position.index.checked_sub(PAYLOAD_OFFSET)? as usize;
        let mut channel = i32::from(*packet.payload().get(offset)?) - self.channel_index_offset;
        if position.size.bytes == 0 && channel > -1 {
            channel &= i32::from(bits::BITMASK[usize::from(position.size.bits)]);
        }
        Some(channel)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn level_frame() -> DeviceFrame {
        let mut level = Parameter::new("");
        level.index = BitAddress::new(11, 0);
        level.size = BitSize::new(1, 0);
        level.param = "LEVEL".into();
        DeviceFrame {
            id: "LEVEL_SET".into(),
            direction: FrameDirection::ToDevice,
            message_type: Some(b'x'),
            channel_field: Some(FieldPosition {
                index: 10,
                size: BitSize::ONE_BYTE,
            }),
            parameters: vec![level],
            ..Default::default()
        }
    }

    #[test]
    fn test_build_payload() {
        let frame = level_frame();
        let payload = frame
            .build_payload(Some(3), |field| {
                assert_eq!(field.param, "LEVEL");
                Some(vec![0xC8])
            })
            .unwrap();
        assert_eq!(payload, vec![b'x', 3, 0xC8]);
    }

    #[test]
    fn test_matches_and_channel() {
        let mut frame = level_frame();
        frame.channel_index_offset = 1;
        let payload: &[u8] = &[b'x', 4, 0x10];
        assert!(frame.matches(payload));
        assert_eq!(frame.channel_from(payload), Some(3));
        assert_eq!(
            frame.read_field(payload, &frame.parameters[0]),
            vec![0x10]
        );
        let other: &[u8] = &[b'i', 4];
        assert!(!frame.matches(other));
    }

    #[test]
    fn test_constant_field_must_match() {
        let mut frame = level_frame();
        let mut marker = Parameter::new("");
        marker.index = BitAddress::new(12, 0);
        marker.size = BitSize::ONE_BYTE;
        marker.const_value = Some(0x42);
        frame.parameters.push(marker);
        let good: &[u8] = &[b'x', 0, 0, 0x42];
        let bad: &[u8] = &[b'x', 0, 0, 0x41];
        assert!(frame.matches(good));
        assert!(!frame.matches(bad));
    }
}
