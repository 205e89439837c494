//! Device description documents
//!
//! One [`DeviceDescription`] per device type. Channels live in an arena;
//! channel indices map to arena slots so a repeating channel (`count > 1`)
//! is stored once and shared by all of its indices.

use crate::bits::{self, BitAddress, BitSize};
use crate::channel::{DeviceChannel, SysinfoCount};
use crate::error::{ModelError, Result};
use crate::frame::{AssociatedValue, DeviceFrame, PacketFields, PAYLOAD_OFFSET};
use crate::paramset::{ParameterSet, ParameterSetKind};
use crate::parameter::{CondOp, Parameter, UiFlags};
use ahash::AHashMap;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// Upper bound for a channel count learned from the wire
pub const MAX_CHANNEL_COUNT: u32 = 255;

/// Which receive modes the device supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxModes {
    pub always: bool,
    pub burst: bool,
    pub config: bool,
    pub wakeup: bool,
    pub lazy_config: bool,
}

impl Default for RxModes {
    fn default() -> Self {
        Self {
            always: true,
            burst: false,
            config: false,
            wakeup: false,
            lazy_config: false,
        }
    }
}

/// Comparison against a constant, e.g. a firmware version bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Condition {
    pub op: CondOp,
    pub value: i32,
}

impl Condition {
    pub fn holds(&self, actual: i32) -> bool {
        match self.op {
            CondOp::Equal => actual == self.value,
            CondOp::Greater => actual > self.value,
            CondOp::Less => actual < self.value,
            CondOp::GreaterEqual => actual >= self.value,
            CondOp::LessEqual => actual <= self.value,
        }
    }
}

/// A supported hardware type and how to recognise it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceType {
    pub name: String,
    pub id: String,
    pub priority: i32,
    pub updatable: bool,
    pub type_id: Option<i32>,
    pub firmware: Option<Condition>,
    /// Matcher fields evaluated against the type code or a packet
    pub parameters: Vec<Parameter>,
}

const CODE_HIGH_BYTE: BitAddress = BitAddress::new(0, 0);
const CODE_LOW_BYTE: BitAddress = BitAddress::new(1, 0);
const FIRMWARE_INDEX: BitAddress = BitAddress::new(9, 0);
const FIRMWARE_INDEX_ALT: BitAddress = BitAddress::new(2, 0);
const WHOLE_CODE: BitAddress = BitAddress::new(10, 0);

impl DeviceType {
    /// Match a 16-bit type code and firmware version
    pub fn matches_code(&self, type_code: u16, firmware: i32) -> bool {
        let code = i64::from(type_code);
        if let Some(type_id) = self.type_id {
            return code == i64::from(type_id)
                && self.firmware.map_or(true, |c| c.holds(firmware));
        }
        if self.parameters.is_empty() {
            return false;
        }
        self.parameters.iter().all(|p| {
            let constant = i64::from(p.const_value.unwrap_or(-1));
            match p.index {
                WHOLE_CODE => constant == code,
                FIRMWARE_INDEX | FIRMWARE_INDEX_ALT => p.check_condition(i64::from(firmware)),
                CODE_HIGH_BYTE => (code >> 8) == constant,
                CODE_LOW_BYTE => (code & 0xFF) == constant,
                _ => false,
            }
        })
    }

    pub fn matches_id(&self, type_id: &str) -> bool {
        self.id == type_id
    }

    /// Match against the fields of a received packet
    pub fn matches_packet<P: PacketFields + ?Sized>(&self, packet: &P) -> bool {
        if self.parameters.is_empty() {
            return false;
        }
        self.parameters.iter().all(|p| {
            let data = packet.get_position(p.index, p.size, None);
            p.check_condition(i64::from(bits::read_be(&data)))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescription {
    /// Source file name, for logs
    pub file: String,
    pub version: u32,
    pub family: String,
    pub rx_modes: RxModes,
    pub class: String,
    pub eep_size: u32,
    pub ui_flags: UiFlags,
    pub cyclic_timeout: u32,
    pub supports_aes: bool,
    pub peering_sysinfo_expect_channel: bool,
    pub needs_time: bool,
    pub supported_types: Vec<DeviceType>,
    pub paramset_defs: BTreeMap<String, ParameterSet>,
    pub frames: Vec<DeviceFrame>,
    frames_by_id: AHashMap<String, usize>,
    channels: Vec<DeviceChannel>,
    channel_slots: BTreeMap<u32, usize>,
    count_from_sysinfo: Option<(SysinfoCount, usize)>,
    /// Channel count this instance has been specialised to
    pub bound_count: Option<u32>,
}

impl Default for DeviceDescription {
    fn default() -> Self {
        Self {
            file: String::new(),
            version: 0,
            family: String::new(),
            rx_modes: RxModes::default(),
            class: String::new(),
            eep_size: 1024,
            ui_flags: UiFlags::default(),
            cyclic_timeout: 0,
            supports_aes: false,
            peering_sysinfo_expect_channel: true,
            needs_time: false,
            supported_types: Vec::new(),
            paramset_defs: BTreeMap::new(),
            frames: Vec::new(),
            frames_by_id: AHashMap::new(),
            channels: Vec::new(),
            channel_slots: BTreeMap::new(),
            count_from_sysinfo: None,
            bound_count: None,
        }
    }
}

impl DeviceDescription {
    pub fn is_battery_powered(&self) -> bool {
        !self.rx_modes.always
    }

    // ======================================
    // Channels
    // ======================================

    /// Add a channel for indices `start_index..start_index+count`
    pub fn add_channel(&mut self, channel: DeviceChannel) -> Result<()> {
        let start = channel.start_index;
        let count = channel.count.max(1);
        if let Some(index) = (start..start + count).find(|i| self.channel_slots.contains_key(i)) {
            return Err(ModelError::schema(format!(
                "{}: channel index {} defined twice",
                self.file, index
            )));
        }
        let slot = self.channels.len();
        if let Some(sysinfo) = channel.count_from_sysinfo {
            self.count_from_sysinfo = Some((sysinfo, slot));
        }
        self.channels.push(channel);
        for index in start..start + count {
            self.channel_slots.insert(index, slot);
        }
        Ok(())
    }

    pub fn channel(&self, index: u32) -> Option<&DeviceChannel> {
        self.channel_slots.get(&index).map(|slot| &self.channels[*slot])
    }

    pub fn channel_mut(&mut self, index: u32) -> Option<&mut DeviceChannel> {
        let slot = *self.channel_slots.get(&index)?;
        self.channels.get_mut(slot)
    }

    pub fn channel_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.channel_slots.keys().copied()
    }

    /// `(index, channel)` pairs in index order
    pub fn channels(&self) -> impl Iterator<Item = (u32, &DeviceChannel)> + '_ {
        self.channel_slots
            .iter()
            .map(|(index, slot)| (*index, &self.channels[*slot]))
    }

    pub fn parameter_set(&self, channel: u32, kind: ParameterSetKind) -> Option<&ParameterSet> {
        self.channel(channel)?.parameter_set(kind)
    }

    pub fn parameter(&self, channel: u32, kind: ParameterSetKind, id: &str) -> Result<&Parameter> {
        let set = self
            .channel(channel)
            .ok_or(ModelError::UnknownChannel(channel))?
            .parameter_set(kind)
            .ok_or_else(|| ModelError::UnknownParameterSet(kind.to_string()))?;
        set.parameter(id)
            .ok_or_else(|| ModelError::UnknownParameter(id.to_string()))
    }

    // ======================================
    // Frames
    // ======================================

    pub fn add_frame(&mut self, frame: DeviceFrame) {
        if self.frames_by_id.contains_key(&frame.id) {
            warn!("{}: frame {} defined twice, keeping the first", self.file, frame.id);
            return;
        }
        self.frames_by_id.insert(frame.id.clone(), self.frames.len());
        self.frames.push(frame);
    }

    pub fn frame(&self, id: &str) -> Option<&DeviceFrame> {
        self.frames_by_id.get(id).map(|i| &self.frames[*i])
    }

    fn frame_mut(&mut self, id: &str) -> Option<&mut DeviceFrame> {
        let i = *self.frames_by_id.get(id)?;
        self.frames.get_mut(i)
    }

    /// Frames with a given message type
    pub fn frames_by_type(&self, message_type: u8) -> impl Iterator<Item = &DeviceFrame> + '_ {
        self.frames
            .iter()
            .filter(move |f| f.message_type == Some(message_type))
    }

    /// First frame matching a received packet
    pub fn find_frame<P: PacketFields + ?Sized>(&self, packet: &P) -> Option<&DeviceFrame> {
        let message_type = packet.message_type()?;
        self.frames_by_type(message_type).find(|f| f.matches(packet))
    }

    // ======================================
    // Channel count specialisation
    // ======================================

    pub fn has_count_from_sysinfo(&self) -> bool {
        self.count_from_sysinfo.is_some()
    }

    /// Channel count announced in a pairing payload
    pub fn count_from_payload(&self, payload: &[u8]) -> Option<u32> {
        let (sysinfo, _) = self.count_from_sysinfo?;
        let offset = sysinfo.index.checked_sub(PAYLOAD_OFFSET)? as usize;
        let bits = if sysinfo.size.bytes == 0 {
            usize::from(sysinfo.size.bits)
        } else {
            8
        };
        let byte = payload.get(offset)?;
        Some(u32::from(byte & bits::BITMASK[bits]))
    }

    /// Copy of this description with the repeating channel bound to `count`
    /// indices. The count is capped at [`MAX_CHANNEL_COUNT`].
    pub fn with_channel_count(&self, count: u32) -> DeviceDescription {
        let mut clone = self.clone();
        let Some((_, slot)) = clone.count_from_sysinfo else {
            return clone;
        };
        let count = if count > MAX_CHANNEL_COUNT {
            warn!(
                "{}: channel count {} exceeds {}, capping",
                clone.file, count, MAX_CHANNEL_COUNT
            );
            MAX_CHANNEL_COUNT
        } else {
            count
        };
        let start = clone.channels[slot].start_index;
        for index in start.saturating_add(1)..start.saturating_add(count) {
            clone.channel_slots.entry(index).or_insert(slot);
        }
        clone.channels[slot].count = count.max(1);
        clone.bound_count = Some(count);
        debug!("{}: bound {} channels from index {}", clone.file, count, start);
        clone
    }

    // ======================================
    // Post-load resolution
    // ======================================

    /// Merge subset references, guarantee MASTER sets and link VALUES
    /// parameters to the frames that carry them.
    pub fn finalize(&mut self) {
        self.resolve_subsets();

        if !self.channel_slots.contains_key(&0) {
            // index 0 is free, insertion cannot collide
            let _ = self.add_channel(DeviceChannel::new(0));
        }
        for channel in &mut self.channels {
            channel.ensure_master();
        }

        self.associate_frames();
    }

    fn resolve_subsets(&mut self) {
        let defs = &self.paramset_defs;
        for channel in &mut self.channels {
            for set in channel.parameter_sets.values_mut() {
                for reference in std::mem::take(&mut set.subset_refs) {
                    match defs.get(&reference) {
                        Some(def) => set.parameters.extend(def.parameters.iter().cloned()),
                        None => error!(
                            "{}: paramset {} references unknown subset {}",
                            self.file, set.id, reference
                        ),
                    }
                }
            }
        }
    }

    fn associate_frames(&mut self) {
        let mut links: Vec<(u32, usize, String, Link)> = Vec::new();
        for (index, slot) in &self.channel_slots {
            let channel = &self.channels[*slot];
            if channel.start_index != *index {
                continue;
            }
            let Some(values) = channel.parameter_set(ParameterSetKind::Values) else {
                continue;
            };
            for (pos, parameter) in values.parameters.iter().enumerate() {
                let physical = &parameter.physical;
                for id in physical.get_request.iter().chain(physical.set_request.iter()) {
                    links.push((*index, pos, id.clone(), Link::Request));
                }
                for event in &physical.event_frames {
                    links.push((
                        *index,
                        pos,
                        event.frame.clone(),
                        Link::Event(channel.physical_index_offset),
                    ));
                }
            }
        }

        for (index, pos, frame_id, link) in links {
            let Some(parameter) = self
                .channel(index)
                .and_then(|c| c.parameter_set(ParameterSetKind::Values))
                .and_then(|s| s.parameters.get(pos))
                .map(|p| p.id.clone())
            else {
                continue;
            };
            let file = self.file.clone();
            let Some(frame) = self.frame_mut(&frame_id) else {
                warn!("{}: parameter {} references unknown frame {}", file, parameter, frame_id);
                continue;
            };
            frame.associated_values.push(AssociatedValue {
                channel: index,
                set: ParameterSetKind::Values,
                parameter: parameter.clone(),
            });
            let Link::Event(offset) = link else {
                continue;
            };
            frame.channel_index_offset = offset;
            let inherited: Option<(bool, BitSize)> = frame
                .parameters
                .iter()
                .filter(|f| f.param == parameter || f.additional_param == parameter)
                .fold(None, |acc, f| {
                    let signed = acc.map_or(false, |(s, _)| s) || f.signed;
                    Some((signed, f.size))
                });
            if let Some((signed, size)) = inherited {
                if let Some(target) = self
                    .channel_mut(index)
                    .and_then(|c| c.parameter_sets.get_mut(&ParameterSetKind::Values))
                    .and_then(|s| s.parameters.get_mut(pos))
                {
                    target.signed |= signed;
                    if !size.is_zero() {
                        target.physical.size = size;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Link {
    Request,
    Event(i32),
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn matcher(index: BitAddress, constant: i32, op: CondOp) -> Parameter {
        let mut p = Parameter::new("");
        p.index = index;
        p.size = BitSize::ONE_BYTE;
        p.const_value = Some(constant);
        p.cond_op = op;
        p
    }

    #[test]
    fn test_type_matching_by_code() {
        let t = DeviceType {
            name: "Switch actuator".into(),
            id: "HMW-IO-4-FM".into(),
            parameters: vec![
                matcher(BitAddress::new(0, 0), 0x10, CondOp::Equal),
                matcher(BitAddress::new(1, 0), 0x14, CondOp::Equal),
                matcher(BitAddress::new(9, 0), 0x0303, CondOp::GreaterEqual),
            ],
            ..Default::default()
        };
        assert!(t.matches_code(0x1014, 0x0303));
        assert!(!t.matches_code(0x1014, 0x0302));
        assert!(!t.matches_code(0x1015, 0x0303));
        assert!(t.matches_id("HMW-IO-4-FM"));

        let empty = DeviceType::default();
        assert!(!empty.matches_code(0x1014, 1));
    }

    #[test]
    fn test_type_matching_by_type_id() {
        let t = DeviceType {
            type_id: Some(0x0011),
            firmware: Some(Condition {
                op: CondOp::Less,
                value: 0x0200,
            }),
            ..Default::default()
        };
        assert!(t.matches_code(0x0011, 0x0100));
        assert!(!t.matches_code(0x0011, 0x0200));
    }

    #[test]
    fn test_duplicate_channel_is_rejected() {
        let mut d = DeviceDescription::default();
        let mut c = DeviceChannel::new(1);
        c.count = 3;
        d.add_channel(c).unwrap();
        assert!(d.add_channel(DeviceChannel::new(2)).is_err());
        assert!(d.channel(3).is_some());
        assert!(d.channel(4).is_none());
    }

    #[test]
    fn test_finalize_creates_master_sets() {
        let mut d = DeviceDescription::default();
        d.add_channel(DeviceChannel::new(1)).unwrap();
        d.finalize();
        assert!(d.parameter_set(0, ParameterSetKind::Master).is_some());
        assert!(d.parameter_set(1, ParameterSetKind::Master).is_some());
    }

    #[test]
    fn test_channel_count_specialisation() {
        let mut d = DeviceDescription::default();
        let mut c = DeviceChannel::new(1);
        c.count_from_sysinfo = Some(SysinfoCount {
            index: 11,
            size: BitSize::new(0, 4),
        });
        d.add_channel(c).unwrap();
        d.finalize();

        assert_eq!(d.count_from_payload(&[0x00, 0x00, 0xF3]), Some(3));
        let special = d.with_channel_count(3);
        assert_eq!(special.bound_count, Some(3));
        assert_eq!(special.channel_indices().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(d.channel_indices().count(), 2);
    }

    #[test]
    fn test_channel_count_hint_is_capped() {
        let mut d = DeviceDescription::default();
        let mut c = DeviceChannel::new(1);
        c.count_from_sysinfo = Some(SysinfoCount {
            index: 11,
            size: BitSize::new(1, 0),
        });
        d.add_channel(c).unwrap();
        d.finalize();

        let special = d.with_channel_count(u32::MAX);
        assert_eq!(special.bound_count, Some(MAX_CHANNEL_COUNT));
        assert_eq!(special.channel_indices().count(), 1 + MAX_CHANNEL_COUNT as usize);
        assert!(special.channel(MAX_CHANNEL_COUNT).is_some());
        assert!(special.channel(MAX_CHANNEL_COUNT + 1).is_none());
    }
}
