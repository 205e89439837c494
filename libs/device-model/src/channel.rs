//! Device channels

use crate::bits::BitSize;
use crate::paramset::{ParameterSet, ParameterSetKind};
use crate::parameter::UiFlags;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelDirection {
    #[default]
    None,
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkRoles {
    pub source_names: Vec<String>,
    pub target_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforceLink {
    pub id: String,
    pub value: String,
}

/// Position of the channel count in a pairing payload (`index[:size]`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysinfoCount {
    pub index: u32,
    pub size: BitSize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceChannel {
    /// First channel index this entry is bound to
    pub start_index: u32,
    pub count: u32,
    pub physical_index_offset: i32,
    pub ui_flags: UiFlags,
    pub direction: ChannelDirection,
    pub class: String,
    pub kind: String,
    pub function: String,
    pub hidden: bool,
    pub autoregister: bool,
    pub aes_default: bool,
    pub paired: bool,
    pub count_from_sysinfo: Option<SysinfoCount>,
    pub parameter_sets: BTreeMap<ParameterSetKind, ParameterSet>,
    pub link_roles: Option<LinkRoles>,
    pub enforce_link: Vec<EnforceLink>,
}

impl DeviceChannel {
    pub fn new(start_index: u32) -> Self {
        Self {
            start_index,
            count: 1,
            physical_index_offset: 0,
            ui_flags: UiFlags::default(),
            direction: ChannelDirection::None,
            class: String::new(),
            kind: String::new(),
            function: String::new(),
            hidden: false,
            autoregister: false,
            aes_default: false,
            paired: false,
            count_from_sysinfo: None,
            parameter_sets: BTreeMap::new(),
            link_roles: None,
            enforce_link: Vec::new(),
        }
    }

    pub fn parameter_set(&self, kind: ParameterSetKind) -> Option<&ParameterSet> {
        self.parameter_sets.get(&kind)
    }

    /// MASTER set, created empty when missing
    pub fn ensure_master(&mut self) -> &mut ParameterSet {
        self.parameter_sets
            .entry(ParameterSetKind::Master)
            .or_insert_with(|| ParameterSet::new(ParameterSetKind::Master))
    }
}
