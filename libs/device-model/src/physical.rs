//! Physical placement of a parameter

use crate::bits::{BitAddress, BitSize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PhysicalKind {
    #[default]
    None,
    Integer,
    Boolean,
    String,
}

/// Where the value is stored or how it reaches the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Interface {
    #[default]
    None,
    Command,
    CentralCommand,
    Internal,
    Config,
    ConfigString,
    /// Kept only on the hub side
    Store,
    /// Configuration memory of the device
    Eeprom,
}

impl Interface {
    pub fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "command" => Interface::Command,
            "central_command" => Interface::CentralCommand,
            "internal" => Interface::Internal,
            "config" => Interface::Config,
            "config_string" => Interface::ConfigString,
            "store" => Interface::Store,
            "eeprom" => Interface::Eeprom,
            _ => return None,
        })
    }

    /// Backed by the configuration block store
    pub fn is_config_memory(&self) -> bool {
        matches!(self, Interface::Eeprom | Interface::Config | Interface::ConfigString)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Endian {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressOperation {
    /// Absolute address, stepped per channel offset
    #[default]
    None,
    /// Relative to the parameter set's address_start
    Addition,
    Subtraction,
}

/// Configuration memory address of a parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhysicalAddress {
    pub index: BitAddress,
    pub operation: AddressOperation,
    pub step: BitSize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DominoEvent {
    pub value: i32,
    pub delay_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    pub frame: String,
    pub domino_event: Option<DominoEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalParameter {
    pub kind: PhysicalKind,
    pub interface: Interface,
    pub endian: Endian,
    pub value_id: String,
    pub id: String,
    pub list: i32,
    pub index: BitAddress,
    pub size: BitSize,
    /// Size was given explicitly (or inherited from a frame field)
    pub size_defined: bool,
    pub counter: String,
    pub volatile: bool,
    pub no_init: bool,
    pub mask: Option<u32>,
    pub set_request: Option<String>,
    pub get_request: Option<String>,
    pub event_frames: Vec<EventFrame>,
    pub address: PhysicalAddress,
    pub reset_after_send: Vec<String>,
}

impl Default for PhysicalParameter {
    fn default() -> Self {
        Self {
            kind: PhysicalKind::None,
            interface: Interface::None,
            endian: Endian::Big,
            value_id: String::new(),
            id: String::new(),
            list: -1,
            index: BitAddress::default(),
            size: BitSize::ONE_BYTE,
            size_defined: false,
            counter: String::new(),
            volatile: false,
            no_init: false,
            mask: None,
            set_request: None,
            get_request: None,
            event_frames: Vec::new(),
            address: PhysicalAddress::default(),
            reset_after_send: Vec::new(),
        }
    }
}
