//! Device description XML reader
//!
//! Unknown attributes and elements are logged and skipped. A broken
//! parameter, parameter set, channel or frame is dropped with an error log
//! while the rest of the document still loads.

use crate::bits::{BitAddress, BitSize};
use crate::channel::{ChannelDirection, DeviceChannel, EnforceLink, LinkRoles, SysinfoCount};
use crate::conversion::Conversion;
use crate::device::{Condition, DeviceDescription, DeviceType, RxModes};
use crate::error::{ModelError, Result};
use crate::frame::{AllowedReceivers, DeviceFrame, FieldPosition, FixedChannel, FrameDirection};
use crate::logical::{
    ActionLogical, BooleanLogical, EnumLogical, EnumOption, FloatLogical, IntegerLogical,
    LogicalParameter, SpecialValue, StringLogical,
};
use crate::paramset::{ParameterSet, ParameterSetKind};
use crate::parameter::{CondOp, Operations, Parameter, UiFlags};
use crate::physical::{
    AddressOperation, DominoEvent, Endian, EventFrame, Interface, PhysicalAddress, PhysicalKind,
    PhysicalParameter,
};
use crate::value::ParamValue;
use roxmltree::Node;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, error, warn};

/// Load one description file
pub fn from_file(path: &Path) -> Result<DeviceDescription> {
    let file = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let text = std::fs::read_to_string(path)?;
    from_xml_str(&text, &file)
}

/// Parse a description document. `file` is only used in log messages.
pub fn from_xml_str(text: &str, file: &str) -> Result<DeviceDescription> {
    let document = roxmltree::Document::parse(text).map_err(|e| ModelError::Xml {
        file: file.to_string(),
        error: e.to_string(),
    })?;
    let root = document.root_element();
    if root.tag_name().name() != "device" {
        return Err(ModelError::Xml {
            file: file.to_string(),
            error: format!("root element is <{}>, expected <device>", root.tag_name().name()),
        });
    }
    let reader = Reader { file };
    let mut device = reader.device(root)?;
    device.finalize();
    debug!(
        "Loaded {} with {} channel indices and {} frames",
        file,
        device.channel_indices().count(),
        device.frames.len()
    );
    Ok(device)
}

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn number(text: &str) -> Result<i32> {
    common::hex::parse_number(text)
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| ModelError::InvalidNumber(text.to_string()))
}

fn unsigned(text: &str) -> Result<u32> {
    common::hex::parse_number(text)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ModelError::InvalidNumber(text.to_string()))
}

fn decimal(text: &str) -> Result<f64> {
    text.trim()
        .parse()
        .map_err(|_| ModelError::InvalidNumber(text.to_string()))
}

fn flag(text: &str) -> bool {
    text == "true"
}

/// `"10"` or `"10:0.4"`
fn field_position(text: &str) -> Result<FieldPosition> {
    let (index, size) = match text.split_once(':') {
        Some((index, size)) => (index, BitSize::parse(size)?),
        None => (text, BitSize::ONE_BYTE),
    };
    let index = decimal(index)?;
    if index < 0.0 {
        return Err(ModelError::InvalidNumber(text.to_string()));
    }
    Ok(FieldPosition {
        index: index.floor() as u32,
        size,
    })
}

fn ui_flags(text: &str) -> UiFlags {
    let mut flags = UiFlags::none();
    for item in text.split(',').map(str::trim) {
        match item {
            "visible" => flags.visible = true,
            "internal" => flags.internal = true,
            "transform" => flags.transform = true,
            "service" => flags.service = true,
            "sticky" => flags.sticky = true,
            "invisible" => flags.invisible = true,
            other => warn!("Unknown ui flag: {}", other),
        }
    }
    flags
}

const CONVERSION_ATTRIBUTES: &[&str] = &[
    "type",
    "factor",
    "factors",
    "offset",
    "value_size",
    "threshold",
    "false",
    "true",
    "invert",
    "div",
    "mul",
    "value",
    "on",
    "off",
    "mantissa_start",
    "mantissa_size",
    "exponent_start",
    "exponent_size",
    "sim_counter",
    "counter_size",
];

struct Reader<'f> {
    file: &'f str,
}

impl Reader<'_> {
    fn unknown_attribute(&self, element: &str, name: &str) {
        warn!("{}: unknown attribute for \"{}\": {}", self.file, element, name);
    }

    fn unknown_node(&self, element: &str, name: &str) {
        warn!("{}: unknown node in \"{}\": {}", self.file, element, name);
    }

    // ======================================
    // Device root
    // ======================================

    fn device(&self, node: Node) -> Result<DeviceDescription> {
        let mut device = DeviceDescription::default();
        device.file = self.file.to_string();

        for attr in node.attributes() {
            let value = attr.value();
            match attr.name() {
                "version" => device.version = unsigned(value)?,
                "family" => device.family = value.to_string(),
                "rx_modes" => device.rx_modes = self.rx_modes(value),
                "class" => device.class = value.to_string(),
                "eep_size" => device.eep_size = unsigned(value)?,
                "ui_flags" => device.ui_flags = ui_flags(value),
                "cyclic_timeout" => device.cyclic_timeout = unsigned(value)?,
                "supports_aes" => device.supports_aes = flag(value),
                "peering_sysinfo_expect_channel" => {
                    device.peering_sysinfo_expect_channel = flag(value)
                },
                "needs_time" => device.needs_time = flag(value),
                other => self.unknown_attribute("device", other),
            }
        }

        let mut root_master: Option<ParameterSet> = None;
        for child in elements(node) {
            match child.tag_name().name() {
                "supported_types" => {
                    for t in elements(child) {
                        if t.tag_name().name() == "type" {
                            device.supported_types.push(self.device_type(t));
                        } else {
                            self.unknown_node("supported_types", t.tag_name().name());
                        }
                    }
                },
                "paramset" => match self.paramset(child) {
                    Ok(set) if set.kind == ParameterSetKind::Master => root_master = Some(set),
                    Ok(set) => error!(
                        "{}: root parameter set {} has to be MASTER, not {}",
                        self.file, set.id, set.kind
                    ),
                    Err(e) => error!("{}: skipping root parameter set: {}", self.file, e),
                },
                "paramset_defs" => {
                    for def in elements(child) {
                        match self.paramset(def) {
                            Ok(set) => {
                                device.paramset_defs.insert(set.id.clone(), set);
                            },
                            Err(e) => error!("{}: skipping parameter set definition: {}", self.file, e),
                        }
                    }
                },
                "channels" => {
                    for c in elements(child) {
                        if c.tag_name().name() != "channel" {
                            self.unknown_node("channels", c.tag_name().name());
                            continue;
                        }
                        let channel = match self.channel(c) {
                            Ok(channel) => channel,
                            Err(e) => {
                                error!("{}: skipping channel: {}", self.file, e);
                                continue;
                            },
                        };
                        if let Err(e) = device.add_channel(channel) {
                            error!("{}", e);
                        }
                    }
                },
                "frames" => {
                    for f in elements(child) {
                        match self.frame(f) {
                            Ok(frame) => device.add_frame(frame),
                            Err(e) => error!("{}: skipping frame: {}", self.file, e),
                        }
                    }
                },
                "team" | "description" => {},
                other => self.unknown_node("device", other),
            }
        }

        if let Some(master) = root_master.filter(|s| !s.is_empty()) {
            if device.channel(0).is_none() {
                device.add_channel(DeviceChannel::new(0))?;
            }
            if let Some(channel) = device.channel_mut(0) {
                if channel
                    .parameter_set(ParameterSetKind::Master)
                    .is_some_and(|s| !s.is_empty())
                {
                    error!("{}: master parameter set of channel 0 has to be empty", self.file);
                }
                channel.parameter_sets.insert(ParameterSetKind::Master, master);
            }
        }
        Ok(device)
    }

    fn rx_modes(&self, text: &str) -> RxModes {
        let mut modes = RxModes {
            always: false,
            ..Default::default()
        };
        for mode in text.split(',').map(str::trim) {
            match mode {
                "always" => modes.always = true,
                "burst" => modes.burst = true,
                "config" => modes.config = true,
                "wakeup" => modes.wakeup = true,
                "lazy_config" => modes.lazy_config = true,
                other => warn!("{}: unknown rx mode: {}", self.file, other),
            }
        }
        if !(modes.burst || modes.config || modes.wakeup || modes.lazy_config) {
            modes.always = true;
        }
        modes
    }

    fn device_type(&self, node: Node) -> DeviceType {
        let mut device_type = DeviceType::default();
        for attr in node.attributes() {
            let value = attr.value();
            match attr.name() {
                "name" => device_type.name = value.to_string(),
                "id" => device_type.id = value.to_string(),
                "priority" => device_type.priority = number(value).unwrap_or(0),
                "updatable" => device_type.updatable = flag(value),
                other => self.unknown_attribute("type", other),
            }
        }
        for child in elements(node) {
            let text = child.text().unwrap_or_default().trim();
            match child.tag_name().name() {
                "parameter" => match self.parameter(child) {
                    Ok(p) => device_type.parameters.push(p),
                    Err(e) => error!("{}: skipping type matcher: {}", self.file, e),
                },
                "type_id" => match number(text) {
                    Ok(id) => device_type.type_id = Some(id),
                    Err(e) => error!("{}: invalid type_id: {}", self.file, e),
                },
                "firmware" => {
                    let op = child
                        .attribute("cond_op")
                        .and_then(CondOp::parse)
                        .unwrap_or_default();
                    match number(text) {
                        Ok(value) => device_type.firmware = Some(Condition { op, value }),
                        Err(e) => error!("{}: invalid firmware condition: {}", self.file, e),
                    }
                },
                other => self.unknown_node("type", other),
            }
        }
        device_type
    }

    // ======================================
    // Parameter sets
    // ======================================

    fn paramset(&self, node: Node) -> Result<ParameterSet> {
        let kind: ParameterSetKind = node.attribute("type").unwrap_or_default().parse()?;
        let mut set = ParameterSet::new(kind);
        for attr in node.attributes() {
            let value = attr.value();
            match attr.name() {
                "type" | "link" => {},
                "id" => set.id = value.to_string(),
                "address_start" => set.address_start = Some(unsigned(value)?),
                "address_step" => set.address_step = Some(unsigned(value)?),
                "count" => set.count = unsigned(value)?,
                "channel_offset" => set.channel_offset = Some(BitAddress::parse(value)?),
                "peer_address_offset" => set.peer_address_offset = Some(BitAddress::parse(value)?),
                "peer_channel_offset" => set.peer_channel_offset = Some(BitAddress::parse(value)?),
                other => self.unknown_attribute("paramset", other),
            }
        }

        let mut enforce = Vec::new();
        for child in elements(node) {
            match child.tag_name().name() {
                "parameter" => match self.parameter(child) {
                    Ok(p) => set.parameters.push(p),
                    Err(e) => error!("{}: skipping parameter in {}: {}", self.file, set.id, e),
                },
                "enforce" => {
                    let id = child.attribute("id").unwrap_or_default();
                    let value = child.attribute("value").unwrap_or_default();
                    enforce.push((id.to_string(), value.to_string()));
                },
                "subset" => match child.attribute("ref") {
                    Some(reference) => set.subset_refs.push(reference.to_string()),
                    None => warn!("{}: subset without ref in {}", self.file, set.id),
                },
                "default_values" => {
                    let function = child.attribute("function").unwrap_or_default().to_string();
                    let values: BTreeMap<String, String> = elements(child)
                        .filter(|v| v.tag_name().name() == "value")
                        .filter_map(|v| {
                            Some((v.attribute("id")?.to_string(), v.attribute("value")?.to_string()))
                        })
                        .collect();
                    set.default_values.insert(function, values);
                },
                other => self.unknown_node("paramset", other),
            }
        }

        for (id, text) in enforce {
            let Some(parameter) = set.parameter_mut(&id) else {
                warn!("{}: enforce for unknown parameter {}", self.file, id);
                continue;
            };
            match ParamValue::parse_for(&parameter.logical, &text) {
                Ok(value) => parameter.logical.set_enforce(value),
                Err(e) => error!("{}: invalid enforce value for {}: {}", self.file, id, e),
            }
        }
        Ok(set)
    }

    fn parameter(&self, node: Node) -> Result<Parameter> {
        let mut parameter = Parameter::default();
        for attr in node.attributes() {
            let value = attr.value();
            match attr.name() {
                "id" => parameter.id = value.to_string(),
                "ui_flags" => parameter.ui_flags = ui_flags(value),
                "operations" => {
                    let mut ops = Operations {
                        read: false,
                        write: false,
                        event: false,
                    };
                    for op in value.split(',').map(str::trim) {
                        match op {
                            "read" => ops.read = true,
                            "write" => ops.write = true,
                            "event" => ops.event = true,
                            other => warn!("{}: unknown operation: {}", self.file, other),
                        }
                    }
                    parameter.operations = ops;
                },
                "signed" => parameter.signed = flag(value),
                "hidden" => parameter.hidden = flag(value),
                "control" => parameter.control = value.to_string(),
                "loopback" => parameter.loopback = flag(value),
                "omit_if" => parameter.omit_if = Some(number(value)?),
                "index" => parameter.index = BitAddress::parse(value)?,
                "size" => parameter.size = BitSize::parse(value)?,
                "const_value" => parameter.const_value = Some(number(value)?),
                "cond_op" => {
                    parameter.cond_op = CondOp::parse(value).unwrap_or_else(|| {
                        warn!("{}: unknown cond_op: {}", self.file, value);
                        CondOp::Equal
                    })
                },
                "param" => parameter.param = value.to_string(),
                "PARAM" => parameter.additional_param = value.to_string(),
                "type" => {
                    parameter.field_kind = match value {
                        "integer" => PhysicalKind::Integer,
                        "boolean" => PhysicalKind::Boolean,
                        "string" => PhysicalKind::String,
                        _ => PhysicalKind::None,
                    }
                },
                "default" | "burst_suppression" => {},
                other => self.unknown_attribute("parameter", other),
            }
        }

        for child in elements(node) {
            match child.tag_name().name() {
                "logical" => {
                    let (logical, signed) = self.logical(child)?;
                    parameter.logical = logical;
                    parameter.signed |= signed;
                },
                "physical" => parameter.physical = self.physical(child)?,
                "conversion" => {
                    if let Some(conversion) = self.conversion(child)? {
                        parameter.conversions.push(conversion);
                    }
                },
                "description" => {},
                other => self.unknown_node("parameter", other),
            }
        }

        let physical = &parameter.physical;
        if physical.index.bit != 0 && physical.size.total_bits() > 8 {
            return Err(ModelError::PartialByteTooWide(format!(
                "{}: index {} size {}",
                parameter.id, physical.index, physical.size
            )));
        }
        Ok(parameter)
    }

    /// Returns the logical contract and whether it implies a signed value
    fn logical(&self, node: Node) -> Result<(LogicalParameter, bool)> {
        let kind = node.attribute("type").unwrap_or("integer");
        let attr = |name: &str| node.attribute(name);
        let known = |name: &str| matches!(name, "type" | "min" | "max" | "default" | "unit");
        for a in node.attributes() {
            if !known(a.name()) {
                self.unknown_attribute("logical", a.name());
            }
        }
        let unit = attr("unit").unwrap_or_default().to_string();

        let special_pairs = || -> Vec<(String, String)> {
            elements(node)
                .filter(|c| c.tag_name().name() == "special_value")
                .map(|c| {
                    (
                        c.attribute("id").unwrap_or_default().to_string(),
                        c.attribute("value").unwrap_or_default().to_string(),
                    )
                })
                .collect()
        };

        let logical = match kind {
            "integer" => {
                let mut l = IntegerLogical {
                    unit,
                    ..Default::default()
                };
                if let Some(v) = attr("min") {
                    l.min = number(v)?;
                }
                if let Some(v) = attr("max") {
                    l.max = number(v)?;
                }
                if let Some(v) = attr("default") {
                    l.default = number(v)?;
                }
                for (id, value) in special_pairs() {
                    l.special_values.push(SpecialValue {
                        id,
                        value: number(&value)?,
                    });
                }
                let signed = attr("min").is_some() && l.min < 0;
                return Ok((LogicalParameter::Integer(l), signed));
            },
            "float" => {
                let mut l = FloatLogical {
                    unit,
                    ..Default::default()
                };
                if let Some(v) = attr("min") {
                    l.min = decimal(v)?;
                }
                if let Some(v) = attr("max") {
                    l.max = decimal(v)?;
                }
                if let Some(v) = attr("default") {
                    l.default = decimal(v)?;
                }
                for (id, value) in special_pairs() {
                    l.special_values.push(SpecialValue {
                        id,
                        value: decimal(&value)?,
                    });
                }
                let signed = attr("min").is_some() && l.min < 0.0;
                return Ok((LogicalParameter::Float(l), signed));
            },
            "boolean" => LogicalParameter::Boolean(BooleanLogical {
                default: attr("default").is_some_and(flag),
                unit,
                enforce: None,
            }),
            "option" => {
                let mut declared = Vec::new();
                for child in elements(node) {
                    if child.tag_name().name() != "option" {
                        self.unknown_node("logical", child.tag_name().name());
                        continue;
                    }
                    let index = match child.attribute("index") {
                        Some(i) => number(i)?,
                        None => declared.len() as i32,
                    };
                    declared.push(EnumOption::new(
                        child.attribute("id").unwrap_or_default(),
                        index,
                        child.attribute("default").is_some_and(flag),
                    ));
                }
                let mut l = EnumLogical::from_options(declared);
                l.unit = unit;
                LogicalParameter::Enum(l)
            },
            "string" => LogicalParameter::String(StringLogical {
                default: attr("default").unwrap_or_default().to_string(),
                unit,
                enforce: None,
            }),
            "action" => LogicalParameter::Action(ActionLogical {
                default: attr("default").is_some_and(flag),
                unit,
                enforce: None,
            }),
            other => {
                return Err(ModelError::schema(format!("unknown logical type {}", other)));
            },
        };
        Ok((logical, false))
    }

    fn physical(&self, node: Node) -> Result<PhysicalParameter> {
        let mut physical = PhysicalParameter::default();
        for attr in node.attributes() {
            let value = attr.value();
            match attr.name() {
                "type" => {
                    physical.kind = match value {
                        "integer" => PhysicalKind::Integer,
                        "boolean" => PhysicalKind::Boolean,
                        "string" => PhysicalKind::String,
                        other => {
                            warn!("{}: unknown physical type {}", self.file, other);
                            PhysicalKind::None
                        },
                    }
                },
                "interface" => {
                    physical.interface = Interface::parse(value).unwrap_or_else(|| {
                        warn!("{}: unknown interface {}", self.file, value);
                        Interface::None
                    })
                },
                "endian" => {
                    physical.endian = if value == "little" {
                        Endian::Little
                    } else {
                        Endian::Big
                    }
                },
                "value_id" => physical.value_id = value.to_string(),
                "id" => physical.id = value.to_string(),
                "list" => physical.list = number(value)?,
                "index" => physical.index = BitAddress::parse(value)?,
                "size" => {
                    physical.size = BitSize::parse(value)?;
                    physical.size_defined = true;
                },
                "counter" => physical.counter = value.to_string(),
                "volatile" => physical.volatile = flag(value),
                "no_init" => physical.no_init = flag(value),
                "mask" => {
                    let mask = common::hex::parse_number(value)
                        .ok_or_else(|| ModelError::InvalidNumber(value.to_string()))?;
                    physical.mask = Some(mask as u32);
                },
                "save_on_change" | "read_size" => {},
                other => self.unknown_attribute("physical", other),
            }
        }

        for child in elements(node) {
            match child.tag_name().name() {
                "set" => physical.set_request = child.attribute("request").map(str::to_string),
                "get" => physical.get_request = child.attribute("request").map(str::to_string),
                "event" => {
                    let Some(frame) = child.attribute("frame") else {
                        warn!("{}: event without frame", self.file);
                        continue;
                    };
                    let domino_event = elements(child)
                        .find(|d| d.tag_name().name() == "domino_event")
                        .map(|d| -> Result<DominoEvent> {
                            Ok(DominoEvent {
                                value: number(d.attribute("value").unwrap_or("0"))?,
                                delay_id: d.attribute("delay_id").unwrap_or_default().to_string(),
                            })
                        })
                        .transpose()?;
                    physical.event_frames.push(EventFrame {
                        frame: frame.to_string(),
                        domino_event,
                    });
                },
                "reset_after_send" => {
                    if let Some(param) = child.attribute("param") {
                        physical.reset_after_send.push(param.to_string());
                    }
                },
                "address" => physical.address = self.address(child)?,
                other => self.unknown_node("physical", other),
            }
        }
        Ok(physical)
    }

    fn address(&self, node: Node) -> Result<PhysicalAddress> {
        let mut address = PhysicalAddress::default();
        for attr in node.attributes() {
            let value = attr.value().trim();
            match attr.name() {
                "index" => {
                    let (operation, rest) = if let Some(rest) = value.strip_prefix('+') {
                        (AddressOperation::Addition, rest)
                    } else if let Some(rest) = value.strip_prefix('-') {
                        (AddressOperation::Subtraction, rest)
                    } else {
                        (AddressOperation::None, value)
                    };
                    address.operation = operation;
                    address.index = BitAddress::parse(rest)?;
                },
                "step" => address.step = BitSize::parse(value)?,
                other => self.unknown_attribute("address", other),
            }
        }
        Ok(address)
    }

    fn conversion(&self, node: Node) -> Result<Option<Conversion>> {
        let kind = node.attribute("type").unwrap_or_default();
        let attr = |name: &str| node.attribute(name);
        for a in node.attributes() {
            if !CONVERSION_ATTRIBUTES.contains(&a.name()) {
                self.unknown_attribute("conversion", a.name());
            }
        }

        let conversion = match kind {
            "float_integer_scale" => {
                let mut factor = attr("factor").map(decimal).transpose()?.unwrap_or(1.0);
                if factor == 0.0 {
                    warn!("{}: scale factor 0 replaced by 1", self.file);
                    factor = 1.0;
                }
                Conversion::FloatIntegerScale {
                    factor,
                    offset: attr("offset").map(decimal).transpose()?.unwrap_or(0.0),
                }
            },
            "integer_integer_scale" => Conversion::IntegerIntegerScale {
                div: attr("div").map(number).transpose()?.unwrap_or(0),
                mul: attr("mul").map(number).transpose()?.unwrap_or(0),
            },
            "integer_integer_map" | "option_integer" => {
                let mut from_device = BTreeMap::new();
                let mut to_device = BTreeMap::new();
                for child in elements(node) {
                    if child.tag_name().name() != "value_map" {
                        self.unknown_node("conversion", child.tag_name().name());
                        continue;
                    }
                    let device_value = number(child.attribute("device_value").unwrap_or("0"))?;
                    let parameter_value =
                        number(child.attribute("parameter_value").unwrap_or("0"))?;
                    if child.attribute("from_device") != Some("false") {
                        from_device.insert(device_value, parameter_value);
                    }
                    if child.attribute("to_device") != Some("false") {
                        to_device.insert(parameter_value, device_value);
                    }
                }
                Conversion::IntegerIntegerMap {
                    from_device,
                    to_device,
                }
            },
            "boolean_integer" => Conversion::BooleanInteger {
                threshold: attr("threshold").map(number).transpose()?.unwrap_or(0),
                true_value: attr("true").map(number).transpose()?.unwrap_or(0),
                false_value: attr("false").map(number).transpose()?.unwrap_or(0),
                invert: attr("invert").is_some_and(flag),
            },
            "float_configtime" => {
                let factors = match attr("factors") {
                    Some(list) => list
                        .split(',')
                        .map(decimal)
                        .collect::<Result<Vec<f64>>>()?,
                    None => Vec::new(),
                };
                let value_bits = match attr("value_size") {
                    Some(size) => BitSize::parse(size)?.total_bits() as u32,
                    None => 0,
                };
                Conversion::FloatConfigTime {
                    factors,
                    value_bits,
                }
            },
            "integer_tinyfloat" => {
                let field = |name: &str, default: u32| -> Result<u32> {
                    attr(name).map(unsigned).transpose().map(|v| v.unwrap_or(default))
                };
                Conversion::IntegerTinyFloat {
                    mantissa_start: field("mantissa_start", 5)?,
                    mantissa_size: field("mantissa_size", 11)?,
                    exponent_start: field("exponent_start", 0)?,
                    exponent_size: field("exponent_size", 5)?,
                }
            },
            "string_unsigned_integer" => Conversion::StringUnsignedInteger,
            "toggle" => Conversion::Toggle {
                parameter: attr("value").unwrap_or_default().to_string(),
                on: attr("on").map(number).transpose()?.unwrap_or(200),
                off: attr("off").map(number).transpose()?.unwrap_or(0),
            },
            "none" | "action_key_counter" | "action_key_same_counter" | "rc19display" => {
                return Ok(None)
            },
            other => {
                warn!("{}: unknown conversion type {}, ignored", self.file, other);
                return Ok(None);
            },
        };
        Ok(Some(conversion))
    }

    // ======================================
    // Channels
    // ======================================

    fn channel(&self, node: Node) -> Result<DeviceChannel> {
        let index = unsigned(node.attribute("index").unwrap_or("0"))?;
        let mut channel = DeviceChannel::new(index);
        for attr in node.attributes() {
            let value = attr.value();
            match attr.name() {
                "index" => {},
                "physical_index_offset" => channel.physical_index_offset = number(value)?,
                "ui_flags" => channel.ui_flags = ui_flags(value),
                "direction" => {
                    channel.direction = match value {
                        "sender" => ChannelDirection::Sender,
                        "receiver" => ChannelDirection::Receiver,
                        other => {
                            warn!("{}: unknown channel direction {}", self.file, other);
                            ChannelDirection::None
                        },
                    }
                },
                "class" => channel.class = value.to_string(),
                "type" => channel.kind = value.to_string(),
                "function" => channel.function = value.to_string(),
                "hidden" => channel.hidden = flag(value),
                "autoregister" => channel.autoregister = flag(value),
                "aes_default" => channel.aes_default = flag(value),
                "paired" => channel.paired = flag(value),
                "count" => channel.count = unsigned(value)?.max(1),
                "count_from_sysinfo" => {
                    channel.count_from_sysinfo = self.sysinfo_count(value);
                },
                other => self.unknown_attribute("channel", other),
            }
        }

        for child in elements(node) {
            match child.tag_name().name() {
                "paramset" => match self.paramset(child) {
                    Ok(set) => {
                        channel.parameter_sets.insert(set.kind, set);
                    },
                    Err(e) => error!(
                        "{}: skipping parameter set of channel {}: {}",
                        self.file, index, e
                    ),
                },
                "link_roles" => {
                    let mut roles = LinkRoles::default();
                    for role in elements(child) {
                        let name = role.attribute("name").unwrap_or_default().to_string();
                        match role.tag_name().name() {
                            "source" => roles.source_names.push(name),
                            "target" => roles.target_names.push(name),
                            other => self.unknown_node("link_roles", other),
                        }
                    }
                    channel.link_roles = Some(roles);
                },
                "enforce_link" => {
                    for value in elements(child) {
                        if let (Some(id), Some(v)) = (value.attribute("id"), value.attribute("value")) {
                            channel.enforce_link.push(EnforceLink {
                                id: id.to_string(),
                                value: v.to_string(),
                            });
                        }
                    }
                },
                "description" => {},
                other => self.unknown_node("channel", other),
            }
        }
        Ok(channel)
    }

    fn sysinfo_count(&self, text: &str) -> Option<SysinfoCount> {
        let parsed = field_position(text).ok()?;
        if parsed.index < 9 || parsed.size.total_bits() > 8 {
            error!(
                "{}: count_from_sysinfo {} needs an index >= 9 and size <= 1",
                self.file, text
            );
            return None;
        }
        Some(SysinfoCount {
            index: parsed.index,
            size: parsed.size,
        })
    }

    // ======================================
    // Frames
    // ======================================

    fn frame(&self, node: Node) -> Result<DeviceFrame> {
        let mut frame = DeviceFrame::default();
        for attr in node.attributes() {
            let value = attr.value();
            match attr.name() {
                "id" => frame.id = value.to_string(),
                "direction" => {
                    frame.direction = match value {
                        "from_device" => FrameDirection::FromDevice,
                        "to_device" => FrameDirection::ToDevice,
                        other => {
                            warn!("{}: unknown frame direction {}", self.file, other);
                            FrameDirection::None
                        },
                    }
                },
                "allowed_receivers" => {
                    let mut receivers = AllowedReceivers::default();
                    for r in value.split(',').map(str::trim) {
                        match r {
                            "broadcast" => receivers.broadcast = true,
                            "central" => receivers.central = true,
                            "other" => receivers.other = true,
                            other => warn!("{}: unknown receiver {}", self.file, other),
                        }
                    }
                    frame.allowed_receivers = receivers;
                },
                "event" => frame.event = flag(value),
                "type" => {
                    let code = match value.strip_prefix('#') {
                        Some(c) => c.bytes().next().map(i32::from).unwrap_or(0),
                        None => number(value)?,
                    };
                    frame.message_type = Some(code as u8);
                },
                "subtype" => frame.subtype = Some(number(value)?),
                "subtype_index" => frame.subtype_index = Some(field_position(value)?),
                "channel_field" => frame.channel_field = Some(field_position(value)?),
                "receiver_channel_field" => {
                    frame.receiver_channel_field = Some(field_position(value)?)
                },
                "fixed_channel" => {
                    frame.fixed_channel = if value == "*" {
                        FixedChannel::Any
                    } else {
                        FixedChannel::Channel(unsigned(value)?)
                    }
                },
                "size" => frame.size = Some(unsigned(value)?),
                "double_send" => frame.double_send = flag(value),
                "max_packets" => frame.max_packets = Some(unsigned(value)?),
                "split_after" => frame.split_after = Some(unsigned(value)?),
                "response_type" => frame.response_type = Some(number(value)?),
                "response_subtype" => frame.response_subtype = Some(number(value)?),
                other => self.unknown_attribute("frame", other),
            }
        }
        for child in elements(node) {
            match child.tag_name().name() {
                "parameter" => match self.parameter(child) {
                    Ok(mut field) => {
                        if field.size.is_zero() {
                            field.size = BitSize::ONE_BYTE;
                        }
                        frame.parameters.push(field)
                    },
                    Err(e) => error!("{}: skipping field of frame {}: {}", self.file, frame.id, e),
                },
                other => self.unknown_node("frame", other),
            }
        }
        Ok(frame)
    }
}
