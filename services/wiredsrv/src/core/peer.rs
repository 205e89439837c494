//! A paired wired device
//!
//! Ties a bus address to its [`DeviceDescription`]. MASTER and LINK
//! parameters live in the device's configuration memory and go through the
//! peer's [`ConfigBlockStore`]; VALUES and store-interface parameters live
//! in parameter slots held by the central. All state sits behind one mutex
//! so a fetch-modify-flush sequence is never observed half done.

use device_model::bits::{self, BitAddress};
use device_model::physical::AddressOperation;
use device_model::{
    Conversion, DeviceDescription, Interface, LogicalParameter, ModelError, ParamValue, Parameter,
    ParameterSet, ParameterSetKind, PacketFields,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::bus::{BusBlockSource, WiredBus};
use crate::core::packet::BusPacket;
use crate::core::store::{ConfigBlockStore, ConfigurationBlock};
use crate::error::{Result, WiredError};

/// Durable identity of a parameter slot
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub kind: ParameterSetKind,
    pub channel: u32,
    pub parameter: String,
    /// Link partner `(peer id, channel)` for LINK slots
    pub remote: Option<(u64, u32)>,
}

impl SlotKey {
    pub fn new(kind: ParameterSetKind, channel: u32, parameter: impl Into<String>) -> Self {
        Self {
            kind,
            channel,
            parameter: parameter.into(),
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: Option<(u64, u32)>) -> Self {
        self.remote = remote;
        self
    }
}

/// A slot as persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSlot {
    pub key: SlotKey,
    pub data: Vec<u8>,
    pub storage_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParameterSlot {
    data: Vec<u8>,
    storage_id: Option<i64>,
}

/// Link partner of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPeer {
    pub remote_id: u64,
    pub remote_channel: u32,
    /// First byte of this link's record in configuration memory
    pub config_address: u32,
}

/// Result of one item of a bulk write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ItemOutcome {
    Ok,
    UnknownParameter,
    ReadOnly,
    Invalid(String),
    CommunicationFailure(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutParamsetReport {
    pub items: BTreeMap<String, ItemOutcome>,
}

impl PutParamsetReport {
    pub fn all_ok(&self) -> bool {
        self.items.values().all(|o| *o == ItemOutcome::Ok)
    }

    pub fn outcome(&self, id: &str) -> Option<&ItemOutcome> {
        self.items.get(id)
    }
}

struct PeerState {
    store: ConfigBlockStore,
    slots: BTreeMap<SlotKey, ParameterSlot>,
    links: BTreeMap<u32, Vec<LinkPeer>>,
}

pub struct WiredPeer {
    pub id: u64,
    pub address: u32,
    pub serial_number: String,
    description: Arc<DeviceDescription>,
    bus: Arc<WiredBus>,
    disposing: AtomicBool,
    state: Mutex<PeerState>,
}

impl std::fmt::Debug for WiredPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WiredPeer")
            .field("id", &self.id)
            .field("address", &format_args!("0x{:08X}", self.address))
            .field("serial_number", &self.serial_number)
            .field("description", &self.description.file)
            .finish()
    }
}

/// Slots for everything the central keeps itself, filled with encoded defaults
fn initial_slots(description: &DeviceDescription) -> BTreeMap<SlotKey, ParameterSlot> {
    let mut slots = BTreeMap::new();
    for (index, channel) in description.channels() {
        for (kind, set) in &channel.parameter_sets {
            if *kind == ParameterSetKind::Link {
                continue;
            }
            for parameter in &set.parameters {
                let interface = parameter.physical.interface;
                let held_by_central = match kind {
                    ParameterSetKind::Values => !interface.is_config_memory(),
                    _ => interface == Interface::Store,
                };
                if parameter.id.is_empty() || !held_by_central {
                    continue;
                }
                match parameter.encode(&parameter.logical.default_value()) {
                    Ok(data) => {
                        slots.insert(
                            SlotKey::new(*kind, index, parameter.id.clone()),
                            ParameterSlot {
                                data,
                                storage_id: None,
                            },
                        );
                    },
                    Err(e) => warn!(
                        "{}: no default for {} on channel {}: {}",
                        description.file, parameter.id, index, e
                    ),
                }
            }
        }
    }
    slots
}

impl WiredPeer {
    pub fn new(
        id: u64,
        address: u32,
        serial_number: impl Into<String>,
        description: Arc<DeviceDescription>,
        bus: Arc<WiredBus>,
    ) -> Self {
        let state = PeerState {
            store: ConfigBlockStore::new(description.eep_size),
            slots: initial_slots(&description),
            links: BTreeMap::new(),
        };
        Self {
            id,
            address,
            serial_number: serial_number.into(),
            description,
            bus,
            disposing: AtomicBool::new(false),
            state: Mutex::new(state),
        }
    }

    pub fn description(&self) -> &Arc<DeviceDescription> {
        &self.description
    }

    pub fn dispose(&self) {
        if !self.disposing.swap(true, Ordering::SeqCst) {
            debug!("Peer {} disposing", self.id);
        }
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_disposing() {
            return Err(WiredError::Disposing);
        }
        Ok(())
    }

    fn block_source(&self) -> BusBlockSource {
        BusBlockSource::new(Arc::clone(&self.bus), self.address)
    }

    fn parameter_set(&self, channel: u32, kind: ParameterSetKind) -> Result<&ParameterSet> {
        let definition = self
            .description
            .channel(channel)
            .ok_or(WiredError::UnknownChannel(channel))?;
        definition
            .parameter_set(kind)
            .ok_or_else(|| WiredError::UnknownParameterSet {
                channel,
                kind: kind.to_string(),
            })
    }

    // ======================================
    // Links
    // ======================================

    /// Register a link partner, replacing an earlier entry for the same remote
    pub async fn add_link(&self, channel: u32, link: LinkPeer) -> Result<()> {
        self.ensure_running()?;
        self.parameter_set(channel, ParameterSetKind::Link)?;
        let mut state = self.state.lock().await;
        let links = state.links.entry(channel).or_default();
        links.retain(|l| (l.remote_id, l.remote_channel) != (link.remote_id, link.remote_channel));
        links.push(link);
        debug!(
            "Peer {} channel {} linked to {}:{} at 0x{:04X}",
            self.id, channel, link.remote_id, link.remote_channel, link.config_address
        );
        Ok(())
    }

    pub async fn links(&self, channel: u32) -> Vec<LinkPeer> {
        let state = self.state.lock().await;
        state.links.get(&channel).cloned().unwrap_or_default()
    }

    fn link(state: &PeerState, channel: u32, remote: Option<(u64, u32)>) -> Result<LinkPeer> {
        let (remote_id, remote_channel) = remote.ok_or_else(|| {
            WiredError::AddressingUnsupported(format!(
                "LINK set of channel {} needs a link partner",
                channel
            ))
        })?;
        state
            .links
            .get(&channel)
            .and_then(|links| {
                links
                    .iter()
                    .find(|l| l.remote_id == remote_id && l.remote_channel == remote_channel)
            })
            .copied()
            .ok_or(WiredError::NotPaired {
                channel,
                remote_id,
                remote_channel,
            })
    }

    // ======================================
    // Addressing
    // ======================================

    fn master_address(&self, channel: u32, set: &ParameterSet, parameter: &Parameter) -> Result<BitAddress> {
        let definition = self
            .description
            .channel(channel)
            .ok_or(WiredError::UnknownChannel(channel))?;
        let offset = channel - definition.start_index;
        let address = parameter.physical.address;

        if address.operation == AddressOperation::None {
            let step = address.step.total_bits() as i64;
            return Ok(address.index.offset_bits(step * i64::from(offset)));
        }

        let (Some(start), Some(step)) = (set.address_start, set.address_step) else {
            return Err(WiredError::AddressingUnsupported(format!(
                "{}: address_start or address_step of {} is not set",
                parameter.id, set.id
            )));
        };
        if set.count > 0 && offset >= set.count {
            return Err(WiredError::AddressingUnsupported(format!(
                "{}: channel offset {} beyond {} records of {}",
                parameter.id, offset, set.count, set.id
            )));
        }
        let base = start + offset * step;
        let byte = match address.operation {
            AddressOperation::Subtraction => base.checked_sub(address.index.byte).ok_or_else(|| {
                WiredError::AddressingUnsupported(format!("{}: address below zero", parameter.id))
            })?,
            _ => base + address.index.byte,
        };
        Ok(BitAddress::new(byte, address.index.bit))
    }

    fn config_address(
        &self,
        state: &PeerState,
        channel: u32,
        set: &ParameterSet,
        parameter: &Parameter,
        remote: Option<(u64, u32)>,
    ) -> Result<BitAddress> {
        match set.kind {
            ParameterSetKind::Link => {
                let link = Self::link(state, channel, remote)?;
                let index = parameter.physical.address.index;
                Ok(BitAddress::new(link.config_address + index.byte, index.bit))
            },
            _ => self.master_address(channel, set, parameter),
        }
    }

    // ======================================
    // Parameter sets
    // ======================================

    /// Read every reported parameter of a set.
    ///
    /// Parameters that fail to decode are logged and left out; bus faults
    /// abort the read.
    pub async fn get_paramset(
        &self,
        channel: u32,
        kind: ParameterSetKind,
        remote: Option<(u64, u32)>,
    ) -> Result<BTreeMap<String, ParamValue>> {
        self.ensure_running()?;
        let set = self.parameter_set(channel, kind)?;
        let source = self.block_source();
        let mut state = self.state.lock().await;
        if kind == ParameterSetKind::Link {
            Self::link(&state, channel, remote)?;
        }

        let mut values = BTreeMap::new();
        for parameter in set.reported() {
            if parameter.physical.interface == Interface::Internal && parameter.id == "UNREACH" {
                values.insert(
                    parameter.id.clone(),
                    ParamValue::Boolean(self.bus.is_unreachable(self.address)),
                );
                continue;
            }

            let raw = if parameter.physical.interface.is_config_memory() {
                let address = match self.config_address(&state, channel, set, parameter, remote) {
                    Ok(address) => address,
                    Err(e) => {
                        warn!("Peer {}: skipping {}: {}", self.id, parameter.id, e);
                        continue;
                    },
                };
                match state
                    .store
                    .read(address, parameter.physical.size, parameter.physical.mask, &source)
                    .await
                {
                    Ok(raw) => raw,
                    Err(e) if e.is_communication_failure() => return Err(e),
                    Err(e) => {
                        warn!("Peer {}: skipping {}: {}", self.id, parameter.id, e);
                        continue;
                    },
                }
            } else {
                let key = SlotKey::new(kind, channel, parameter.id.clone()).with_remote(remote);
                match state.slots.get(&key) {
                    Some(slot) => slot.data.clone(),
                    None => {
                        values.insert(parameter.id.clone(), parameter.logical.default_value());
                        continue;
                    },
                }
            };

            match parameter.decode(&raw, false) {
                Ok(value) => {
                    values.insert(parameter.id.clone(), value);
                },
                Err(e) => warn!("Peer {}: cannot decode {}: {}", self.id, parameter.id, e),
            }
        }
        Ok(values)
    }

    /// Write several parameters of one set.
    ///
    /// Each item is encoded and stored on its own; configuration memory is
    /// flushed once at the end. A failed flush turns the affected items into
    /// communication failures.
    pub async fn put_paramset(
        &self,
        channel: u32,
        kind: ParameterSetKind,
        remote: Option<(u64, u32)>,
        values: BTreeMap<String, ParamValue>,
    ) -> Result<PutParamsetReport> {
        self.ensure_running()?;
        let set = self.parameter_set(channel, kind)?;
        let source = self.block_source();
        let mut state = self.state.lock().await;
        if kind == ParameterSetKind::Link {
            Self::link(&state, channel, remote)?;
        }

        let mut report = PutParamsetReport::default();
        let mut flush = BTreeSet::new();
        let mut flushed_items = Vec::new();

        for (id, value) in values {
            let Some(parameter) = set.parameter(&id) else {
                report.items.insert(id, ItemOutcome::UnknownParameter);
                continue;
            };
            if !parameter.operations.write {
                report.items.insert(id, ItemOutcome::ReadOnly);
                continue;
            }

            let result = if kind == ParameterSetKind::Values {
                self.apply_value(&mut state, channel, set, parameter, &value).await
            } else {
                match self.write_config(&mut state, channel, set, parameter, remote, &value, &source).await {
                    Ok(blocks) if parameter.physical.interface == Interface::Eeprom => {
                        flush.extend(blocks);
                        flushed_items.push(id.clone());
                        Ok(())
                    },
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                }
            };

            let outcome = match result {
                Ok(()) => ItemOutcome::Ok,
                Err(e) if e.is_communication_failure() => ItemOutcome::CommunicationFailure(e.to_string()),
                Err(WiredError::ReadOnly(_)) => ItemOutcome::ReadOnly,
                Err(e) => ItemOutcome::Invalid(e.to_string()),
            };
            report.items.insert(id, outcome);
        }

        if !flush.is_empty() {
            match state.store.flush_blocks(&flush, &source).await {
                Ok(written) => info!(
                    "Peer {}: {} {} parameters written in {} blocks",
                    self.id,
                    flushed_items.len(),
                    kind,
                    written
                ),
                Err(e) => {
                    errors::log_error!(e, "Peer {}: flushing configuration failed", self.id);
                    for id in flushed_items {
                        report
                            .items
                            .insert(id, ItemOutcome::CommunicationFailure(e.to_string()));
                    }
                },
            }
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_config(
        &self,
        state: &mut PeerState,
        channel: u32,
        set: &ParameterSet,
        parameter: &Parameter,
        remote: Option<(u64, u32)>,
        value: &ParamValue,
        source: &BusBlockSource,
    ) -> Result<BTreeSet<u32>> {
        let raw = parameter.encode(value)?;
        if parameter.physical.interface == Interface::Store {
            let key = SlotKey::new(set.kind, channel, parameter.id.clone()).with_remote(remote);
            Self::update_slot(state, key, raw);
            return Ok(BTreeSet::new());
        }
        if !parameter.physical.interface.is_config_memory() {
            return Err(WiredError::AddressingUnsupported(format!(
                "{} is not stored in configuration memory",
                parameter.id
            )));
        }
        let address = self.config_address(state, channel, set, parameter, remote)?;
        state
            .store
            .write(address, parameter.physical.size, &raw, source)
            .await
    }

    /// Write every dirty block back, including those left by config-interface writes
    pub async fn flush(&self) -> Result<usize> {
        self.ensure_running()?;
        let source = self.block_source();
        let mut state = self.state.lock().await;
        state.store.flush(&source).await
    }

    pub async fn dirty_blocks(&self) -> BTreeSet<u32> {
        self.state.lock().await.store.dirty_blocks()
    }

    // ======================================
    // Values
    // ======================================

    pub async fn get_value(&self, channel: u32, id: &str) -> Result<ParamValue> {
        self.ensure_running()?;
        let set = self.parameter_set(channel, ParameterSetKind::Values)?;
        let parameter = set
            .parameter(id)
            .ok_or_else(|| ModelError::UnknownParameter(id.to_string()))?;
        if parameter.physical.interface == Interface::Internal && parameter.id == "UNREACH" {
            return Ok(ParamValue::Boolean(self.bus.is_unreachable(self.address)));
        }
        let state = self.state.lock().await;
        match state.slots.get(&SlotKey::new(ParameterSetKind::Values, channel, id)) {
            Some(slot) => Ok(parameter.decode(&slot.data, false)?),
            None => Ok(parameter.logical.default_value()),
        }
    }

    /// Set a VALUES parameter, sending its set request when it has one
    pub async fn set_value(&self, channel: u32, id: &str, value: ParamValue) -> Result<()> {
        self.ensure_running()?;
        let set = self.parameter_set(channel, ParameterSetKind::Values)?;
        let parameter = set
            .parameter(id)
            .ok_or_else(|| ModelError::UnknownParameter(id.to_string()))?;
        let mut state = self.state.lock().await;
        self.apply_value(&mut state, channel, set, parameter, &value).await
    }

    /// Resolve a toggle into the value its target parameter should take
    fn toggle_target<'a>(
        state: &PeerState,
        channel: u32,
        set: &'a ParameterSet,
        target: &str,
        on: i32,
        off: i32,
    ) -> Result<(&'a Parameter, ParamValue)> {
        let parameter = set
            .parameter(target)
            .ok_or_else(|| ModelError::UnknownParameter(target.to_string()))?;
        let current = state
            .slots
            .get(&SlotKey::new(ParameterSetKind::Values, channel, target))
            .map(|slot| slot.data.clone());

        let next = match &parameter.logical {
            LogicalParameter::Boolean(_) => {
                let current = match current {
                    Some(raw) => parameter.decode(&raw, false)?.as_bool(),
                    None => false,
                };
                ParamValue::Boolean(!current)
            },
            LogicalParameter::Integer(_) | LogicalParameter::Float(_) => {
                let current = current.and_then(|raw| raw.first().copied()).map(i32::from);
                let raw = if current == Some(on) { off } else { on };
                parameter.decode(&bits::to_be_minimal(raw), false)?
            },
            other => {
                return Err(WiredError::AddressingUnsupported(format!(
                    "cannot toggle {} of type {}",
                    target,
                    other.type_name()
                )))
            },
        };
        Ok((parameter, next))
    }

    async fn apply_value(
        &self,
        state: &mut PeerState,
        channel: u32,
        set: &ParameterSet,
        parameter: &Parameter,
        value: &ParamValue,
    ) -> Result<()> {
        if !parameter.operations.write {
            return Err(WiredError::ReadOnly(parameter.id.clone()));
        }
        let (parameter, value) = match parameter.toggle() {
            Some(Conversion::Toggle { parameter: target, on, off }) => {
                let (target, next) = Self::toggle_target(state, channel, set, target, *on, *off)?;
                debug!("Peer {}: {} toggles {} to {}", self.id, parameter.id, target.id, next);
                (target, next)
            },
            _ => (parameter, value.clone()),
        };

        let raw = parameter.encode(&value)?;
        let key = SlotKey::new(ParameterSetKind::Values, channel, parameter.id.clone());
        match parameter.physical.interface {
            Interface::Store | Interface::Internal => {
                Self::update_slot(state, key, raw);
                Ok(())
            },
            Interface::Command | Interface::CentralCommand => {
                Self::update_slot(state, key, raw.clone());
                self.send_command(state, channel, set, parameter, &raw).await
            },
            interface if interface.is_config_memory() => {
                let source = self.block_source();
                let address = self.master_address(channel, set, parameter)?;
                let blocks = state
                    .store
                    .write(address, parameter.physical.size, &raw, &source)
                    .await?;
                state.store.flush_blocks(&blocks, &source).await?;
                Ok(())
            },
            _ => Err(WiredError::AddressingUnsupported(format!(
                "{} has no physical interface",
                parameter.id
            ))),
        }
    }

    /// Build the set-request frame for a command parameter and send it
    async fn send_command(
        &self,
        state: &mut PeerState,
        channel: u32,
        set: &ParameterSet,
        parameter: &Parameter,
        raw: &[u8],
    ) -> Result<()> {
        let Some(frame_id) = parameter.physical.set_request.as_deref() else {
            return Err(WiredError::ReadOnly(parameter.id.clone()));
        };
        let frame = self.description.frame(frame_id).ok_or_else(|| {
            ModelError::schema(format!("{} references unknown frame {}", parameter.id, frame_id))
        })?;
        let definition = self
            .description
            .channel(channel)
            .ok_or(WiredError::UnknownChannel(channel))?;
        let wire_channel = channel as i32 + definition.physical_index_offset;

        let slots = &state.slots;
        let own_names = [&parameter.physical.value_id, &parameter.physical.id];
        let payload = frame.build_payload(Some(wire_channel), |field| {
            if field.param.is_empty() && !field.additional_param.is_empty() {
                let slot = slots.get(&SlotKey::new(
                    ParameterSetKind::Values,
                    channel,
                    field.additional_param.clone(),
                ))?;
                let omitted = field.omit_if == Some(bits::read_be(&slot.data) as i32);
                return (!omitted).then(|| slot.data.clone());
            }
            if own_names.iter().any(|name| !name.is_empty() && **name == field.param) {
                return Some(raw.to_vec());
            }
            let other = set.find_by_physical(&field.param)?;
            slots
                .get(&SlotKey::new(ParameterSetKind::Values, channel, other.id.clone()))
                .map(|slot| slot.data.clone())
        })?;

        let response = self.bus.request(self.address, payload).await?;
        if !response.is_ack() && response.message_type().is_some() {
            let updates = self.apply_event(state, &response);
            debug!("Peer {}: response to {} updated {} values", self.id, frame_id, updates.len());
        }

        for reset in &parameter.physical.reset_after_send {
            let Some(target) = set.parameter(reset) else {
                continue;
            };
            match target.encode(&target.logical.default_value()) {
                Ok(data) => Self::update_slot(
                    state,
                    SlotKey::new(ParameterSetKind::Values, channel, reset.clone()),
                    data,
                ),
                Err(e) => warn!("Peer {}: cannot reset {}: {}", self.id, reset, e),
            }
        }
        Ok(())
    }

    fn update_slot(state: &mut PeerState, key: SlotKey, data: Vec<u8>) {
        state
            .slots
            .entry(key)
            .and_modify(|slot| slot.data = data.clone())
            .or_insert(ParameterSlot {
                data,
                storage_id: None,
            });
    }

    // ======================================
    // Events
    // ======================================

    /// Decode an event frame into VALUES slots.
    ///
    /// Returns `(channel, parameter, value)` for every value it updated.
    pub async fn handle_event(&self, packet: &BusPacket) -> Result<Vec<(u32, String, ParamValue)>> {
        self.ensure_running()?;
        let mut state = self.state.lock().await;
        Ok(self.apply_event(&mut state, packet))
    }

    fn apply_event(&self, state: &mut PeerState, packet: &BusPacket) -> Vec<(u32, String, ParamValue)> {
        let description = &self.description;
        let Some(frame) = description.find_frame(packet) else {
            debug!(
                "Peer {}: no frame for message type {:?}",
                self.id,
                packet.message_type()
            );
            return Vec::new();
        };
        let received_channel = frame.channel_from(packet);

        let mut updates = Vec::new();
        for associated in &frame.associated_values {
            let channel = match received_channel {
                Some(channel) if channel >= 0 => {
                    let channel = channel as u32;
                    let same_definition = match (
                        description.channel(channel),
                        description.channel(associated.channel),
                    ) {
                        (Some(a), Some(b)) => std::ptr::eq(a, b),
                        _ => false,
                    };
                    if !same_definition {
                        continue;
                    }
                    channel
                },
                Some(_) => continue,
                None => associated.channel,
            };
            let Ok(parameter) = description.parameter(associated.channel, associated.set, &associated.parameter) else {
                continue;
            };
            let Some(field) = frame.parameters.iter().find(|f| {
                f.param == parameter.id
                    || (!parameter.physical.value_id.is_empty() && f.param == parameter.physical.value_id)
            }) else {
                continue;
            };

            let raw = frame.read_field(packet, field);
            match parameter.decode(&raw, true) {
                Ok(value) => {
                    Self::update_slot(
                        state,
                        SlotKey::new(associated.set, channel, parameter.id.clone()),
                        raw,
                    );
                    updates.push((channel, parameter.id.clone(), value));
                },
                Err(e) => warn!(
                    "Peer {}: cannot decode {} from {}: {}",
                    self.id, parameter.id, frame.id, e
                ),
            }
        }
        updates
    }

    // ======================================
    // Persistence
    // ======================================

    /// Rebind persisted slots; ids the description no longer knows are dropped
    pub async fn restore_slots(&self, stored: Vec<StoredSlot>) -> usize {
        let mut state = self.state.lock().await;
        let mut restored = 0;
        for slot in stored {
            let key = slot.key;
            if let Err(e) = self.description.parameter(key.channel, key.kind, &key.parameter) {
                warn!(
                    "Peer {}: dropping stored {} {} of channel {}: {}",
                    self.id, key.kind, key.parameter, key.channel, e
                );
                continue;
            }
            state.slots.insert(
                key,
                ParameterSlot {
                    data: slot.data,
                    storage_id: slot.storage_id,
                },
            );
            restored += 1;
        }
        restored
    }

    /// Seed the block cache from persisted blocks
    pub async fn restore_blocks(&self, blocks: Vec<ConfigurationBlock>) -> usize {
        let mut state = self.state.lock().await;
        let mut restored = 0;
        for block in blocks {
            match state.store.insert_block(block) {
                Ok(()) => restored += 1,
                Err(e) => warn!("Peer {}: dropping stored block: {}", self.id, e),
            }
        }
        restored
    }

    pub async fn snapshot_slots(&self) -> Vec<StoredSlot> {
        let state = self.state.lock().await;
        state
            .slots
            .iter()
            .map(|(key, slot)| StoredSlot {
                key: key.clone(),
                data: slot.data.clone(),
                storage_id: slot.storage_id,
            })
            .collect()
    }

    pub async fn snapshot_blocks(&self) -> Vec<ConfigurationBlock> {
        let state = self.state.lock().await;
        state.store.blocks().cloned().collect()
    }

    /// Remember the row id a slot was saved under
    pub async fn set_slot_storage_id(&self, key: &SlotKey, storage_id: i64) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.slots.get_mut(key) {
            slot.storage_id = Some(storage_id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::BusTimings;
    use crate::core::transport::MockBus;
    use tracing_test::traced_test;

    const FIXTURE: &str = include_str!("../../tests/fixtures/hbw_switch.xml");

    fn peer() -> WiredPeer {
        let description = device_model::xml::from_xml_str(FIXTURE, "hbw_switch.xml").unwrap();
        let bus = WiredBus::new(Arc::new(MockBus::new()), 1, BusTimings::fast());
        WiredPeer::new(5, 0x42, "JEQ0000005", Arc::new(description), Arc::new(bus))
    }

    #[test]
    fn test_master_addressing_modes() {
        let peer = peer();
        let root = peer.parameter_set(0, ParameterSetKind::Master).unwrap();
        let logging = root.parameter("LOGGING_TIME").unwrap();
        assert_eq!(
            peer.master_address(0, root, logging).unwrap(),
            BitAddress::new(0x01, 0)
        );

        let set = peer.parameter_set(2, ParameterSetKind::Master).unwrap();
        let locked = set.parameter("LOCKED").unwrap();
        assert_eq!(peer.master_address(1, set, locked).unwrap(), BitAddress::new(0x30, 2));
        assert_eq!(peer.master_address(2, set, locked).unwrap(), BitAddress::new(0x32, 2));
    }

    #[tokio::test]
    async fn test_values_start_from_defaults() {
        let peer = peer();
        assert_eq!(peer.get_value(1, "STATE").await.unwrap(), ParamValue::Boolean(false));
        assert_eq!(peer.get_value(2, "INHIBIT").await.unwrap(), ParamValue::Boolean(false));
        assert!(peer
            .snapshot_slots()
            .await
            .iter()
            .any(|s| s.key == SlotKey::new(ParameterSetKind::Master, 0, "DISPLAY_ORDER")));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_restore_drops_unknown_slots() {
        let peer = peer();
        let restored = peer
            .restore_slots(vec![
                StoredSlot {
                    key: SlotKey::new(ParameterSetKind::Values, 1, "INHIBIT"),
                    data: vec![1],
                    storage_id: Some(10),
                },
                StoredSlot {
                    key: SlotKey::new(ParameterSetKind::Values, 1, "DIMMER_LEVEL"),
                    data: vec![7],
                    storage_id: Some(11),
                },
            ])
            .await;
        assert_eq!(restored, 1);
        assert_eq!(peer.get_value(1, "INHIBIT").await.unwrap(), ParamValue::Boolean(true));
        assert!(logs_contain("dropping stored VALUES DIMMER_LEVEL of channel 1"));
    }

    #[tokio::test]
    async fn test_store_interface_value_stays_local() {
        let peer = peer();
        peer.set_value(1, "INHIBIT", ParamValue::Boolean(true)).await.unwrap();
        assert_eq!(peer.get_value(1, "INHIBIT").await.unwrap(), ParamValue::Boolean(true));
        assert_eq!(peer.get_value(2, "INHIBIT").await.unwrap(), ParamValue::Boolean(false));
    }

    #[tokio::test]
    async fn test_read_only_value() {
        let peer = peer();
        let err = peer
            .set_value(0, "UNREACH", ParamValue::Boolean(true))
            .await
            .unwrap_err();
        assert!(matches!(err, WiredError::ReadOnly(_)));
        assert!(matches!(
            peer.set_value(9, "STATE", ParamValue::Boolean(true)).await,
            Err(WiredError::UnknownChannel(9))
        ));
    }
}
