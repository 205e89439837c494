//! Device description model for the wired hub
//!
//! Provides:
//! - Logical values and their contracts (`value`, `logical`)
//! - Conversion chain between raw integers and logical values (`conversion`)
//! - Bit-level placement and the parameter byte codec (`bits`, `physical`, `parameter`)
//! - Device description documents read from XML (`device`, `channel`, `frame`, `xml`)
//! - Registry resolving a description from wire observations (`registry`)

pub mod bits;
pub mod channel;
pub mod conversion;
pub mod device;
pub mod error;
pub mod frame;
pub mod logical;
pub mod parameter;
pub mod paramset;
pub mod physical;
pub mod registry;
pub mod value;
pub mod xml;

pub use bits::{BitAddress, BitSize};
pub use channel::DeviceChannel;
pub use conversion::Conversion;
pub use device::{DeviceDescription, DeviceType};
pub use error::{ModelError, Result};
pub use frame::{DeviceFrame, PacketFields};
pub use logical::LogicalParameter;
pub use parameter::Parameter;
pub use paramset::{ParameterSet, ParameterSetKind};
pub use physical::{Interface, PhysicalParameter};
pub use registry::DescriptionRegistry;
pub use value::ParamValue;
