//! Parameter sets (MASTER / VALUES / LINK)

use crate::bits::BitAddress;
use crate::error::{ModelError, Result};
use crate::parameter::Parameter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParameterSetKind {
    Master,
    Values,
    Link,
}

impl ParameterSetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterSetKind::Master => "MASTER",
            ParameterSetKind::Values => "VALUES",
            ParameterSetKind::Link => "LINK",
        }
    }
}

impl fmt::Display for ParameterSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParameterSetKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MASTER" | "master" => Ok(ParameterSetKind::Master),
            "VALUES" | "values" => Ok(ParameterSetKind::Values),
            "LINK" | "link" => Ok(ParameterSetKind::Link),
            other => Err(ModelError::UnknownParameterSet(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    pub id: String,
    pub kind: ParameterSetKind,
    pub parameters: Vec<Parameter>,
    /// First configuration byte for relative addresses
    pub address_start: Option<u32>,
    /// Bytes between consecutive channels (or link slots)
    pub address_step: Option<u32>,
    /// Number of address slots; zero means unbounded
    pub count: u32,
    pub channel_offset: Option<BitAddress>,
    pub peer_address_offset: Option<BitAddress>,
    pub peer_channel_offset: Option<BitAddress>,
    /// `paramset_defs` ids merged in after load
    pub subset_refs: Vec<String>,
    /// Named default value sets, function -> parameter id -> text
    pub default_values: BTreeMap<String, BTreeMap<String, String>>,
}

impl ParameterSet {
    pub fn new(kind: ParameterSetKind) -> Self {
        Self {
            id: String::new(),
            kind,
            parameters: Vec::new(),
            address_start: None,
            address_step: None,
            count: 0,
            channel_offset: None,
            peer_address_offset: None,
            peer_channel_offset: None,
            subset_refs: Vec::new(),
            default_values: BTreeMap::new(),
        }
    }

    pub fn parameter(&self, id: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.id == id)
    }

    pub fn parameter_mut(&mut self, id: &str) -> Option<&mut Parameter> {
        self.parameters.iter_mut().find(|p| p.id == id)
    }

    /// Parameters whose physical id or value id matches `name`
    pub fn find_by_physical(&self, name: &str) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|p| p.physical.id == name || p.physical.value_id == name)
    }

    /// Parameters listed by paramset reads: named, not hidden, with a reported flag
    pub fn reported(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters
            .iter()
            .filter(|p| !p.id.is_empty() && !p.hidden && p.ui_flags.is_reported())
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::parameter::UiFlags;

    #[test]
    fn test_kind_parse() {
        assert_eq!("MASTER".parse::<ParameterSetKind>().unwrap(), ParameterSetKind::Master);
        assert!(matches!(
            "PEER".parse::<ParameterSetKind>(),
            Err(ModelError::UnknownParameterSet(_))
        ));
    }

    #[test]
    fn test_reported_filter() {
        let mut set = ParameterSet::new(ParameterSetKind::Values);
        set.parameters.push(Parameter::new("STATE"));
        let mut hidden = Parameter::new("SECRET");
        hidden.hidden = true;
        set.parameters.push(hidden);
        let mut flagless = Parameter::new("RAW");
        flagless.ui_flags = UiFlags::none();
        set.parameters.push(flagless);
        set.parameters.push(Parameter::new(""));

        let ids: Vec<_> = set.reported().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["STATE"]);
    }
}
