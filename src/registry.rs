//! Machine bookkeeping for a single environment.
//!
//! The registry is the authoritative list of machines that destroy must
//! clean up. It lives inside the caller-owned state so a later process can
//! tear down machines created by an earlier one. Alongside it, the
//! [`MachineCatalog`] maps machine names to plain [`MachineInfo`] records for
//! test suites that need a machine's address.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised when building registry values.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Raised when a machine identifier is blank.
    #[error("machine identifier must not be empty")]
    EmptyMachineId,
}

/// Opaque, stable identifier of a provisioned machine.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineId(String);

impl MachineId {
    /// Builds an identifier, trimming surrounding whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::EmptyMachineId`] when the trimmed value is
    /// empty.
    pub fn new(value: impl Into<String>) -> Result<Self, RegistryError> {
        let raw = value.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(RegistryError::EmptyMachineId);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MachineId {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MachineId> for String {
    fn from(value: MachineId) -> Self {
        value.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MachineId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Set of machines known to exist for the current environment.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineRegistry {
    machines: BTreeSet<MachineId>,
}

impl MachineRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a machine, returning `false` when it was already present.
    pub fn record(&mut self, machine: MachineId) -> bool {
        self.machines.insert(machine)
    }

    /// Records every machine yielded by `machines`, collapsing duplicates.
    pub fn record_all(&mut self, machines: impl IntoIterator<Item = MachineId>) {
        self.machines.extend(machines);
    }

    /// Forgets a machine, returning `true` when it was present.
    pub fn forget(&mut self, machine: &MachineId) -> bool {
        self.machines.remove(machine)
    }

    /// Looks a machine up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MachineId> {
        self.machines.iter().find(|machine| machine.as_str() == name)
    }

    /// Whether no machines are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Number of recorded machines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Iterates recorded machines.
    pub fn iter(&self) -> impl Iterator<Item = &MachineId> {
        self.machines.iter()
    }

    /// Removes every machine.
    pub fn clear(&mut self) {
        self.machines.clear();
    }

    /// Machine names as plain strings.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.machines
            .iter()
            .map(|machine| machine.as_str().to_owned())
            .collect()
    }
}

impl FromIterator<MachineId> for MachineRegistry {
    fn from_iter<T: IntoIterator<Item = MachineId>>(iter: T) -> Self {
        Self {
            machines: iter.into_iter().collect(),
        }
    }
}

/// Addressing details of a provisioned machine.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Machine name as declared by the recipe.
    pub name: String,
    /// Short hostname reported by the machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Fully qualified domain name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
    /// Primary IPv4 address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipaddress: Option<String>,
    /// Primary IPv6 address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6address: Option<String>,
}

impl MachineInfo {
    /// Extracts machine details from resource attributes.
    ///
    /// Values are read from the top level of `attributes` first and then
    /// from a nested `automatic` object, which is where node data reported
    /// by the machine itself ends up.
    #[must_use]
    pub fn from_attributes(name: &str, attributes: &BTreeMap<String, Value>) -> Self {
        let lookup = |key: &str| {
            attributes
                .get(key)
                .and_then(Value::as_str)
                .or_else(|| {
                    attributes
                        .get("automatic")
                        .and_then(|automatic| automatic.get(key))
                        .and_then(Value::as_str)
                })
                .map(str::to_owned)
        };
        Self {
            name: name.to_owned(),
            hostname: lookup("hostname"),
            fqdn: lookup("fqdn"),
            ipaddress: lookup("ipaddress"),
            ipv6address: lookup("ipv6address"),
        }
    }

    /// Best address to reach the machine at.
    #[must_use]
    pub fn address(&self) -> &str {
        self.ipaddress
            .as_deref()
            .or(self.fqdn.as_deref())
            .or(self.hostname.as_deref())
            .unwrap_or(&self.name)
    }
}

/// Name-keyed lookup of [`MachineInfo`] records.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineCatalog {
    entries: BTreeMap<String, MachineInfo>,
}

impl MachineCatalog {
    /// Inserts or replaces the record for `info.name`.
    pub fn insert(&mut self, info: MachineInfo) {
        self.entries.insert(info.name.clone(), info);
    }

    /// Looks a machine up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MachineInfo> {
        self.entries.get(name)
    }

    /// Removes the record for `name`.
    pub fn remove(&mut self, name: &str) -> Option<MachineInfo> {
        self.entries.remove(name)
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether the catalogue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("")]
    #[case("   ")]
    fn machine_id_rejects_blank_values(#[case] value: &str) {
        assert_eq!(MachineId::new(value), Err(RegistryError::EmptyMachineId));
    }

    #[rstest]
    fn machine_id_trims_whitespace() {
        let id = MachineId::new("  web1 ").expect("valid id");
        assert_eq!(id.as_str(), "web1");
    }

    #[rstest]
    fn registry_collapses_duplicates() {
        let mut registry = MachineRegistry::new();
        assert!(registry.record(MachineId::new("web1").expect("id")));
        assert!(!registry.record(MachineId::new("web1").expect("id")));
        registry.record_all([
            MachineId::new("web2").expect("id"),
            MachineId::new("web1").expect("id"),
        ]);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["web1", "web2"]);
    }

    #[rstest]
    fn registry_serialises_as_string_array() {
        let registry: MachineRegistry = ["b", "a"]
            .into_iter()
            .map(|name| MachineId::new(name).expect("id"))
            .collect();
        let value = serde_json::to_value(&registry).expect("serialise");
        assert_eq!(value, json!(["a", "b"]));
    }

    #[rstest]
    fn registry_rejects_blank_names_when_deserialising() {
        let result = serde_json::from_value::<MachineRegistry>(json!(["web1", " "]));
        assert!(result.is_err(), "blank machine names should be rejected");
    }

    #[rstest]
    fn machine_info_reads_nested_automatic_attributes() {
        let attributes: BTreeMap<String, Value> = serde_json::from_value(json!({
            "automatic": {"hostname": "web1", "ipaddress": "10.0.0.5"},
            "fqdn": "web1.example.test"
        }))
        .expect("attributes");

        let info = MachineInfo::from_attributes("web1", &attributes);

        assert_eq!(info.hostname.as_deref(), Some("web1"));
        assert_eq!(info.fqdn.as_deref(), Some("web1.example.test"));
        assert_eq!(info.address(), "10.0.0.5");
    }

    #[rstest]
    fn machine_info_address_falls_back_to_name() {
        let info = MachineInfo::from_attributes("db", &BTreeMap::new());
        assert_eq!(info.address(), "db");
    }
}
