//! Physical network to distributed switch mapping.
//!
//! The map is built once at startup from the `network_maps` option and is
//! read-only afterwards. Every network and port hook resolves its segment to a
//! switch through [`NetworkMap::lookup`].

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::backend::DvsBackend;
use crate::error::{DvsError, DvsResult};
use crate::types::{NetworkSegment, NetworkType};

/// Errors raised while parsing `physnet:dvs` mapping entries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    /// The entry is not of the form `key:value`.
    #[error("Invalid mapping: '{0}'")]
    Malformed(String),

    /// The key part is empty.
    #[error("Missing key in mapping: '{0}'")]
    MissingKey(String),

    /// The value part is empty.
    #[error("Missing value in mapping: '{0}'")]
    MissingValue(String),

    /// The same physical network appears twice.
    #[error("Key {0} in mapping is not unique")]
    DuplicateKey(String),

    /// The same switch appears twice.
    #[error("Value {0} in mapping is not unique")]
    DuplicateValue(String),
}

/// Parses a list of `physnet:dvs_name` entries into a map.
///
/// Blank entries are skipped. Keys and values must both be unique.
pub fn parse_mappings<S: AsRef<str>>(
    entries: &[S],
) -> Result<BTreeMap<String, String>, MappingError> {
    let mut mappings = BTreeMap::new();
    for entry in entries {
        let entry = entry.as_ref().trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry
            .split_once(':')
            .ok_or_else(|| MappingError::Malformed(entry.to_string()))?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() {
            return Err(MappingError::MissingKey(entry.to_string()));
        }
        if value.is_empty() {
            return Err(MappingError::MissingValue(entry.to_string()));
        }
        if mappings.contains_key(key) {
            return Err(MappingError::DuplicateKey(key.to_string()));
        }
        if mappings.values().any(|v: &String| v == value) {
            return Err(MappingError::DuplicateValue(value.to_string()));
        }
        mappings.insert(key.to_string(), value.to_string());
    }
    Ok(mappings)
}

/// Read-only mapping from physical network name to switch handle.
#[derive(Clone, Default)]
pub struct NetworkMap {
    inner: BTreeMap<String, Arc<dyn DvsBackend>>,
}

impl NetworkMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the map from parsed mappings, connecting each switch with
    /// `connect`.
    pub fn from_mappings<F>(mappings: &BTreeMap<String, String>, mut connect: F) -> DvsResult<Self>
    where
        F: FnMut(&str) -> DvsResult<Arc<dyn DvsBackend>>,
    {
        let mut map = Self::new();
        for (physnet, dvs_name) in mappings {
            map.insert(physnet.clone(), connect(dvs_name)?);
        }
        Ok(map)
    }

    /// Adds a switch for a physical network.
    pub fn insert(&mut self, physical_network: impl Into<String>, dvs: Arc<dyn DvsBackend>) {
        self.inner.insert(physical_network.into(), dvs);
    }

    /// Returns the switch mapped to a physical network.
    pub fn get(&self, physical_network: &str) -> Option<&Arc<dyn DvsBackend>> {
        self.inner.get(physical_network)
    }

    /// Returns the number of mapped physical networks.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if no physical network is mapped.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates over `(physical_network, switch)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn DvsBackend>)> {
        self.inner.iter()
    }

    /// Iterates over the mapped switches.
    pub fn backends(&self) -> impl Iterator<Item = &Arc<dyn DvsBackend>> {
        self.inner.values()
    }

    /// Resolves a segment to the switch that backs it.
    ///
    /// Only VLAN segments are managed. A VLAN segment without a physical
    /// network is an invalid network.
    pub fn lookup(&self, segment: &NetworkSegment) -> DvsResult<Arc<dyn DvsBackend>> {
        if segment.network_type != NetworkType::Vlan {
            return Err(DvsError::unsupported_network_type(
                segment.network_type.as_str(),
            ));
        }
        let physical_network = segment
            .physical_network
            .as_deref()
            .ok_or_else(|| DvsError::invalid_network("VLAN segment has no physical network"))?;
        match self.inner.get(physical_network) {
            Some(dvs) => Ok(Arc::clone(dvs)),
            None => {
                debug!("No dvs mapped for physical network: {}", physical_network);
                Err(DvsError::no_dvs(physical_network))
            }
        }
    }
}

impl std::fmt::Debug for NetworkMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.inner.iter().map(|(k, v)| (k, v.name())))
            .finish()
    }
}
