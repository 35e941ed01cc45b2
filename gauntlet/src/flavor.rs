use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use std::path::Path;

use crate::error::{ConfigError, GauntletError};

/// Identifier of a hardware resource class (e.g. `g3`, `g3.s`, `g2.m`).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlavorId(pub String);

impl FlavorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FlavorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FlavorId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A hardware resource class with finite concurrent capacity.
///
/// Flavors are immutable once the catalog is loaded. `capacity` is the
/// maximum number of concurrently held leases; `tp_width` is the widest
/// tensor-parallel degree a machine of this flavor can satisfy.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Flavor {
    pub id: FlavorId,
    pub capacity: usize,
    pub tp_width: u8,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    flavors: Vec<RawFlavor>,
}

#[derive(Debug, Deserialize)]
struct RawFlavor {
    name: String,
    capacity: usize,
    #[serde(default = "default_tp_width")]
    tp_width: u8,
}

fn default_tp_width() -> u8 {
    1
}

/// Immutable catalog of known flavors, loaded once at startup.
///
/// The catalog is supplied separately from the test matrix (a companion
/// YAML document) and is the authority the matrix's flavor references
/// are validated against.
#[derive(Clone, Debug, Default)]
pub struct FlavorCatalog {
    flavors: BTreeMap<FlavorId, Flavor>,
}

impl FlavorCatalog {
    /// Parse and validate a `flavors:` document.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] listing every violation: unparseable
    /// document, empty flavor name, or duplicate flavor name.
    pub fn from_yaml(doc: &str) -> Result<Self, ConfigError> {
        let raw: RawCatalog = serde_yaml::from_str(doc).map_err(ConfigError::parse)?;
        Self::from_entries(raw.flavors)
    }

    /// Read and parse a catalog document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GauntletError> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path).map_err(|source| GauntletError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_yaml(&doc)?)
    }

    fn from_entries(entries: Vec<RawFlavor>) -> Result<Self, ConfigError> {
        let mut violations = Vec::new();
        let mut flavors = BTreeMap::new();

        for entry in entries {
            if entry.name.trim().is_empty() {
                violations.push("flavor with empty name".to_string());
                continue;
            }
            let id = FlavorId::new(entry.name.clone());
            if flavors.contains_key(&id) {
                violations.push(format!("duplicate flavor `{}`", entry.name));
                continue;
            }
            flavors.insert(
                id.clone(),
                Flavor {
                    id,
                    capacity: entry.capacity,
                    tp_width: entry.tp_width.max(1),
                },
            );
        }

        if violations.is_empty() {
            Ok(Self { flavors })
        } else {
            Err(ConfigError::new(violations))
        }
    }

    /// Build a catalog directly from flavor definitions (used by tests
    /// and embedding callers).
    pub fn from_flavors(flavors: impl IntoIterator<Item = Flavor>) -> Self {
        Self {
            flavors: flavors.into_iter().map(|f| (f.id.clone(), f)).collect(),
        }
    }

    pub fn get(&self, id: &FlavorId) -> Option<&Flavor> {
        self.flavors.get(id)
    }

    pub fn contains(&self, id: &FlavorId) -> bool {
        self.flavors.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flavor> {
        self.flavors.values()
    }

    pub fn len(&self) -> usize {
        self.flavors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flavors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_catalog_with_defaults() {
        let doc = r#"
flavors:
  - name: g3
    capacity: 4
    tp_width: 8
  - name: g3.s
    capacity: 2
"#;
        let catalog = FlavorCatalog::from_yaml(doc).unwrap();
        assert_eq!(catalog.len(), 2);
        let g3 = catalog.get(&FlavorId::from("g3")).unwrap();
        assert_eq!(g3.capacity, 4);
        assert_eq!(g3.tp_width, 8);
        // tp_width defaults to 1
        let g3s = catalog.get(&FlavorId::from("g3.s")).unwrap();
        assert_eq!(g3s.tp_width, 1);
    }

    #[test]
    fn duplicate_and_empty_names_collected_together() {
        let doc = r#"
flavors:
  - name: g2
    capacity: 1
  - name: g2
    capacity: 2
  - name: ""
    capacity: 1
"#;
        let err = FlavorCatalog::from_yaml(doc).unwrap_err();
        assert_eq!(err.violations.len(), 2);
    }

    #[test]
    fn malformed_document_is_parse_error() {
        let err = FlavorCatalog::from_yaml("flavors: 12").unwrap_err();
        assert!(err.to_string().contains("parse error"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = FlavorCatalog::load("/nonexistent/flavors.yaml").unwrap_err();
        assert!(matches!(err, GauntletError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/flavors.yaml"));
    }
}
