use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, GauntletError};
use crate::flavor::{FlavorCatalog, FlavorId};

/// One command execution bound to a flavor.
///
/// Steps are immutable once loaded. Environment overrides are part of
/// the data model rather than baked into the command string, so each
/// step's environment scoping is enforced structurally.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub flavor: FlavorId,
    pub command: String,
    /// Required tensor-parallel degree; must fit the flavor's width.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tp_degree: Option<u8>,
    /// Per-step environment overrides, applied to a snapshot of the
    /// parent environment. Never mutates the orchestrator's own env.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Opaque execution-path tag (e.g. `v0`/`v1`), exported to the
    /// child environment as `GAUNTLET_VARIANT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// An ordered phase of the run containing independent steps.
///
/// Stages execute strictly in document order; steps within a stage are
/// independent and run concurrently subject to flavor capacity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub steps: Vec<Step>,
}

/// The immutable job graph produced by the config loader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestMatrix {
    pub stages: Vec<Stage>,
}

#[derive(Debug, Deserialize)]
struct RawMatrix {
    stages: Vec<Stage>,
}

impl TestMatrix {
    /// Parse a `stages:` document and validate it against the catalog.
    ///
    /// Produces the immutable job graph with no side effects. All
    /// violations are collected into a single [`ConfigError`]:
    /// duplicate or empty step names within a stage, unknown flavor
    /// references, empty commands, and tensor-parallel degrees wider
    /// than the flavor supports.
    pub fn from_yaml(doc: &str, catalog: &FlavorCatalog) -> Result<Self, ConfigError> {
        let raw: RawMatrix = serde_yaml::from_str(doc).map_err(ConfigError::parse)?;
        let matrix = Self { stages: raw.stages };
        matrix.validate(catalog)?;
        Ok(matrix)
    }

    /// Read and parse a matrix document from disk.
    pub fn load(path: impl AsRef<Path>, catalog: &FlavorCatalog) -> Result<Self, GauntletError> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path).map_err(|source| GauntletError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_yaml(&doc, catalog)?)
    }

    /// Validate an already-constructed matrix against the catalog.
    pub fn validate(&self, catalog: &FlavorCatalog) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                violations.push("stage with empty name".to_string());
            }
            let mut seen = HashSet::new();
            for step in &stage.steps {
                if step.name.trim().is_empty() {
                    violations.push(format!("stage `{}`: step with empty name", stage.name));
                } else if !seen.insert(step.name.as_str()) {
                    violations.push(format!(
                        "stage `{}`: duplicate step name `{}`",
                        stage.name, step.name
                    ));
                }
                if step.command.trim().is_empty() {
                    violations.push(format!(
                        "stage `{}`: step `{}` has an empty command",
                        stage.name, step.name
                    ));
                }
                match catalog.get(&step.flavor) {
                    None => violations.push(format!(
                        "stage `{}`: step `{}` references unknown flavor `{}`",
                        stage.name, step.name, step.flavor
                    )),
                    Some(flavor) => {
                        if let Some(tp) = step.tp_degree {
                            if tp > flavor.tp_width {
                                violations.push(format!(
                                    "stage `{}`: step `{}` requires tp_degree {} but flavor `{}` supports at most {}",
                                    stage.name, step.name, tp, flavor.id, flavor.tp_width
                                ));
                            }
                        }
                    }
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::new(violations))
        }
    }

    /// Total number of steps across all stages.
    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|s| s.steps.len()).sum()
    }
}
