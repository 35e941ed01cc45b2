use thiserror::Error;

/// Invalid declarative input. Fatal: raised before any step executes.
///
/// Validation collects every violation it finds rather than stopping at
/// the first, so a misconfigured matrix can be fixed in one pass.
#[derive(Debug, Clone, Error)]
#[error("invalid configuration:\n  {}", violations.join("\n  "))]
pub struct ConfigError {
    /// Human-readable descriptions of every violation found.
    pub violations: Vec<String>,
}

impl ConfigError {
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }

    /// Wrap a document parse failure as a single-violation error.
    pub fn parse(err: impl std::fmt::Display) -> Self {
        Self {
            violations: vec![format!("document parse error: {err}")],
        }
    }
}

/// Errors surfaced while loading the run's declarative input.
///
/// A failing step command is never an error: it is captured into the
/// step's attempt record. Resource shortages and execution faults
/// likewise travel through report statuses, not this type.
#[derive(Debug, Error)]
pub enum GauntletError {
    /// Malformed or invalid matrix/catalog document.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unreadable matrix/catalog document.
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
