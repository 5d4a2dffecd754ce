//! Per-unit static configuration.
//!
//! A catalog file maps unit names to the ports, environment entries,
//! secrets, volumes and resource limits that end up in the deployment
//! manifests. Units without an entry fall back to the catalog's
//! `defaults` entry, and then to [`UnitConfig::default`].
//!
//! ```json
//! {
//!   "defaults": { "volumes": ["log:/opt/sas/viya/config/var/log"] },
//!   "units": {
//!     "httpproxy": { "ports": ["80:80", "443:443"] }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Log volume every unit gets when nothing else is configured.
pub const DEFAULT_LOG_VOLUME: &str = "log:/opt/sas/viya/config/var/log";

/// Resource limits and requests for a unit's pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub limits: Vec<String>,
    #[serde(default)]
    pub requests: Vec<String>,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty() && self.requests.is_empty()
    }
}

/// Static configuration for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitConfig {
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Additional provisioning roles applied while building the image.
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub resources: Resources,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            environment: Vec::new(),
            secrets: Vec::new(),
            roles: Vec::new(),
            volumes: vec![DEFAULT_LOG_VOLUME.to_string()],
            resources: Resources::default(),
        }
    }
}

/// All unit configurations for one deployment type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitCatalog {
    #[serde(default)]
    pub defaults: Option<UnitConfig>,
    #[serde(default)]
    pub units: HashMap<String, UnitConfig>,
}

impl UnitCatalog {
    /// Parse a catalog from its JSON text.
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text).map_err(|e| CoreError::Catalog(e.to_string()))
    }

    /// Load a catalog file. A missing file yields an empty catalog.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(CoreError::Catalog(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Configuration for `unit`, falling back to the catalog defaults.
    pub fn resolve(&self, unit: &str) -> UnitConfig {
        self.units
            .get(unit)
            .or(self.defaults.as_ref())
            .cloned()
            .unwrap_or_default()
    }
}
