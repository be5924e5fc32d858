//! Semantic registry: the metric and dimension catalog.
//!
//! The registry maps business vocabulary to physical schema. It is loaded
//! once (from the built-in catalog or a TOML file) and never mutated; a
//! reload builds a new [`Registry`] and swaps it into a [`SharedRegistry`].
//!
//! Lookups are case-insensitive and synonym-aware:
//!
//! ```
//! use semql::registry::Registry;
//!
//! let registry = Registry::builtin().unwrap();
//! assert_eq!(registry.resolve_metric("Sales").unwrap().name, "secondary_sales_value");
//! assert_eq!(registry.synonym_of("brand"), Some("brand_name"));
//! ```

mod loader;
pub mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use crate::query::Grain;

pub use types::{
    Aggregation, DimensionDef, FactFilter, JoinKey, MetricDef, MetricFormat, ValueType,
};

/// The embedded consumer packaged goods catalog.
pub const BUILTIN_CATALOG: &str = include_str!("../../catalog/cpg.toml");

/// A name that resolves to nothing, directly or through a synonym.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryLookupError {
    #[error("unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("unknown dimension '{0}'")]
    UnknownDimension(String),
}

pub type RegistryResult<T> = Result<T, RegistryLookupError>;

/// A catalog that cannot be turned into a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryLoadError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("'{owner}' joins to '{fact}', which is not the table of any metric")]
    UnknownFact { owner: String, fact: String },

    #[error("metric '{metric}' lists unknown dimension '{dimension}'")]
    UnknownDimension { metric: String, dimension: String },

    #[error("business term '{term}' points at unknown name '{target}'")]
    UnknownTermTarget { term: String, target: String },

    #[error("invalid calendar dimension '{dimension}': {reason}")]
    InvalidCalendar { dimension: String, reason: String },

    #[error("synonym '{term}' maps to both '{first}' and '{second}'")]
    ConflictingSynonym {
        term: String,
        first: String,
        second: String,
    },

    #[error("'{0}' is not a valid SQL identifier")]
    InvalidIdentifier(String),
}

/// Immutable catalog of metrics and dimensions.
#[derive(Debug, Clone)]
pub struct Registry {
    metrics: BTreeMap<String, MetricDef>,
    dimensions: BTreeMap<String, DimensionDef>,
    synonyms: BTreeMap<String, String>,
    calendar: DimensionDef,
    time_dimensions: BTreeMap<Grain, String>,
    facts: BTreeSet<String>,
}

impl Registry {
    /// Load the embedded catalog.
    pub fn builtin() -> Result<Self, RegistryLoadError> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RegistryLoadError> {
        let registry = loader::load_str(content)?;
        registry.log_loaded();
        Ok(registry)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RegistryLoadError> {
        let path = path.as_ref();
        let registry = loader::load_file(path)?;
        tracing::debug!(path = %path.display(), "read catalog file");
        registry.log_loaded();
        Ok(registry)
    }

    fn log_loaded(&self) {
        tracing::info!(
            metrics = self.metrics.len(),
            dimensions = self.dimensions.len(),
            synonyms = self.synonyms.len(),
            "loaded semantic registry"
        );
    }

    fn canonical_key(&self, name: &str) -> String {
        let key = name.trim().to_lowercase();
        match self.synonyms.get(&key) {
            Some(canonical) => canonical.clone(),
            None => key,
        }
    }

    pub fn resolve_metric(&self, name: &str) -> RegistryResult<&MetricDef> {
        self.metrics
            .get(&self.canonical_key(name))
            .ok_or_else(|| RegistryLookupError::UnknownMetric(name.to_string()))
    }

    pub fn resolve_dimension(&self, name: &str) -> RegistryResult<&DimensionDef> {
        self.dimensions
            .get(&self.canonical_key(name))
            .ok_or_else(|| RegistryLookupError::UnknownDimension(name.to_string()))
    }

    /// Canonical name for a term, if the term is a canonical name or a
    /// registered synonym. Never a partial match.
    pub fn synonym_of(&self, term: &str) -> Option<&str> {
        let key = term.trim().to_lowercase();
        if let Some(canonical) = self.synonyms.get(&key) {
            return Some(canonical.as_str());
        }
        self.metrics
            .get_key_value(&key)
            .map(|(k, _)| k.as_str())
            .or_else(|| self.dimensions.get_key_value(&key).map(|(k, _)| k.as_str()))
    }

    /// The dimension the time window filter constrains.
    pub fn calendar_dimension(&self) -> &DimensionDef {
        &self.calendar
    }

    /// First declared time dimension at `grain`.
    pub fn time_dimension_for(&self, grain: Grain) -> Option<&DimensionDef> {
        self.time_dimensions
            .get(&grain)
            .and_then(|name| self.dimensions.get(name))
    }

    pub fn list_metrics(&self) -> impl Iterator<Item = &MetricDef> {
        self.metrics.values()
    }

    pub fn list_dimensions(&self) -> impl Iterator<Item = &DimensionDef> {
        self.dimensions.values()
    }

    /// Fact tables that back at least one metric.
    pub fn facts(&self) -> impl Iterator<Item = &str> {
        self.facts.iter().map(String::as_str)
    }
}

/// Process-wide registry handle with atomic replacement.
///
/// Requests take a [`snapshot`](SharedRegistry::snapshot) at the start and
/// keep using it; a concurrent [`swap`](SharedRegistry::swap) is only seen
/// by requests that start afterwards.
#[derive(Debug, Clone)]
pub struct SharedRegistry {
    current: Arc<RwLock<Arc<Registry>>>,
}

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    pub fn snapshot(&self) -> Arc<Registry> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Install a new registry, returning the one it replaced.
    pub fn swap(&self, registry: Registry) -> Arc<Registry> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *guard, Arc::new(registry));
        tracing::info!("semantic registry swapped");
        previous
    }
}

impl From<Registry> for SharedRegistry {
    fn from(registry: Registry) -> Self {
        Self::new(registry)
    }
}
