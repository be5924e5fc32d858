//! TOML-based configuration for semql.
//!
//! Supports a config file (semql.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [registry]
//! catalog = "${SEMQL_HOME}/catalog.toml"
//!
//! [compiler]
//! default_dialect = "postgres"
//! dialects = ["postgres", "duckdb"]
//!
//! [validation]
//! max_group_by = 4
//! max_limit = 10000
//! low_confidence_threshold = 0.5
//!
//! [security]
//! region = "zone_name"
//! state = "state_name"
//! territory = "district_name"
//! national_roles = ["admin", "executive"]
//!
//! [security.hierarchy]
//! so = "so_code"
//! asm = "asm_code"
//! zsm = "zsm_code"
//! nsm = "nsm_code"
//!
//! [diagnostics]
//! candidate_dimensions = ["brand_name", "state_name", "channel_name"]
//! max_candidates = 3
//! drill_down = true
//!
//! [audit]
//! path = "logs/audit.jsonl"
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::security::{AccessLevel, HierarchyLevel, Role};
use crate::sql::Dialect;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub registry: RegistrySettings,
    pub compiler: CompilerSettings,
    pub validation: ValidationSettings,
    pub security: SecuritySettings,
    pub diagnostics: DiagnosticSettings,
    pub audit: AuditSettings,
}

/// Catalog source.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// External catalog file (supports ${ENV_VAR} expansion). The built-in
    /// catalog is used when unset.
    pub catalog: Option<String>,
}

/// Compiler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompilerSettings {
    /// Dialect used when a request does not name one.
    pub default_dialect: Dialect,

    /// Dialects with a registered renderer.
    pub dialects: Vec<Dialect>,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            default_dialect: Dialect::DuckDb,
            dialects: Dialect::ALL.to_vec(),
        }
    }
}

/// Hard ceiling on group-by dimensions; settings may only lower it.
pub const MAX_GROUP_BY_CEILING: usize = 4;

/// Validator limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Maximum number of group-by dimensions.
    pub max_group_by: usize,

    /// Maximum row limit a query may request.
    pub max_limit: u64,

    /// Upstream confidence below which a warning is attached.
    pub low_confidence_threshold: f64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            max_group_by: MAX_GROUP_BY_CEILING,
            max_limit: 10_000,
            low_confidence_threshold: 0.5,
        }
    }
}

/// Row-level security policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Dimension constrained for region-level users.
    pub region: String,

    /// Dimension constrained for state-level users.
    pub state: String,

    /// Dimension constrained for territory-level users.
    pub territory: String,

    /// Roles allowed to hold national (unfiltered) scope.
    pub national_roles: Vec<Role>,

    /// Dimensions constrained for users in the sales hierarchy.
    pub hierarchy: HierarchySettings,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            region: "zone_name".to_string(),
            state: "state_name".to_string(),
            territory: "district_name".to_string(),
            national_roles: vec![Role::Admin, Role::Executive],
            hierarchy: HierarchySettings::default(),
        }
    }
}

/// One dimension per sales hierarchy level.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HierarchySettings {
    pub so: String,
    pub asm: String,
    pub zsm: String,
    pub nsm: String,
}

impl Default for HierarchySettings {
    fn default() -> Self {
        Self {
            so: "so_code".to_string(),
            asm: "asm_code".to_string(),
            zsm: "zsm_code".to_string(),
            nsm: "nsm_code".to_string(),
        }
    }
}

impl SecuritySettings {
    /// Dimension bound to an access level, `None` for national scope.
    pub fn dimension_for(&self, level: AccessLevel) -> Option<&str> {
        match level {
            AccessLevel::National => None,
            AccessLevel::Region => Some(&self.region),
            AccessLevel::State => Some(&self.state),
            AccessLevel::Territory => Some(&self.territory),
        }
    }

    /// Dimension bound to a sales hierarchy level.
    pub fn hierarchy_dimension(&self, level: HierarchyLevel) -> &str {
        match level {
            HierarchyLevel::So => &self.hierarchy.so,
            HierarchyLevel::Asm => &self.hierarchy.asm,
            HierarchyLevel::Zsm => &self.hierarchy.zsm,
            HierarchyLevel::Nsm => &self.hierarchy.nsm,
        }
    }
}

/// Diagnostic plan generation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiagnosticSettings {
    /// Dimensions tried, in order, for contribution analysis.
    pub candidate_dimensions: Vec<String>,

    /// Upper bound on the dimensions a plan measures, caller's first.
    pub max_candidates: usize,

    /// Whether to add a drill-down step into the top contributor.
    pub drill_down: bool,
}

impl Default for DiagnosticSettings {
    fn default() -> Self {
        Self {
            candidate_dimensions: vec![
                "brand_name".to_string(),
                "state_name".to_string(),
                "channel_name".to_string(),
            ],
            max_candidates: 3,
            drill_down: true,
        }
    }
}

/// Audit trail destination.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditSettings {
    /// JSON-lines file (supports ${ENV_VAR} expansion). Records go to the
    /// tracing log when unset.
    pub path: Option<String>,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// Parse settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content)?;
        settings.check()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `SEMQL_CONFIG`
    /// 2. `./semql.toml`
    /// 3. `~/.config/semql/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("SEMQL_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("semql.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("semql").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    fn check(&self) -> Result<(), SettingsError> {
        if !(1..=MAX_GROUP_BY_CEILING).contains(&self.validation.max_group_by) {
            return Err(SettingsError::InvalidConfig(format!(
                "validation.max_group_by must be between 1 and {}",
                MAX_GROUP_BY_CEILING
            )));
        }
        if self.diagnostics.max_candidates == 0 {
            return Err(SettingsError::InvalidConfig(
                "diagnostics.max_candidates must be at least 1".to_string(),
            ));
        }
        if !self.compiler.dialects.contains(&self.compiler.default_dialect) {
            return Err(SettingsError::InvalidConfig(format!(
                "compiler.default_dialect '{}' is not in compiler.dialects",
                self.compiler.default_dialect
            )));
        }
        Ok(())
    }

    /// Catalog path with environment variables expanded.
    pub fn catalog_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        self.registry
            .catalog
            .as_deref()
            .map(|p| expand_env_vars(p).map(PathBuf::from))
            .transpose()
    }

    /// Audit log path with environment variables expanded.
    pub fn audit_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        self.audit
            .path
            .as_deref()
            .map(|p| expand_env_vars(p).map(PathBuf::from))
            .transpose()
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let var_name: String = if chars.next_if_eq(&'{').is_some() {
            let name = std::iter::from_fn(|| chars.next_if(|ch| *ch != '}')).collect();
            if chars.next_if_eq(&'}').is_none() {
                return Err(SettingsError::InvalidConfig(format!(
                    "unterminated variable reference in '{}'",
                    s
                )));
            }
            name
        } else {
            std::iter::from_fn(|| chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_'))
                .collect()
        };

        if var_name.is_empty() {
            // Just a lone $, keep it
            result.push('$');
            continue;
        }
        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
