//! Configuration module for semql.
//!
//! Handles the settings file and environment variable expansion.

mod settings;

pub use settings::{
    expand_env_vars, AuditSettings, CompilerSettings, DiagnosticSettings, HierarchySettings,
    RegistrySettings, SecuritySettings, Settings, SettingsError, ValidationSettings,
    MAX_GROUP_BY_CEILING,
};
