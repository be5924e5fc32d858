//! Top-level error taxonomy.
//!
//! Each pipeline stage owns its error enum; [`SemqlError`] wraps them so a
//! request-level caller can propagate any stage failure with `?` and the
//! audit trail can classify it through [`SemqlError::kind`].

use std::fmt;

use crate::compiler::CompilationError;
use crate::config::SettingsError;
use crate::orchestrator::{ExecutionError, OrchestrationError};
use crate::patterns::PatternError;
use crate::registry::{RegistryLoadError, RegistryLookupError};
use crate::security::SecurityError;
use crate::validation::ValidationFailed;

/// Result type for request-level operations.
pub type SemqlResult<T> = Result<T, SemqlError>;

/// Any failure a request can end with.
#[derive(Debug, thiserror::Error)]
pub enum SemqlError {
    #[error(transparent)]
    Registry(#[from] RegistryLookupError),

    #[error(transparent)]
    RegistryLoad(#[from] RegistryLoadError),

    #[error(transparent)]
    Validation(#[from] ValidationFailed),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Compilation(#[from] CompilationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Config(#[from] SettingsError),
}

impl SemqlError {
    /// Stable classification used in audit records and logs.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SemqlError::Registry(_) | SemqlError::RegistryLoad(_) => ErrorKind::RegistryLookup,
            SemqlError::Validation(_) => ErrorKind::Validation,
            SemqlError::Security(_) => ErrorKind::Security,
            SemqlError::Compilation(_) => ErrorKind::Compilation,
            SemqlError::Execution(_) => ErrorKind::Execution,
            SemqlError::Orchestration(_) | SemqlError::Pattern(_) => ErrorKind::Orchestration,
            SemqlError::Config(_) => ErrorKind::Configuration,
        }
    }
}

/// Error family, as recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RegistryLookup,
    Validation,
    Security,
    Compilation,
    Execution,
    Orchestration,
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::RegistryLookup => "registry_lookup",
            ErrorKind::Validation => "validation",
            ErrorKind::Security => "security",
            ErrorKind::Compilation => "compilation",
            ErrorKind::Execution => "execution",
            ErrorKind::Orchestration => "orchestration",
            ErrorKind::Configuration => "configuration",
        };
        write!(f, "{}", name)
    }
}
