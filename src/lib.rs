//! # semql
//!
//! A governed semantic query core: structured business questions in,
//! validated and access-controlled SQL out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           StructuredQuery (from an intent parser)        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [patterns]
//! ┌─────────────────────────────────────────────────────────┐
//! │   one query / comparison pair / diagnostic plan          │
//! └─────────────────────────────────────────────────────────┘
//!                          │ each query
//!                          ▼ [validation] → [security]
//! ┌─────────────────────────────────────────────────────────┐
//! │        SecuredQuery (certified + row-level filters)      │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [compiler]
//! ┌─────────────────────────────────────────────────────────┐
//! │   QueryAst → parameterized SQL per dialect + params      │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [orchestrator] / QueryExecutor
//! ┌─────────────────────────────────────────────────────────┐
//! │     rows → comparison / diagnostic finding → audit       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`registry`] underneath everything is read-only for the lifetime
//! of a request.

pub mod analysis;
pub mod audit;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod patterns;
pub mod query;
pub mod registry;
pub mod security;
pub mod sql;
pub mod validation;

pub use engine::{Answer, CompileOptions, Engine, Pipeline};
pub use error::{ErrorKind, SemqlError, SemqlResult};
pub use query::StructuredQuery;
pub use registry::{Registry, SharedRegistry};
pub use security::UserContext;
pub use sql::Dialect;
