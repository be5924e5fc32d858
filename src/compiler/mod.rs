//! Compilation of secured queries to parameterized SQL.
//!
//! ```text
//! SecuredQuery → [AstBuilder] → QueryAst → [RendererRegistry] → CompiledStatement
//! ```
//!
//! The builder only takes a [`SecuredQuery`], which only the row-level
//! security layer can produce, which in turn only accepts a query the
//! validator certified. Identifiers in the output come from the registry;
//! every filter value is a bound parameter.

pub mod ast;
mod builder;
mod fingerprint;
mod render;

pub use ast::{
    AggregateExpression, Clause, ColumnRef, Join, Operand, OrderItem, OrderTarget, Param,
    Predicate, QueryAst, SelectItem,
};
pub use builder::AstBuilder;
pub use fingerprint::fingerprint;
pub use render::{render, RenderedSql, RendererRegistry};

use chrono::NaiveDate;
use serde::Serialize;

use crate::query::{FilterOp, WindowError};
use crate::registry::{Registry, RegistryLookupError};
use crate::security::SecuredQuery;
use crate::sql::Dialect;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompilationError {
    #[error("cannot join dimension '{dimension}' to '{fact}': {reason}")]
    UnresolvableJoin {
        dimension: String,
        fact: String,
        reason: String,
    },

    #[error("no renderer registered for dialect '{0}'")]
    UnsupportedDialect(String),

    #[error(transparent)]
    Registry(#[from] RegistryLookupError),

    #[error("time window: {0}")]
    TimeWindow(WindowError),

    #[error("invalid value for '{column}': {reason}")]
    InvalidValue { column: String, reason: String },

    #[error("operator '{operator}' has the wrong operand shape on '{column}'")]
    MalformedPredicate { column: String, operator: FilterOp },

    #[error("failed to fingerprint statement: {0}")]
    Fingerprint(String),
}

pub type CompilationResult<T> = Result<T, CompilationError>;

/// What the executor receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledStatement {
    pub sql: String,
    pub params: Vec<Param>,
    pub dialect: Dialect,
    pub fingerprint: String,
}

/// Builder plus renderer for one registry snapshot.
#[derive(Debug, Clone)]
pub struct Compiler<'r> {
    builder: AstBuilder<'r>,
    renderers: RendererRegistry,
}

impl<'r> Compiler<'r> {
    pub fn new(registry: &'r Registry, renderers: RendererRegistry, as_of: NaiveDate) -> Self {
        Self {
            builder: AstBuilder::new(registry, as_of),
            renderers,
        }
    }

    pub fn build(&self, secured: &SecuredQuery) -> CompilationResult<QueryAst> {
        self.builder.build(secured)
    }

    pub fn compile(
        &self,
        secured: &SecuredQuery,
        dialect: Dialect,
    ) -> CompilationResult<CompiledStatement> {
        let ast = self.build(secured)?;
        let RenderedSql { sql, params } = self.renderers.render(&ast, dialect)?;
        let fingerprint = fingerprint(dialect, &sql, &params)
            .map_err(|e| CompilationError::Fingerprint(e.to_string()))?;

        tracing::debug!(
            dialect = %dialect,
            params = params.len(),
            fingerprint = %fingerprint,
            "compiled statement"
        );
        Ok(CompiledStatement {
            sql,
            params,
            dialect,
            fingerprint,
        })
    }
}
