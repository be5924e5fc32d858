//! DuckDB SQL dialect.
//!
//! DuckDB is PostgreSQL-compatible for everything the compiler emits:
//! - ANSI identifier quoting (`"`)
//! - `?` positional parameters
//! - `LIMIT n`

use super::helpers;
use super::SqlDialect;

/// DuckDB SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct DuckDb;

impl SqlDialect for DuckDb {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    fn placeholder(&self, index: usize) -> String {
        helpers::placeholder_anonymous(index)
    }

    // Uses default emit_limit (LIMIT ...)
}
