//! Shared helper functions for SQL dialect implementations.
//!
//! This module provides reusable building blocks that dialects can compose
//! to implement the `SqlDialect` trait with minimal duplication.

use super::super::token::{Token, TokenStream};

// =============================================================================
// Identifier Quoting
// =============================================================================

/// Quote identifier with double quotes (ANSI style).
/// Used by: Postgres, DuckDB
pub fn quote_double(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote identifier with backticks.
/// Used by: MySQL
pub fn quote_backtick(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Quote identifier with square brackets.
/// Used by: T-SQL (SQL Server, Azure Synapse)
pub fn quote_bracket(ident: &str) -> String {
    format!("[{}]", ident.replace(']', "]]"))
}

// =============================================================================
// Parameter Markers
// =============================================================================

/// Anonymous positional marker, bound in order of appearance.
/// Used by: DuckDB, MySQL
pub fn placeholder_anonymous(_index: usize) -> String {
    "?".into()
}

/// Numbered marker `$n`.
/// Used by: Postgres
pub fn placeholder_dollar(index: usize) -> String {
    format!("${}", index)
}

/// Named marker `@pn`, bound by name on the client side.
/// Used by: T-SQL
pub fn placeholder_at_named(index: usize) -> String {
    format!("@p{}", index)
}

// =============================================================================
// Pagination
// =============================================================================

/// Emit `LIMIT n` (standard SQL).
/// Used by: Postgres, DuckDB, MySQL
pub fn emit_limit_standard(limit: u64) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.push(Token::Limit).space().push(Token::LitInt(limit));
    ts
}

/// Emit `OFFSET 0 ROWS FETCH NEXT n ROWS ONLY` (T-SQL style).
/// Used by: T-SQL (SQL Server, Azure Synapse)
/// Note: Requires ORDER BY clause in T-SQL
pub fn emit_limit_tsql(limit: u64) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.push(Token::Offset)
        .space()
        .push(Token::LitInt(0))
        .space()
        .push(Token::Rows)
        .space()
        .push(Token::Fetch)
        .space()
        .push(Token::Next)
        .space()
        .push(Token::LitInt(limit))
        .space()
        .push(Token::Rows)
        .space()
        .push(Token::Only);
    ts
}
