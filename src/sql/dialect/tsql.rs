//! T-SQL (SQL Server / Azure SQL) dialect.
//!
//! T-SQL has significant differences from ANSI:
//! - Square bracket identifier quoting (`[name]`)
//! - Named `@pn` parameters (sp_executesql style)
//! - OFFSET FETCH for row limiting (requires ORDER BY)

use super::helpers;
use super::SqlDialect;
use crate::sql::token::TokenStream;

/// T-SQL (SQL Server) dialect.
#[derive(Debug, Clone, Copy)]
pub struct TSql;

impl SqlDialect for TSql {
    fn name(&self) -> &'static str {
        "tsql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_bracket(ident)
    }

    fn placeholder(&self, index: usize) -> String {
        helpers::placeholder_at_named(index)
    }

    fn emit_limit(&self, limit: u64) -> TokenStream {
        helpers::emit_limit_tsql(limit)
    }

    fn requires_order_by_for_limit(&self) -> bool {
        true
    }
}
