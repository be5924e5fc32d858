//! SQL text generation.
//!
//! - [`token`] - Token types for SQL generation
//! - [`dialect`] - SQL dialect implementations
//!
//! The compiler's renderer walks the query AST into a [`TokenStream`] and
//! serializes it for one [`Dialect`].

pub mod dialect;
pub mod token;


pub use dialect::{Dialect, SqlDialect, UnknownDialect};
pub use token::{Token, TokenStream};
