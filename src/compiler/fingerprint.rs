//! Statement fingerprints for caching and audit.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::ast::Param;
use crate::sql::Dialect;

#[derive(Serialize)]
struct FingerprintInput<'a> {
    dialect: Dialect,
    sql: &'a str,
    params: &'a [Param],
}

/// SHA-256 over the dialect, SQL text and parameters, as 64 hex digits.
///
/// The input is serialized to JSON first, so two statements share a
/// fingerprint only when all three parts are equal.
pub fn fingerprint(
    dialect: Dialect,
    sql: &str,
    params: &[Param],
) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(&FingerprintInput {
        dialect,
        sql,
        params,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
