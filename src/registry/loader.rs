//! TOML catalog loader.
//!
//! The catalog file is deserialized into raw section structs, then checked
//! and folded into an immutable [`Registry`]. A catalog that fails any
//! check is rejected whole; there is no partially loaded registry.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use super::types::{
    Aggregation, DimensionDef, FactFilter, JoinKey, MetricDef, MetricFormat, ValueType,
};
use super::{Registry, RegistryLoadError};
use crate::query::Grain;

/// Catalog identifiers are rendered quoted, but are still restricted to
/// plain SQL names.
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    calendar: CalendarSection,
    #[serde(default)]
    business_terms: BTreeMap<String, String>,
    #[serde(default)]
    metrics: Vec<RawMetric>,
    #[serde(default)]
    joins: Vec<RawTableJoin>,
    #[serde(default)]
    dimensions: Vec<RawDimension>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CalendarSection {
    dimension: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMetric {
    name: String,
    #[serde(default)]
    description: String,
    table: String,
    column: String,
    aggregation: Aggregation,
    #[serde(default)]
    format: MetricFormat,
    #[serde(default)]
    dimensions: Vec<String>,
    #[serde(default)]
    synonyms: Vec<String>,
    #[serde(default)]
    filters: Vec<FactFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTableJoin {
    table: String,
    fact: String,
    fact_key: String,
    dimension_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDimension {
    name: String,
    #[serde(default)]
    description: String,
    table: String,
    column: String,
    #[serde(rename = "type", default)]
    value_type: ValueType,
    #[serde(default)]
    grain: Option<Grain>,
    #[serde(default)]
    synonyms: Vec<String>,
    #[serde(default)]
    joins: Vec<JoinKey>,
}

pub(super) fn load_file(path: &Path) -> Result<Registry, RegistryLoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| RegistryLoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_str(&content)
}

pub(super) fn load_str(content: &str) -> Result<Registry, RegistryLoadError> {
    let file: CatalogFile = toml::from_str(content)?;
    build(file)
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

fn check_identifier(name: &str) -> Result<(), RegistryLoadError> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(RegistryLoadError::InvalidIdentifier(name.to_string()))
    }
}

fn build(file: CatalogFile) -> Result<Registry, RegistryLoadError> {
    let facts: BTreeSet<String> = file.metrics.iter().map(|m| m.table.clone()).collect();

    let mut table_joins: BTreeMap<String, Vec<JoinKey>> = BTreeMap::new();
    for join in file.joins {
        if !facts.contains(&join.fact) {
            return Err(RegistryLoadError::UnknownFact {
                owner: join.table,
                fact: join.fact,
            });
        }
        check_identifier(&join.table)?;
        check_identifier(&join.fact_key)?;
        check_identifier(&join.dimension_key)?;
        table_joins.entry(join.table).or_default().push(JoinKey {
            fact: join.fact,
            fact_key: join.fact_key,
            dimension_key: join.dimension_key,
        });
    }

    let mut dimensions = BTreeMap::new();
    let mut time_dimensions = BTreeMap::new();
    for raw in file.dimensions {
        let key = normalize(&raw.name);
        check_identifier(&key)?;
        check_identifier(&raw.table)?;
        check_identifier(&raw.column)?;
        let joins = if raw.joins.is_empty() {
            table_joins.get(&raw.table).cloned().unwrap_or_default()
        } else {
            raw.joins
        };
        for join in &joins {
            if !facts.contains(&join.fact) {
                return Err(RegistryLoadError::UnknownFact {
                    owner: key,
                    fact: join.fact.clone(),
                });
            }
            check_identifier(&join.fact_key)?;
            check_identifier(&join.dimension_key)?;
        }
        if let Some(grain) = raw.grain {
            time_dimensions.entry(grain).or_insert_with(|| key.clone());
        }
        let def = DimensionDef {
            name: key.clone(),
            description: raw.description,
            table: raw.table,
            column: raw.column,
            value_type: raw.value_type,
            grain: raw.grain,
            synonyms: raw.synonyms,
            joins,
        };
        if dimensions.insert(key.clone(), def).is_some() {
            return Err(RegistryLoadError::Duplicate {
                kind: "dimension",
                name: key,
            });
        }
    }

    let mut metrics = BTreeMap::new();
    for raw in file.metrics {
        let key = normalize(&raw.name);
        check_identifier(&key)?;
        check_identifier(&raw.table)?;
        check_identifier(&raw.column)?;
        if dimensions.contains_key(&key) {
            return Err(RegistryLoadError::Duplicate {
                kind: "metric",
                name: key,
            });
        }
        let allowed: Vec<String> = raw.dimensions.iter().map(|d| normalize(d)).collect();
        if let Some(unknown) = allowed.iter().find(|d| !dimensions.contains_key(*d)) {
            return Err(RegistryLoadError::UnknownDimension {
                metric: key,
                dimension: unknown.clone(),
            });
        }
        for filter in &raw.filters {
            check_identifier(&filter.column)?;
        }
        let def = MetricDef {
            name: key.clone(),
            description: raw.description,
            table: raw.table,
            column: raw.column,
            aggregation: raw.aggregation,
            format: raw.format,
            dimensions: allowed,
            synonyms: raw.synonyms,
            filters: raw.filters,
        };
        if metrics.insert(key.clone(), def).is_some() {
            return Err(RegistryLoadError::Duplicate {
                kind: "metric",
                name: key,
            });
        }
    }

    let calendar_name = normalize(&file.calendar.dimension);
    let calendar = match dimensions.get(&calendar_name) {
        Some(def) if def.value_type == ValueType::Date => def.clone(),
        Some(def) => {
            return Err(RegistryLoadError::InvalidCalendar {
                dimension: calendar_name,
                reason: format!("expected a date dimension, found {}", def.value_type),
            })
        }
        None => {
            return Err(RegistryLoadError::InvalidCalendar {
                dimension: calendar_name,
                reason: "no such dimension".into(),
            })
        }
    };
    if let Some(fact) = facts.iter().find(|f| !calendar.is_joinable_to(f)) {
        return Err(RegistryLoadError::InvalidCalendar {
            dimension: calendar_name,
            reason: format!("not joinable to fact '{}'", fact),
        });
    }

    let mut synonyms = SynonymTable::default();
    for def in metrics.values() {
        for term in &def.synonyms {
            synonyms.add(term, &def.name, &metrics, &dimensions)?;
        }
    }
    for def in dimensions.values() {
        for term in &def.synonyms {
            synonyms.add(term, &def.name, &metrics, &dimensions)?;
        }
    }
    for (term, target) in &file.business_terms {
        let target = normalize(target);
        if !metrics.contains_key(&target) && !dimensions.contains_key(&target) {
            return Err(RegistryLoadError::UnknownTermTarget {
                term: term.clone(),
                target,
            });
        }
        synonyms.add(term, &target, &metrics, &dimensions)?;
    }

    Ok(Registry {
        metrics,
        dimensions,
        synonyms: synonyms.0,
        calendar,
        time_dimensions,
        facts,
    })
}

#[derive(Default)]
struct SynonymTable(BTreeMap<String, String>);

impl SynonymTable {
    fn add(
        &mut self,
        term: &str,
        canonical: &str,
        metrics: &BTreeMap<String, MetricDef>,
        dimensions: &BTreeMap<String, DimensionDef>,
    ) -> Result<(), RegistryLoadError> {
        let key = normalize(term);
        if key == canonical {
            return Ok(());
        }
        if metrics.contains_key(&key) || dimensions.contains_key(&key) {
            return Err(RegistryLoadError::ConflictingSynonym {
                term: key.clone(),
                first: key,
                second: canonical.to_string(),
            });
        }
        match self.0.get(&key) {
            Some(existing) if existing != canonical => Err(RegistryLoadError::ConflictingSynonym {
                term: key.clone(),
                first: existing.clone(),
                second: canonical.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.0.insert(key, canonical.to_string());
                Ok(())
            }
        }
    }
}
