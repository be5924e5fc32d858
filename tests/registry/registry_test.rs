//! Catalog loading and lookup tests.

use std::path::PathBuf;

use semql::config::Settings;
use semql::engine::load_registry;
use semql::query::Grain;
use semql::registry::{
    Aggregation, Registry, RegistryLoadError, RegistryLookupError, SharedRegistry, ValueType,
};

const SMALL_CATALOG: &str = r#"
[calendar]
dimension = "order_date"

[business_terms]
"turnover" = "order_value"

[[metrics]]
name = "order_value"
table = "fact_orders"
column = "amount"
aggregation = "sum"
synonyms = ["orders"]

[[metrics]]
name = "customers"
table = "fact_orders"
column = "customer_id"
aggregation = "count_distinct"
dimensions = ["order_date", "region"]

[[joins]]
table = "dim_calendar"
fact = "fact_orders"
fact_key = "date_id"
dimension_key = "date_id"

[[dimensions]]
name = "order_date"
table = "dim_calendar"
column = "calendar_date"
type = "date"
grain = "day"

[[dimensions]]
name = "order_month"
table = "dim_calendar"
column = "month_start"
type = "date"
grain = "month"

[[dimensions]]
name = "region"
table = "fact_orders"
column = "region"
type = "string"
synonyms = ["area"]
"#;

fn temp_catalog(name: &str, content: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "semql-{}-{}-{}.toml",
        name,
        std::process::id(),
        uuid::Uuid::new_v4()
    ));
    std::fs::write(&path, content).unwrap();
    path
}

// ============================================================================
// Built-in catalog
// ============================================================================

#[test]
fn test_builtin_catalog_resolves_business_vocabulary() {
    let registry = Registry::builtin().unwrap();

    for term in ["sales", "Revenue", "  net sales ", "offtake", "sell out"] {
        assert_eq!(
            registry.resolve_metric(term).unwrap().name,
            "secondary_sales_value",
            "term {term:?}"
        );
    }
    assert_eq!(registry.resolve_dimension("region").unwrap().name, "zone_name");
    assert_eq!(registry.resolve_dimension("Brand").unwrap().column, "brand_name");
    assert_eq!(registry.synonym_of("sell in"), Some("primary_sales_value"));
    assert_eq!(registry.synonym_of("brand_name"), Some("brand_name"));
}

#[test]
fn test_lookups_never_match_partially() {
    let registry = Registry::builtin().unwrap();
    assert_eq!(registry.synonym_of("bran"), None);
    assert_eq!(registry.synonym_of("sales value"), None);
    assert_eq!(
        registry.resolve_metric("secondary_sales").unwrap_err(),
        RegistryLookupError::UnknownMetric("secondary_sales".into())
    );
    assert!(matches!(
        registry.resolve_dimension("brand_name_x"),
        Err(RegistryLookupError::UnknownDimension(_))
    ));
}

#[test]
fn test_builtin_definitions() {
    let registry = Registry::builtin().unwrap();

    let sales = registry.resolve_metric("secondary_sales_value").unwrap();
    assert_eq!(sales.table, "fact_secondary_sales");
    assert_eq!(sales.aggregation, Aggregation::Sum);
    assert_eq!(sales.filters.len(), 1);
    assert_eq!(sales.filters[0].column, "return_flag");

    let invoices = registry.resolve_metric("invoice_count").unwrap();
    assert_eq!(invoices.aggregation, Aggregation::CountDistinct);

    let primary = registry.resolve_metric("primary_sales_value").unwrap();
    assert!(primary.allows_group_by("brand_name"));
    assert!(!primary.allows_group_by("channel_name"));

    let channel = registry.resolve_dimension("channel_name").unwrap();
    assert!(channel.is_joinable_to("fact_secondary_sales"));
    assert!(!channel.is_joinable_to("fact_primary_sales"));

    let invoice = registry.resolve_dimension("invoice_number").unwrap();
    assert!(invoice.is_on_fact("fact_secondary_sales"));
    assert!(invoice.join_for("fact_secondary_sales").is_none());

    let pack = registry.resolve_dimension("pack").unwrap();
    assert_eq!(pack.value_type, ValueType::Integer);
}

#[test]
fn test_calendar_and_time_dimensions() {
    let registry = Registry::builtin().unwrap();
    let calendar = registry.calendar_dimension();
    assert_eq!(calendar.name, "date");
    assert_eq!(calendar.value_type, ValueType::Date);
    for fact in registry.facts() {
        assert!(calendar.is_joinable_to(fact), "calendar not joinable to {fact}");
    }

    assert_eq!(registry.time_dimension_for(Grain::Week).unwrap().column, "week_start");
    assert_eq!(registry.time_dimension_for(Grain::Month).unwrap().column, "month_start");
    assert_eq!(registry.time_dimension_for(Grain::Quarter).unwrap().column, "quarter_start");
    assert!(!registry.resolve_dimension("month_name").unwrap().is_time());
}

#[test]
fn test_listings_are_sorted_and_complete() {
    let registry = Registry::builtin().unwrap();
    let metrics: Vec<&str> = registry.list_metrics().map(|m| m.name.as_str()).collect();
    let mut sorted = metrics.clone();
    sorted.sort_unstable();
    assert_eq!(metrics, sorted);
    assert!(metrics.contains(&"secondary_sales_volume"));

    let facts: Vec<&str> = registry.facts().collect();
    assert_eq!(facts, ["fact_primary_sales", "fact_secondary_sales"]);
    assert!(registry.list_dimensions().count() >= 20);
}

// ============================================================================
// Custom catalogs
// ============================================================================

#[test]
fn test_catalog_from_file() {
    let path = temp_catalog("small", SMALL_CATALOG);
    let registry = Registry::from_file(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(registry.calendar_dimension().column, "calendar_date");
    assert_eq!(registry.resolve_metric("turnover").unwrap().name, "order_value");
    assert_eq!(registry.resolve_metric("orders").unwrap().name, "order_value");
    assert_eq!(registry.resolve_dimension("area").unwrap().name, "region");

    let month = registry.resolve_dimension("order_month").unwrap();
    let join = month.join_for("fact_orders").unwrap();
    assert_eq!(join.fact_key, "date_id");

    let customers = registry.resolve_metric("customers").unwrap();
    assert!(!customers.allows_group_by("order_month"));
}

#[test]
fn test_missing_file_is_an_io_error() {
    let err = Registry::from_file("/definitely/not/here/catalog.toml").unwrap_err();
    assert!(matches!(err, RegistryLoadError::Io { .. }));
}

fn rejected(catalog: &str) -> RegistryLoadError {
    match Registry::from_toml_str(catalog) {
        Ok(_) => panic!("catalog unexpectedly loaded:\n{catalog}"),
        Err(e) => e,
    }
}

#[test]
fn test_invalid_catalogs_are_rejected_whole() {
    let err = rejected(&SMALL_CATALOG.replace("name = \"customers\"", "name = \"Order_Value\""));
    assert!(matches!(err, RegistryLoadError::Duplicate { kind: "metric", .. }));

    let err = rejected(&SMALL_CATALOG.replace("fact = \"fact_orders\"", "fact = \"fact_returns\""));
    assert!(matches!(err, RegistryLoadError::UnknownFact { .. }));

    let err = rejected(&SMALL_CATALOG.replace("dimension = \"order_date\"", "dimension = \"region\""));
    assert!(matches!(err, RegistryLoadError::InvalidCalendar { .. }));

    let err = rejected(&SMALL_CATALOG.replace("\"turnover\" = \"order_value\"", "\"turnover\" = \"gmv\""));
    assert!(matches!(err, RegistryLoadError::UnknownTermTarget { .. }));

    let err = rejected(&SMALL_CATALOG.replace("column = \"amount\"", "column = \"amount) FROM x --\""));
    assert!(matches!(err, RegistryLoadError::InvalidIdentifier(_)));

    let err = rejected(&SMALL_CATALOG.replace("\"order_date\", \"region\"]", "\"order_date\", \"country\"]"));
    assert!(matches!(err, RegistryLoadError::UnknownDimension { .. }));

    let err = rejected(&SMALL_CATALOG.replace("synonyms = [\"area\"]", "synonyms = [\"orders\"]"));
    assert!(matches!(err, RegistryLoadError::ConflictingSynonym { .. }));

    let err = rejected(&SMALL_CATALOG.replace("aggregation = \"sum\"", "aggregation = \"median\""));
    assert!(matches!(err, RegistryLoadError::Parse(_)));
}

#[test]
fn test_calendar_must_reach_every_fact() {
    let catalog = format!(
        "{}\n[[metrics]]\nname = \"returns\"\ntable = \"fact_returns\"\ncolumn = \"qty\"\naggregation = \"sum\"\n",
        SMALL_CATALOG
    );
    let err = rejected(&catalog);
    assert!(matches!(err, RegistryLoadError::InvalidCalendar { .. }));
    assert!(err.to_string().contains("fact_returns"));
}

// ============================================================================
// Shared handle
// ============================================================================

#[test]
fn test_swap_is_seen_by_new_snapshots_only() {
    let shared = SharedRegistry::new(Registry::builtin().unwrap());
    let before = shared.snapshot();

    let previous = shared.swap(Registry::from_toml_str(SMALL_CATALOG).unwrap());
    assert!(previous.resolve_metric("sales").is_ok());

    // The snapshot taken earlier keeps answering with the old catalog.
    assert!(before.resolve_metric("sales").is_ok());
    assert!(before.resolve_metric("order_value").is_err());

    let after = shared.snapshot();
    assert!(after.resolve_metric("order_value").is_ok());
    assert!(after.resolve_metric("sales").is_err());
}

#[test]
fn test_swap_across_threads() {
    let shared = SharedRegistry::new(Registry::builtin().unwrap());
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let shared = shared.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let snapshot = shared.snapshot();
                    let metric = snapshot
                        .resolve_metric("sales")
                        .or_else(|_| snapshot.resolve_metric("orders"));
                    assert!(metric.is_ok());
                }
            })
        })
        .collect();
    shared.swap(Registry::from_toml_str(SMALL_CATALOG).unwrap());
    for reader in readers {
        reader.join().unwrap();
    }
}

// ============================================================================
// Settings
// ============================================================================

#[test]
fn test_load_registry_follows_settings() {
    let registry = load_registry(&Settings::default()).unwrap();
    assert!(registry.resolve_metric("offtake").is_ok());

    let path = temp_catalog("settings", SMALL_CATALOG);
    std::env::set_var("SEMQL_TEST_CATALOG", &path);
    let settings = Settings::from_toml_str(
        r#"
        [registry]
        catalog = "${SEMQL_TEST_CATALOG}"
        "#,
    )
    .unwrap();
    let registry = load_registry(&settings).unwrap();
    std::fs::remove_file(&path).ok();
    assert!(registry.resolve_metric("turnover").is_ok());
}
