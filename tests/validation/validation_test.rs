//! Validation of structured queries as they arrive from the intent parser.

use insta::assert_snapshot;

use semql::config::{Settings, ValidationSettings};
use semql::query::{
    FilterOp, FilterValue, Grain, Intent, MetricVariant, SortDirection, StructuredQuery,
};
use semql::validation::{
    parse_query, QueryShape, ValidationError, ValidationFailed, ValidationWarning, Validator,
};
use semql::{Engine, Registry, SharedRegistry};

fn validator(registry: &Registry) -> Validator<'_> {
    Validator::new(registry, ValidationSettings::default())
}

// ============================================================================
// Wire format
// ============================================================================

#[test]
fn test_parser_output_validates() {
    let query = parse_query(
        r#"{
            "intent": "ranking",
            "metric_request": {"primary_metric": "sales"},
            "dimensionality": {"group_by": ["brand"]},
            "time_context": {"window": "last_quarter", "grain": "month"},
            "filters": [{"dimension": "state", "operator": "=", "value": "Kerala"}],
            "sorting": {"order_by": "sales", "direction": "DESC", "limit": 10},
            "result_shape": {"format": "chart", "chart_type": "bar"},
            "confidence": 0.92,
            "original_question": "top 10 brands in Kerala last quarter"
        }"#,
    )
    .unwrap();

    assert_eq!(query.filters[0].values, [FilterValue::Text("Kerala".into())]);
    assert_eq!(query.time_context.grain, Grain::Month);

    let registry = Registry::builtin().unwrap();
    let report = validator(&registry).validate(&query);
    assert!(report.is_valid(), "{:?}", report.errors);
    assert!(report.warnings.is_empty());
}

#[test]
fn test_missing_time_context_uses_defaults() {
    let query = parse_query(
        r#"{"intent": "snapshot", "metric_request": {"primary_metric": "secondary_sales_value"}}"#,
    )
    .unwrap();
    assert_eq!(query.time_context.window, "last_4_weeks");
    assert_eq!(query.time_context.grain, Grain::Day);
}

#[test]
fn test_malformed_input_is_a_validation_error() {
    let cases = [
        "not json",
        r#"{"metric_request": {"primary_metric": "sales"}}"#,
        r#"{"intent": "forecast", "metric_request": {"primary_metric": "sales"}}"#,
        r#"{"intent": "snapshot", "metric_request": {"primary_metric": "sales"}, "sql": "SELECT 1"}"#,
        r#"{"intent": "snapshot", "metric_request": {"primary_metric": "sales"},
            "filters": [{"dimension": "state", "operator": "LIKE", "values": ["K%"]}]}"#,
    ];
    for json in cases {
        let err = parse_query(json).unwrap_err();
        assert_eq!(err.rule(), "malformed_input", "input {json}");
        assert_eq!(err.field(), "$");
    }
}

#[test]
fn test_errors_serialize_with_rule_tags() {
    let registry = Registry::builtin().unwrap();
    let query = StructuredQuery::new(Intent::Snapshot, "gross_margin").group_by("planet");
    let report = validator(&registry).validate(&query);

    assert_snapshot!(serde_json::to_string_pretty(&report.errors).unwrap(), @r#"
    [
      {
        "rule": "unknown_metric",
        "field": "metric_request.primary_metric",
        "name": "gross_margin"
      },
      {
        "rule": "unknown_dimension",
        "field": "dimensionality.group_by[0]",
        "name": "planet"
      }
    ]
    "#);
}

// ============================================================================
// Rules
// ============================================================================

#[test]
fn test_every_violation_is_reported() {
    let registry = Registry::builtin().unwrap();
    let query = StructuredQuery::new(Intent::Trend, "sales")
        .secondary_metric("primary_sales_value")
        .group_by("brand_name")
        .group_by("channel")
        .window("last_2_weeks")
        .grain(Grain::Year)
        .filter("return_flag", FilterOp::Between, [FilterValue::Bool(true)])
        .filter("retailer", FilterOp::Eq, [FilterValue::Int(42)])
        .sort("state_name", SortDirection::Asc, Some(20_000));
    let report = validator(&registry).validate(&query);

    assert_eq!(
        report.rules(),
        [
            "incompatible_metric",
            "limit_out_of_range",
            "sort_not_selected",
            "missing_time_dimension",
            "invalid_time_window",
            "malformed_filter",
            "malformed_filter",
        ]
    );
    assert_eq!(report.errors[5].field(), "filters[0].values");
    assert_eq!(report.errors[6].field(), "filters[1].values");
}

#[test]
fn test_ranking_needs_sort_and_limit() {
    let registry = Registry::builtin().unwrap();
    let v = validator(&registry);

    let unsorted = StructuredQuery::new(Intent::Ranking, "sales").group_by("brand");
    assert_eq!(v.validate(&unsorted).rules(), ["missing_sort"]);
    assert_eq!(v.validate(&unsorted).errors[0].field(), "sorting");

    let unlimited = unsorted
        .clone()
        .sort("sales", SortDirection::Desc, None);
    assert_eq!(v.validate(&unlimited).errors[0].field(), "sorting.limit");

    let ranked = unsorted.sort("brand", SortDirection::Asc, Some(3));
    let certified = v.certify(&ranked).unwrap();
    assert_eq!(
        certified.shape(),
        &QueryShape::Ranking {
            order_by: "brand_name".into(),
            direction: SortDirection::Asc,
            limit: 3,
        }
    );
}

#[test]
fn test_filters_must_fit_operator_and_type() {
    let registry = Registry::builtin().unwrap();
    let v = validator(&registry);
    let base = StructuredQuery::new(Intent::Snapshot, "secondary_sales_value");

    let ok = base
        .clone()
        .filter("pack_size", FilterOp::Between, [FilterValue::Int(100), FilterValue::Int(500)])
        .filter("date", FilterOp::Gte, [FilterValue::Text("2024-04-01".into())])
        .filter("return_flag", FilterOp::Eq, [FilterValue::Bool(false)])
        .filter("state", FilterOp::NotIn, [FilterValue::Text("Goa".into())]);
    assert!(v.validate(&ok).is_valid());

    let bad = [
        base.clone().filter("brand", FilterOp::In, []),
        base.clone().filter("brand", FilterOp::Eq, ["A".into(), "B".into()]),
        base.clone().filter("brand", FilterOp::Lt, ["M".into()]),
        base.clone().filter("date", FilterOp::Eq, ["last tuesday".into()]),
        base.clone().filter("pack_size", FilterOp::Eq, [FilterValue::Float(1.5)]),
    ];
    for query in bad {
        let report = v.validate(&query);
        assert_eq!(report.rules(), ["malformed_filter"], "{:?}", query.filters);
    }
}

#[test]
fn test_filter_dimension_must_reach_the_fact() {
    let registry = Registry::builtin().unwrap();
    let query = StructuredQuery::new(Intent::Snapshot, "primary_sales_value").filter(
        "retailer_name",
        FilterOp::Eq,
        ["Metro Mart".into()],
    );
    let report = validator(&registry).validate(&query);
    assert_eq!(report.rules(), ["incompatible_dimension"]);
    assert_eq!(report.errors[0].field(), "filters[0].dimension");
}

#[test]
fn test_window_and_grain() {
    let registry = Registry::builtin().unwrap();
    let v = validator(&registry);

    let weekly = StructuredQuery::new(Intent::Trend, "sales")
        .group_by("week")
        .window("last_4_weeks")
        .grain(Grain::Week);
    assert!(v.validate(&weekly).is_valid());

    let monthly = weekly.clone().grain(Grain::Month);
    assert!(v.validate(&monthly).is_valid());

    let quarterly = weekly.clone().grain(Grain::Quarter);
    assert_eq!(v.validate(&quarterly).rules(), ["invalid_time_window"]);

    let unknown = weekly.window("since the launch");
    let report = v.validate(&unknown);
    assert!(matches!(
        &report.errors[0],
        ValidationError::InvalidTimeWindow { window, .. } if window == "since the launch"
    ));
}

#[test]
fn test_limits_come_from_settings() {
    let settings = Settings::from_toml_str(
        r#"
        [validation]
        max_group_by = 1
        max_limit = 50
        low_confidence_threshold = 0.8
        "#,
    )
    .unwrap();
    let registry = Registry::builtin().unwrap();
    let v = Validator::new(&registry, settings.validation.clone());

    let query = StructuredQuery::new(Intent::Ranking, "sales")
        .group_by("brand")
        .group_by("state")
        .sort("sales", SortDirection::Desc, Some(100))
        .confidence(0.7);
    let report = v.validate(&query);
    assert_eq!(report.rules(), ["cardinality_exceeded", "limit_out_of_range"]);
    assert_eq!(
        report.warnings,
        [ValidationWarning::LowConfidence {
            confidence: 0.7,
            threshold: 0.8,
        }]
    );

    assert!(Settings::from_toml_str("[validation]\nmax_group_by = 0").is_err());
}

#[test]
fn test_group_by_cap_cannot_be_raised() {
    let err = Settings::from_toml_str("[validation]\nmax_group_by = 10\n").unwrap_err();
    assert!(err.to_string().contains("between 1 and 4"));
    assert!(Settings::from_toml_str("[validation]\nmax_group_by = 4\n").is_ok());

    // A validator built by hand still holds the line.
    let registry = Registry::builtin().unwrap();
    let settings = ValidationSettings {
        max_group_by: 10,
        ..ValidationSettings::default()
    };
    let query = StructuredQuery::new(Intent::Snapshot, "sales")
        .group_by("brand")
        .group_by("state")
        .group_by("zone")
        .group_by("channel")
        .group_by("category");
    let report = Validator::new(&registry, settings).validate(&query);
    assert_eq!(report.rules(), ["cardinality_exceeded"]);
    assert!(matches!(
        report.errors[0],
        ValidationError::CardinalityExceeded { count: 5, max: 4, .. }
    ));
}

// ============================================================================
// Warnings and certification
// ============================================================================

#[test]
fn test_warnings_never_block() {
    let registry = Registry::builtin().unwrap();
    let query = StructuredQuery::new(Intent::Snapshot, "sales")
        .sort("sales", SortDirection::Desc, Some(0))
        .result_shape(semql::query::ResultFormat::Chart, None)
        .confidence(0.2);

    let certified = validator(&registry).certify(&query).unwrap();
    assert_eq!(
        certified.warnings(),
        [
            ValidationWarning::LowConfidence {
                confidence: 0.2,
                threshold: 0.5,
            },
            ValidationWarning::ZeroLimit,
            ValidationWarning::ChartWithoutGroupBy,
        ]
    );
    assert_eq!(certified.shape(), &QueryShape::Snapshot);
}

#[test]
fn test_growth_variant_outside_comparison_warns() {
    let registry = Registry::builtin().unwrap();
    let ranking = StructuredQuery::new(Intent::Ranking, "sales")
        .group_by("brand")
        .sort("sales", SortDirection::Desc, Some(5))
        .variant(MetricVariant::Growth);

    let report = validator(&registry).validate(&ranking);
    assert!(report.is_valid());
    assert_eq!(
        report.warnings,
        [ValidationWarning::VariantWithoutComparison {
            variant: MetricVariant::Growth,
            intent: Intent::Ranking,
        }]
    );
    assert_snapshot!(
        report.warnings[0].to_string(),
        @"metric variant growth only applies to comparisons; the ranking answer reports absolute values"
    );

    let comparison = StructuredQuery::new(Intent::Comparison, "sales").variant(MetricVariant::Delta);
    assert!(validator(&registry).validate(&comparison).warnings.is_empty());
}

#[test]
fn test_certified_query_is_canonical() {
    let registry = Registry::builtin().unwrap();
    let query = StructuredQuery::new(Intent::Comparison, " Offtake ")
        .secondary_metric("units")
        .group_by("Zone")
        .filter("category", FilterOp::In, ["Soaps".into()])
        .window("LAST_4_WEEKS");
    let certified = validator(&registry).certify(&query).unwrap();
    let q = certified.query();

    assert_eq!(q.primary_metric(), "secondary_sales_value");
    assert_eq!(q.metric_request.secondary_metrics, ["secondary_sales_volume"]);
    assert_eq!(q.group_by_dimensions(), ["zone_name"]);
    assert_eq!(q.filters[0].dimension, "category_name");
    assert_eq!(q.time_context.window, "last_4_weeks");
    assert_eq!(certified.window().to_string(), "last_4_weeks");
    assert_eq!(certified.shape(), &QueryShape::Comparison);
}

#[test]
fn test_failure_lists_every_error() {
    let registry = Registry::builtin().unwrap();
    let query = StructuredQuery::new(Intent::Snapshot, "gross_margin").window("fortnight");
    let report = validator(&registry).certify(&query).unwrap_err();
    let failed = ValidationFailed::from(report);
    assert_eq!(failed.errors.len(), 2);
    let message = failed.to_string();
    assert!(message.contains("gross_margin"));
    assert!(message.contains("fortnight"));
}

#[test]
fn test_engine_validates_against_current_registry() {
    let engine = Engine::new(
        SharedRegistry::new(Registry::builtin().unwrap()),
        Settings::default(),
    )
    .unwrap();
    let query = StructuredQuery::new(Intent::Snapshot, "turnover");
    assert_eq!(engine.validate(&query).rules(), ["unknown_metric"]);

    let catalog = semql::registry::BUILTIN_CATALOG.replace(
        "\"offtake\" = \"secondary_sales_value\"",
        "\"offtake\" = \"secondary_sales_value\"\n\"turnover\" = \"secondary_sales_value\"",
    );
    engine.registry().swap(Registry::from_toml_str(&catalog).unwrap());
    assert!(engine.validate(&query).is_valid());
}
