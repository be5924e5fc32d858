//! Pattern expansion, checked through to the compiled SQL.

use chrono::NaiveDate;
use serde_json::{json, Value};

use semql::analysis::{trend_direction, Row, TrendDirection};
use semql::compiler::{CompiledStatement, Param};
use semql::config::Settings;
use semql::patterns::{
    ContributionPair, DiagnosticPlan, DiagnosticStep, Expansion, PatternError, PatternGrammar,
    StepDependency, StepRole,
};
use semql::query::{FilterOp, Grain, Intent, SortDirection, StructuredQuery, TimeWindow};
use semql::security::{AccessLevel, UserContext};
use semql::{CompileOptions, Pipeline, Registry};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn as_of() -> NaiveDate {
    date(2024, 6, 12)
}

fn admin() -> UserContext {
    UserContext::new("u-admin", "admin", AccessLevel::National)
}

fn expand(query: &StructuredQuery) -> Expansion {
    let registry = Registry::builtin().unwrap();
    let settings = Settings::default();
    PatternGrammar::new(&registry, settings.diagnostics.clone())
        .expand(query)
        .unwrap()
}

fn compile(query: &StructuredQuery) -> CompiledStatement {
    let registry = Registry::builtin().unwrap();
    let settings = Settings::default();
    let user = admin();
    let options = CompileOptions::default().with_as_of(as_of());
    Pipeline::new(&registry, &settings, Some(&user), options)
        .compile(query)
        .unwrap()
        .statement
}

/// The date bounds bound for the calendar window, in order.
fn window_params(statement: &CompiledStatement) -> Vec<NaiveDate> {
    statement
        .params
        .iter()
        .filter_map(|p| match p {
            Param::Date(d) => Some(*d),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Comparison
// ============================================================================

#[test]
fn test_comparison_periods_are_contiguous_and_equal() {
    for name in ["last_4_weeks", "last_30_days", "last_3_months", "this_month", "last_quarter"] {
        let current: TimeWindow = name.parse().unwrap();
        let prior: TimeWindow = format!("previous:{name}").parse().unwrap();
        let now = current.resolve(as_of()).unwrap();
        let before = prior.resolve(as_of()).unwrap();

        assert_eq!(before.end, now.start, "{name}");
        assert!(!before.overlaps(&now), "{name}");
        if name.ends_with("weeks") || name.ends_with("days") {
            assert_eq!(before.days(), now.days(), "{name}");
        }
    }
}

#[test]
fn test_comparison_compiles_both_periods() {
    let query = StructuredQuery::new(Intent::Comparison, "sales")
        .group_by("zone")
        .window("last_4_weeks");
    let Expansion::Comparison(pair) = expand(&query) else {
        panic!("expected a comparison");
    };

    assert_eq!(pair.current.filters, pair.prior.filters);
    assert_eq!(pair.current.group_by_dimensions(), pair.prior.group_by_dimensions());

    let current = compile(&pair.current);
    let prior = compile(&pair.prior);
    assert_eq!(window_params(&current), [date(2024, 5, 16), date(2024, 6, 13)]);
    assert_eq!(window_params(&prior), [date(2024, 4, 18), date(2024, 5, 16)]);

    // Only the bound dates differ.
    assert_eq!(current.sql, prior.sql);
    assert_ne!(current.fingerprint, prior.fingerprint);
}

#[test]
fn test_to_date_comparison_uses_same_days() {
    let query = StructuredQuery::new(Intent::Comparison, "sales").window("mtd");
    let Expansion::Comparison(pair) = expand(&query) else {
        panic!("expected a comparison");
    };
    assert_eq!(pair.prior.time_context.window, "previous:mtd");
    assert_eq!(
        window_params(&compile(&pair.prior)),
        [date(2024, 5, 1), date(2024, 5, 13)]
    );
}

#[test]
fn test_comparison_of_a_preceding_window_is_refused() {
    let registry = Registry::builtin().unwrap();
    let grammar = PatternGrammar::new(&registry, Settings::default().diagnostics);
    let query = StructuredQuery::new(Intent::Comparison, "sales").window("previous:this_month");
    assert_eq!(
        grammar.expand(&query),
        Err(PatternError::NestedComparison("previous:this_month".into()))
    );
}

// ============================================================================
// Trend, ranking and snapshot
// ============================================================================

#[test]
fn test_trend_groups_and_orders_by_time() {
    let query = StructuredQuery::new(Intent::Trend, "sales")
        .group_by("brand")
        .window("last_4_weeks")
        .grain(Grain::Week);
    let Expansion::Single { query: trend } = expand(&query) else {
        panic!("expected a single query");
    };
    assert_eq!(trend.group_by_dimensions(), ["week", "brand"]);

    let sql = compile(&trend).sql;
    assert!(sql.contains("\"dim_date\".\"week_start\" AS \"week\""));
    assert!(sql.contains("ORDER BY \"dim_date\".\"week_start\" ASC"));
}

#[test]
fn test_monthly_trend_buckets_sort_chronologically() {
    let query = StructuredQuery::new(Intent::Trend, "sales")
        .window("last_quarter")
        .grain(Grain::Month);
    let Expansion::Single { query: trend } = expand(&query) else {
        panic!("expected a single query");
    };
    assert_eq!(trend.group_by_dimensions(), ["month"]);

    let sql = compile(&trend).sql;
    assert!(sql.contains("\"dim_date\".\"month_start\" AS \"month\""));
    assert!(sql.contains("GROUP BY \"dim_date\".\"month_start\""));
    assert!(sql.contains("ORDER BY \"dim_date\".\"month_start\" ASC"));
    assert!(!sql.contains("month_name"));

    // Rows arrive in bucket order. By name, April would come first and
    // turn this rise into a fall.
    let rows: Vec<Row> = [("2024-02-01", 100.0), ("2024-03-01", 120.0), ("2024-04-01", 150.0)]
        .into_iter()
        .map(|(month, sales)| {
            let Value::Object(row) = json!({"month": month, "secondary_sales_value": sales}) else {
                unreachable!()
            };
            row
        })
        .collect();
    assert_eq!(
        trend_direction(&rows, "secondary_sales_value"),
        TrendDirection::Increasing
    );
}

#[test]
fn test_trend_needs_a_registered_grain() {
    let catalog = semql::registry::BUILTIN_CATALOG.replace("grain = \"quarter\"\n", "");
    let registry = Registry::from_toml_str(&catalog).unwrap();
    let grammar = PatternGrammar::new(&registry, Settings::default().diagnostics);
    let query = StructuredQuery::new(Intent::Trend, "sales").grain(Grain::Quarter);
    assert_eq!(
        grammar.expand(&query),
        Err(PatternError::NoTimeDimension(Grain::Quarter))
    );
}

#[test]
fn test_ranking_passes_through() {
    let query = StructuredQuery::new(Intent::Ranking, "sales")
        .group_by("brand")
        .sort("sales", SortDirection::Desc, Some(10));
    assert_eq!(expand(&query), Expansion::Single { query: query.clone() });
}

#[test]
fn test_snapshot_drops_time_grouping() {
    let query = StructuredQuery::new(Intent::Snapshot, "sales")
        .group_by("month")
        .group_by("state")
        .sort("month", SortDirection::Asc, None);
    let Expansion::Single { query: snapshot } = expand(&query) else {
        panic!("expected a single query");
    };
    assert_eq!(snapshot.group_by_dimensions(), ["state"]);
    assert!(snapshot.sorting.is_none());
    assert!(!compile(&snapshot).sql.contains("month_start"));
}

// ============================================================================
// Diagnostic
// ============================================================================

#[test]
fn test_diagnostic_prefers_the_callers_dimension() {
    let query = StructuredQuery::new(Intent::Diagnostic, "sales")
        .group_by("channel")
        .window("last_month")
        .filter("zone", FilterOp::Eq, ["South".into()]);
    let Expansion::Diagnostic(plan) = expand(&query) else {
        panic!("expected a diagnostic plan");
    };

    assert_eq!(plan.metric(), "sales");
    assert_eq!(
        plan.candidate_dimensions(),
        ["channel_name", "brand_name", "state_name"]
    );
    assert_eq!(plan.step(2).unwrap().query.group_by_dimensions(), ["channel_name"]);
    let drill = plan.step(8).unwrap();
    assert_eq!(drill.role, StepRole::DrillDown);
    assert!(matches!(
        &drill.depends_on,
        Some(StepDependency::TopContributor { candidates }) if candidates.len() == 3
    ));

    // Independent steps compile as they are; every one keeps the caller's filter.
    for step in plan.steps().iter().filter(|s| s.depends_on.is_none()) {
        let statement = compile(&step.query);
        assert!(statement.params.contains(&Param::Text("South".into())));
        assert!(statement.sql.contains("\"dim_geography\".\"zone_name\" = ?"));
    }
}

#[test]
fn test_diagnostic_without_a_fitting_candidate() {
    let settings = Settings::from_toml_str(
        r#"
        [diagnostics]
        candidate_dimensions = ["channel_name", "retailer_name"]
        "#,
    )
    .unwrap();
    let registry = Registry::builtin().unwrap();
    let grammar = PatternGrammar::new(&registry, settings.diagnostics.clone());
    let query = StructuredQuery::new(Intent::Diagnostic, "primary_sales_value");
    assert_eq!(
        grammar.expand(&query),
        Err(PatternError::NoCandidateDimension {
            metric: "primary_sales_value".into()
        })
    );
}

#[test]
fn test_plans_reject_forward_dependencies() {
    let query = StructuredQuery::new(Intent::Snapshot, "sales");
    let step = |index, depends_on| DiagnosticStep {
        index,
        role: StepRole::DrillDown,
        query: query.clone(),
        depends_on,
    };
    let brands = ContributionPair {
        dimension: "brand_name".into(),
        current_step: 2,
        prior_step: 3,
    };
    let forward = Some(StepDependency::TopContributor {
        candidates: vec![brands.clone()],
    });

    let err = DiagnosticPlan::new(
        "sales",
        vec![brands.clone()],
        vec![step(1, None), step(2, forward.clone())],
    )
    .unwrap_err();
    assert_eq!(err, PatternError::ForwardDependency { step: 2, depends_on: 2 });

    let err = DiagnosticPlan::new("sales", Vec::new(), vec![step(2, None)]).unwrap_err();
    assert_eq!(err, PatternError::StepOutOfOrder { position: 1, index: 2 });

    let plan = DiagnosticPlan::new(
        "sales",
        vec![brands],
        vec![step(1, None), step(2, None), step(3, None), step(4, forward)],
    )
    .unwrap();
    assert_eq!(plan.steps().len(), 4);
    assert_eq!(plan.candidate_dimensions(), ["brand_name"]);
}

#[test]
fn test_candidates_are_capped() {
    let settings = Settings::from_toml_str(
        r#"
        [diagnostics]
        max_candidates = 2
        "#,
    )
    .unwrap();
    let registry = Registry::builtin().unwrap();
    let query = StructuredQuery::new(Intent::Diagnostic, "sales").group_by("zone");
    let plan = PatternGrammar::new(&registry, settings.diagnostics)
        .diagnostic(&query)
        .unwrap();
    assert_eq!(plan.candidate_dimensions(), ["zone_name", "brand_name"]);
    assert_eq!(plan.steps().len(), 6);

    assert!(Settings::from_toml_str("[diagnostics]\nmax_candidates = 0\n").is_err());
}

#[test]
fn test_expansion_serializes_for_planning_output() {
    let query = StructuredQuery::new(Intent::Diagnostic, "sales").window("last_4_weeks");
    let json = serde_json::to_value(expand(&query)).unwrap();
    assert_eq!(json["kind"], "diagnostic");
    assert_eq!(json["steps"].as_array().unwrap().len(), 8);
    assert_eq!(json["steps"][7]["depends_on"]["kind"], "top_contributor");
    assert_eq!(
        json["steps"][7]["depends_on"]["candidates"][1]["dimension"],
        "state_name"
    );
    assert_eq!(json["steps"][2]["query"]["time_context"]["window"], "previous:last_4_weeks");
    assert_eq!(json["contributions"].as_array().unwrap().len(), 3);
}
