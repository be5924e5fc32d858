//! Request handling through the engine facade.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};

use semql::analysis::Row;
use semql::audit::{AuditSink, MemorySink};
use semql::compiler::CompiledStatement;
use semql::config::Settings;
use semql::orchestrator::{
    CancelSignal, ExecutionError, ExecutionOutput, PlanState, QueryExecutor,
};
use semql::query::{Grain, Intent, MetricVariant, SortDirection, StructuredQuery};
use semql::security::{AccessLevel, UserContext};
use semql::{
    Answer, CompileOptions, Dialect, Engine, ErrorKind, Registry, SemqlError, SharedRegistry,
};

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Default)]
struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<Vec<Row>, ExecutionError>>>,
    calls: Mutex<usize>,
}

impl ScriptedExecutor {
    fn new(script: Vec<Result<Vec<Row>, ExecutionError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _statement: &CompiledStatement,
    ) -> Result<ExecutionOutput, ExecutionError> {
        *self.calls.lock().unwrap() += 1;
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()));
        next.map(|rows| ExecutionOutput::new(rows, Duration::from_millis(12)))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn rows(values: Vec<Value>) -> Vec<Row> {
    values
        .into_iter()
        .map(|v| match v {
            Value::Object(row) => row,
            other => panic!("not an object: {other}"),
        })
        .collect()
}

fn engine() -> (Engine, Arc<MemorySink>) {
    let audit = Arc::new(MemorySink::new());
    let engine = Engine::new(
        SharedRegistry::new(Registry::builtin().unwrap()),
        Settings::default(),
    )
    .unwrap()
    .with_audit(audit.clone());
    (engine, audit)
}

fn admin() -> UserContext {
    UserContext::new("u-admin", "admin", AccessLevel::National)
}

fn options() -> CompileOptions {
    CompileOptions::default().with_as_of(NaiveDate::from_ymd_opt(2024, 6, 12).unwrap())
}

fn top_brands() -> StructuredQuery {
    StructuredQuery::new(Intent::Ranking, "sales")
        .group_by("brand")
        .window("this_month")
        .sort("sales", SortDirection::Desc, Some(3))
        .question("top 3 brands this month")
}

// ============================================================================
// Answers
// ============================================================================

#[tokio::test]
async fn test_single_query_answer() {
    let (engine, audit) = engine();
    let executor = ScriptedExecutor::new(vec![Ok(rows(vec![
        json!({"brand_name": "Aqua", "secondary_sales_value": 900.0}),
        json!({"brand_name": "Brio", "secondary_sales_value": 700.0}),
    ]))]);

    let answer = engine
        .answer(&executor, &top_brands(), Some(&admin()), options(), &CancelSignal::never())
        .await
        .unwrap();

    let Answer::Single { statement, output } = answer else {
        panic!("expected a single answer");
    };
    assert_eq!(statement.dialect, Dialect::DuckDb);
    assert!(statement.sql.ends_with("LIMIT 3"));
    assert_eq!(output.row_count, 2);

    let records = audit.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert!(record.success);
    assert_eq!(record.user_id.as_deref(), Some("u-admin"));
    assert_eq!(record.question.as_deref(), Some("top 3 brands this month"));
    assert_eq!(record.metric.as_deref(), Some("secondary_sales_value"));
    assert_eq!(record.result_count, Some(2));
    assert_eq!(record.execution_time_ms, Some(12));
    assert_eq!(record.fingerprint.as_ref(), Some(&statement.fingerprint));
    assert_eq!(record.sql.as_ref(), Some(&statement.sql));
}

#[tokio::test]
async fn test_comparison_answer_pairs_rows_by_key() {
    let (engine, audit) = engine();
    let executor = ScriptedExecutor::new(vec![
        Ok(rows(vec![
            json!({"zone_name": "South", "secondary_sales_value": 500.0}),
            json!({"zone_name": "North", "secondary_sales_value": 300.0}),
        ])),
        Ok(rows(vec![
            json!({"zone_name": "South", "secondary_sales_value": 400.0}),
            json!({"zone_name": "East", "secondary_sales_value": 50.0}),
        ])),
    ]);
    let query = StructuredQuery::new(Intent::Comparison, "sales")
        .group_by("zone")
        .window("last_4_weeks");

    let answer = engine
        .answer(&executor, &query, Some(&admin()), options(), &CancelSignal::never())
        .await
        .unwrap();

    let Answer::Comparison {
        current,
        prior,
        variant,
        rows,
    } = answer
    else {
        panic!("expected a comparison answer");
    };
    assert_eq!(variant, MetricVariant::Absolute);
    assert_eq!(current.sql, prior.sql);
    let keys: Vec<&str> = rows.iter().map(|r| r.key[0].as_str()).collect();
    assert_eq!(keys, ["East", "North", "South"]);
    assert_eq!(rows[0].current, 0.0);
    assert_eq!(rows[1].growth, None);
    assert_eq!(rows[2].delta, 100.0);
    assert_eq!(rows[2].growth, Some(0.25));

    assert_eq!(executor.calls(), 2);
    let records = audit.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].query_id, records[1].query_id);
    assert_eq!(records[1].time_window.as_deref(), Some("previous:last_4_weeks"));
}

#[tokio::test]
async fn test_comparison_rows_follow_requested_variant() {
    let (engine, _audit) = engine();
    let executor = ScriptedExecutor::new(vec![
        Ok(rows(vec![
            json!({"zone_name": "South", "secondary_sales_value": 500.0}),
            json!({"zone_name": "North", "secondary_sales_value": 300.0}),
        ])),
        Ok(rows(vec![
            json!({"zone_name": "South", "secondary_sales_value": 400.0}),
            json!({"zone_name": "North", "secondary_sales_value": 200.0}),
        ])),
    ]);
    let query = StructuredQuery::new(Intent::Comparison, "sales")
        .group_by("zone")
        .variant(MetricVariant::Growth);

    let answer = engine
        .answer(&executor, &query, Some(&admin()), options(), &CancelSignal::never())
        .await
        .unwrap();

    let Answer::Comparison { variant, rows, .. } = answer else {
        panic!("expected a comparison answer");
    };
    assert_eq!(variant, MetricVariant::Growth);
    // North grew 50%, South 25%; both moved by 100.
    let keys: Vec<&str> = rows.iter().map(|r| r.key[0].as_str()).collect();
    assert_eq!(keys, ["North", "South"]);
}

#[tokio::test]
async fn test_diagnostic_answer_carries_finding() {
    let (engine, audit) = engine();
    let executor = ScriptedExecutor::new(vec![
        Ok(rows(vec![
            json!({"week": "2024-05-20", "secondary_sales_value": 1000.0}),
            json!({"week": "2024-05-27", "secondary_sales_value": 800.0}),
        ])),
        Ok(rows(vec![json!({"brand_name": "Aqua", "secondary_sales_value": 300.0})])),
        Ok(rows(vec![json!({"brand_name": "Aqua", "secondary_sales_value": 500.0})])),
    ]);
    let query = StructuredQuery::new(Intent::Diagnostic, "sales")
        .window("last_4_weeks")
        .grain(Grain::Week);

    let answer = engine
        .answer(&executor, &query, Some(&admin()), options(), &CancelSignal::never())
        .await
        .unwrap();

    let Answer::Diagnostic(finding) = answer else {
        panic!("expected a diagnostic answer");
    };
    // State and channel came back empty, so brand is the only lead.
    assert_eq!(finding.state, PlanState::Concluded);
    assert_eq!(finding.explaining_dimension.as_deref(), Some("brand_name"));
    assert_eq!(finding.top_contributor().unwrap().value, "Aqua");
    assert_eq!(finding.total_delta, -200.0);
    assert_eq!(finding.trend.change_pct, -20.0);
    assert_eq!(executor.calls(), 8);

    let records = audit.records();
    assert_eq!(records.len(), 8);
    assert!(records.iter().all(|r| r.query_id == records[0].query_id));
    assert!(records.iter().all(|r| r.user_id.as_deref() == Some("u-admin")));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_invalid_query_is_audited_and_never_executed() {
    let (engine, audit) = engine();
    let executor = ScriptedExecutor::default();
    let query = StructuredQuery::new(Intent::Ranking, "sales").group_by("brand");

    let err = engine
        .answer(&executor, &query, Some(&admin()), options(), &CancelSignal::never())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(executor.calls(), 0);
    let records = audit.records();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert_eq!(records[0].error_kind, Some(ErrorKind::Validation));
    assert!(records[0].sql.is_none());
}

#[tokio::test]
async fn test_execution_failure_is_audited_once() {
    let (engine, audit) = engine();
    let executor = ScriptedExecutor::new(vec![Err(ExecutionError::new("connection reset"))]);

    let err = engine
        .answer(&executor, &top_brands(), Some(&admin()), options(), &CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, SemqlError::Execution(_)));
    assert!(err.to_string().contains("connection reset"));
    let records = audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_kind, Some(ErrorKind::Execution));
    assert!(records[0].sql.is_some());
}

#[tokio::test]
async fn test_missing_user_is_refused() {
    let (engine, audit) = engine();
    let executor = ScriptedExecutor::default();

    let err = engine
        .answer(&executor, &top_brands(), None, options(), &CancelSignal::never())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Security);
    assert_eq!(executor.calls(), 0);
    assert_eq!(audit.records()[0].user_id, None);
}

// ============================================================================
// Compile only
// ============================================================================

#[test]
fn test_compile_lists_every_statement() {
    let (engine, audit) = engine();
    let user = admin();

    let comparison = StructuredQuery::new(Intent::Comparison, "sales").window("this_month");
    let statements = engine
        .compile(&comparison, Some(&user), options().with_dialect(Dialect::Postgres))
        .unwrap();
    assert_eq!(statements.len(), 2);
    assert!(statements.iter().all(|s| s.dialect == Dialect::Postgres));

    // The drill-down depends on run-time rows and is left out.
    let diagnostic = StructuredQuery::new(Intent::Diagnostic, "sales");
    let statements = engine.compile(&diagnostic, Some(&user), options()).unwrap();
    assert_eq!(statements.len(), 7);

    assert_eq!(audit.records().len(), 9);
    assert!(audit.records().iter().all(|r| r.success));
}

#[test]
fn test_audit_log_file_from_settings() {
    let path = std::env::temp_dir().join(format!("semql-engine-{}.jsonl", uuid::Uuid::new_v4()));
    let settings = Settings::from_toml_str(&format!(
        "[audit]\npath = \"{}\"\n",
        path.display().to_string().replace('\\', "\\\\")
    ))
    .unwrap();
    let engine = Engine::from_settings(settings).unwrap();

    let user = admin();
    engine.compile(&top_brands(), Some(&user), options()).unwrap();
    let _ = engine.compile(&top_brands(), None, options());

    let content = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).ok();
    let lines: Vec<Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["success"], true);
    assert_eq!(lines[1]["success"], false);
    assert_eq!(lines[1]["error_kind"], "security");
}

#[test]
fn test_custom_sink_receives_records() {
    struct Counting(Mutex<usize>);

    impl AuditSink for Counting {
        fn record(&self, _record: &semql::audit::AuditRecord) {
            *self.0.lock().unwrap() += 1;
        }
    }

    let sink = Arc::new(Counting(Mutex::new(0)));
    let engine = Engine::new(
        SharedRegistry::new(Registry::builtin().unwrap()),
        Settings::default(),
    )
    .unwrap()
    .with_audit(sink.clone());
    engine
        .compile(&top_brands(), Some(&admin()), options())
        .unwrap();
    assert_eq!(*sink.0.lock().unwrap(), 1);
}
