//! End-to-end request handling.
//!
//! ```text
//! StructuredQuery ──▶ PatternGrammar::expand
//!                        │ one query per step
//!                        ▼
//!                 Validator::certify ──▶ RowLevelSecurity::secure ──▶ Compiler::compile
//!                                                                       │
//!                                                  QueryExecutor ◀──────┘
//!                                                       │
//!                                                 analysis / orchestrator ──▶ AuditSink
//! ```
//!
//! Every request works against one registry snapshot taken when it
//! starts, so a concurrent [`SharedRegistry::swap`] never changes a
//! request halfway through.

use std::sync::Arc;

use chrono::{Local, NaiveDate};
use serde::Serialize;
use uuid::Uuid;

use crate::analysis::{self, ComparisonRow};
use crate::audit::{AuditRecord, AuditSink, JsonLinesSink, TracingSink};
use crate::compiler::{CompiledStatement, Compiler, RendererRegistry};
use crate::config::Settings;
use crate::error::{SemqlError, SemqlResult};
use crate::orchestrator::{
    CancelSignal, CompiledStep, DiagnosticFinding, DiagnosticOrchestrator, ExecutionOutput,
    QueryExecutor, StepCompiler,
};
use crate::patterns::{Expansion, PatternGrammar};
use crate::query::{MetricVariant, StructuredQuery};
use crate::registry::{Registry, SharedRegistry};
use crate::security::{RowLevelSecurity, SecuredQuery, UserContext};
use crate::sql::Dialect;
use crate::validation::{CertifiedQuery, ValidationFailed, ValidationReport, Validator};

/// Per-request compilation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Falls back to `compiler.default_dialect`.
    pub dialect: Option<Dialect>,
    /// Date time windows resolve against. Falls back to today.
    pub as_of: Option<NaiveDate>,
}

impl CompileOptions {
    #[must_use]
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = Some(dialect);
        self
    }

    #[must_use]
    pub fn with_as_of(mut self, as_of: NaiveDate) -> Self {
        self.as_of = Some(as_of);
        self
    }
}

/// Validate, secure and compile against one registry snapshot for one user.
pub struct Pipeline<'a> {
    registry: &'a Registry,
    settings: &'a Settings,
    user: Option<&'a UserContext>,
    security: RowLevelSecurity,
    dialect: Dialect,
    as_of: NaiveDate,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        registry: &'a Registry,
        settings: &'a Settings,
        user: Option<&'a UserContext>,
        options: CompileOptions,
    ) -> Self {
        Self {
            registry,
            settings,
            user,
            security: RowLevelSecurity::new(settings.security.clone()),
            dialect: options
                .dialect
                .unwrap_or(settings.compiler.default_dialect),
            as_of: options.as_of.unwrap_or_else(|| Local::now().date_naive()),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    pub fn expand(&self, query: &StructuredQuery) -> SemqlResult<Expansion> {
        Ok(PatternGrammar::new(self.registry, self.settings.diagnostics.clone()).expand(query)?)
    }

    pub fn certify(&self, query: &StructuredQuery) -> SemqlResult<CertifiedQuery> {
        Validator::new(self.registry, self.settings.validation.clone())
            .certify(query)
            .map_err(|report| ValidationFailed::from(report).into())
    }

    pub fn secure(&self, query: &StructuredQuery) -> SemqlResult<SecuredQuery> {
        let certified = self.certify(query)?;
        Ok(self.security.secure(certified, self.user)?)
    }

    pub fn compile(&self, query: &StructuredQuery) -> SemqlResult<CompiledStep> {
        let secured = self.secure(query)?;
        let renderers = RendererRegistry::new(self.settings.compiler.dialects.iter().copied());
        let statement =
            Compiler::new(self.registry, renderers, self.as_of).compile(&secured, self.dialect)?;
        Ok(CompiledStep {
            query: secured.query().clone(),
            statement,
        })
    }
}

impl StepCompiler for Pipeline<'_> {
    fn compile_step(&self, query: &StructuredQuery) -> SemqlResult<CompiledStep> {
        self.compile(query)
    }
}

/// Outcome of [`Engine::answer`].
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Answer {
    Single {
        statement: CompiledStatement,
        output: ExecutionOutput,
    },
    Comparison {
        current: CompiledStatement,
        prior: CompiledStatement,
        variant: MetricVariant,
        rows: Vec<ComparisonRow>,
    },
    Diagnostic(DiagnosticFinding),
}

/// Request-level facade over one shared registry.
///
/// The executor is supplied per call to [`Engine::answer`]; compiling,
/// validating and planning need none.
pub struct Engine {
    registry: SharedRegistry,
    settings: Settings,
    audit: Arc<dyn AuditSink>,
}

impl Engine {
    /// Audit records go where `settings.audit` says.
    pub fn new(registry: SharedRegistry, settings: Settings) -> SemqlResult<Self> {
        let audit: Arc<dyn AuditSink> = match settings.audit_path()? {
            Some(path) => Arc::new(JsonLinesSink::new(path)),
            None => Arc::new(TracingSink),
        };
        Ok(Self {
            registry,
            settings,
            audit,
        })
    }

    /// Load the configured catalog, or the built-in one.
    pub fn from_settings(settings: Settings) -> SemqlResult<Self> {
        let registry = load_registry(&settings)?;
        Self::new(SharedRegistry::new(registry), settings)
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn validate(&self, query: &StructuredQuery) -> ValidationReport {
        let registry = self.registry.snapshot();
        Validator::new(&registry, self.settings.validation.clone()).validate(query)
    }

    pub fn expand(&self, query: &StructuredQuery) -> SemqlResult<Expansion> {
        let registry = self.registry.snapshot();
        Ok(PatternGrammar::new(&registry, self.settings.diagnostics.clone()).expand(query)?)
    }

    /// Compile every statement the request expands to, without executing.
    ///
    /// A diagnostic step that filters on an earlier step's rows is left
    /// out, since its SQL only exists at run time.
    pub fn compile(
        &self,
        query: &StructuredQuery,
        user: Option<&UserContext>,
        options: CompileOptions,
    ) -> SemqlResult<Vec<CompiledStatement>> {
        let query_id = Uuid::new_v4();
        let user_id = user.map(|u| u.user_id.as_str());
        let registry = self.registry.snapshot();
        let pipeline = Pipeline::new(&registry, &self.settings, user, options);

        let compiled = self.compile_expansion(&pipeline, query);
        match &compiled {
            Ok(steps) => {
                for step in steps {
                    self.audit.record(
                        &AuditRecord::for_query(query_id, user_id, &step.query)
                            .with_statement(&step.statement)
                            .succeeded(),
                    );
                }
            }
            Err(e) => self.audit_error(query_id, user_id, query, e),
        }
        Ok(compiled?.into_iter().map(|s| s.statement).collect())
    }

    fn compile_expansion(
        &self,
        pipeline: &Pipeline<'_>,
        query: &StructuredQuery,
    ) -> SemqlResult<Vec<CompiledStep>> {
        let expansion = pipeline.expand(query)?;
        match expansion {
            Expansion::Single { query } => Ok(vec![pipeline.compile(&query)?]),
            Expansion::Comparison(pair) => Ok(vec![
                pipeline.compile(&pair.current)?,
                pipeline.compile(&pair.prior)?,
            ]),
            Expansion::Diagnostic(plan) => plan
                .steps()
                .iter()
                .filter(|step| step.depends_on.is_none())
                .map(|step| pipeline.compile(&step.query))
                .collect(),
        }
    }

    /// Run a request end to end.
    ///
    /// A diagnostic plan that aborts still returns `Ok` with a finding that
    /// carries the completed steps and the step error. `cancel` applies to
    /// diagnostic plans.
    pub async fn answer(
        &self,
        executor: &dyn QueryExecutor,
        query: &StructuredQuery,
        user: Option<&UserContext>,
        options: CompileOptions,
        cancel: &CancelSignal,
    ) -> SemqlResult<Answer> {
        let query_id = Uuid::new_v4();
        let user_id = user.map(|u| u.user_id.as_str());
        let registry = self.registry.snapshot();
        let pipeline = Pipeline::new(&registry, &self.settings, user, options);

        tracing::info!(
            query_id = %query_id,
            intent = %query.intent,
            dialect = %pipeline.dialect(),
            "answering query"
        );
        let answer = self
            .run(executor, &pipeline, query, query_id, user_id, cancel)
            .await;
        if let Err(e) = &answer {
            self.audit_error(query_id, user_id, query, e);
        }
        answer
    }

    async fn run(
        &self,
        executor: &dyn QueryExecutor,
        pipeline: &Pipeline<'_>,
        query: &StructuredQuery,
        query_id: Uuid,
        user_id: Option<&str>,
        cancel: &CancelSignal,
    ) -> SemqlResult<Answer> {
        let expansion = pipeline.expand(query)?;
        match expansion {
            Expansion::Single { query } => {
                let step = pipeline.compile(&query)?;
                let output = self.execute(executor, &step, query_id, user_id).await?;
                Ok(Answer::Single {
                    statement: step.statement,
                    output,
                })
            }
            Expansion::Comparison(pair) => {
                let current = pipeline.compile(&pair.current)?;
                let prior = pipeline.compile(&pair.prior)?;
                let now = self.execute(executor, &current, query_id, user_id).await?;
                let before = self.execute(executor, &prior, query_id, user_id).await?;

                let keys: Vec<&str> = current
                    .query
                    .group_by_dimensions()
                    .iter()
                    .map(String::as_str)
                    .collect();
                let variant = current.query.metric_request.variant;
                let mut rows = analysis::compare(
                    &now.rows,
                    &before.rows,
                    &keys,
                    current.query.primary_metric(),
                );
                analysis::order_by_variant(&mut rows, variant);
                Ok(Answer::Comparison {
                    current: current.statement,
                    prior: prior.statement,
                    variant,
                    rows,
                })
            }
            Expansion::Diagnostic(plan) => {
                let finding = DiagnosticOrchestrator::new(pipeline, executor, self.audit.as_ref())
                    .for_request(query_id, user_id)
                    .run(&plan, cancel)
                    .await;
                Ok(Answer::Diagnostic(finding))
            }
        }
    }

    async fn execute(
        &self,
        executor: &dyn QueryExecutor,
        step: &CompiledStep,
        query_id: Uuid,
        user_id: Option<&str>,
    ) -> SemqlResult<ExecutionOutput> {
        let record = AuditRecord::for_query(query_id, user_id, &step.query)
            .with_statement(&step.statement);
        match executor.execute(&step.statement).await {
            Ok(output) => {
                tracing::debug!(
                    query_id = %query_id,
                    rows = output.row_count,
                    elapsed_ms = output.execution_time_ms(),
                    "statement executed"
                );
                self.audit.record(&record.with_output(&output));
                Ok(output)
            }
            Err(e) => {
                let error = SemqlError::from(e);
                self.audit.record(&record.with_error(&error));
                Err(error)
            }
        }
    }

    /// Errors raised before execution. Execution failures are recorded
    /// where they happen, with their statement.
    fn audit_error(
        &self,
        query_id: Uuid,
        user_id: Option<&str>,
        query: &StructuredQuery,
        error: &SemqlError,
    ) {
        if matches!(error, SemqlError::Execution(_)) {
            return;
        }
        tracing::info!(query_id = %query_id, kind = %error.kind(), "request rejected");
        self.audit
            .record(&AuditRecord::for_query(query_id, user_id, query).with_error(error));
    }
}

/// The registry named by `registry.catalog`, or the built-in catalog.
pub fn load_registry(settings: &Settings) -> SemqlResult<Registry> {
    let registry = match settings.catalog_path()? {
        Some(path) => Registry::from_file(path)?,
        None => Registry::builtin()?,
    };
    Ok(registry)
}
