//! semql CLI - compile structured queries to SQL
//!
//! Usage:
//!   semql compile <query.json> [--user <user.json>] [--dialect <dialect>] [--as-of <date>]
//!   semql validate <query.json>
//!   semql plan <query.json>
//!   semql catalog
//!
//! Examples:
//!   semql compile queries/top_brands.json --user users/admin.json --dialect postgres
//!   semql plan queries/why_sales_dropped.json
//!   RUST_LOG=semql=debug semql compile q.json --user u.json --output json

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use semql::config::Settings;
use semql::security::UserContext;
use semql::validation::parse_query;
use semql::{CompileOptions, Dialect, Engine, StructuredQuery};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "semql")]
#[command(about = "semql - validated, access-controlled SQL from structured business questions")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to $SEMQL_CONFIG, ./semql.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a structured query to SQL
    Compile {
        /// Path to the query JSON file
        file: PathBuf,

        /// Path to the user context JSON file
        #[arg(short, long)]
        user: Option<PathBuf>,

        /// SQL dialect to generate (defaults to compiler.default_dialect)
        #[arg(short, long)]
        dialect: Option<Dialect>,

        /// Date time windows resolve against (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Output format
        #[arg(short, long, default_value = "sql")]
        output: OutputFormat,
    },

    /// Validate a structured query and list every error and warning
    Validate {
        /// Path to the query JSON file
        file: PathBuf,
    },

    /// Show the queries a request expands to
    Plan {
        /// Path to the query JSON file
        file: PathBuf,
    },

    /// List catalog metrics and dimensions
    Catalog,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// SQL text with bound parameters as comments
    Sql,
    /// Compiled statements as JSON
    Json,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let engine = match load_engine(cli.config.as_deref()) {
        Ok(engine) => engine,
        Err(message) => {
            eprintln!("{}", message);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Compile {
            file,
            user,
            dialect,
            as_of,
            output,
        } => cmd_compile(&engine, &file, user.as_deref(), dialect, as_of, output),
        Commands::Validate { file } => cmd_validate(&engine, &file),
        Commands::Plan { file } => cmd_plan(&engine, &file),
        Commands::Catalog => cmd_catalog(&engine),
    }
}

fn load_engine(config: Option<&Path>) -> Result<Engine, String> {
    let settings = match config {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    }
    .map_err(|e| format!("Configuration error: {}", e))?;
    Engine::from_settings(settings).map_err(|e| format!("Failed to load catalog: {}", e))
}

fn read_file(path: &Path) -> Result<String, ExitCode> {
    fs::read_to_string(path).map_err(|e| {
        eprintln!("Error reading file '{}': {}", path.display(), e);
        ExitCode::FAILURE
    })
}

fn read_query(path: &Path) -> Result<StructuredQuery, ExitCode> {
    let source = read_file(path)?;
    parse_query(&source).map_err(|e| {
        eprintln!("Invalid query: {}", e);
        ExitCode::FAILURE
    })
}

fn read_user(path: &Path) -> Result<UserContext, ExitCode> {
    let source = read_file(path)?;
    serde_json::from_str(&source).map_err(|e| {
        eprintln!("Invalid user context '{}': {}", path.display(), e);
        ExitCode::FAILURE
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to serialize output: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_compile(
    engine: &Engine,
    file: &Path,
    user: Option<&Path>,
    dialect: Option<Dialect>,
    as_of: Option<NaiveDate>,
    output: OutputFormat,
) -> ExitCode {
    let query = match read_query(file) {
        Ok(query) => query,
        Err(code) => return code,
    };
    let user = match user.map(read_user).transpose() {
        Ok(user) => user,
        Err(code) => return code,
    };
    let options = CompileOptions { dialect, as_of };

    let statements = match engine.compile(&query, user.as_ref(), options) {
        Ok(statements) => statements,
        Err(e) => {
            eprintln!("Compilation error ({}): {}", e.kind(), e);
            return ExitCode::FAILURE;
        }
    };

    match output {
        OutputFormat::Json => print_json(&statements),
        OutputFormat::Sql => {
            for (i, statement) in statements.iter().enumerate() {
                if i > 0 {
                    println!();
                }
                println!("-- Dialect: {}", statement.dialect);
                println!("-- Fingerprint: {}", statement.fingerprint);
                for (n, param) in statement.params.iter().enumerate() {
                    println!("-- Param {}: {}", n + 1, param);
                }
                println!("{};", statement.sql);
            }
            ExitCode::SUCCESS
        }
    }
}

fn cmd_validate(engine: &Engine, file: &Path) -> ExitCode {
    let query = match read_query(file) {
        Ok(query) => query,
        Err(code) => return code,
    };

    let report = engine.validate(&query);
    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
    if report.is_valid() {
        println!("OK: {} is valid", file.display());
        return ExitCode::SUCCESS;
    }

    eprintln!("Validation errors:");
    for error in &report.errors {
        eprintln!("  [{}] {}", error.rule(), error);
    }
    ExitCode::FAILURE
}

fn cmd_plan(engine: &Engine, file: &Path) -> ExitCode {
    let query = match read_query(file) {
        Ok(query) => query,
        Err(code) => return code,
    };
    match engine.expand(&query) {
        Ok(expansion) => print_json(&expansion),
        Err(e) => {
            eprintln!("Planning error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_catalog(engine: &Engine) -> ExitCode {
    let registry = engine.registry().snapshot();

    println!("Metrics:");
    for metric in registry.list_metrics() {
        println!(
            "  - {} ({}({}.{}))",
            metric.name,
            metric.aggregation.function_name(),
            metric.table,
            metric.column
        );
        if !metric.description.is_empty() {
            println!("      {}", metric.description);
        }
    }
    println!();

    println!("Dimensions:");
    for dimension in registry.list_dimensions() {
        let grain = dimension
            .grain
            .map(|g| format!(", grain: {}", g))
            .unwrap_or_default();
        println!(
            "  - {} ({}.{}{})",
            dimension.name, dimension.table, dimension.column, grain
        );
    }
    println!();

    println!("Calendar: {}", registry.calendar_dimension().name);
    ExitCode::SUCCESS
}
