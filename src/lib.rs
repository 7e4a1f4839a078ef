pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod io_utils;
pub mod naming;
pub mod online;
pub mod orchestrator;
pub mod report;
pub mod rows;
pub mod schema;
pub mod source;
pub mod table;
pub mod typemap;
pub mod writer;

use std::{env, sync::OnceLock};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::{
    cli::{Cli, Commands, RemoteArgs, SourceArgs},
    config::{EngineConfig, JobFile},
    online::{EngineConnector, OnlineContext, RemoteDescriptor, RemoteEngine, ThreadSleeper},
    orchestrator::{CancelToken, ConversionJob},
    schema::{CanonicalType, ColumnOverride},
    source::{SourceDescriptor, SourceOptions},
    writer::{TargetDescriptor, TargetKind},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("legacy_convert", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

/// Parses the command line and runs it, returning the process exit code.
pub fn run() -> Result<i32> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Convert(args) => handle_convert(&args),
        Commands::Inspect(args) => handle_inspect(&args),
        Commands::Partitions(args) => handle_partitions(&args),
        Commands::TestConnection(args) => handle_test_connection(&args),
    }
}

fn engine_config(base: EngineConfig) -> Result<EngineConfig> {
    base.from_env().context("Applying LEGACY_CONVERT_* overrides")
}

fn source_descriptor(args: &SourceArgs) -> Result<SourceDescriptor> {
    let input = args
        .input
        .clone()
        .ok_or_else(|| anyhow!("an input file is required (-i/--input)"))?;
    let mut options = SourceOptions {
        sample_rows: args.sample_rows,
        strict: args.strict,
        encoding: args.encoding.clone(),
        delimiter: args.delimiter,
        tables: args.tables.clone(),
        table_order: args.table_order.clone(),
        primary_key: args.primary_key.clone(),
        ..SourceOptions::default()
    };
    for spec in &args.column_types {
        let (column, ty) = spec
            .split_once('=')
            .ok_or_else(|| anyhow!("column type '{spec}' must look like column=type"))?;
        let ty: CanonicalType = ty
            .parse()
            .with_context(|| format!("Parsing column type for '{column}'"))?;
        options.columns.insert(
            column.trim().to_string(),
            ColumnOverride {
                ty: Some(ty),
                ..ColumnOverride::default()
            },
        );
    }
    Ok(SourceDescriptor {
        kind: args.source_kind,
        path: input,
        options,
    })
}

/// Builds connection settings from flags; `fallback` is the engine used when
/// `--engine` is absent.
fn remote_descriptor(args: &RemoteArgs, fallback: RemoteEngine) -> Result<RemoteDescriptor> {
    let host = args.host.clone().ok_or_else(|| anyhow!("--host is required"))?;
    let database = args
        .database
        .clone()
        .ok_or_else(|| anyhow!("--database is required"))?;
    let user = args.user.clone().ok_or_else(|| anyhow!("--user is required"))?;
    Ok(RemoteDescriptor {
        engine: args.engine.unwrap_or(fallback),
        host,
        port: args.port,
        database,
        user,
        credential_ref: args.credential.clone(),
    })
}

fn inline_targets(args: &cli::ConvertArgs) -> Result<Vec<TargetDescriptor>> {
    if args.targets.is_empty() {
        bail!("at least one --to KIND:DESTINATION is required");
    }
    args.targets
        .iter()
        .map(|spec| {
            let mut target = TargetDescriptor::parse_spec(spec)
                .with_context(|| format!("Parsing target '{spec}'"))?;
            target.naming = args.naming.clone();
            target.partition_column = args.partition_column.clone();
            target.batch_size = args.batch_size;
            if let Some(dialect) = args.dialect {
                target.dialect = dialect;
            }
            if let Some(if_exists) = args.if_exists {
                target.if_exists = if_exists;
            }
            if target.kind == TargetKind::Remote {
                // A `postgres:` or `mysql:` prefix names the engine.
                let fallback: RemoteEngine = spec
                    .split_once(':')
                    .and_then(|(kind, _)| kind.parse().ok())
                    .unwrap_or_default();
                target.remote = Some(
                    remote_descriptor(&args.remote, fallback)
                        .with_context(|| format!("Remote target '{spec}'"))?,
                );
            }
            Ok(target)
        })
        .collect()
}

fn handle_convert(args: &cli::ConvertArgs) -> Result<i32> {
    let (source, targets, engine) = match &args.job {
        Some(path) => {
            let job = JobFile::load(path).with_context(|| format!("Loading job file {path:?}"))?;
            (job.source, job.targets, job.engine)
        }
        None => (
            source_descriptor(&args.source)?,
            inline_targets(args)?,
            EngineConfig::default(),
        ),
    };
    let config = engine_config(engine)?;
    debug!("Engine settings: {config:?}");
    let job = ConversionJob::new(source, targets, config).context("Preparing conversion job")?;
    let summary = job.run();
    info!(
        "Job {} finished {:?}: {} row(s) written, {} skipped, {} warning(s)",
        summary.job_id,
        summary.state,
        summary.rows_written,
        summary.rows_skipped,
        summary.warnings.len()
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Serializing job summary")?
    );
    Ok(summary.exit_code())
}

fn handle_inspect(args: &cli::InspectArgs) -> Result<i32> {
    let descriptor = source_descriptor(&args.source)?;
    let config = engine_config(EngineConfig::default())?;
    let reader = source::open_reader(&descriptor, &config)
        .with_context(|| format!("Opening {:?}", descriptor.path))?;
    let (dataset, warnings) = orchestrator::infer_dataset(reader.as_ref(), &descriptor.options)
        .with_context(|| format!("Inferring schema of {:?}", descriptor.path))?;
    if args.json {
        let value = serde_json::json!({ "dataset": dataset, "warnings": warnings });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(0);
    }
    let headers: Vec<String> = ["column", "type", "nullable", "origin", "source type"]
        .iter()
        .map(|h| h.to_string())
        .collect();
    for table in &dataset.tables {
        let rows = table
            .row_count
            .map_or_else(|| "unknown".to_string(), |n| n.to_string());
        println!("Table: {} ({rows} rows)", table.name);
        let cells: Vec<Vec<String>> = table
            .columns
            .iter()
            .map(|column| {
                vec![
                    column.name.clone(),
                    column.ty.token(),
                    column.nullable.to_string(),
                    format!("{:?}", column.origin).to_lowercase(),
                    column.source_type.clone().unwrap_or_default(),
                ]
            })
            .collect();
        table::print_table(&headers, &cells);
        if !table.primary_key.is_empty() {
            println!("Primary key: {}", table.primary_key.join(", "));
        }
        println!();
    }
    for warning in &warnings {
        println!("warning: [{}] {}", warning.table, warning.message);
    }
    Ok(0)
}

fn handle_partitions(args: &cli::PartitionArgs) -> Result<i32> {
    let descriptor = source_descriptor(&args.source)?;
    let config = engine_config(EngineConfig::default())?;
    let reader = source::open_reader(&descriptor, &config)
        .with_context(|| format!("Opening {:?}", descriptor.path))?;
    let reports =
        orchestrator::discover_partitions(reader.as_ref(), &descriptor.options, &args.column)
            .with_context(|| format!("Scanning partition column '{}'", args.column))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(0);
    }
    let headers: Vec<String> = ["table", args.column.as_str(), "rows"]
        .iter()
        .map(|h| h.to_string())
        .collect();
    let rows: Vec<Vec<String>> = reports
        .iter()
        .flat_map(|report| {
            report.values.iter().map(|(value, count)| {
                vec![report.table.clone(), value.clone(), count.to_string()]
            })
        })
        .collect();
    table::print_table(&headers, &rows);
    for report in reports.iter().filter(|r| !r.column_found) {
        println!("warning: table '{}' has no column '{}'", report.table, args.column);
    }
    Ok(0)
}

fn handle_test_connection(args: &cli::TestConnectionArgs) -> Result<i32> {
    let (descriptor, engine) = match (&args.job, &args.target) {
        (Some(path), Some(name)) => {
            let job = JobFile::load(path).with_context(|| format!("Loading job file {path:?}"))?;
            let target = job
                .targets
                .iter()
                .find(|t| t.name.as_deref() == Some(name.as_str()) || t.id() == *name)
                .ok_or_else(|| anyhow!("job file has no target named '{name}'"))?;
            let remote = target
                .remote
                .clone()
                .ok_or_else(|| anyhow!("target '{name}' is not a remote target"))?;
            (remote, job.engine)
        }
        _ => (
            remote_descriptor(&args.remote, RemoteEngine::default())?,
            EngineConfig::default(),
        ),
    };
    let config = engine_config(engine)?;
    let cancel = CancelToken::default();
    let ctx = OnlineContext {
        connector: &EngineConnector,
        sleeper: &ThreadSleeper,
        config: &config,
        cancel: &cancel,
    };
    let check = online::test_connection(&descriptor, &ctx);
    println!("{}", serde_json::to_string_pretty(&check)?);
    Ok(if check.ok { 0 } else { 1 })
}
