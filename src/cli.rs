use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{
    online::RemoteEngine,
    source::SourceKind,
    writer::{IfExists, SqlDialect},
};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Convert legacy database files into SQL dumps, SQLite, flat files and remote databases",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a conversion job and print its summary as JSON
    Convert(ConvertArgs),
    /// List the tables of a source with their inferred schema
    Inspect(InspectArgs),
    /// List the distinct partition values of a column, per table
    Partitions(PartitionArgs),
    /// Check that a remote database is reachable without changing it
    TestConnection(TestConnectionArgs),
}

/// Options describing the input dataset.
#[derive(Debug, Args, Clone, Default)]
pub struct SourceArgs {
    /// Source file (.mdb, .accdb, .csv, .tsv, .xlsx, .json, .jsonl ...)
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,
    /// Source kind when the extension does not tell it
    #[arg(long = "source-kind")]
    pub source_kind: Option<SourceKind>,
    /// Text encoding of delimited input, bypassing detection
    #[arg(long)]
    pub encoding: Option<String>,
    /// Field delimiter for delimited input (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Rows examined by schema inference (whole table when omitted)
    #[arg(long = "sample-rows")]
    pub sample_rows: Option<usize>,
    /// Fail on the first malformed row instead of skipping it
    #[arg(long)]
    pub strict: bool,
    /// Restrict the job to these tables
    #[arg(long = "table", action = clap::ArgAction::Append)]
    pub tables: Vec<String>,
    /// Process these tables first, in the given order
    #[arg(long = "table-order", value_delimiter = ',')]
    pub table_order: Vec<String>,
    /// Declared column types such as `joined=date` or `orders.total=decimal(12,2)`
    #[arg(long = "column-type", action = clap::ArgAction::Append)]
    pub column_types: Vec<String>,
    /// Primary-key columns, comma separated
    #[arg(long = "primary-key", value_delimiter = ',')]
    pub primary_key: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ConvertArgs {
    /// YAML job file describing the source and targets
    #[arg(long, conflicts_with_all = ["input", "targets"])]
    pub job: Option<PathBuf>,
    #[command(flatten)]
    pub source: SourceArgs,
    /// Target as KIND:DESTINATION, e.g. `sqlite:out/legacy.db` or `remote:{table}`
    #[arg(long = "to", action = clap::ArgAction::Append)]
    pub targets: Vec<String>,
    /// Destination naming template such as `at2-{year}`
    #[arg(long)]
    pub naming: Option<String>,
    /// Column whose values split every target into partitions
    #[arg(long = "partition-column")]
    pub partition_column: Option<String>,
    /// Rows per batch
    #[arg(long = "batch-size")]
    pub batch_size: Option<usize>,
    /// SQL dialect for sql_script targets
    #[arg(long)]
    pub dialect: Option<SqlDialect>,
    /// What remote targets do with an existing table (replace, append, fail)
    #[arg(long = "if-exists")]
    pub if_exists: Option<IfExists>,
    #[command(flatten)]
    pub remote: RemoteArgs,
}

/// Connection settings for remote targets.
#[derive(Debug, Args, Clone, Default)]
pub struct RemoteArgs {
    /// Remote server family: mysql (default) or postgres
    #[arg(long)]
    pub engine: Option<RemoteEngine>,
    #[arg(long)]
    pub host: Option<String>,
    /// Defaults to 3306 for MySQL and 5432 for Postgres
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub database: Option<String>,
    #[arg(long)]
    pub user: Option<String>,
    /// Credential reference: `env:NAME` or `file:PATH`
    #[arg(long)]
    pub credential: Option<String>,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    /// Print the inferred dataset as JSON instead of tables
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct PartitionArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    /// Partition column, e.g. a date column for per-year splits
    #[arg(short = 'c', long)]
    pub column: String,
    /// Print the report as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct TestConnectionArgs {
    /// Job file holding the remote target
    #[arg(long, requires = "target", conflicts_with = "host")]
    pub job: Option<PathBuf>,
    /// Name (or KIND:DESTINATION id) of the remote target in the job file
    #[arg(long)]
    pub target: Option<String>,
    #[command(flatten)]
    pub remote: RemoteArgs,
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_accepts_repeated_targets() {
        let cli = Cli::try_parse_from([
            "legacy-convert",
            "convert",
            "-i",
            "AT2.mdb",
            "--to",
            "sqlite:out.db",
            "--to",
            "remote:{table}",
            "--naming",
            "at2-{year}",
            "--dialect",
            "postgres",
            "--engine",
            "mariadb",
        ])
        .unwrap();
        let Commands::Convert(args) = cli.command else {
            panic!("expected convert");
        };
        assert_eq!(args.targets.len(), 2);
        assert_eq!(args.dialect, Some(SqlDialect::Postgres));
        assert_eq!(args.remote.engine, Some(RemoteEngine::Mysql));
    }

    #[test]
    fn job_file_excludes_inline_targets() {
        let parsed = Cli::try_parse_from([
            "legacy-convert",
            "convert",
            "--job",
            "job.yaml",
            "--to",
            "csv:out.csv",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn delimiters_accept_names() {
        assert_eq!(parse_delimiter("tab"), Ok(b'\t'));
        assert_eq!(parse_delimiter(";"), Ok(b';'));
        assert!(parse_delimiter("ab").is_err());
    }
}
