use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ConvertError, Result},
    source::SourceDescriptor,
    writer::TargetDescriptor,
};

pub const ENV_BATCH_SIZE: &str = "LEGACY_CONVERT_BATCH_SIZE";
pub const ENV_CHUNK_THRESHOLD: &str = "LEGACY_CONVERT_CHUNK_THRESHOLD";
pub const ENV_MAX_FILE_SIZE_MB: &str = "LEGACY_CONVERT_MAX_FILE_SIZE_MB";
pub const ENV_MAX_RETRIES: &str = "LEGACY_CONVERT_MAX_RETRIES";
pub const ENV_MDBTOOLS_DIR: &str = "LEGACY_CONVERT_MDBTOOLS_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            multiplier: 2,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub batch_size: usize,
    /// Tables with more rows than this are always split into `batch_size` chunks.
    pub chunk_threshold: u64,
    pub max_batch_bytes: usize,
    pub max_file_size_mb: u64,
    pub rows_per_statement: usize,
    pub retry: RetrySettings,
    pub connect_timeout_secs: u64,
    pub statement_timeout_secs: u64,
    /// Malformed-row warnings kept per table before they are summarised.
    pub warning_cap: usize,
    pub mdbtools_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            chunk_threshold: 10_000,
            max_batch_bytes: 8 * 1024 * 1024,
            max_file_size_mb: 1024,
            rows_per_statement: 500,
            retry: RetrySettings::default(),
            connect_timeout_secs: 10,
            statement_timeout_secs: 60,
            warning_cap: 100,
            mdbtools_dir: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConvertError::Config(format!("{name} has an invalid value '{value}'")))
}

impl EngineConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }

    /// Applies `LEGACY_CONVERT_*` overrides from the process environment.
    pub fn from_env(self) -> Result<Self> {
        self.with_overrides(std::env::vars())
    }

    pub fn with_overrides<I>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            match name.as_str() {
                ENV_BATCH_SIZE => self.batch_size = parse_env(&name, &value)?,
                ENV_CHUNK_THRESHOLD => self.chunk_threshold = parse_env(&name, &value)?,
                ENV_MAX_FILE_SIZE_MB => self.max_file_size_mb = parse_env(&name, &value)?,
                ENV_MAX_RETRIES => self.retry.max_attempts = parse_env(&name, &value)?,
                ENV_MDBTOOLS_DIR if !value.trim().is_empty() => {
                    self.mdbtools_dir = Some(PathBuf::from(value.trim()))
                }
                _ => continue,
            }
            debug!("Engine setting overridden by {name}");
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ConvertError::Config("batch_size must be at least 1".into()));
        }
        if self.rows_per_statement == 0 {
            return Err(ConvertError::Config(
                "rows_per_statement must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConvertError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// A conversion job as written in a YAML job file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobFile {
    pub source: SourceDescriptor,
    pub targets: Vec<TargetDescriptor>,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl JobFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            ConvertError::Config(format!("cannot read job file {path:?}: {err}"))
        })?;
        let mut job = Self::parse(&raw)?;
        // Relative paths in a job file are resolved against its directory.
        if let Some(base) = path.parent() {
            if job.source.path.is_relative() {
                job.source.path = base.join(&job.source.path);
            }
            for target in &mut job.targets {
                target.resolve_relative_to(base);
            }
        }
        Ok(job)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let job: JobFile = serde_yaml::from_str(raw)
            .map_err(|err| ConvertError::Config(format!("invalid job file: {err}")))?;
        if job.targets.is_empty() {
            return Err(ConvertError::Config("job file lists no targets".into()));
        }
        job.engine.validate()?;
        Ok(job)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|err| ConvertError::Config(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::TargetKind;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.chunk_threshold, 10_000);
        assert_eq!(config.max_file_size_bytes(), 1024 * 1024 * 1024);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn environment_overrides_are_strict() {
        let config = EngineConfig::default()
            .with_overrides(vars(&[
                (ENV_BATCH_SIZE, "250"),
                (ENV_MDBTOOLS_DIR, "/opt/mdbtools/bin"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap();
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.mdbtools_dir, Some(PathBuf::from("/opt/mdbtools/bin")));

        let err = EngineConfig::default()
            .with_overrides(vars(&[(ENV_MAX_RETRIES, "many")]))
            .unwrap_err();
        assert!(matches!(err, ConvertError::Config(_)));
        assert!(
            EngineConfig::default()
                .with_overrides(vars(&[(ENV_BATCH_SIZE, "0")]))
                .is_err()
        );
    }

    #[test]
    fn job_file_parses_targets_and_engine_settings() {
        let job = JobFile::parse(
            r#"
source:
  path: data/AT2.mdb
  options:
    strict: true
targets:
  - kind: sql_script
    destination: out/at2.sql
    dialect: postgres
  - kind: delimited
    destination: out/{table}.csv
    naming: "at2-{year}.csv"
    partition_column: fecha
engine:
  batch_size: 50
"#,
        )
        .unwrap();
        assert!(job.source.options.strict);
        assert_eq!(job.targets.len(), 2);
        assert_eq!(job.targets[0].kind, TargetKind::SqlScript);
        assert_eq!(job.targets[1].partition_column.as_deref(), Some("fecha"));
        assert_eq!(job.engine.batch_size, 50);
        assert_eq!(job.engine.rows_per_statement, 500);
    }

    #[test]
    fn job_without_targets_is_rejected() {
        let err = JobFile::parse("source: { path: a.csv }\ntargets: []\n").unwrap_err();
        assert!(err.to_string().contains("no targets"));
    }
}
