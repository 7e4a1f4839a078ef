//! Batch orchestration.
//!
//! A [`ConversionJob`] drives one source through every configured target:
//! tables are discovered and their schemas inferred once, then each table is
//! streamed in bounded batches and fanned out to one writer per target (or
//! per partition of a partitioned target). Targets succeed or fail
//! independently and the [`JobSummary`] reports each of them.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Instant,
};

use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    config::{EngineConfig, JobFile},
    error::{ConvertError, ErrorScope, Result},
    naming::{self, NamingVars, UNKNOWN_PARTITION},
    online::{Connector, EngineConnector, OnlineContext, Sleeper, ThreadSleeper},
    report::{
        JobError, JobSummary, TableReport, TargetReport, TargetStatus, Warning, WarningCode,
    },
    rows::{Batcher, ColumnChange, RawBatch, RowBatch, RowConverter, SourceRecord, plan_batch_rows},
    schema::{Dataset, SchemaNormalizer, Table, TableInference},
    source::{self, SourceDescriptor, SourceOptions, SourceReader, SourceTable},
    writer::{self, TargetDescriptor, Writer, WriterContext},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    SchemaInferred,
    Streaming,
    Finalizing,
    Completed,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Aborted)
    }

    /// Forward moves along the pipeline, or into `Failed`/`Aborted` from
    /// any live state.
    pub fn can_advance_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, SchemaInferred)
            | (SchemaInferred, Streaming)
            | (Streaming, Finalizing)
            | (Finalizing, Completed)
            | (Finalizing, Failed) => true,
            (from, Failed | Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Shared cancellation flag, checked at every batch read and write.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ConvertError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub state: JobState,
    pub tables_total: usize,
    pub tables_done: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_table: Option<String>,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_skipped: u64,
}

impl JobProgress {
    fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            state: JobState::Pending,
            tables_total: 0,
            tables_done: 0,
            current_table: None,
            rows_read: 0,
            rows_written: 0,
            rows_skipped: 0,
        }
    }
}

pub type ProgressHandle = Arc<Mutex<JobProgress>>;

fn update_progress(handle: &ProgressHandle, f: impl FnOnce(&mut JobProgress)) {
    if let Ok(mut progress) = handle.lock() {
        f(&mut progress);
    }
}

fn normalizer_for(options: &SourceOptions) -> SchemaNormalizer {
    SchemaNormalizer::new(options.sample_rows)
        .with_overrides(options.columns.clone())
        .with_primary_key(options.primary_key.clone())
}

/// Applies the `tables` filter and the `table_order` preference. Tables not
/// named in `table_order` follow in discovery order.
pub fn select_tables<'r>(
    reader: &'r dyn SourceReader,
    options: &SourceOptions,
) -> Result<Vec<&'r SourceTable>> {
    let available = reader.tables();
    let unknown: Vec<&String> = options
        .tables
        .iter()
        .chain(&options.table_order)
        .filter(|name| !available.iter().any(|t| t.name.eq_ignore_ascii_case(name)))
        .collect();
    if !unknown.is_empty() {
        let names: Vec<&str> = available.iter().map(|t| t.name.as_str()).collect();
        return Err(ConvertError::Validation(format!(
            "unknown table(s) {unknown:?}; available: {names:?}"
        )));
    }
    let mut selected: Vec<&SourceTable> = available
        .iter()
        .filter(|t| {
            options.tables.is_empty()
                || options.tables.iter().any(|name| t.name.eq_ignore_ascii_case(name))
        })
        .collect();
    selected.sort_by_key(|t| {
        options
            .table_order
            .iter()
            .position(|name| t.name.eq_ignore_ascii_case(name))
            .unwrap_or(usize::MAX)
    });
    Ok(selected)
}

/// Runs schema inference for one table. Tables whose columns are all
/// declared by the source are not read unless sampling asks for it.
pub fn infer_table(
    reader: &dyn SourceReader,
    source: &SourceTable,
    normalizer: &SchemaNormalizer,
) -> Result<Table> {
    let mut inference = TableInference::new(source.columns.clone());
    for (idx, declared) in source.declared.iter().enumerate() {
        if let Some(declared) = declared {
            inference.declare(idx, declared.ty.clone(), Some(declared.source_type.clone()));
        }
    }
    let fully_declared = !source.declared.is_empty() && source.declared.iter().all(Option::is_some);
    let mut exhausted = false;
    if !(fully_declared && normalizer.sample_rows.is_none()) && normalizer.sample_rows != Some(0) {
        exhausted = true;
        for record in reader.stream(&source.name)? {
            if let SourceRecord::Row { values, .. } = record?
                && values.len() == source.columns.len()
            {
                inference.observe(&values);
            }
            if normalizer.sample_complete(&inference) {
                exhausted = false;
                break;
            }
        }
    }
    debug!(
        "Inferred '{}' from {} rows (whole table: {exhausted})",
        source.name,
        inference.rows_seen()
    );
    let mut table = normalizer.finish(&source.name, inference, source.primary_key.clone(), exhausted);
    if table.row_count.is_none() {
        table.row_count = source.row_count;
    }
    Ok(table)
}

/// Infers every selected table of an open reader.
pub fn infer_dataset(
    reader: &dyn SourceReader,
    options: &SourceOptions,
) -> Result<(Dataset, Vec<Warning>)> {
    let normalizer = normalizer_for(options);
    let mut tables = Vec::new();
    let mut warnings = Vec::new();
    for source in select_tables(reader, options)? {
        warnings.extend(source.warnings.iter().cloned());
        tables.push(infer_table(reader, source, &normalizer)?);
    }
    Ok((
        Dataset {
            identity: reader.identity(),
            tables,
        },
        warnings,
    ))
}

/// Distinct partition values of one column in one table, with row counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionReport {
    pub table: String,
    pub column_found: bool,
    pub values: BTreeMap<String, u64>,
}

/// Scans `column` of every selected table. Tables without the column put
/// all rows under the unknown partition.
pub fn discover_partitions(
    reader: &dyn SourceReader,
    options: &SourceOptions,
    column: &str,
) -> Result<Vec<PartitionReport>> {
    let mut reports = Vec::new();
    for source in select_tables(reader, options)? {
        let index = source
            .columns
            .iter()
            .position(|name| name.eq_ignore_ascii_case(column));
        let mut values: BTreeMap<String, u64> = BTreeMap::new();
        for record in reader.stream(&source.name)? {
            if let SourceRecord::Row { values: row, .. } = record? {
                let key = index.map_or_else(
                    || UNKNOWN_PARTITION.to_string(),
                    |idx| naming::partition_key(row.get(idx).and_then(|v| v.as_deref())),
                );
                *values.entry(key).or_default() += 1;
            }
        }
        reports.push(PartitionReport {
            table: source.name.clone(),
            column_found: index.is_some(),
            values,
        });
    }
    Ok(reports)
}

/// One writer destination: a target, or one partition of a partitioned target.
struct Lane<'a> {
    id: String,
    target: TargetDescriptor,
    /// Partition column and the key this lane receives.
    partition: Option<(String, String)>,
    writer: Option<Box<dyn Writer + 'a>>,
    report: TargetReport,
    table_open: bool,
}

impl<'a> Lane<'a> {
    fn new(id: String, target: TargetDescriptor, partition: Option<(String, String)>) -> Self {
        let report = TargetReport::new(target.kind.label(), target.destination.clone());
        Self {
            id,
            target,
            partition,
            writer: None,
            report,
            table_open: false,
        }
    }

    fn accepts_rows(&self) -> bool {
        self.writer.is_some() && self.table_open
    }

    /// Records a writer failure at the scope the error names.
    fn fail(&mut self, table: &str, err: &ConvertError) {
        match err.scope() {
            ErrorScope::Row | ErrorScope::Column | ErrorScope::Table => {
                warn!("Target {} failed table '{table}': {err}", self.id);
                self.report.fail_table(table, err);
                if let Some(writer) = self.writer.as_mut() {
                    writer.abort_table();
                }
            }
            ErrorScope::Target | ErrorScope::Job => {
                warn!("Target {} failed: {err}", self.id);
                self.report.fail(err);
                if let Some(mut writer) = self.writer.take() {
                    writer.abort_table();
                }
            }
        }
        self.table_open = false;
    }

    /// Releases the writer without closing it.
    fn abort(&mut self, status: TargetStatus) {
        if let Some(mut writer) = self.writer.take() {
            if self.table_open {
                writer.abort_table();
            }
            if self.report.status == TargetStatus::Success {
                self.report.status = status;
            }
        }
        self.table_open = false;
    }
}

/// Warnings and row totals gathered while a job runs.
#[derive(Default)]
struct RunLog {
    warnings: Vec<Warning>,
    tables: Vec<TableReport>,
}

pub struct ConversionJob {
    id: Uuid,
    source: SourceDescriptor,
    targets: Vec<TargetDescriptor>,
    config: EngineConfig,
    cancel: CancelToken,
    connector: Arc<dyn Connector>,
    sleeper: Arc<dyn Sleeper>,
    progress: ProgressHandle,
}

impl ConversionJob {
    pub fn new(
        source: SourceDescriptor,
        targets: Vec<TargetDescriptor>,
        config: EngineConfig,
    ) -> Result<Self> {
        if targets.is_empty() {
            return Err(ConvertError::Validation("a job needs at least one target".into()));
        }
        config.validate()?;
        let mut ids = HashSet::new();
        for target in &targets {
            if !ids.insert(target.id()) {
                return Err(ConvertError::Validation(format!(
                    "target '{}' is listed twice; give one of them a name",
                    target.id()
                )));
            }
        }
        let id = Uuid::new_v4();
        Ok(Self {
            id,
            source,
            targets,
            config,
            cancel: CancelToken::default(),
            connector: Arc::new(EngineConnector),
            sleeper: Arc::new(ThreadSleeper),
            progress: Arc::new(Mutex::new(JobProgress::new(id))),
        })
    }

    pub fn from_job_file(job: JobFile) -> Result<Self> {
        Self::new(job.source, job.targets, job.engine)
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn progress_handle(&self) -> ProgressHandle {
        self.progress.clone()
    }

    pub fn progress(&self) -> Option<JobProgress> {
        self.progress.lock().ok().map(|p| p.clone())
    }

    fn advance(&self, state: &mut JobState, next: JobState) {
        if !state.can_advance_to(next) {
            warn!("Job {} ignored transition {state:?} -> {next:?}", self.id);
            return;
        }
        debug!("Job {}: {state:?} -> {next:?}", self.id);
        *state = next;
        update_progress(&self.progress, |p| p.state = next);
    }

    fn batch_rows(&self) -> usize {
        self.targets
            .iter()
            .filter_map(|t| t.batch_size)
            .filter(|size| *size > 0)
            .min()
            .unwrap_or(self.config.batch_size)
    }

    /// Runs the job to completion. Failures end up in the summary; this
    /// never returns early without one.
    pub fn run(&self) -> JobSummary {
        let started = Instant::now();
        let mut state = JobState::Pending;
        update_progress(&self.progress, |p| p.state = JobState::Pending);
        info!(
            "Job {} converting {} to {} target(s)",
            self.id,
            self.source.path.display(),
            self.targets.len()
        );

        let mut log = RunLog::default();
        let mut lanes: Vec<Lane<'_>> = Vec::new();
        let online = OnlineContext {
            connector: self.connector.as_ref(),
            sleeper: self.sleeper.as_ref(),
            config: &self.config,
            cancel: &self.cancel,
        };
        let outcome = self.execute(&mut state, &mut log, &mut lanes, online);

        let error = match outcome {
            Ok(()) => None,
            Err(err) => {
                let status = if matches!(err, ConvertError::Cancelled) {
                    TargetStatus::Aborted
                } else {
                    TargetStatus::Failed
                };
                for lane in &mut lanes {
                    lane.abort(status);
                }
                Some(err)
            }
        };

        let mut per_target: BTreeMap<String, TargetReport> = lanes
            .into_iter()
            .map(|lane| (lane.id, lane.report))
            .collect();
        if per_target.is_empty()
            && let Some(err) = &error
        {
            // The job never reached its writers.
            for target in &self.targets {
                let mut report = TargetReport::new(target.kind.label(), target.destination.clone());
                report.fail(err);
                per_target.insert(target.id(), report);
            }
        }

        let final_state = match &error {
            Some(ConvertError::Cancelled) => JobState::Aborted,
            Some(_) => JobState::Failed,
            None if per_target.values().all(TargetReport::succeeded) => JobState::Completed,
            None => JobState::Failed,
        };
        self.advance(&mut state, final_state);
        if let Some(err) = &error {
            warn!("Job {} ended {final_state:?}: {err}", self.id);
        } else {
            info!("Job {} ended {final_state:?}", self.id);
        }

        JobSummary {
            job_id: self.id,
            state: final_state,
            tables_processed: log.tables.len(),
            rows_written: log.tables.iter().map(|t| t.rows_written).sum(),
            rows_skipped: log.tables.iter().map(|t| t.rows_skipped).sum(),
            tables: log.tables,
            warnings: log.warnings,
            per_target,
            error: error.as_ref().map(JobError::from),
            elapsed_ms: started.elapsed().as_millis(),
        }
    }

    fn execute<'a>(
        &'a self,
        state: &mut JobState,
        log: &mut RunLog,
        lanes: &mut Vec<Lane<'a>>,
        online: OnlineContext<'a>,
    ) -> Result<()> {
        let options = &self.source.options;
        let reader = source::open_reader(&self.source, &self.config)?;
        let normalizer = normalizer_for(options);
        let selected = select_tables(reader.as_ref(), options)?;
        update_progress(&self.progress, |p| p.tables_total = selected.len());

        let mut tables = Vec::with_capacity(selected.len());
        for source_table in &selected {
            self.cancel.check()?;
            log.warnings.extend(source_table.warnings.iter().cloned());
            tables.push(infer_table(reader.as_ref(), source_table, &normalizer)?);
        }
        self.advance(state, JobState::SchemaInferred);

        *lanes = self.plan_lanes(reader.as_ref(), options, &mut log.warnings)?;
        let ctx = WriterContext {
            config: &self.config,
            online,
            single_table: tables.len() == 1,
        };
        for lane in lanes.iter_mut() {
            self.cancel.check()?;
            match writer::open_writer(&lane.target, &ctx) {
                Ok(writer) => lane.writer = Some(writer),
                Err(ConvertError::Cancelled) => return Err(ConvertError::Cancelled),
                Err(err) => {
                    warn!("Cannot open target {}: {err}", lane.id);
                    lane.report.fail(&err);
                }
            }
        }
        self.advance(state, JobState::Streaming);

        let batch_rows = self.batch_rows();
        for mut table in tables {
            let report = self.stream_table(reader.as_ref(), &mut table, lanes, log, batch_rows)?;
            log.tables.push(report);
            update_progress(&self.progress, |p| {
                p.tables_done += 1;
                p.current_table = None;
            });
        }
        self.advance(state, JobState::Finalizing);

        for lane in lanes.iter_mut() {
            let Some(writer) = lane.writer.take() else {
                continue;
            };
            match writer.close() {
                Ok(summary) => debug!(
                    "Closed target {} ({} rows, {} tables)",
                    lane.id, summary.rows_written, summary.tables
                ),
                Err(err) => {
                    warn!("Closing target {} failed: {err}", lane.id);
                    lane.report.fail(&err);
                }
            }
        }
        Ok(())
    }

    /// Expands targets into lanes; partitioned targets get one lane per
    /// partition value found in the data.
    fn plan_lanes<'a>(
        &self,
        reader: &dyn SourceReader,
        options: &SourceOptions,
        warnings: &mut Vec<Warning>,
    ) -> Result<Vec<Lane<'a>>> {
        let vars = NamingVars::new(self.source.stem());
        let mut discovered: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut lanes = Vec::new();
        for target in &self.targets {
            let Some(column) = target.partition_column.clone() else {
                lanes.push(Lane::new(target.id(), target.for_partition(&vars)?, None));
                continue;
            };
            if !discovered.contains_key(&column) {
                let mut keys = BTreeSet::new();
                for report in discover_partitions(reader, options, &column)? {
                    if !report.column_found {
                        warnings.push(Warning::new(
                            &report.table,
                            WarningCode::PartitionColumnMissing,
                            format!(
                                "no column '{column}'; rows go to the '{UNKNOWN_PARTITION}' partition"
                            ),
                        ));
                    }
                    keys.extend(report.values.into_keys());
                }
                info!("Partition column '{column}' has {} value(s)", keys.len());
                discovered.insert(column.clone(), keys);
            }
            for key in discovered.get(&column).into_iter().flatten() {
                let expanded = target.for_partition(&vars.clone().with_partition(key.clone()))?;
                let id = expanded.id();
                lanes.push(Lane::new(id, expanded, Some((column.clone(), key.clone()))));
            }
        }
        Ok(lanes)
    }

    fn stream_table(
        &self,
        reader: &dyn SourceReader,
        table: &mut Table,
        lanes: &mut [Lane<'_>],
        log: &mut RunLog,
        batch_size: usize,
    ) -> Result<TableReport> {
        let name = table.name.clone();
        info!("Streaming table '{name}'");
        update_progress(&self.progress, |p| p.current_table = Some(name.clone()));
        let mut report = TableReport {
            table: name.clone(),
            ..TableReport::default()
        };

        for lane in lanes.iter_mut() {
            let Some(writer) = lane.writer.as_mut() else {
                continue;
            };
            match writer.begin_table(table) {
                Ok(warnings) => {
                    log.warnings.extend(warnings);
                    lane.table_open = true;
                }
                Err(err) => lane.fail(&name, &err),
            }
        }

        let partition_columns: BTreeSet<String> = lanes
            .iter()
            .filter_map(|lane| lane.partition.as_ref().map(|(column, _)| column.clone()))
            .collect();
        let rows_per_batch = plan_batch_rows(table.row_count, batch_size, self.config.chunk_threshold);
        let batches = Batcher::new(
            reader.stream(&name)?,
            rows_per_batch,
            self.config.max_batch_bytes,
        );
        let mut malformed_reported = 0usize;
        let mut malformed_suppressed = 0u64;

        for (sequence, raw) in batches.enumerate() {
            self.cancel.check()?;
            let raw = raw?;
            let read = raw.len() as u64;
            let raw_keys: HashMap<&String, Vec<(u64, String)>> = partition_columns
                .iter()
                .map(|column| (column, partition_keys(table, &raw, column)))
                .collect();

            let mut converted = RowConverter.convert(table, raw, sequence as u64);
            let skipped_lines: HashSet<u64> = converted
                .skipped
                .iter()
                .filter_map(|err| match err {
                    ConvertError::MalformedRow { row, .. } => Some(*row),
                    _ => None,
                })
                .collect();
            if self.source.options.strict && !converted.skipped.is_empty() {
                return Err(converted.skipped.swap_remove(0));
            }
            for err in &converted.skipped {
                if malformed_reported < self.config.warning_cap {
                    malformed_reported += 1;
                    log.warnings.push(malformed_warning(err));
                } else {
                    malformed_suppressed += 1;
                }
            }
            let skipped = converted.skipped.len() as u64;
            for change in &converted.changes {
                log.warnings.push(widened_warning(&name, change));
                for lane in lanes.iter_mut().filter(|lane| lane.accepts_rows()) {
                    let Some(writer) = lane.writer.as_mut() else {
                        continue;
                    };
                    match writer.alter_column(table, change) {
                        Ok(warnings) => log.warnings.extend(warnings),
                        Err(err) => lane.fail(&name, &err),
                    }
                }
            }

            let keys: HashMap<&String, Vec<String>> = raw_keys
                .into_iter()
                .map(|(column, keys)| {
                    let kept = keys
                        .into_iter()
                        .filter(|(line, _)| !skipped_lines.contains(line))
                        .map(|(_, key)| key)
                        .collect();
                    (column, kept)
                })
                .collect();

            let batch = converted.batch;
            for lane in lanes.iter_mut().filter(|lane| lane.accepts_rows()) {
                self.cancel.check()?;
                let selected;
                let to_write = match &lane.partition {
                    None => &batch,
                    Some((column, key)) => {
                        selected = partition_slice(&batch, keys.get(column), key);
                        &selected
                    }
                };
                if to_write.is_empty() {
                    continue;
                }
                let Some(writer) = lane.writer.as_mut() else {
                    continue;
                };
                match writer.write_batch(to_write) {
                    Ok(ack) => lane.report.rows_written += ack.rows,
                    Err(ConvertError::Cancelled) => return Err(ConvertError::Cancelled),
                    Err(err) => lane.fail(&name, &err),
                }
            }

            report.rows_read += read;
            report.rows_written += batch.len() as u64;
            report.rows_skipped += skipped;
            report.batches += 1;
            update_progress(&self.progress, |p| {
                p.rows_read += read;
                p.rows_written += batch.len() as u64;
                p.rows_skipped += skipped;
            });
        }

        if malformed_suppressed > 0 {
            log.warnings.push(Warning::new(
                &name,
                WarningCode::MalformedRowsSuppressed,
                format!("{malformed_suppressed} more malformed rows were skipped"),
            ));
        }

        for lane in lanes.iter_mut().filter(|lane| lane.accepts_rows()) {
            let Some(writer) = lane.writer.as_mut() else {
                continue;
            };
            match writer.finish_table() {
                Ok(warnings) => {
                    log.warnings.extend(warnings);
                    lane.table_open = false;
                }
                Err(err) => lane.fail(&name, &err),
            }
        }
        info!(
            "Table '{name}': {} read, {} written, {} skipped in {} batch(es)",
            report.rows_read, report.rows_written, report.rows_skipped, report.batches
        );
        Ok(report)
    }
}

/// Partition key of every well-formed record, tagged with its line.
fn partition_keys(table: &Table, raw: &RawBatch, column: &str) -> Vec<(u64, String)> {
    let index = table.column_index(column);
    raw.records
        .iter()
        .filter_map(|record| match record {
            SourceRecord::Row { line, values } => {
                let key = index.map_or_else(
                    || UNKNOWN_PARTITION.to_string(),
                    |idx| naming::partition_key(values.get(idx).and_then(|v| v.as_deref())),
                );
                Some((*line, key))
            }
            SourceRecord::Malformed { .. } => None,
        })
        .collect()
}

fn partition_slice(batch: &RowBatch, keys: Option<&Vec<String>>, key: &str) -> RowBatch {
    let rows = match keys {
        Some(keys) => batch
            .rows
            .iter()
            .zip(keys)
            .filter(|(_, row_key)| row_key.as_str() == key)
            .map(|(row, _)| row.clone())
            .collect(),
        None => Vec::new(),
    };
    RowBatch {
        sequence: batch.sequence,
        rows,
    }
}

fn malformed_warning(err: &ConvertError) -> Warning {
    match err {
        ConvertError::MalformedRow {
            table,
            column,
            message,
            row,
        } => {
            let warning = Warning::new(
                table,
                WarningCode::MalformedRow,
                format!("row {row}: {message}"),
            );
            match column {
                Some(column) => warning.on_column(column),
                None => warning,
            }
        }
        other => Warning::new("", WarningCode::MalformedRow, other.to_string()),
    }
}

fn widened_warning(table: &str, change: &ColumnChange) -> Warning {
    let message = if change.before.ty != change.after.ty {
        format!(
            "type widened from {} to {}",
            change.before.ty.token(),
            change.after.ty.token()
        )
    } else {
        "column became nullable".to_string()
    };
    Warning::new(table, WarningCode::SchemaWidened, message).on_column(&change.after.name)
}

struct RegisteredJob {
    cancel: CancelToken,
    progress: ProgressHandle,
    handle: Option<JoinHandle<JobSummary>>,
}

/// Job id to handle map for callers that run jobs in the background. Each
/// job runs on its own thread with its own state.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<Uuid, RegisteredJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, job: ConversionJob) -> Result<Uuid> {
        let id = job.id();
        let cancel = job.cancel_token();
        let progress = job.progress_handle();
        let handle = std::thread::Builder::new()
            .name(format!("job-{id}"))
            .spawn(move || job.run())?;
        self.jobs.insert(
            id,
            RegisteredJob {
                cancel,
                progress,
                handle: Some(handle),
            },
        );
        Ok(id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.jobs.keys().copied().collect()
    }

    pub fn progress(&self, id: Uuid) -> Option<JobProgress> {
        let job = self.jobs.get(&id)?;
        job.progress.lock().ok().map(|p| p.clone())
    }

    pub fn cancel(&self, id: Uuid) -> bool {
        match self.jobs.get(&id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Waits for a job. Returns `None` for unknown ids, jobs already joined,
    /// or a job thread that panicked.
    pub fn join(&mut self, id: Uuid) -> Option<JobSummary> {
        let handle = self.jobs.get_mut(&id)?.handle.take()?;
        handle.join().ok()
    }

    /// Forgets a finished job.
    pub fn remove(&mut self, id: Uuid) -> bool {
        let finished = self
            .jobs
            .get(&id)
            .is_some_and(|job| job.handle.as_ref().is_none_or(JoinHandle::is_finished));
        if finished {
            self.jobs.remove(&id);
        }
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{report::TargetStatus, writer::TargetKind};
    use std::fs;

    fn csv_job(dir: &std::path::Path, contents: &str, targets: Vec<TargetDescriptor>) -> ConversionJob {
        let path = dir.join("people.csv");
        fs::write(&path, contents).unwrap();
        ConversionJob::new(SourceDescriptor::new(&path), targets, EngineConfig::default()).unwrap()
    }

    #[test]
    fn state_machine_only_moves_forward() {
        use JobState::*;
        assert!(Pending.can_advance_to(SchemaInferred));
        assert!(Streaming.can_advance_to(Aborted));
        assert!(Pending.can_advance_to(Failed));
        assert!(!Streaming.can_advance_to(Pending));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Pending.can_advance_to(Completed));
    }

    #[test]
    fn rows_balance_across_chunked_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = String::from("id,name\n");
        for i in 0..25 {
            body.push_str(&format!("{i},n{i}\n"));
        }
        body.push_str("x,y,z\n");
        let mut target = TargetDescriptor::new(
            TargetKind::Delimited,
            dir.path().join("out.csv").to_string_lossy(),
        );
        target.batch_size = Some(10);
        let mut job = csv_job(dir.path(), &body, vec![target]);
        job.config.chunk_threshold = 5;
        let summary = job.run();

        assert_eq!(summary.state, JobState::Completed);
        let table = summary.table("people").unwrap();
        assert_eq!(table.rows_read, table.rows_written + table.rows_skipped);
        assert_eq!(table.rows_written, 25);
        assert_eq!(table.rows_skipped, 1);
        assert_eq!(table.batches, 3);
    }

    #[test]
    fn strict_mode_fails_on_first_malformed_row() {
        let dir = tempfile::tempdir().unwrap();
        let target = TargetDescriptor::new(
            TargetKind::Document,
            dir.path().join("out.json").to_string_lossy(),
        );
        let mut job = csv_job(dir.path(), "id,name\n1,a\n2\n", vec![target]);
        job.source.options.strict = true;
        let summary = job.run();
        assert_eq!(summary.state, JobState::Failed);
        assert_eq!(summary.error.unwrap().kind, "malformed_row");
    }

    #[test]
    fn one_failing_target_does_not_stop_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, "file in the way").unwrap();
        let good = TargetDescriptor::new(
            TargetKind::Delimited,
            dir.path().join("good.csv").to_string_lossy(),
        );
        let bad = TargetDescriptor::new(
            TargetKind::Sqlite,
            blocker.join("out.db").to_string_lossy(),
        );
        let job = csv_job(dir.path(), "id,name\n1,a\n", vec![good.clone(), bad.clone()]);
        let summary = job.run();

        assert_eq!(summary.state, JobState::Failed);
        assert_eq!(summary.exit_code(), 2);
        assert_eq!(summary.per_target[&good.id()].status, TargetStatus::Success);
        assert_eq!(summary.per_target[&bad.id()].status, TargetStatus::Failed);
        assert!(dir.path().join("good.csv").exists());
    }

    #[test]
    fn cancelled_job_is_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let target = TargetDescriptor::new(
            TargetKind::Delimited,
            dir.path().join("out.csv").to_string_lossy(),
        );
        let job = csv_job(dir.path(), "id\n1\n2\n", vec![target]);
        job.cancel_token().cancel();
        let summary = job.run();
        assert_eq!(summary.state, JobState::Aborted);
        assert_eq!(summary.error.unwrap().kind, "cancelled");
    }

    #[test]
    fn unknown_tables_are_rejected_with_the_available_list() {
        let dir = tempfile::tempdir().unwrap();
        let target = TargetDescriptor::new(
            TargetKind::Delimited,
            dir.path().join("out.csv").to_string_lossy(),
        );
        let mut job = csv_job(dir.path(), "id\n1\n", vec![target]);
        job.source.options.tables = vec!["orders".into()];
        let summary = job.run();
        let error = summary.error.unwrap();
        assert_eq!(error.kind, "validation_error");
        assert!(error.message.contains("people"));
    }

    #[test]
    fn registry_runs_jobs_in_the_background() {
        let dir = tempfile::tempdir().unwrap();
        let target = TargetDescriptor::new(
            TargetKind::Delimited,
            dir.path().join("out.csv").to_string_lossy(),
        );
        let job = csv_job(dir.path(), "id\n1\n", vec![target]);
        let mut registry = JobRegistry::new();
        let id = registry.submit(job).unwrap();
        let summary = registry.join(id).unwrap();
        assert_eq!(summary.state, JobState::Completed);
        assert_eq!(registry.progress(id).unwrap().state, JobState::Completed);
        assert!(registry.remove(id));
        assert!(registry.progress(id).is_none());
    }
}
