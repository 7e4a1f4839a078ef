mod common;

use std::{sync::Arc, time::Duration};

use common::{
    RecordingSleeper, ScriptedConnector, TestWorkspace, members_csv, mysql_descriptor,
    remote_descriptor,
};
use legacy_convert::{
    config::{EngineConfig, JobFile},
    online::{self, OnlineContext},
    orchestrator::{CancelToken, ConversionJob, JobState},
    report::{TargetStatus, WarningCode},
    schema::{CanonicalType, ColumnOverride},
    source::SourceDescriptor,
    writer::{SqlDialect, TargetDescriptor, TargetKind},
};
use rusqlite::Connection;
use rust_xlsxwriter::Workbook;

fn declared_date(source: &mut SourceDescriptor) {
    source.options.columns.insert(
        "joined".into(),
        ColumnOverride {
            ty: Some(CanonicalType::Date),
            ..ColumnOverride::default()
        },
    );
}

#[test]
fn malformed_date_is_skipped_and_reported_on_its_column() {
    let ws = TestWorkspace::new();
    let input = ws.write("members.csv", &members_csv(10, Some(4)));
    let mut source = SourceDescriptor::new(&input);
    declared_date(&mut source);
    let target = TargetDescriptor::new(TargetKind::Sqlite, ws.file("out/members.db"));

    let summary = ConversionJob::new(source, vec![target], EngineConfig::default())
        .unwrap()
        .run();

    assert_eq!(summary.state, JobState::Completed);
    assert_eq!(summary.rows_written, 9);
    assert_eq!(summary.rows_skipped, 1);
    let table = summary.table("members").unwrap();
    assert_eq!(table.rows_read, table.rows_written + table.rows_skipped);
    let malformed: Vec<_> = summary.warnings_with(WarningCode::MalformedRow).collect();
    assert_eq!(malformed.len(), 1);
    assert_eq!(malformed[0].column.as_deref(), Some("joined"));

    let conn = Connection::open(ws.path().join("out/members.db")).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM members", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 9);
}

#[test]
fn one_reader_feeds_every_target() {
    let ws = TestWorkspace::new();
    let input = ws.write("members.csv", &members_csv(25, None));
    let mut script = TargetDescriptor::new(TargetKind::SqlScript, ws.file("members.sql"));
    script.dialect = SqlDialect::Postgres;
    script.batch_size = Some(10);
    let targets = vec![
        script,
        TargetDescriptor::new(TargetKind::Delimited, ws.file("members.tsv")),
        TargetDescriptor::new(TargetKind::Document, ws.file("members.jsonl")),
        TargetDescriptor::new(TargetKind::Spreadsheet, ws.file("members.xlsx")),
    ];
    let mut config = EngineConfig::default();
    config.chunk_threshold = 10;

    let summary = ConversionJob::new(SourceDescriptor::new(&input), targets, config)
        .unwrap()
        .run();

    assert_eq!(summary.state, JobState::Completed);
    assert_eq!(summary.table("members").unwrap().batches, 3);
    assert!(summary.per_target.values().all(|t| t.rows_written == 25));

    let sql = ws.read("members.sql");
    assert!(sql.contains("CREATE TABLE IF NOT EXISTS \"members\""));
    assert_eq!(sql.matches("INSERT INTO").count(), 3);
    assert!(sql.trim_end().ends_with("COMMIT;"));
    assert_eq!(ws.read("members.tsv").lines().count(), 26);
    assert_eq!(ws.read("members.jsonl").lines().count(), 25);
    assert!(ws.path().join("members.xlsx").exists());
}

#[test]
fn sampled_inference_widens_while_streaming() {
    let ws = TestWorkspace::new();
    let input = ws.write("codes.csv", "code,label\n1,a\n2,b\n3,c\nX-4,d\n");
    let mut source = SourceDescriptor::new(&input);
    source.options.sample_rows = Some(2);
    let mut script = TargetDescriptor::new(TargetKind::SqlScript, ws.file("codes.sql"));
    script.dialect = SqlDialect::Postgres;

    let summary = ConversionJob::new(source, vec![script], EngineConfig::default())
        .unwrap()
        .run();

    assert_eq!(summary.state, JobState::Completed);
    assert_eq!(summary.rows_written, 4);
    let widened: Vec<_> = summary.warnings_with(WarningCode::SchemaWidened).collect();
    assert_eq!(widened.len(), 1);
    assert_eq!(widened[0].column.as_deref(), Some("code"));
    assert!(ws.read("codes.sql").contains("ALTER TABLE \"codes\" ALTER COLUMN \"code\" TYPE TEXT"));
}

#[test]
fn year_partitions_become_independent_remote_tables() {
    let ws = TestWorkspace::new();
    let input = ws.write(
        "AT2.csv",
        "id,site,sampled\n1,north,2008-02-01\n2,south,2008-07-19\n3,north,2009-01-03\n",
    );
    let mut remote = TargetDescriptor::new(TargetKind::Remote, "{table}");
    remote.naming = Some("at2-{year}".into());
    remote.partition_column = Some("sampled".into());
    remote.remote = Some(remote_descriptor());
    let connector = ScriptedConnector::refusing(0);
    let log = connector.log.clone();

    let summary = ConversionJob::new(SourceDescriptor::new(&input), vec![remote], EngineConfig::default())
        .unwrap()
        .with_connector(Arc::new(connector))
        .with_sleeper(Arc::new(RecordingSleeper::default()))
        .run();

    assert_eq!(summary.state, JobState::Completed);
    let ids: Vec<&String> = summary.per_target.keys().collect();
    assert_eq!(ids, vec!["remote:at2-2008", "remote:at2-2009"]);
    assert_eq!(summary.per_target["remote:at2-2008"].rows_written, 2);
    assert_eq!(summary.per_target["remote:at2-2009"].rows_written, 1);
    assert_eq!(log.inserted_rows("at2_2008"), 2);
    assert_eq!(log.inserted_rows("at2_2009"), 1);
    assert!(summary.warnings_with(WarningCode::RowCountMismatch).next().is_none());
}

#[test]
fn refused_connections_are_retried_until_the_target_succeeds() {
    let ws = TestWorkspace::new();
    let input = ws.write("members.csv", &members_csv(3, None));
    let mut remote = TargetDescriptor::new(TargetKind::Remote, "members");
    remote.remote = Some(remote_descriptor());
    let connector = ScriptedConnector::refusing(2);
    let log = connector.log.clone();
    let sleeper = Arc::new(RecordingSleeper::default());

    let summary = ConversionJob::new(SourceDescriptor::new(&input), vec![remote], EngineConfig::default())
        .unwrap()
        .with_connector(Arc::new(connector))
        .with_sleeper(sleeper.clone())
        .run();

    assert_eq!(summary.state, JobState::Completed);
    assert!(summary.error.is_none());
    assert_eq!(summary.per_target["remote:members"].status, TargetStatus::Success);
    assert_eq!(log.connects.load(std::sync::atomic::Ordering::SeqCst), 3);
    assert_eq!(
        *sleeper.delays.lock().unwrap(),
        vec![Duration::from_millis(200), Duration::from_millis(400)]
    );
}

#[test]
fn rejected_credentials_fail_only_the_remote_target() {
    let ws = TestWorkspace::new();
    let input = ws.write("members.csv", &members_csv(3, None));
    let mut remote = TargetDescriptor::new(TargetKind::Remote, "members");
    remote.remote = Some(remote_descriptor());
    let local = TargetDescriptor::new(TargetKind::Delimited, ws.file("members_out.csv"));
    let connector = ScriptedConnector::rejecting_credentials();
    let log = connector.log.clone();

    let summary = ConversionJob::new(
        SourceDescriptor::new(&input),
        vec![remote, local.clone()],
        EngineConfig::default(),
    )
    .unwrap()
    .with_connector(Arc::new(connector))
    .with_sleeper(Arc::new(RecordingSleeper::default()))
    .run();

    assert_eq!(summary.state, JobState::Failed);
    assert_eq!(summary.exit_code(), 2);
    assert_eq!(log.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
    let remote_report = &summary.per_target["remote:members"];
    assert_eq!(remote_report.status, TargetStatus::Failed);
    assert!(remote_report.error_detail.as_deref().unwrap().contains("authentication"));
    assert_eq!(summary.per_target[&local.id()].status, TargetStatus::Success);
}

#[test]
fn mysql_remote_tables_use_mysql_syntax() {
    let ws = TestWorkspace::new();
    let input = ws.write("members.csv", &members_csv(5, None));
    let mut source = SourceDescriptor::new(&input);
    source.options.primary_key = vec!["id".into()];
    let mut remote = TargetDescriptor::new(TargetKind::Remote, "{table}");
    remote.remote = Some(mysql_descriptor());
    let connector = ScriptedConnector::refusing(0);
    let log = connector.log.clone();

    let summary = ConversionJob::new(source, vec![remote], EngineConfig::default())
        .unwrap()
        .with_connector(Arc::new(connector))
        .with_sleeper(Arc::new(RecordingSleeper::default()))
        .run();

    assert_eq!(summary.state, JobState::Completed);
    assert_eq!(log.inserted_rows("members"), 5);
    let statements = log.statements();
    assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS `members`"));
    assert!(statements[0].contains("PRIMARY KEY (`id`)"));
    let batch = statements
        .iter()
        .find(|sql| sql.starts_with("START TRANSACTION;"))
        .unwrap();
    assert!(batch.contains("INSERT IGNORE INTO `members`"));
    assert!(!batch.contains("ON CONFLICT"));
    assert!(log.queries()[0].contains("table_schema = DATABASE()"));
    assert!(summary.warnings_with(WarningCode::RowCountMismatch).next().is_none());
}

#[test]
fn unique_key_violation_fails_the_remote_table_without_retrying() {
    let ws = TestWorkspace::new();
    let input = ws.write("members.csv", &members_csv(3, None));
    let mut remote = TargetDescriptor::new(TargetKind::Remote, "members");
    remote.remote = Some(remote_descriptor());
    let local = TargetDescriptor::new(TargetKind::Delimited, ws.file("members_out.csv"));
    let connector = ScriptedConnector::violating_unique_keys();
    let log = connector.log.clone();
    let sleeper = Arc::new(RecordingSleeper::default());

    let summary = ConversionJob::new(
        SourceDescriptor::new(&input),
        vec![remote, local.clone()],
        EngineConfig::default(),
    )
    .unwrap()
    .with_connector(Arc::new(connector))
    .with_sleeper(sleeper.clone())
    .run();

    assert_eq!(summary.exit_code(), 2);
    assert_eq!(log.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(sleeper.delays.lock().unwrap().is_empty());
    assert_eq!(log.inserted_rows("members"), 0);
    let remote_report = &summary.per_target["remote:members"];
    assert_eq!(remote_report.status, TargetStatus::Failed);
    assert_eq!(remote_report.failed_tables.len(), 1);
    assert_eq!(remote_report.failed_tables[0].table, "members");
    assert_eq!(remote_report.failed_tables[0].code, "data_integrity_error");
    assert!(remote_report.failed_tables[0].message.contains("members_pkey"));
    let local_report = &summary.per_target[&local.id()];
    assert_eq!(local_report.status, TargetStatus::Success);
    assert_eq!(local_report.rows_written, 3);
}

#[test]
fn connection_checks_only_read_from_the_server() {
    let connector = ScriptedConnector::refusing(0);
    let log = connector.log.clone();
    let sleeper = RecordingSleeper::default();
    let config = EngineConfig::default();
    let cancel = CancelToken::default();
    let ctx = OnlineContext {
        connector: &connector,
        sleeper: &sleeper,
        config: &config,
        cancel: &cancel,
    };

    let first = online::test_connection(&remote_descriptor(), &ctx);
    let second = online::test_connection(&remote_descriptor(), &ctx);
    for check in [&first, &second] {
        assert!(check.ok);
        assert_eq!(check.target, "db.internal:5432/legacy");
        assert_eq!(check.server_version.as_deref(), Some("16.2"));
        assert!(check.error_detail.is_none());
        assert!(check.latency_ms < 10_000);
    }
    let mysql = online::test_connection(&mysql_descriptor(), &ctx);
    assert!(mysql.ok);
    assert_eq!(mysql.target, "db.internal:3306/legacy");
    assert_eq!(mysql.server_version.as_deref(), Some("8.0.36"));

    assert!(log.statements().is_empty());
    assert_eq!(
        log.queries(),
        vec!["SHOW server_version", "SHOW server_version", "SELECT VERSION()"]
    );
    assert_eq!(log.connects.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[test]
fn rejected_connection_check_reports_the_cause() {
    let connector = ScriptedConnector::rejecting_credentials();
    let log = connector.log.clone();
    let sleeper = RecordingSleeper::default();
    let config = EngineConfig::default();
    let cancel = CancelToken::default();
    let ctx = OnlineContext {
        connector: &connector,
        sleeper: &sleeper,
        config: &config,
        cancel: &cancel,
    };

    let check = online::test_connection(&remote_descriptor(), &ctx);

    assert!(!check.ok);
    assert!(check.server_version.is_none());
    assert!(check.error_detail.unwrap().contains("authentication"));
    assert_eq!(log.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(sleeper.delays.lock().unwrap().is_empty());
    assert!(log.queries().is_empty());
}

#[test]
fn empty_sheets_are_skipped_by_sql_targets() {
    let ws = TestWorkspace::new();
    let input = ws.path().join("book.xlsx");
    let mut workbook = Workbook::new();
    let people = workbook.add_worksheet();
    people.set_name("people").unwrap();
    people.write_string(0, 0, "id").unwrap();
    people.write_string(0, 1, "name").unwrap();
    people.write_number(1, 0, 1.0).unwrap();
    people.write_string(1, 1, "Ada").unwrap();
    workbook.add_worksheet().set_name("empty").unwrap();
    workbook.save(&input).unwrap();
    let targets = vec![
        TargetDescriptor::new(TargetKind::Sqlite, ws.file("book.db")),
        TargetDescriptor::new(TargetKind::SqlScript, ws.file("book.sql")),
    ];

    let summary = ConversionJob::new(SourceDescriptor::new(&input), targets, EngineConfig::default())
        .unwrap()
        .run();

    assert_eq!(summary.state, JobState::Completed);
    assert!(summary.per_target.values().all(|t| t.succeeded()));
    let empty: Vec<_> = summary.warnings_with(WarningCode::EmptyTable).collect();
    assert_eq!(empty.len(), 2);
    assert!(empty.iter().all(|w| w.table == "empty"));

    let conn = Connection::open(ws.path().join("book.db")).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM people", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
    let tables: i64 = conn
        .query_row("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(tables, 1);

    let sql = ws.read("book.sql");
    assert!(sql.contains("CREATE TABLE IF NOT EXISTS `people`"));
    assert!(sql.contains("-- Table: empty (0 columns) skipped"));
    assert!(!sql.contains("`empty`"));
    assert!(!sql.contains("(\n\n)"));
}

#[test]
fn job_files_resolve_paths_next_to_themselves() {
    let ws = TestWorkspace::new();
    ws.write("data/members.csv", &members_csv(4, None));
    let job_path = ws.write(
        "data/job.yaml",
        r#"
source:
  path: members.csv
  options:
    primary_key: [id]
targets:
  - kind: sql_script
    destination: out/members.sql
    dialect: mysql
engine:
  batch_size: 2
"#,
    );

    let job = JobFile::load(&job_path).unwrap();
    let summary = ConversionJob::from_job_file(job).unwrap().run();

    assert_eq!(summary.state, JobState::Completed);
    let sql = ws.read("data/out/members.sql");
    assert!(sql.contains("PRIMARY KEY (`id`)"));
    assert!(sql.contains("START TRANSACTION;"));
}

#[test]
fn missing_source_fails_before_any_target_opens() {
    let ws = TestWorkspace::new();
    let target = TargetDescriptor::new(TargetKind::Delimited, ws.file("out.csv"));
    let summary = ConversionJob::new(
        SourceDescriptor::new(ws.path().join("gone.csv")),
        vec![target],
        EngineConfig::default(),
    )
    .unwrap()
    .run();

    assert_eq!(summary.state, JobState::Failed);
    assert_eq!(summary.error.unwrap().kind, "source_unavailable");
    assert!(!ws.path().join("out.csv").exists());
}
