#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};
use std::time::Duration;

use legacy_convert::{
    config::EngineConfig,
    error::{ConvertError, Result},
    online::{
        Connector, RemoteDescriptor, RemoteEngine, RemoteSession, Sleeper, classify_sqlstate,
    },
};
use tempfile::{TempDir, tempdir};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Path of `name` inside the workspace, as a string for descriptors.
    pub fn file(&self, name: &str) -> String {
        self.temp_dir.path().join(name).to_string_lossy().into_owned()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        self.write_bytes(name, contents.as_bytes())
    }

    pub fn write_bytes(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(&path, contents).expect("write temp file contents");
        path
    }

    pub fn read(&self, name: &str) -> String {
        fs::read_to_string(self.temp_dir.path().join(name)).expect("read output file")
    }
}

/// Three columns, `rows` members; row `bad_row` (1-based) carries a date
/// that does not parse.
pub fn members_csv(rows: usize, bad_row: Option<usize>) -> String {
    let mut body = String::from("id,name,joined\n");
    for i in 1..=rows {
        let joined = if Some(i) == bad_row {
            "2009-13-45".to_string()
        } else {
            format!("{}-{:02}-15", 2007 + i % 3, i % 12 + 1)
        };
        body.push_str(&format!("{i},member {i},{joined}\n"));
    }
    body
}

/// Statement groups that open a transaction, in either dialect.
fn is_batch(sql: &str) -> bool {
    sql.starts_with("BEGIN") || sql.starts_with("START TRANSACTION")
}

/// What the scripted database has seen.
#[derive(Default)]
pub struct ScriptLog {
    /// Statements that ran to completion.
    pub statements: Mutex<Vec<String>>,
    /// Read-only queries, in order.
    pub queries: Mutex<Vec<String>>,
    pub connects: AtomicU32,
}

impl ScriptLog {
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().expect("statement log").clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().expect("query log").clone()
    }

    /// Row tuples inserted into `table` across committed batches, with either
    /// quoting style.
    pub fn inserted_rows(&self, table: &str) -> usize {
        let needles = [format!("INTO \"{table}\" ("), format!("INTO `{table}` (")];
        self.statements()
            .iter()
            .filter(|sql| is_batch(sql))
            .flat_map(|sql| sql.split(";\n").map(str::to_string).collect::<Vec<_>>())
            .filter(|stmt| needles.iter().any(|needle| stmt.contains(needle)))
            .map(|stmt| stmt.matches("\n  (").count())
            .sum()
    }
}

/// In-memory stand-in for a remote database. The first `refusals` connection
/// attempts are refused.
pub struct ScriptedConnector {
    pub log: Arc<ScriptLog>,
    refusals: AtomicU32,
    auth_failure: bool,
    duplicate_keys: bool,
}

impl ScriptedConnector {
    pub fn refusing(refusals: u32) -> Self {
        Self {
            log: Arc::new(ScriptLog::default()),
            refusals: AtomicU32::new(refusals),
            auth_failure: false,
            duplicate_keys: false,
        }
    }

    pub fn rejecting_credentials() -> Self {
        Self {
            auth_failure: true,
            ..Self::refusing(0)
        }
    }

    /// Every insert batch hits a unique-key violation (SQLSTATE 23505).
    pub fn violating_unique_keys() -> Self {
        Self {
            duplicate_keys: true,
            ..Self::refusing(0)
        }
    }
}

impl Connector for ScriptedConnector {
    fn connect(
        &self,
        _descriptor: &RemoteDescriptor,
        _config: &EngineConfig,
    ) -> Result<Box<dyn RemoteSession>> {
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        if self.auth_failure {
            return Err(ConvertError::Auth("password authentication failed".into()));
        }
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ConvertError::TransientConnection("connection refused".into()));
        }
        Ok(Box::new(ScriptedSession {
            log: self.log.clone(),
            duplicate_keys: self.duplicate_keys,
        }))
    }
}

struct ScriptedSession {
    log: Arc<ScriptLog>,
    duplicate_keys: bool,
}

impl RemoteSession for ScriptedSession {
    fn batch_execute(&mut self, sql: &str) -> Result<()> {
        if self.duplicate_keys && is_batch(sql) {
            return Err(classify_sqlstate(
                "23505",
                None,
                "duplicate key value violates unique constraint \"members_pkey\"".into(),
            ));
        }
        self.log
            .statements
            .lock()
            .expect("statement log")
            .push(sql.to_string());
        Ok(())
    }

    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>> {
        self.log
            .queries
            .lock()
            .expect("query log")
            .push(sql.to_string());
        if sql.contains("information_schema") {
            return Ok(Some("0".into()));
        }
        if sql.starts_with("SHOW server_version") {
            return Ok(Some("16.2".into()));
        }
        if sql.starts_with("SELECT VERSION()") {
            return Ok(Some("8.0.36".into()));
        }
        let table = sql
            .split(['"', '`'])
            .nth(1)
            .expect("quoted table in count query")
            .to_string();
        Ok(Some(self.log.inserted_rows(&table).to_string()))
    }
}

/// Records requested delays instead of sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    pub delays: Mutex<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays.lock().expect("delay log").push(duration);
    }
}

pub fn remote_descriptor() -> RemoteDescriptor {
    RemoteDescriptor {
        engine: RemoteEngine::Postgres,
        host: "db.internal".into(),
        port: None,
        database: "legacy".into(),
        user: "loader".into(),
        credential_ref: Some("env:LEGACY_CONVERT_TEST_PASSWORD".into()),
    }
}

pub fn mysql_descriptor() -> RemoteDescriptor {
    RemoteDescriptor {
        engine: RemoteEngine::Mysql,
        ..remote_descriptor()
    }
}
