//! Remote database connectivity.
//!
//! [`Connector`] opens a [`RemoteSession`] for a [`RemoteDescriptor`]. The
//! MySQL and Postgres drivers live here behind [`EngineConnector`], which
//! picks one from the descriptor's [`RemoteEngine`]; tests substitute
//! scripted connectors. Connection attempts and batch writes go through
//! [`RetryPolicy`], which repeats only errors classified as transient.

use std::{
    fmt, fs,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use mysql::prelude::Queryable;
use postgres::{NoTls, SimpleQueryMessage};
use serde::{Deserialize, Serialize};

use crate::{
    config::{EngineConfig, RetrySettings},
    error::{ConvertError, Result},
    orchestrator::CancelToken,
    writer::SqlDialect,
};

/// A resolved credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Resolves a credential reference: `env:NAME` reads an environment
/// variable and `file:PATH` the first line of a file.
pub fn resolve_credential(reference: &str) -> Result<Secret> {
    let (scheme, rest) = reference.split_once(':').ok_or_else(|| {
        ConvertError::Config("credential reference must look like env:NAME or file:PATH".into())
    })?;
    match scheme {
        "env" => std::env::var(rest)
            .map(Secret)
            .map_err(|_| ConvertError::Config(format!("environment variable {rest} is not set"))),
        "file" => {
            let contents = fs::read_to_string(rest).map_err(|err| {
                ConvertError::Config(format!("cannot read credential file {rest:?}: {err}"))
            })?;
            Ok(Secret(contents.lines().next().unwrap_or_default().trim().to_string()))
        }
        other => Err(ConvertError::Config(format!(
            "unsupported credential scheme '{other}'"
        ))),
    }
}

/// Server family behind a remote target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteEngine {
    #[default]
    #[serde(alias = "mariadb")]
    Mysql,
    #[serde(alias = "postgresql")]
    Postgres,
}

impl RemoteEngine {
    pub fn default_port(self) -> u16 {
        match self {
            RemoteEngine::Mysql => 3306,
            RemoteEngine::Postgres => 5432,
        }
    }

    pub fn dialect(self) -> SqlDialect {
        match self {
            RemoteEngine::Mysql => SqlDialect::Mysql,
            RemoteEngine::Postgres => SqlDialect::Postgres,
        }
    }

    pub fn version_query(self) -> &'static str {
        match self {
            RemoteEngine::Mysql => "SELECT VERSION()",
            RemoteEngine::Postgres => "SHOW server_version",
        }
    }

    /// Counts tables called `name` in the session's current schema.
    pub fn table_exists_query(self, name: &str) -> String {
        let schema = match self {
            RemoteEngine::Mysql => "DATABASE()",
            RemoteEngine::Postgres => "current_schema()",
        };
        format!(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = {schema} AND table_name = '{}'",
            name.replace('\\', "").replace('\'', "''")
        )
    }
}

impl std::str::FromStr for RemoteEngine {
    type Err = ConvertError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(RemoteEngine::Mysql),
            "postgres" | "postgresql" => Ok(RemoteEngine::Postgres),
            other => Err(ConvertError::Config(format!(
                "unknown remote engine '{other}'; use mysql or postgres"
            ))),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteDescriptor {
    #[serde(default)]
    pub engine: RemoteEngine,
    pub host: String,
    /// Defaults to the engine's standard port.
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    pub user: String,
    /// `env:NAME` or `file:PATH`; resolved only when connecting.
    #[serde(default, rename = "credential")]
    pub credential_ref: Option<String>,
}

impl RemoteDescriptor {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.engine.default_port())
    }

    pub fn label(&self) -> String {
        format!("{}:{}/{}", self.host, self.port(), self.database)
    }
}

impl fmt::Debug for RemoteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let credential = self
            .credential_ref
            .as_deref()
            .and_then(|r| r.split_once(':'))
            .map(|(scheme, _)| format!("{scheme}:***"));
        f.debug_struct("RemoteDescriptor")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port())
            .field("database", &self.database)
            .field("user", &self.user)
            .field("credential", &credential)
            .finish()
    }
}

/// An open connection, exclusively owned by one writer or check.
pub trait RemoteSession {
    fn batch_execute(&mut self, sql: &str) -> Result<()>;

    /// First column of the first row, as text.
    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>>;
}

pub trait Connector: Send + Sync {
    fn connect(
        &self,
        descriptor: &RemoteDescriptor,
        config: &EngineConfig,
    ) -> Result<Box<dyn RemoteSession>>;
}

/// Maps a SQLSTATE to the error taxonomy.
pub fn classify_sqlstate(code: &str, table: Option<&str>, message: String) -> ConvertError {
    let table = table.unwrap_or_default();
    match code {
        "28000" | "28P01" => ConvertError::Auth(message),
        "42501" => ConvertError::Permission(message),
        "53300" | "57P01" | "57P02" | "57P03" | "57014" | "40001" | "40P01" => {
            ConvertError::TransientConnection(message)
        }
        code if code.starts_with("08") => ConvertError::TransientConnection(message),
        code if code.starts_with("23") || code.starts_with("22") || code == "42P07" => {
            ConvertError::integrity(table, message)
        }
        _ => ConvertError::target(table, message),
    }
}

fn classify_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionRefused | ConnectionReset | ConnectionAborted | TimedOut | BrokenPipe | NotConnected
    )
}

/// Classifies a driver error; `table` names the table being written, if any.
pub fn classify_pg_error(err: &postgres::Error, table: Option<&str>) -> ConvertError {
    let message = err.to_string();
    if let Some(state) = err.code() {
        let detail = err
            .as_db_error()
            .map_or_else(|| message.clone(), |db| db.message().to_string());
        return classify_sqlstate(state.code(), table, detail);
    }
    let io_source = std::error::Error::source(err)
        .and_then(|source| source.downcast_ref::<std::io::Error>());
    if err.is_closed() || io_source.is_some_and(classify_io) || message.contains("timed out") {
        return ConvertError::TransientConnection(message);
    }
    if message.contains("password") || message.contains("authentication") {
        return ConvertError::Auth(message);
    }
    ConvertError::target(table.unwrap_or_default(), message)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresConnector;

struct PostgresSession {
    client: postgres::Client,
}

impl RemoteSession for PostgresSession {
    fn batch_execute(&mut self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .map_err(|err| classify_pg_error(&err, None))
    }

    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>> {
        let messages = self
            .client
            .simple_query(sql)
            .map_err(|err| classify_pg_error(&err, None))?;
        Ok(messages.into_iter().find_map(|message| match message {
            SimpleQueryMessage::Row(row) => row.get(0).map(str::to_string),
            _ => None,
        }))
    }
}

impl Connector for PostgresConnector {
    fn connect(
        &self,
        descriptor: &RemoteDescriptor,
        config: &EngineConfig,
    ) -> Result<Box<dyn RemoteSession>> {
        let mut pg = postgres::Config::new();
        pg.host(&descriptor.host)
            .port(descriptor.port())
            .dbname(&descriptor.database)
            .user(&descriptor.user)
            .application_name("legacy-convert")
            .connect_timeout(config.connect_timeout());
        let options = format!(
            "-c statement_timeout={}",
            config.statement_timeout().as_millis()
        );
        pg.options(&options);
        if let Some(reference) = &descriptor.credential_ref {
            let secret = resolve_credential(reference)?;
            pg.password(secret.expose());
        }
        debug!("Connecting to {}", descriptor.label());
        let client = pg
            .connect(NoTls)
            .map_err(|err| classify_pg_error(&err, None))?;
        Ok(Box::new(PostgresSession { client }))
    }
}

/// Maps a MySQL error number to the error taxonomy.
pub fn classify_mysql_code(code: u16, table: Option<&str>, message: String) -> ConvertError {
    let table = table.unwrap_or_default();
    match code {
        1045 | 1698 => ConvertError::Auth(message),
        1044 | 1142 | 1143 | 1227 => ConvertError::Permission(message),
        // Server busy, lock conflicts, and the client-side connection codes.
        1040 | 1053 | 1205 | 1213 | 2002 | 2003 | 2006 | 2013 => {
            ConvertError::TransientConnection(message)
        }
        1048 | 1050 | 1062 | 1264 | 1292 | 1366 | 1406 | 1451 | 1452 => {
            ConvertError::integrity(table, message)
        }
        _ => ConvertError::target(table, message),
    }
}

pub fn classify_mysql_error(err: &mysql::Error, table: Option<&str>) -> ConvertError {
    let message = err.to_string();
    match err {
        mysql::Error::MySqlError(server) => {
            classify_mysql_code(server.code, table, server.message.clone())
        }
        mysql::Error::IoError(io) if classify_io(io) => ConvertError::TransientConnection(message),
        mysql::Error::DriverError(
            mysql::DriverError::ConnectTimeout | mysql::DriverError::CouldNotConnect(_),
        ) => ConvertError::TransientConnection(message),
        _ => ConvertError::target(table.unwrap_or_default(), message),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlConnector;

struct MysqlSession {
    conn: mysql::Conn,
}

impl RemoteSession for MysqlSession {
    fn batch_execute(&mut self, sql: &str) -> Result<()> {
        self.conn
            .query_drop(sql)
            .map_err(|err| classify_mysql_error(&err, None))
    }

    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>> {
        let value: Option<Option<String>> = self
            .conn
            .query_first(sql)
            .map_err(|err| classify_mysql_error(&err, None))?;
        Ok(value.flatten())
    }
}

impl Connector for MysqlConnector {
    fn connect(
        &self,
        descriptor: &RemoteDescriptor,
        config: &EngineConfig,
    ) -> Result<Box<dyn RemoteSession>> {
        let password = descriptor
            .credential_ref
            .as_deref()
            .map(resolve_credential)
            .transpose()?;
        let opts = mysql::OptsBuilder::new()
            .ip_or_hostname(Some(descriptor.host.as_str()))
            .tcp_port(descriptor.port())
            .db_name(Some(descriptor.database.as_str()))
            .user(Some(descriptor.user.as_str()))
            .pass(password.as_ref().map(Secret::expose))
            .tcp_connect_timeout(Some(config.connect_timeout()))
            .read_timeout(Some(config.statement_timeout()))
            .write_timeout(Some(config.statement_timeout()))
            .init(vec!["SET NAMES utf8mb4"]);
        debug!("Connecting to {}", descriptor.label());
        let conn = mysql::Conn::new(opts).map_err(|err| classify_mysql_error(&err, None))?;
        Ok(Box::new(MysqlSession { conn }))
    }
}

/// Opens sessions with the driver matching the descriptor's engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConnector;

impl Connector for EngineConnector {
    fn connect(
        &self,
        descriptor: &RemoteDescriptor,
        config: &EngineConfig,
    ) -> Result<Box<dyn RemoteSession>> {
        match descriptor.engine {
            RemoteEngine::Mysql => MysqlConnector.connect(descriptor, config),
            RemoteEngine::Postgres => PostgresConnector.connect(descriptor, config),
        }
    }
}

/// Pause between attempts; replaced by a recording sleeper in tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            multiplier: settings.multiplier.max(1),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then make attempt number `attempt`.
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Decides what follows a failure of attempt `attempt`.
    pub fn decide(&self, attempt: u32, err: &ConvertError) -> RetryDecision {
        if err.is_transient() && attempt < self.max_attempts {
            RetryDecision::Retry {
                attempt: attempt + 1,
                delay: self.delay_after(attempt),
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are used up. Cancellation is checked before every retry.
    pub fn run<T>(
        &self,
        label: &str,
        sleeper: &dyn Sleeper,
        cancel: &CancelToken,
        mut op: impl FnMut(u32) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 1;
        loop {
            let err = match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            match self.decide(attempt, &err) {
                RetryDecision::Retry {
                    attempt: next,
                    delay,
                } => {
                    warn!(
                        "{label}: attempt {attempt}/{} failed ({err}); retrying in {delay:?}",
                        self.max_attempts
                    );
                    sleeper.sleep(delay);
                    if cancel.is_cancelled() {
                        return Err(ConvertError::Cancelled);
                    }
                    attempt = next;
                }
                RetryDecision::GiveUp => return Err(err),
            }
        }
    }
}

/// Everything needed to reach a remote target.
#[derive(Clone)]
pub struct OnlineContext<'a> {
    pub connector: &'a dyn Connector,
    pub sleeper: &'a dyn Sleeper,
    pub config: &'a EngineConfig,
    pub cancel: &'a CancelToken,
}

impl OnlineContext<'_> {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.retry)
    }

    /// Opens a session, retrying transient failures.
    pub fn connect(&self, descriptor: &RemoteDescriptor) -> Result<Box<dyn RemoteSession>> {
        let label = format!("connect {}", descriptor.label());
        self.policy().run(&label, self.sleeper, self.cancel, |_| {
            self.connector.connect(descriptor, self.config)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionCheck {
    pub ok: bool,
    pub target: String,
    pub latency_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// Connects and reads the server version. Nothing on the server is changed.
pub fn test_connection(descriptor: &RemoteDescriptor, ctx: &OnlineContext<'_>) -> ConnectionCheck {
    let started = Instant::now();
    let outcome = with_connection(descriptor, ctx, |session| {
        session.query_scalar(descriptor.engine.version_query())
    });
    let latency_ms = started.elapsed().as_millis();
    match outcome {
        Ok(version) => {
            info!("Connection to {} ok in {latency_ms} ms", descriptor.label());
            ConnectionCheck {
                ok: true,
                target: descriptor.label(),
                latency_ms,
                server_version: version,
                error_detail: None,
            }
        }
        Err(err) => ConnectionCheck {
            ok: false,
            target: descriptor.label(),
            latency_ms,
            server_version: None,
            error_detail: Some(err.to_string()),
        },
    }
}

/// Runs `f` on a freshly opened session; the session is released when this
/// returns, whichever way `f` exits.
pub fn with_connection<T>(
    descriptor: &RemoteDescriptor,
    ctx: &OnlineContext<'_>,
    f: impl FnOnce(&mut dyn RemoteSession) -> Result<T>,
) -> Result<T> {
    let mut session = ctx.connect(descriptor)?;
    let result = f(session.as_mut());
    drop(session);
    debug!("Released connection to {}", descriptor.label());
    result
}
