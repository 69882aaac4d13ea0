//! # External resource pools
//!
//! Shared, named Redis clients and SQL pools backing the plugin host
//! functions. Pools are reconciled on every snapshot apply: created for new
//! names, recreated when the address or connection string changes, destroyed
//! when the name disappears. All concurrent plugin instances share them.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use redis::aio::MultiplexedConnection;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::{MySqlPool, PgPool, Row};
use tracing::{info, warn};

use crate::proto;

/// Idle multiplexed Redis connections are dropped after this long.
const REDIS_IDLE_EVICTION: Duration = Duration::from_secs(60);

/// Default SQL pool size.
const SQL_MAX_CONNECTIONS: u32 = 20;

/// Closed set of supported SQL backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    Postgres,
    Mysql,
}

impl FromStr for DatabaseKind {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            other => Err(PoolError::Backend(format!("unsupported database type '{}'", other))),
        }
    }
}

/// Errors surfaced to the plugin host functions.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("unknown resource '{0}'")]
    UnknownResource(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("query rejected: {0}")]
    Rejected(String),
}

/// A Redis reply the guest can distinguish from an error.
#[derive(Debug, PartialEq, Eq)]
pub enum RedisReply {
    Nil,
    Payload(Vec<u8>),
}

#[derive(Clone)]
struct RedisHandle {
    address: String,
    client: redis::Client,
    // Cached multiplexed connection with its last-use timestamp.
    conn: Arc<tokio::sync::Mutex<Option<(MultiplexedConnection, Instant)>>>,
}

impl RedisHandle {
    fn open(name: &str, address: &str) -> Option<Self> {
        match redis::Client::open(address) {
            Ok(client) => Some(Self {
                address: address.to_string(),
                client,
                conn: Arc::new(tokio::sync::Mutex::new(None)),
            }),
            Err(e) => {
                warn!(resource = %name, address = %address, error = %e, "Invalid Redis address");
                None
            }
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, PoolError> {
        let mut guard = self.conn.lock().await;
        if let Some((conn, last_used)) = guard.as_mut() {
            if last_used.elapsed() < REDIS_IDLE_EVICTION {
                *last_used = Instant::now();
                return Ok(conn.clone());
            }
            *guard = None;
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PoolError::Backend(format!("redis connect failed: {}", e)))?;
        *guard = Some((conn.clone(), Instant::now()));
        Ok(conn)
    }
}

#[derive(Clone)]
enum SqlPool {
    Postgres(PgPool),
    Mysql(MySqlPool),
}

#[derive(Clone)]
struct SqlHandle {
    connection_string: String,
    pool: SqlPool,
}

impl SqlHandle {
    fn open(name: &str, kind: DatabaseKind, connection_string: &str) -> Option<Self> {
        let pool = match kind {
            DatabaseKind::Postgres => PgPoolOptions::new()
                .max_connections(SQL_MAX_CONNECTIONS)
                .connect_lazy(connection_string)
                .map(SqlPool::Postgres),
            DatabaseKind::Mysql => MySqlPoolOptions::new()
                .max_connections(SQL_MAX_CONNECTIONS)
                .connect_lazy(connection_string)
                .map(SqlPool::Mysql),
        };
        match pool {
            Ok(pool) => Some(Self { connection_string: connection_string.to_string(), pool }),
            Err(e) => {
                warn!(resource = %name, error = %e, "Invalid database connection string");
                None
            }
        }
    }
}

/// Keyed pools shared across the data plane.
#[derive(Default)]
pub struct ResourcePools {
    redis: RwLock<HashMap<String, RedisHandle>>,
    sql: RwLock<HashMap<String, SqlHandle>>,
}

impl ResourcePools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile both pools against the snapshot's resource set.
    pub fn reconcile(&self, resources: Option<&proto::ExternalResources>) {
        let empty = proto::ExternalResources::default();
        let resources = resources.unwrap_or(&empty);

        {
            let mut redis = self.redis.write().unwrap();
            let desired: HashSet<&str> =
                resources.redis.iter().map(|r| r.name.as_str()).collect();
            redis.retain(|name, _| {
                let keep = desired.contains(name.as_str());
                if !keep {
                    info!(resource = %name, "Removing Redis pool");
                }
                keep
            });
            for config in &resources.redis {
                let recreate = match redis.get(&config.name) {
                    Some(handle) => handle.address != config.address,
                    None => true,
                };
                if recreate {
                    info!(resource = %config.name, address = %config.address, "Creating Redis pool");
                    match RedisHandle::open(&config.name, &config.address) {
                        Some(handle) => {
                            redis.insert(config.name.clone(), handle);
                        }
                        None => {
                            redis.remove(&config.name);
                        }
                    }
                }
            }
        }

        {
            let mut sql = self.sql.write().unwrap();
            let desired: HashSet<&str> =
                resources.databases.iter().map(|d| d.name.as_str()).collect();
            sql.retain(|name, _| {
                let keep = desired.contains(name.as_str());
                if !keep {
                    info!(resource = %name, "Removing SQL pool");
                }
                keep
            });
            for config in &resources.databases {
                let kind = match config.r#type.parse::<DatabaseKind>() {
                    Ok(kind) => kind,
                    Err(e) => {
                        warn!(resource = %config.name, error = %e, "Skipping database resource");
                        sql.remove(&config.name);
                        continue;
                    }
                };
                let recreate = match sql.get(&config.name) {
                    Some(handle) => handle.connection_string != config.connection_string,
                    None => true,
                };
                if recreate {
                    info!(resource = %config.name, kind = ?kind, "Creating SQL pool");
                    match SqlHandle::open(&config.name, kind, &config.connection_string) {
                        Some(handle) => {
                            sql.insert(config.name.clone(), handle);
                        }
                        None => {
                            sql.remove(&config.name);
                        }
                    }
                }
            }
        }
    }

    /// Execute one Redis command on the named pool.
    ///
    /// `command` framing: whitespace-delimited tokens, the first being the
    /// command name and the rest its arguments.
    pub async fn redis_command(
        &self,
        name: &str,
        command: &str,
    ) -> Result<RedisReply, PoolError> {
        let handle = self
            .redis
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownResource(name.to_string()))?;

        let mut parts = command.split_whitespace();
        let first = parts
            .next()
            .ok_or_else(|| PoolError::Rejected("empty redis command".to_string()))?;
        let mut cmd = redis::cmd(first);
        for arg in parts {
            cmd.arg(arg);
        }

        let mut conn = handle.connection().await?;
        let value: redis::Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| PoolError::Backend(format!("redis command failed: {}", e)))?;

        match value {
            redis::Value::Nil => Ok(RedisReply::Nil),
            other => Ok(RedisReply::Payload(format_redis_value(&other).into_bytes())),
        }
    }

    /// Execute one read-only SQL query on the named pool. Rows are encoded as
    /// a JSON array of arrays of strings.
    pub async fn sql_query(&self, name: &str, sql: &str) -> Result<Vec<u8>, PoolError> {
        ensure_read_only(sql)?;

        let handle = self
            .sql
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownResource(name.to_string()))?;

        let rows: Vec<Vec<String>> = match &handle.pool {
            SqlPool::Postgres(pool) => sqlx::query(sql)
                .fetch_all(pool)
                .await
                .map_err(|e| PoolError::Backend(format!("postgres query failed: {}", e)))?
                .iter()
                .map(pg_row_values)
                .collect(),
            SqlPool::Mysql(pool) => sqlx::query(sql)
                .fetch_all(pool)
                .await
                .map_err(|e| PoolError::Backend(format!("mysql query failed: {}", e)))?
                .iter()
                .map(mysql_row_values)
                .collect(),
        };

        serde_json::to_vec(&rows)
            .map_err(|e| PoolError::Backend(format!("rowset encoding failed: {}", e)))
    }

    #[cfg(test)]
    pub(crate) fn redis_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.redis.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    #[cfg(test)]
    pub(crate) fn redis_address(&self, name: &str) -> Option<String> {
        self.redis.read().unwrap().get(name).map(|h| h.address.clone())
    }

    #[cfg(test)]
    pub(crate) fn sql_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sql.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Reject anything that is not a single SELECT statement.
fn ensure_read_only(sql: &str) -> Result<(), PoolError> {
    let trimmed = sql.trim();
    let first = trimmed
        .split_whitespace()
        .next()
        .ok_or_else(|| PoolError::Rejected("empty query".to_string()))?;
    if !first.eq_ignore_ascii_case("select") {
        return Err(PoolError::Rejected("only SELECT statements are allowed".to_string()));
    }
    let body = trimmed.trim_end_matches(|c: char| c.is_whitespace() || c == ';');
    if body.contains(';') {
        return Err(PoolError::Rejected("multiple statements are not allowed".to_string()));
    }
    Ok(())
}

fn format_redis_value(value: &redis::Value) -> String {
    match value {
        redis::Value::Nil => String::new(),
        redis::Value::Int(i) => i.to_string(),
        redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        redis::Value::SimpleString(s) => s.clone(),
        redis::Value::Okay => "OK".to_string(),
        redis::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(format_redis_value).collect();
            serde_json::to_string(&rendered).unwrap_or_default()
        }
        other => format!("{:?}", other),
    }
}

fn pg_row_values(row: &sqlx::postgres::PgRow) -> Vec<String> {
    (0..row.columns().len()).map(|i| column_as_string_pg(row, i)).collect()
}

fn column_as_string_pg(row: &sqlx::postgres::PgRow, index: usize) -> String {
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.unwrap_or_default();
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(|v| v.to_string()).unwrap_or_default();
    }
    if let Ok(value) = row.try_get::<Option<i32>, _>(index) {
        return value.map(|v| v.to_string()).unwrap_or_default();
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map(|v| v.to_string()).unwrap_or_default();
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map(|v| v.to_string()).unwrap_or_default();
    }
    String::new()
}

fn mysql_row_values(row: &sqlx::mysql::MySqlRow) -> Vec<String> {
    (0..row.columns().len()).map(|i| column_as_string_mysql(row, i)).collect()
}

fn column_as_string_mysql(row: &sqlx::mysql::MySqlRow, index: usize) -> String {
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.unwrap_or_default();
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(|v| v.to_string()).unwrap_or_default();
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map(|v| v.to_string()).unwrap_or_default();
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map(|v| v.to_string()).unwrap_or_default();
    }
    String::new()
}

/// Shared handle type used across the data plane.
pub type SharedPools = Arc<ResourcePools>;

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(
        redis: &[(&str, &str)],
        databases: &[(&str, &str, &str)],
    ) -> proto::ExternalResources {
        proto::ExternalResources {
            redis: redis
                .iter()
                .map(|(name, address)| proto::RedisConfig {
                    name: name.to_string(),
                    address: address.to_string(),
                })
                .collect(),
            databases: databases
                .iter()
                .map(|(name, kind, conn)| proto::DatabaseConfig {
                    name: name.to_string(),
                    r#type: kind.to_string(),
                    connection_string: conn.to_string(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_reconcile_creates_and_removes() {
        let pools = ResourcePools::new();
        pools.reconcile(Some(&resources(
            &[("default", "redis://127.0.0.1:6379")],
            &[("users-pg", "postgres", "postgres://agw@localhost/users")],
        )));

        assert_eq!(pools.redis_names(), vec!["default"]);
        assert_eq!(pools.sql_names(), vec!["users-pg"]);

        pools.reconcile(Some(&resources(&[], &[])));
        assert!(pools.redis_names().is_empty());
        assert!(pools.sql_names().is_empty());
    }

    #[test]
    fn test_reconcile_recreates_on_address_change() {
        let pools = ResourcePools::new();
        pools.reconcile(Some(&resources(&[("default", "redis://127.0.0.1:6379")], &[])));
        assert_eq!(pools.redis_address("default").as_deref(), Some("redis://127.0.0.1:6379"));

        pools.reconcile(Some(&resources(&[("default", "redis://127.0.0.1:6380")], &[])));
        assert_eq!(pools.redis_address("default").as_deref(), Some("redis://127.0.0.1:6380"));
    }

    #[test]
    fn test_reconcile_skips_unknown_database_kind() {
        let pools = ResourcePools::new();
        pools.reconcile(Some(&resources(
            &[],
            &[("bad", "oracle", "oracle://nope")],
        )));
        assert!(pools.sql_names().is_empty());
    }

    #[test]
    fn test_database_kind_parse() {
        assert_eq!("postgres".parse::<DatabaseKind>().unwrap(), DatabaseKind::Postgres);
        assert_eq!("mysql".parse::<DatabaseKind>().unwrap(), DatabaseKind::Mysql);
        assert!("sqlite".parse::<DatabaseKind>().is_err());
    }

    #[test]
    fn test_read_only_guard() {
        assert!(ensure_read_only("SELECT 1").is_ok());
        assert!(ensure_read_only("  select name from users  ").is_ok());
        assert!(ensure_read_only("SELECT 1;").is_ok());
        assert!(ensure_read_only("DELETE FROM users").is_err());
        assert!(ensure_read_only("INSERT INTO t VALUES (1)").is_err());
        assert!(ensure_read_only("SELECT 1; DROP TABLE users").is_err());
        assert!(ensure_read_only("").is_err());
    }

    #[tokio::test]
    async fn test_unknown_resource_errors() {
        let pools = ResourcePools::new();
        let err = pools.redis_command("ghost", "GET k").await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownResource(_)));

        let err = pools.sql_query("ghost", "SELECT 1").await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownResource(_)));
    }

    #[test]
    fn test_format_redis_value() {
        assert_eq!(format_redis_value(&redis::Value::Int(5)), "5");
        assert_eq!(
            format_redis_value(&redis::Value::BulkString(b"hello".to_vec())),
            "hello"
        );
        assert_eq!(format_redis_value(&redis::Value::Okay), "OK");
        let array = redis::Value::Array(vec![
            redis::Value::Int(1),
            redis::Value::BulkString(b"two".to_vec()),
        ]);
        assert_eq!(format_redis_value(&array), r#"["1","two"]"#);
    }
}
