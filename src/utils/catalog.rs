// pgvault/src/utils/catalog.rs
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ConnectionSpec;
use crate::errors::{BackupError, Result};

const LIST_DATABASES_SQL: &str =
    "SELECT datname FROM pg_database WHERE datistemplate = false AND datallowconn = true";

const TERMINATE_SESSIONS_SQL: &str = r#"
    SELECT pg_terminate_backend(pid)
    FROM pg_stat_activity
    WHERE usename = current_user
      AND pid <> pg_backend_pid()
"#;

/// Server-side queries the engine issues outside of `pg_dump`.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Connectable, non-template databases in catalog order.
    async fn list_databases(&self, dsn: &Url) -> Result<Vec<String>>;

    /// Terminates the current user's other sessions, returns how many went away.
    async fn terminate_other_sessions(&self, dsn: &Url) -> Result<u64>;
}

/// [`Catalog`] backed by a short-lived sqlx connection.
pub struct PgCatalog {
    connect_timeout: Duration,
}

impl PgCatalog {
    pub fn new(connect_timeout: Duration) -> Self {
        PgCatalog { connect_timeout }
    }

    async fn connect(&self, dsn: &Url) -> Result<PgConnection> {
        let host = dsn.host_str().unwrap_or("localhost");
        timeout(self.connect_timeout, PgConnection::connect(dsn.as_str()))
            .await
            .map_err(|_| {
                BackupError::Connection(format!(
                    "timed out after {}s connecting to {}",
                    self.connect_timeout.as_secs(),
                    host
                ))
            })?
            .map_err(|e| BackupError::Connection(format!("failed to connect to {}: {}", host, e)))
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn list_databases(&self, dsn: &Url) -> Result<Vec<String>> {
        let mut conn = self.connect(dsn).await?;
        let names = sqlx::query_scalar::<_, String>(LIST_DATABASES_SQL)
            .fetch_all(&mut conn)
            .await
            .map_err(|e| BackupError::Connection(format!("failed to list databases: {}", e)))?;
        if let Err(e) = conn.close().await {
            debug!("Closing catalog connection failed: {}", e);
        }
        Ok(names)
    }

    async fn terminate_other_sessions(&self, dsn: &Url) -> Result<u64> {
        let mut conn = self
            .connect(dsn)
            .await
            .map_err(|e| BackupError::Termination(e.to_string()))?;
        let results = sqlx::query_scalar::<_, bool>(TERMINATE_SESSIONS_SQL)
            .fetch_all(&mut conn)
            .await
            .map_err(|e| BackupError::Termination(format!("pg_terminate_backend failed: {}", e)))?;
        if let Err(e) = conn.close().await {
            debug!("Closing catalog connection failed: {}", e);
        }
        Ok(results.into_iter().filter(|terminated| *terminated).count() as u64)
    }
}

/// Databases of one connection that should be backed up, consumed once.
pub struct DatabaseIter {
    names: std::vec::IntoIter<String>,
    ignored: Vec<String>,
}

impl Iterator for DatabaseIter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        for name in self.names.by_ref() {
            if self.ignored.iter().any(|i| *i == name) {
                info!("Skipping ignored database: {}", name);
                continue;
            }
            return Some(name);
        }
        None
    }
}

/// Lists a connection's databases with the ignore list applied.
pub async fn enumerate_databases(catalog: &dyn Catalog, spec: &ConnectionSpec) -> Result<DatabaseIter> {
    let names = catalog.list_databases(&spec.dsn).await?;
    debug!("Catalog of {} returned {} database(s)", spec.label(), names.len());
    Ok(DatabaseIter {
        names: names.into_iter(),
        ignored: spec.ignore_databases.clone(),
    })
}

/// Runs the session terminator for a connection. Failures are only logged.
pub async fn terminate_sessions(catalog: &dyn Catalog, spec: &ConnectionSpec) -> Option<u64> {
    match catalog.terminate_other_sessions(&spec.dsn).await {
        Ok(count) => {
            info!("Terminated {} other session(s) on {}", count, spec.redacted_dsn());
            Some(count)
        }
        Err(e) => {
            warn!("Session termination on {} failed: {}", spec.redacted_dsn(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::testing::{FakeCatalog, test_config};
    use crate::config::parse_connections;

    fn first_spec(pairs: &[(&str, &str)]) -> ConnectionSpec {
        let config = test_config(pairs);
        let mut parsed = parse_connections(&config.pg_urls, &config);
        parsed.specs.remove(0)
    }

    #[tokio::test]
    async fn test_ignore_list_filters_exact_names_in_order() -> anyhow::Result<()> {
        let spec = first_spec(&[
            ("PG_URLS", "postgres://u@h/postgres"),
            ("IGNORE_DATABASES", "postgres, scratch"),
        ]);
        let catalog = FakeCatalog::new(&["postgres", "orders", "scratch", "scratch2", "accounts"]);
        let names: Vec<String> = enumerate_databases(&catalog, &spec).await?.collect();
        assert_eq!(names, vec!["orders", "scratch2", "accounts"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_enumeration_failure_is_connection_error() {
        let spec = first_spec(&[("PG_URLS", "postgres://u@h/postgres")]);
        let catalog = FakeCatalog::unreachable();
        let result = enumerate_databases(&catalog, &spec).await;
        assert!(matches!(result, Err(BackupError::Connection(_))));
    }

    #[tokio::test]
    async fn test_terminator_reports_count() {
        let spec = first_spec(&[("PG_URLS", "postgres://u@h/postgres")]);
        let catalog = FakeCatalog::new(&["postgres"]).with_sessions(3);
        assert_eq!(terminate_sessions(&catalog, &spec).await, Some(3));
        assert_eq!(catalog.terminations(), 1);
        assert_eq!(terminate_sessions(&FakeCatalog::unreachable(), &spec).await, None);
    }

    #[tokio::test]
    async fn test_unreachable_server_times_out_as_connection_error() -> anyhow::Result<()> {
        // Reserved TEST-NET address, never answers.
        let dsn = Url::parse("postgres://u:p@192.0.2.1:5432/postgres")?;
        let catalog = PgCatalog::new(Duration::from_millis(200));
        let err = catalog.list_databases(&dsn).await.unwrap_err();
        assert!(matches!(err, BackupError::Connection(_)));
        Ok(())
    }
}
