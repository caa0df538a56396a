// pgvault/src/backup/db_dump.rs
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use tokio::process::Command;
use tracing::debug;
use url::Url;
use which::which;

use crate::errors::{BackupError, Result};

const STDERR_TAIL_LINES: usize = 20;

/// Produces a dump file for one database.
#[async_trait]
pub trait Dumper: Send + Sync {
    async fn dump(&self, dsn: &Url, database: &str, output: &Path) -> Result<()>;
}

/// Runs the `pg_dump` client in custom format.
pub struct PgDump {
    executable: PathBuf,
    timeout: Duration,
}

impl PgDump {
    /// Finds the pg_dump executable in the system PATH.
    pub fn locate(timeout: Duration) -> anyhow::Result<Self> {
        let executable = which("pg_dump").context(
            "pg_dump executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.",
        )?;
        debug!("Found pg_dump executable at: {}", executable.display());
        Ok(PgDump { executable, timeout })
    }
}

#[async_trait]
impl Dumper for PgDump {
    async fn dump(&self, dsn: &Url, database: &str, output: &Path) -> Result<()> {
        let (target, password) = split_password(dsn);
        let mut command = Command::new(&self.executable);
        if let Some(password) = password {
            command.env("PGPASSWORD", password);
        }
        let child = command
            .arg("--format=custom")
            .arg("--no-password")
            .arg("--file")
            .arg(output)
            .arg("--dbname")
            .arg(target.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackupError::Dump(format!("failed to start pg_dump for {}: {}", database, e)))?;

        let result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                BackupError::Dump(format!(
                    "pg_dump for {} timed out after {} seconds",
                    database,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| BackupError::Dump(format!("failed to run pg_dump for {}: {}", database, e)))?;

        if !result.status.success() {
            return Err(BackupError::Dump(format!(
                "pg_dump for database {} failed with status: {}\nStderr: {}",
                database,
                result.status,
                stderr_tail(&result.stderr)
            )));
        }
        Ok(())
    }
}

/// The DSN without its password, and the decoded password. Keeps the
/// secret out of the process list.
fn split_password(dsn: &Url) -> (Url, Option<String>) {
    let password = dsn
        .password()
        .map(|p| percent_decode_str(p).decode_utf8_lossy().into_owned());
    let mut target = dsn.clone();
    if password.is_some() {
        // Only fails for URLs that cannot carry credentials at all.
        let _ = target.set_password(None);
    }
    (target, password)
}

/// Last lines of a child's stderr, enough to explain a failure.
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let stderr: String = (1..=30).map(|i| format!("line {}\n\n", i)).collect();
        let tail = stderr_tail(stderr.as_bytes());
        assert!(tail.starts_with("line 11\n"));
        assert!(tail.ends_with("line 30"));
        assert_eq!(tail.lines().count(), STDERR_TAIL_LINES);
    }

    #[test]
    fn test_split_password_decodes_and_strips() -> anyhow::Result<()> {
        let dsn = Url::parse("postgres://backup:s3cr%40t%2F1@db:5432/app?sslmode=require")?;
        let (target, password) = split_password(&dsn);
        assert_eq!(password.as_deref(), Some("s3cr@t/1"));
        assert_eq!(target.as_str(), "postgres://backup@db:5432/app?sslmode=require");

        let (target, password) = split_password(&Url::parse("postgres://backup@db/app")?);
        assert_eq!(password, None);
        assert_eq!(target.as_str(), "postgres://backup@db/app");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_password_goes_through_environment() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let argv_file = dir.path().join("argv");
        let env_file = dir.path().join("env");
        let script = dir.path().join("pg_dump");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}'\nprintf '%s' \"$PGPASSWORD\" > '{}'\n",
                argv_file.display(),
                env_file.display()
            ),
        )?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;

        let dumper = PgDump {
            executable: script,
            timeout: Duration::from_secs(10),
        };
        let dsn = Url::parse("postgres://backup:s3cr%40t@db:5432/app")?;
        dumper.dump(&dsn, "app", &dir.path().join("app.dump")).await?;

        let argv = std::fs::read_to_string(&argv_file)?;
        assert!(!argv.contains("s3cr"), "password leaked into argv: {}", argv);
        assert!(argv.lines().any(|l| l == "postgres://backup@db:5432/app"));
        assert_eq!(std::fs::read_to_string(&env_file)?, "s3cr@t");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_dump_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dumper = PgDump {
            executable: PathBuf::from("false"),
            timeout: Duration::from_secs(10),
        };
        let dsn = Url::parse("postgres://u@localhost/app")?;
        let err = dumper.dump(&dsn, "app", &dir.path().join("app.dump")).await.unwrap_err();
        assert!(matches!(err, BackupError::Dump(ref m) if m.contains("app")));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_executable_is_dump_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dumper = PgDump {
            executable: dir.path().join("no-such-pg_dump"),
            timeout: Duration::from_secs(10),
        };
        let dsn = Url::parse("postgres://u@localhost/app")?;
        let err = dumper.dump(&dsn, "app", &dir.path().join("app.dump")).await.unwrap_err();
        assert!(matches!(err, BackupError::Dump(_)));
        Ok(())
    }
}
