// pgvault/src/config/mod.rs
pub mod connection;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backup::s3_upload::RetryPolicy;

pub use connection::{ConnectionSpec, StorageSettings, parse_connections};

const DEFAULT_CONFIG_FILE: &str = "config.json";
const DEFAULT_UPLOAD_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_UPLOAD_RETRY_BASE_MS: u64 = 2_000;
const UPLOAD_RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_DUMP_TIMEOUT_SECS: u64 = 6 * 60 * 60;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

// Structs for deserializing config.json. Every field is optional; the
// environment fills or overrides whatever the file leaves out.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub pg_urls: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_force_path_style: Option<bool>,
    pub global_prefix: Option<String>,
    pub retention_days: Option<i64>,
    pub ignore_databases: Option<serde_json::Value>,
    pub archive_password: Option<String>,
    pub backup_format: Option<String>,
    pub force_terminate: Option<bool>,
    pub temp_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub upload_max_attempts: Option<u32>,
    pub upload_retry_base_ms: Option<u64>,
    pub dump_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
}

/// Shape of the artifact that gets uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Raw `pg_dump` custom-format output.
    Dump,
    /// Deflated zip, AES-256 protected when a passphrase is configured.
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Dump => "dump",
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    pub fn is_archive(self) -> bool {
        self != ArchiveFormat::Dump
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dump" | "raw" => Some(ArchiveFormat::Dump),
            "zip" => Some(ArchiveFormat::Zip),
            "tar.gz" | "tgz" | "targz" => Some(ArchiveFormat::TarGz),
            _ => None,
        }
    }
}

/// Global fallbacks for object storage, overridable per connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageDefaults {
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub force_path_style: Option<bool>,
}

/// Immutable run configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub pg_urls: String,
    pub storage: StorageDefaults,
    pub global_prefix: Option<String>,
    pub retention_days: Option<i64>,
    pub ignore_databases: Vec<String>,
    pub archive_password: Option<String>,
    pub archive_format: ArchiveFormat,
    pub force_terminate: bool,
    pub temp_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub upload_retry: RetryPolicy,
    pub dump_timeout: Duration,
    pub connect_timeout: Duration,
}

impl GlobalConfig {
    /// Loads `.env`-populated process environment on top of an optional
    /// JSON file (`CONFIG_FILE`, or `config.json` when it exists).
    pub fn from_process_env() -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let json_path = match env("CONFIG_FILE").filter(|p| !p.trim().is_empty()) {
            Some(path) => Some(PathBuf::from(path)),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.is_file().then_some(default)
            }
        };
        Self::load(json_path.as_deref(), env)
    }

    pub fn load<F>(json_path: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = match json_path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file at {}", path.display()))?;
                serde_json::from_str::<RawJsonConfig>(&content).with_context(|| {
                    format!("Failed to parse JSON from config file at {}", path.display())
                })?
            }
            None => RawJsonConfig::default(),
        };
        Self::from_sources(raw, env)
    }

    /// Merges the JSON layer with the environment; non-empty environment
    /// values win.
    pub fn from_sources<F>(raw: RawJsonConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let text = |key: &str, json: Option<String>| var(key).or(json.filter(|v| !v.trim().is_empty()));

        let pg_urls = text("PG_URLS", raw.pg_urls)
            .context("PG_URLS must be set with one or more PostgreSQL connections (separated by ',')")?;

        let storage = StorageDefaults {
            endpoint: text("S3_ENDPOINT", raw.s3_endpoint),
            access_key: text("S3_ACCESS_KEY", raw.s3_access_key),
            secret_key: text("S3_SECRET_KEY", raw.s3_secret_key),
            bucket: text("S3_BUCKET", raw.s3_bucket),
            region: var("S3_REGION").or_else(|| var("AWS_REGION")).or(raw.s3_region),
            force_path_style: match var("S3_FORCE_PATH_STYLE") {
                Some(v) => Some(parse_flag(&v).with_context(|| {
                    format!("S3_FORCE_PATH_STYLE must be a boolean, got '{}'", v)
                })?),
                None => raw.s3_force_path_style,
            },
        };

        let retention_days = match var("RETENTION_DAYS") {
            Some(v) => Some(
                v.parse::<i64>()
                    .with_context(|| format!("RETENTION_DAYS must be an integer, got '{}'", v))?,
            ),
            None => raw.retention_days,
        };

        let ignore_databases = match var("IGNORE_DATABASES") {
            Some(v) => split_list(&v),
            None => parse_ignore_list(&raw.ignore_databases)?,
        };

        let archive_password = text("ARCHIVE_PASSWORD", raw.archive_password);
        let archive_format = match text("BACKUP_FORMAT", raw.backup_format) {
            Some(v) => ArchiveFormat::parse(&v).with_context(|| {
                format!("BACKUP_FORMAT must be one of dump, zip, tar.gz; got '{}'", v)
            })?,
            None if archive_password.is_some() => ArchiveFormat::Zip,
            None => ArchiveFormat::Dump,
        };
        if archive_password.is_some() && archive_format != ArchiveFormat::Zip {
            anyhow::bail!(
                "ARCHIVE_PASSWORD requires the zip backup format, but BACKUP_FORMAT is '{}'",
                archive_format.extension()
            );
        }

        let force_terminate = match var("FORCE_TERMINATE") {
            Some(v) => parse_flag(&v)
                .with_context(|| format!("FORCE_TERMINATE must be a boolean, got '{}'", v))?,
            None => raw.force_terminate.unwrap_or(false),
        };

        let upload_max_attempts = number("UPLOAD_MAX_ATTEMPTS", &var, raw.upload_max_attempts)?
            .unwrap_or(DEFAULT_UPLOAD_MAX_ATTEMPTS);
        if upload_max_attempts == 0 {
            anyhow::bail!("UPLOAD_MAX_ATTEMPTS must be at least 1");
        }
        let retry_base_ms = number("UPLOAD_RETRY_BASE_MS", &var, raw.upload_retry_base_ms)?
            .unwrap_or(DEFAULT_UPLOAD_RETRY_BASE_MS);
        let dump_timeout_secs = number("DUMP_TIMEOUT_SECS", &var, raw.dump_timeout_secs)?
            .unwrap_or(DEFAULT_DUMP_TIMEOUT_SECS);
        let connect_timeout_secs = number("CONNECT_TIMEOUT_SECS", &var, raw.connect_timeout_secs)?
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);

        Ok(GlobalConfig {
            pg_urls,
            storage,
            global_prefix: text("GLOBAL_PREFIX", raw.global_prefix)
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
            retention_days,
            ignore_databases,
            archive_password,
            archive_format,
            force_terminate,
            temp_dir: var("TEMP_DIR").map(PathBuf::from).or(raw.temp_dir),
            log_file: var("LOG_FILE").map(PathBuf::from).or(raw.log_file),
            upload_retry: RetryPolicy {
                max_attempts: upload_max_attempts,
                base_delay: Duration::from_millis(retry_base_ms),
                max_delay: UPLOAD_RETRY_MAX_DELAY,
            },
            dump_timeout: Duration::from_secs(dump_timeout_secs),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
        })
    }
}

/// Accepts the usual spellings of a boolean switch.
pub(crate) fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn number<T, V>(key: &str, var: &V, json: Option<T>) -> Result<Option<T>>
where
    T: std::str::FromStr,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", key, v)),
        None => Ok(json),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `ignore_databases` in config.json may be an array of names or a single
/// comma-separated string.
fn parse_ignore_list(value: &Option<serde_json::Value>) -> Result<Vec<String>> {
    match value {
        Some(serde_json::Value::String(s)) => Ok(split_list(s)),
        Some(v) if v.is_array() => {
            let names: Vec<String> = serde_json::from_value(v.clone())
                .context("Failed to parse ignore_databases as array of strings")?;
            Ok(names
                .into_iter()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect())
        }
        Some(serde_json::Value::Null) | None => Ok(Vec::new()),
        Some(_) => Err(anyhow::anyhow!(
            "ignore_databases must be either an array of database names or a comma-separated string"
        )),
    }
}
