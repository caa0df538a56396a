// pgvault/src/config/connection.rs
//! Parser for the multi-connection list (`PG_URLS`).
//!
//! Entries are separated by `,`. Each entry ends with a PostgreSQL DSN and
//! may carry `@`-separated metadata in front of it, either as `key=value`
//! pairs or as the six-field positional layout
//! `prefix@bucket@endpoint@force_path_style@access@secret@postgres://...`.
//!
//! The prefix is a single path segment: surrounding `/` are trimmed. It has
//! no global fallback; `GLOBAL_PREFIX` only roots the object keys.

use std::collections::BTreeMap;

use tracing::warn;
use url::Url;

use crate::config::{GlobalConfig, parse_flag};
use crate::errors::{BackupError, Result};

const DSN_SCHEMES: [&str; 2] = ["postgres://", "postgresql://"];
const POSITIONAL_FIELDS: usize = 6;
const POSITIONAL_LAYOUT: &str = "prefix@bucket@endpoint@force_path_style@access@secret@postgres://...";

/// Object-storage settings of one connection, globals already applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StorageSettings {
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: Option<String>,
    pub force_path_style: Option<bool>,
}

/// One parsed configuration entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSpec {
    pub dsn: Url,
    pub prefix: Option<String>,
    pub bucket: Option<String>,
    pub storage: StorageSettings,
    pub db_buckets: BTreeMap<String, String>,
    pub retention_days: Option<i64>,
    pub force_terminate: bool,
    pub ignore_databases: Vec<String>,
}

impl ConnectionSpec {
    pub fn host(&self) -> &str {
        self.dsn.host_str().filter(|h| !h.is_empty()).unwrap_or("localhost")
    }

    /// Name used to tag log lines for this connection.
    pub fn label(&self) -> &str {
        self.prefix.as_deref().unwrap_or_else(|| self.host())
    }

    /// DSN with the password masked, safe to log.
    pub fn redacted_dsn(&self) -> String {
        let mut url = self.dsn.clone();
        if url.password().is_some() {
            let _ = url.set_password(Some("****"));
        }
        url.to_string()
    }

    /// The DSN pointed at another database on the same server.
    pub fn dsn_for_database(&self, database: &str) -> Url {
        let mut url = self.dsn.clone();
        url.set_path(&format!("/{}", database));
        url
    }
}

/// A `key=value` or bare segment of a meta-annotated entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaSegment {
    Pair(String, String),
    Token(String),
}

/// The positional-compact fields, in order. Empty strings mean "not given".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionalFields {
    pub prefix: String,
    pub bucket: String,
    pub endpoint: String,
    pub force_path_style: String,
    pub access: String,
    pub secret: String,
}

/// How the metadata in front of a DSN was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryForm {
    Bare,
    Meta(Vec<MetaSegment>),
    Positional(PositionalFields),
}

/// Values an entry supplies on its own, before global fallbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Overrides {
    prefix: Option<String>,
    bucket: Option<String>,
    endpoint: Option<String>,
    access: Option<String>,
    secret: Option<String>,
    region: Option<String>,
    force_path_style: Option<bool>,
    db_buckets: BTreeMap<String, String>,
    retention: Option<i64>,
    force_terminate: Option<bool>,
}

/// A configuration entry that could not be parsed. Only the entry position
/// is kept since the raw text may hold credentials.
#[derive(Debug)]
pub struct EntryError {
    pub index: usize,
    pub error: BackupError,
}

#[derive(Debug, Default)]
pub struct ParsedConnections {
    pub specs: Vec<ConnectionSpec>,
    pub errors: Vec<EntryError>,
}

/// Parses every entry of `raw`, keeping input order. A bad entry is reported
/// in `errors` and does not stop the others.
pub fn parse_connections(raw: &str, global: &GlobalConfig) -> ParsedConnections {
    let mut parsed = ParsedConnections::default();
    for (index, entry) in raw.split(',').map(str::trim).enumerate() {
        if entry.is_empty() {
            continue;
        }
        match parse_entry(entry, global) {
            Ok(spec) => parsed.specs.push(spec),
            Err(error) => parsed.errors.push(EntryError { index, error }),
        }
    }
    parsed
}

/// Parses one entry into a spec with global fallbacks applied.
pub fn parse_entry(entry: &str, global: &GlobalConfig) -> Result<ConnectionSpec> {
    let (meta, dsn) = split_dsn(entry)?;
    let form = classify(meta)?;
    let overrides = overrides_from(form)?;

    let dsn = Url::parse(dsn)?;

    let defaults = &global.storage;
    Ok(ConnectionSpec {
        dsn,
        prefix: overrides
            .prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty()),
        bucket: overrides.bucket.or_else(|| defaults.bucket.clone()),
        storage: StorageSettings {
            endpoint: overrides.endpoint.or_else(|| defaults.endpoint.clone()),
            access_key: overrides.access.or_else(|| defaults.access_key.clone()),
            secret_key: overrides.secret.or_else(|| defaults.secret_key.clone()),
            region: overrides.region.or_else(|| defaults.region.clone()),
            force_path_style: overrides.force_path_style.or(defaults.force_path_style),
        },
        db_buckets: overrides.db_buckets,
        retention_days: overrides.retention.or(global.retention_days),
        force_terminate: overrides.force_terminate.unwrap_or(global.force_terminate),
        ignore_databases: global.ignore_databases.clone(),
    })
}

/// Splits an entry at the first DSN scheme token.
fn split_dsn(entry: &str) -> Result<(&str, &str)> {
    let start = DSN_SCHEMES
        .iter()
        .filter_map(|scheme| entry.find(scheme))
        .min()
        .ok_or_else(|| {
            BackupError::Config(
                "entry does not contain a postgres:// or postgresql:// DSN".to_string(),
            )
        })?;
    Ok(entry.split_at(start))
}

/// Decides which grammar the metadata uses.
pub fn classify(meta: &str) -> Result<EntryForm> {
    if meta.is_empty() {
        return Ok(EntryForm::Bare);
    }
    let body = meta.strip_suffix('@').ok_or_else(|| {
        BackupError::Config("metadata must be separated from the DSN by '@'".to_string())
    })?;
    let segments: Vec<&str> = body.split('@').collect();

    if segments.iter().any(|s| s.contains('=')) {
        let parsed = segments
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| match s.split_once('=') {
                Some((key, value)) => {
                    MetaSegment::Pair(key.trim().to_ascii_lowercase(), value.trim().to_string())
                }
                None => MetaSegment::Token(s.trim().to_string()),
            })
            .collect();
        return Ok(EntryForm::Meta(parsed));
    }

    if segments.len() != POSITIONAL_FIELDS {
        return Err(BackupError::Config(format!(
            "positional entry has {} metadata field(s), expected {} ({})",
            segments.len(),
            POSITIONAL_FIELDS,
            POSITIONAL_LAYOUT
        )));
    }
    let field = |i: usize| segments[i].trim().to_string();
    Ok(EntryForm::Positional(PositionalFields {
        prefix: field(0),
        bucket: field(1),
        endpoint: field(2),
        force_path_style: field(3),
        access: field(4),
        secret: field(5),
    }))
}

fn overrides_from(form: EntryForm) -> Result<Overrides> {
    let mut overrides = Overrides::default();
    match form {
        EntryForm::Bare => {}
        EntryForm::Meta(segments) => {
            for segment in segments {
                match segment {
                    MetaSegment::Pair(key, value) => apply_pair(&mut overrides, &key, value)?,
                    MetaSegment::Token(token) if overrides.prefix.is_none() => {
                        overrides.prefix = Some(token);
                    }
                    MetaSegment::Token(token) => {
                        warn!("Ignoring stray metadata segment '{}' (prefix already set)", token);
                    }
                }
            }
        }
        EntryForm::Positional(fields) => {
            overrides.prefix = non_empty(fields.prefix);
            // `bucket(comment)` is accepted and the comment dropped.
            overrides.bucket = non_empty(match fields.bucket.split_once('(') {
                Some((name, _)) => name.trim().to_string(),
                None => fields.bucket,
            });
            overrides.endpoint = non_empty(fields.endpoint);
            overrides.force_path_style = parse_optional_flag("force_path_style", &fields.force_path_style)?;
            overrides.access = non_empty(fields.access);
            overrides.secret = non_empty(fields.secret);
        }
    }
    Ok(overrides)
}

fn apply_pair(overrides: &mut Overrides, key: &str, value: String) -> Result<()> {
    match key {
        "prefix" => overrides.prefix = non_empty(value),
        "bucket" => overrides.bucket = non_empty(value),
        "endpoint" => overrides.endpoint = non_empty(value),
        "access" => overrides.access = non_empty(value),
        "secret" => overrides.secret = non_empty(value),
        "region" => overrides.region = non_empty(value),
        "force_path_style" => overrides.force_path_style = parse_optional_flag(key, &value)?,
        "force_terminate" => overrides.force_terminate = parse_optional_flag(key, &value)?,
        "db_buckets" => overrides.db_buckets = parse_db_buckets(&value)?,
        "retention" => {
            overrides.retention = match non_empty(value) {
                Some(v) => Some(v.parse::<i64>().map_err(|_| {
                    BackupError::Config(format!("retention must be an integer number of days, got '{}'", v))
                })?),
                None => None,
            }
        }
        other => warn!("Ignoring unrecognized connection option '{}'", other),
    }
    Ok(())
}

/// Parses `db1=bucket1;db2=bucket2`.
pub fn parse_db_buckets(spec: &str) -> Result<BTreeMap<String, String>> {
    let mut mapping = BTreeMap::new();
    for pair in spec.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (db, bucket) = pair.split_once('=').ok_or_else(|| {
            BackupError::Config(format!("db_buckets item '{}' must look like database=bucket", pair))
        })?;
        let (db, bucket) = (db.trim(), bucket.trim());
        if db.is_empty() || bucket.is_empty() {
            return Err(BackupError::Config(format!(
                "db_buckets item '{}' has an empty database or bucket",
                pair
            )));
        }
        mapping.insert(db.to_string(), bucket.to_string());
    }
    Ok(mapping)
}

fn parse_optional_flag(key: &str, value: &str) -> Result<Option<bool>> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    parse_flag(value)
        .map(Some)
        .ok_or_else(|| BackupError::Config(format!("{} must be a boolean, got '{}'", key, value)))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
