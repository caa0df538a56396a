// pgvault/src/backup/destination.rs
//! Maps a (connection, database, timestamp) triple to its object key, and
//! reads the timestamp back out of keys found in storage.

use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use regex::Regex;

use crate::config::{ConnectionSpec, GlobalConfig};
use crate::errors::{BackupError, Result};

static STAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{2})h-(\d{2})m-(\d{2})d-(\d{2})mes-(\d{4})y\.(dump|zip|tar\.gz)$")
        .expect("static regex")
});

/// Where one database's artifact goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub bucket: String,
    /// Directory holding every artifact of this database, ends with `/`.
    pub directory: String,
    /// Leading part of the filename shared by all artifacts of this database.
    pub name_prefix: String,
    pub file_name: String,
    pub key: String,
}

impl Destination {
    pub fn scope(&self) -> RetentionScope {
        RetentionScope {
            bucket: self.bucket.clone(),
            directory: self.directory.clone(),
            name_prefix: self.name_prefix.clone(),
        }
    }
}

/// The set of objects retention is evaluated over.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RetentionScope {
    pub bucket: String,
    pub directory: String,
    pub name_prefix: String,
}

impl RetentionScope {
    /// Timestamp embedded in `key`, if the key is an artifact of this scope.
    pub fn parse_key(&self, key: &str) -> Option<NaiveDateTime> {
        let file_name = key.strip_prefix(&self.directory)?;
        if file_name.contains('/') {
            return None;
        }
        parse_stamp(file_name.strip_prefix(&self.name_prefix)?)
    }
}

/// Per-database bucket, else the connection bucket (which carries the
/// global fallback).
pub fn resolve_bucket<'a>(spec: &'a ConnectionSpec, database: &str) -> Option<&'a str> {
    spec.db_buckets
        .get(database)
        .map(String::as_str)
        .or(spec.bucket.as_deref())
}

/// Connection prefix, else the DSN host.
pub fn base_dir(spec: &ConnectionSpec) -> String {
    spec.prefix
        .as_deref()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| spec.host())
        .to_string()
}

/// `{prefix-}{db}-HHh-MMm-DDd-MMmes-YYYYy`, without extension.
pub fn filename_stem(prefix: Option<&str>, database: &str, taken_at: NaiveDateTime) -> String {
    format!(
        "{}{}",
        name_prefix(prefix, database),
        format_stamp(taken_at)
    )
}

fn name_prefix(prefix: Option<&str>, database: &str) -> String {
    match prefix {
        Some(p) => format!("{}-{}-", p, database),
        None => format!("{}-", database),
    }
}

fn format_stamp(taken_at: NaiveDateTime) -> String {
    format!(
        "{:02}h-{:02}m-{:02}d-{:02}mes-{:04}y",
        taken_at.hour(),
        taken_at.minute(),
        taken_at.day(),
        taken_at.month(),
        taken_at.year()
    )
}

/// Inverse of the timestamp part of [`filename_stem`] plus extension.
fn parse_stamp(stamp: &str) -> Option<NaiveDateTime> {
    let caps = STAMP_RE.captures(stamp)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    let time = NaiveTime::from_hms_opt(num(1)?, num(2)?, 0)?;
    let date = NaiveDate::from_ymd_opt(caps.get(5)?.as_str().parse::<i32>().ok()?, num(4)?, num(3)?)?;
    Some(date.and_time(time))
}

/// Resolves bucket, directory and key for one database.
pub fn resolve_destination(
    global: &GlobalConfig,
    spec: &ConnectionSpec,
    database: &str,
    taken_at: NaiveDateTime,
) -> Result<Destination> {
    let bucket = resolve_bucket(spec, database).ok_or_else(|| {
        BackupError::Config(format!(
            "no bucket configured for database '{}' (db_buckets, connection bucket or S3_BUCKET)",
            database
        ))
    })?;
    let base_dir = base_dir(spec);
    let directory = match global.global_prefix.as_deref() {
        Some(root) => format!("{}/{}/{}/", root, base_dir, database),
        None => format!("{}/{}/", base_dir, database),
    };
    let prefix = spec.prefix.as_deref().filter(|p| !p.is_empty());
    let file_name = format!(
        "{}.{}",
        filename_stem(prefix, database, taken_at),
        global.archive_format.extension()
    );
    Ok(Destination {
        bucket: bucket.to_string(),
        key: format!("{}{}", directory, file_name),
        directory,
        name_prefix: name_prefix(prefix, database),
        file_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RawJsonConfig, parse_connections};
    use std::collections::HashMap;

    fn global(pairs: &[(&str, &str)]) -> GlobalConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GlobalConfig::from_sources(RawJsonConfig::default(), move |k: &str| map.get(k).cloned())
            .expect("test config")
    }

    fn spec(g: &GlobalConfig) -> ConnectionSpec {
        let mut parsed = parse_connections(&g.pg_urls, g);
        assert!(parsed.errors.is_empty());
        parsed.specs.remove(0)
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .and_then(|date| date.and_hms_opt(h, mi, 0))
            .expect("valid timestamp")
    }

    #[test]
    fn test_filename_format_is_exact() {
        let ts = at(2024, 3, 7, 4, 5);
        assert_eq!(filename_stem(None, "orders", ts), "orders-04h-05m-07d-03mes-2024y");
        assert_eq!(
            filename_stem(Some("erp"), "orders", ts),
            "erp-orders-04h-05m-07d-03mes-2024y"
        );
        assert_eq!(filename_stem(None, "x", at(987, 12, 31, 23, 59)), "x-23h-59m-31d-12mes-0987y");
    }

    #[test]
    fn test_full_key_layout() -> anyhow::Result<()> {
        let g = global(&[
            ("PG_URLS", "prefix=erp@bucket=bk@postgres://u:p@db.internal/app"),
            ("GLOBAL_PREFIX", "nightly"),
            ("BACKUP_FORMAT", "zip"),
        ]);
        let s = spec(&g);
        let dest = resolve_destination(&g, &s, "orders", at(2025, 1, 2, 3, 4))?;
        assert_eq!(dest.bucket, "bk");
        assert_eq!(dest.directory, "nightly/erp/orders/");
        assert_eq!(dest.key, "nightly/erp/orders/erp-orders-03h-04m-02d-01mes-2025y.zip");
        Ok(())
    }

    #[test]
    fn test_base_dir_falls_back_to_host_and_no_global_prefix() -> anyhow::Result<()> {
        let g = global(&[("PG_URLS", "postgres://u@pg-main:5432/app"), ("S3_BUCKET", "g")]);
        let s = spec(&g);
        let dest = resolve_destination(&g, &s, "accounts", at(2025, 11, 30, 22, 0))?;
        assert_eq!(dest.key, "pg-main/accounts/accounts-22h-00m-30d-11mes-2025y.dump");
        assert_eq!(dest.directory, "pg-main/accounts/");
        Ok(())
    }

    #[test]
    fn test_db_bucket_scenario() -> anyhow::Result<()> {
        let g = global(&[("PG_URLS", "bucket=general@db_buckets=prod=prod-bk@postgres://h/d")]);
        let s = spec(&g);
        let ts = at(2025, 6, 1, 0, 0);
        assert_eq!(resolve_destination(&g, &s, "prod", ts)?.bucket, "prod-bk");
        assert_eq!(resolve_destination(&g, &s, "other", ts)?.bucket, "general");
        Ok(())
    }

    #[test]
    fn test_bucket_precedence_exhaustive() {
        for db_map in [false, true] {
            for conn in [false, true] {
                for glob in [false, true] {
                    let mut entry = String::new();
                    if db_map {
                        entry.push_str("db_buckets=target=map-bk;unrelated=x@");
                    }
                    if conn {
                        entry.push_str("bucket=conn-bk@");
                    }
                    if entry.is_empty() {
                        entry.push_str("prefix=p@");
                    }
                    entry.push_str("postgres://h/d");

                    let mut pairs = vec![("PG_URLS", entry.as_str())];
                    if glob {
                        pairs.push(("S3_BUCKET", "global-bk"));
                    }
                    let g = global(&pairs);
                    let s = spec(&g);

                    let expected = if db_map {
                        Some("map-bk")
                    } else if conn {
                        Some("conn-bk")
                    } else if glob {
                        Some("global-bk")
                    } else {
                        None
                    };
                    assert_eq!(resolve_bucket(&s, "target"), expected, "{:?}", (db_map, conn, glob));

                    let resolved = resolve_destination(&g, &s, "target", at(2025, 1, 1, 0, 0));
                    match expected {
                        Some(b) => assert_eq!(resolved.map(|d| d.bucket).ok().as_deref(), Some(b)),
                        None => assert!(matches!(resolved, Err(BackupError::Config(_)))),
                    }
                }
            }
        }
    }

    #[test]
    fn test_filename_round_trip() {
        let mut samples = Vec::new();
        for year in [1999, 2000, 2024, 2025, 9999] {
            for month in [1, 2, 6, 12] {
                for day in [1, 9, 28] {
                    for (hour, minute) in [(0, 0), (9, 5), (12, 30), (23, 59)] {
                        samples.push(at(year, month, day, hour, minute));
                    }
                }
            }
        }
        samples.push(at(2024, 2, 29, 13, 37));

        let g = global(&[("PG_URLS", "prefix=crm@bucket=b@postgres://h/d")]);
        let s = spec(&g);
        for ts in samples {
            let dest = resolve_destination(&g, &s, "sales-eu", ts).expect("destination");
            assert_eq!(dest.scope().parse_key(&dest.key), Some(ts), "{}", dest.key);
        }
    }

    #[test]
    fn test_prefix_with_slash_round_trips() -> anyhow::Result<()> {
        let g = global(&[("PG_URLS", "prefix=backups/@bucket=bk@postgres://u@h/d")]);
        let s = spec(&g);
        let ts = at(2025, 3, 10, 4, 0);
        let dest = resolve_destination(&g, &s, "orders", ts)?;
        assert_eq!(dest.key, "backups/orders/backups-orders-04h-00m-10d-03mes-2025y.dump");
        assert_eq!(dest.scope().parse_key(&dest.key), Some(ts));
        Ok(())
    }

    #[test]
    fn test_parse_key_rejects_foreign_keys() {
        let scope = RetentionScope {
            bucket: "b".to_string(),
            directory: "host/app/".to_string(),
            name_prefix: "app-".to_string(),
        };
        assert!(scope.parse_key("host/app/app-01h-02m-03d-04mes-2025y.dump").is_some());
        assert!(scope.parse_key("host/app/app-01h-02m-03d-04mes-2025y.tar.gz").is_some());
        assert!(scope.parse_key("host/app/app-01h-02m-03d-04mes-2025y.sql").is_none());
        assert!(scope.parse_key("host/app/nested/app-01h-02m-03d-04mes-2025y.dump").is_none());
        assert!(scope.parse_key("host/app/app-archive-01h-02m-03d-04mes-2025y.dump").is_none());
        assert!(scope.parse_key("host/app/app-25h-02m-03d-04mes-2025y.dump").is_none());
        assert!(scope.parse_key("host/app/app-01h-02m-31d-02mes-2025y.dump").is_none());
        assert!(scope.parse_key("other/app/app-01h-02m-03d-04mes-2025y.dump").is_none());
    }
}
