// pgvault/src/backup/retention.rs
//! Calendar-day retention over the artifacts of one scope.

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate, NaiveDateTime};
use tracing::{debug, info, warn};

use crate::backup::destination::RetentionScope;
use crate::backup::s3_upload::ObjectStore;
use crate::errors::{BackupError, Result};

/// An artifact found in storage, dated by its filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBackup {
    pub key: String,
    pub taken_at: NaiveDateTime,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub examined: usize,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Keeps the keys that are artifacts of `scope`; anything else is left alone.
pub fn collect_backups(scope: &RetentionScope, keys: impl IntoIterator<Item = String>) -> Vec<StoredBackup> {
    keys.into_iter()
        .filter_map(|key| {
            let taken_at = scope.parse_key(&key)?;
            Some(StoredBackup { key, taken_at })
        })
        .collect()
}

/// Keys to delete: everything dated before `today - (days - 1)`, then all
/// but the latest artifact of each remaining day. Ties on the timestamp keep
/// the greatest key.
pub fn plan_deletions(backups: &[StoredBackup], today: NaiveDate, retention_days: Option<i64>) -> Vec<String> {
    let days = match retention_days {
        Some(d) if d > 0 => d as u64,
        _ => return Vec::new(),
    };
    // Before the representable range every artifact is inside the window.
    let cutoff = today.checked_sub_days(Days::new(days - 1)).unwrap_or(NaiveDate::MIN);

    let mut deletions = Vec::new();
    let mut latest_per_day: BTreeMap<NaiveDate, &StoredBackup> = BTreeMap::new();
    for backup in backups {
        let day = backup.taken_at.date();
        if day < cutoff {
            deletions.push(backup.key.clone());
            continue;
        }
        match latest_per_day.get(&day) {
            Some(kept) if (kept.taken_at, &kept.key) >= (backup.taken_at, &backup.key) => {
                deletions.push(backup.key.clone());
            }
            Some(kept) => {
                deletions.push(kept.key.clone());
                latest_per_day.insert(day, backup);
            }
            None => {
                latest_per_day.insert(day, backup);
            }
        }
    }
    deletions.sort();
    deletions
}

/// Lists the scope, plans and deletes. Individual delete failures are
/// recorded and do not stop the others.
pub async fn apply_retention(
    store: &dyn ObjectStore,
    scope: &RetentionScope,
    today: NaiveDate,
    retention_days: Option<i64>,
) -> Result<RetentionReport> {
    if !matches!(retention_days, Some(d) if d > 0) {
        debug!("Retention disabled for s3://{}/{}", scope.bucket, scope.directory);
        return Ok(RetentionReport::default());
    }

    let keys = store
        .list_keys(&scope.bucket, &scope.directory)
        .await
        .map_err(|e| BackupError::Retention(format!("listing s3://{}/{}: {}", scope.bucket, scope.directory, e)))?;
    let backups = collect_backups(scope, keys);
    let mut report = RetentionReport {
        examined: backups.len(),
        ..RetentionReport::default()
    };

    for key in plan_deletions(&backups, today, retention_days) {
        match store.delete_key(&scope.bucket, &key).await {
            Ok(()) => {
                info!("Retention deleted s3://{}/{}", scope.bucket, key);
                report.deleted.push(key);
            }
            Err(e) => {
                warn!("Retention could not delete s3://{}/{}: {}", scope.bucket, key, e);
                report.failed.push(key);
            }
        }
    }

    if !report.failed.is_empty() {
        return Err(BackupError::Retention(format!(
            "{} of {} deletion(s) failed in s3://{}/{}",
            report.failed.len(),
            report.failed.len() + report.deleted.len(),
            scope.bucket,
            scope.directory
        )));
    }
    Ok(report)
}
