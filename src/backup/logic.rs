// pgvault/src/backup/logic.rs
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use tracing::{Instrument, error, info, info_span, warn};

use crate::backup::db_dump::Dumper;
use crate::backup::destination::{Destination, RetentionScope, resolve_destination};
use crate::backup::pipeline::{BackupArtifact, Outcome, Pipeline, Stage};
use crate::backup::retention::apply_retention;
use crate::backup::s3_upload::{ObjectStore, StoreFactory};
use crate::config::connection::EntryError;
use crate::config::{ConnectionSpec, GlobalConfig, parse_connections};
use crate::errors::BackupError;
use crate::utils::catalog::{Catalog, enumerate_databases, terminate_sessions};

type Clock = Box<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// A connection whose storage or catalog could not be reached.
#[derive(Debug)]
pub struct ConnectionFailure {
    pub connection: String,
    pub error: BackupError,
}

#[derive(Debug)]
pub struct TargetReport {
    pub connection: String,
    pub artifact: BackupArtifact,
}

/// Everything that happened in one pass.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub targets: Vec<TargetReport>,
    pub entry_errors: Vec<EntryError>,
    pub connection_errors: Vec<ConnectionFailure>,
    pub retention_errors: Vec<BackupError>,
    pub skipped_scopes: Vec<RetentionScope>,
}

impl RunSummary {
    /// Retention trouble is reported but never fails the run.
    pub fn is_success(&self) -> bool {
        self.entry_errors.is_empty()
            && self.connection_errors.is_empty()
            && self.targets.iter().all(|t| t.artifact.succeeded())
    }

    pub fn log_report(&self) {
        let succeeded = self.targets.iter().filter(|t| t.artifact.succeeded()).count();
        info!(
            "Run finished: {}/{} database(s) backed up, {} entry error(s), {} connection error(s), {} retention error(s)",
            succeeded,
            self.targets.len(),
            self.entry_errors.len(),
            self.connection_errors.len(),
            self.retention_errors.len()
        );
        for entry in &self.entry_errors {
            error!("  entry #{}: {}", entry.index + 1, entry.error);
        }
        for failure in &self.connection_errors {
            error!("  connection {}: {}", failure.connection, failure.error);
        }
        for target in &self.targets {
            let artifact = &target.artifact;
            match &artifact.outcome {
                Outcome::Done { attempts } => info!(
                    "  {}/{} taken {} -> s3://{}/{} ({} bytes, {} attempt(s))",
                    target.connection,
                    artifact.database,
                    artifact.taken_at.format("%Y-%m-%d %H:%M"),
                    artifact.bucket,
                    artifact.key,
                    artifact.size.unwrap_or(0),
                    attempts
                ),
                Outcome::Failed { stage, error } => error!(
                    "  {}/{} failed while {:?} ({}): {}",
                    target.connection,
                    artifact.database,
                    stage,
                    error.kind(),
                    error
                ),
            }
        }
        for scope in &self.skipped_scopes {
            warn!("  retention skipped for s3://{}/{}{}*", scope.bucket, scope.directory, scope.name_prefix);
        }
    }
}

/// Outcome of a dry run: the keys a backup run would write.
#[derive(Debug, Default)]
pub struct CheckReport {
    pub planned: Vec<Destination>,
    pub entry_errors: Vec<EntryError>,
    pub connection_errors: Vec<ConnectionFailure>,
    pub unresolved: Vec<(String, BackupError)>,
}

impl CheckReport {
    pub fn is_success(&self) -> bool {
        self.entry_errors.is_empty() && self.connection_errors.is_empty() && self.unresolved.is_empty()
    }
}

/// Drives a pass over every configured connection, one database at a time.
pub struct BackupEngine {
    config: GlobalConfig,
    catalog: Arc<dyn Catalog>,
    dumper: Arc<dyn Dumper>,
    stores: Arc<dyn StoreFactory>,
    clock: Clock,
}

impl BackupEngine {
    pub fn new(
        config: GlobalConfig,
        catalog: Arc<dyn Catalog>,
        dumper: Arc<dyn Dumper>,
        stores: Arc<dyn StoreFactory>,
    ) -> Self {
        BackupEngine {
            config,
            catalog,
            dumper,
            stores,
            clock: Box::new(local_minute),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub async fn run(&self) -> RunSummary {
        let parsed = parse_connections(&self.config.pg_urls, &self.config);
        let mut summary = RunSummary::default();
        for entry in parsed.errors {
            error!("Skipping connection entry #{}: {}", entry.index + 1, entry.error);
            summary.entry_errors.push(entry);
        }
        info!("Backing up {} connection(s)", parsed.specs.len());

        for spec in &parsed.specs {
            let span = info_span!("connection", name = %spec.label());
            self.run_connection(spec, &mut summary).instrument(span).await;
        }
        summary
    }

    async fn run_connection(&self, spec: &ConnectionSpec, summary: &mut RunSummary) {
        let label = spec.label().to_string();
        info!("Connecting to {}", spec.redacted_dsn());

        let store = match self.stores.connect(&spec.storage).await {
            Ok(store) => store,
            Err(error) => {
                error!("Storage for {} unavailable: {}", label, error);
                summary.connection_errors.push(ConnectionFailure { connection: label, error });
                return;
            }
        };
        let databases = match enumerate_databases(self.catalog.as_ref(), spec).await {
            Ok(databases) => databases,
            Err(error) => {
                error!("Could not enumerate databases of {}: {}", spec.redacted_dsn(), error);
                summary.connection_errors.push(ConnectionFailure { connection: label, error });
                return;
            }
        };

        // Fixed before any upload so a run crossing midnight never prunes
        // what it just wrote.
        let today = (self.clock)().date();
        let pipeline = Pipeline::new(&self.config, self.dumper.as_ref(), store.as_ref());
        // Scope -> every target written into it this run succeeded.
        let mut scopes: BTreeMap<RetentionScope, bool> = BTreeMap::new();
        for database in databases {
            let taken_at = (self.clock)();
            let artifact = match resolve_destination(&self.config, spec, &database, taken_at) {
                Ok(dest) => {
                    let span = info_span!("database", name = %database);
                    let artifact = pipeline.run(spec, &dest, &database, taken_at).instrument(span).await;
                    *scopes.entry(dest.scope()).or_insert(true) &= artifact.succeeded();
                    artifact
                }
                Err(error) => {
                    warn!("Skipping database {}: {}", database, error);
                    unresolved_target(database, taken_at, error)
                }
            };
            summary.targets.push(TargetReport { connection: label.clone(), artifact });
        }

        self.prune(store.as_ref(), spec, today, scopes, summary).await;

        if spec.force_terminate {
            terminate_sessions(self.catalog.as_ref(), spec).await;
        }
    }

    async fn prune(
        &self,
        store: &dyn ObjectStore,
        spec: &ConnectionSpec,
        today: NaiveDate,
        scopes: BTreeMap<RetentionScope, bool>,
        summary: &mut RunSummary,
    ) {
        for (scope, healthy) in scopes {
            if !healthy {
                warn!(
                    "Skipping retention for s3://{}/{}: a backup into it failed this run",
                    scope.bucket, scope.directory
                );
                summary.skipped_scopes.push(scope);
                continue;
            }
            match apply_retention(store, &scope, today, spec.retention_days).await {
                Ok(report) if !report.deleted.is_empty() => info!(
                    "Retention removed {} of {} backup(s) in s3://{}/{}",
                    report.deleted.len(),
                    report.examined,
                    scope.bucket,
                    scope.directory
                ),
                Ok(_) => {}
                Err(e) => {
                    error!("{}", e);
                    summary.retention_errors.push(e);
                }
            }
        }
    }

    /// Resolves every target without dumping, uploading or deleting anything.
    pub async fn plan(&self) -> CheckReport {
        let parsed = parse_connections(&self.config.pg_urls, &self.config);
        let mut report = CheckReport::default();
        for entry in parsed.errors {
            error!("Connection entry #{} is invalid: {}", entry.index + 1, entry.error);
            report.entry_errors.push(entry);
        }

        for spec in &parsed.specs {
            let span = info_span!("connection", name = %spec.label());
            self.plan_connection(spec, &mut report).instrument(span).await;
        }
        report
    }

    async fn plan_connection(&self, spec: &ConnectionSpec, report: &mut CheckReport) {
        info!(
            "{} -> storage endpoint {}, retention {}, force terminate {}",
            spec.redacted_dsn(),
            spec.storage.endpoint.as_deref().unwrap_or("(AWS default)"),
            spec.retention_days.map_or("off".to_string(), |d| format!("{} day(s)", d)),
            spec.force_terminate
        );
        let databases = match enumerate_databases(self.catalog.as_ref(), spec).await {
            Ok(databases) => databases,
            Err(error) => {
                error!("Could not enumerate databases of {}: {}", spec.redacted_dsn(), error);
                report.connection_errors.push(ConnectionFailure {
                    connection: spec.label().to_string(),
                    error,
                });
                return;
            }
        };
        for database in databases {
            match resolve_destination(&self.config, spec, &database, (self.clock)()) {
                Ok(dest) => {
                    info!("Would back up {} to s3://{}/{}", database, dest.bucket, dest.key);
                    report.planned.push(dest);
                }
                Err(error) => {
                    error!("Cannot back up {}: {}", database, error);
                    report.unresolved.push((database, error));
                }
            }
        }
    }
}

fn unresolved_target(database: String, taken_at: NaiveDateTime, error: BackupError) -> BackupArtifact {
    BackupArtifact {
        local_path: Default::default(),
        database,
        taken_at,
        size: None,
        bucket: String::new(),
        key: String::new(),
        outcome: Outcome::Failed { stage: Stage::Pending, error },
    }
}

/// Local wall-clock time truncated to the minute, the resolution of keys.
fn local_minute() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(now)
}
