pub(crate) mod archive;
pub(crate) mod db_dump;
pub(crate) mod destination;
mod logic;
pub(crate) mod pipeline;
pub(crate) mod retention;
pub(crate) mod s3_upload;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use anyhow::Result;

use crate::config::GlobalConfig;
use crate::utils::catalog::PgCatalog;

pub use logic::{BackupEngine, CheckReport, RunSummary};

/// Wires the production collaborators around the configuration.
pub fn build_engine(config: GlobalConfig) -> Result<BackupEngine> {
    let dumper = db_dump::PgDump::locate(config.dump_timeout)?;
    let catalog = PgCatalog::new(config.connect_timeout);
    Ok(BackupEngine::new(
        config,
        Arc::new(catalog),
        Arc::new(dumper),
        Arc::new(s3_upload::S3StoreFactory),
    ))
}

/// Public entry point for one backup pass.
pub async fn run_backup_flow(config: GlobalConfig) -> Result<RunSummary> {
    let engine = build_engine(config)?;
    let summary = engine.run().await;
    summary.log_report();
    Ok(summary)
}

/// Dry run: resolves every target and reports what a backup would write.
pub async fn run_check_flow(config: GlobalConfig) -> Result<CheckReport> {
    let engine = build_engine(config)?;
    let report = engine.plan().await;
    tracing::info!(
        "Check finished: {} target(s) planned, {} entry error(s), {} connection error(s), {} unresolved target(s)",
        report.planned.len(),
        report.entry_errors.len(),
        report.connection_errors.len(),
        report.unresolved.len()
    );
    Ok(report)
}
