// pgvault/src/backup/pipeline.rs
//! Dump → compress → upload for one database, as an explicit state machine.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::backup::archive::compress_dump;
use crate::backup::db_dump::Dumper;
use crate::backup::destination::Destination;
use crate::backup::s3_upload::{ObjectStore, RetryPolicy, upload_with_retry};
use crate::config::{ArchiveFormat, ConnectionSpec, GlobalConfig};
use crate::errors::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    Dumping,
    Compressing,
    Uploading,
    Done,
    Failed,
}

#[derive(Debug)]
pub enum Outcome {
    Done { attempts: u32 },
    /// `stage` is where the target was when it failed.
    Failed { stage: Stage, error: BackupError },
}

/// Result of one target, kept for the run summary.
#[derive(Debug)]
pub struct BackupArtifact {
    /// Where the artifact lived while it was built; gone once the target ends.
    pub local_path: PathBuf,
    pub database: String,
    pub taken_at: NaiveDateTime,
    pub size: Option<u64>,
    pub bucket: String,
    pub key: String,
    pub outcome: Outcome,
}

impl BackupArtifact {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Outcome::Done { .. })
    }
}

enum State {
    Pending,
    Dumping,
    Compressing,
    Uploading { artifact: PathBuf },
    Done { attempts: u32 },
    Failed { stage: Stage, error: BackupError },
}

impl State {
    fn stage(&self) -> Stage {
        match self {
            State::Pending => Stage::Pending,
            State::Dumping => Stage::Dumping,
            State::Compressing => Stage::Compressing,
            State::Uploading { .. } => Stage::Uploading,
            State::Done { .. } => Stage::Done,
            State::Failed { .. } => Stage::Failed,
        }
    }
}

/// Everything a target needs besides its own destination.
pub struct Pipeline<'a> {
    pub dumper: &'a dyn Dumper,
    pub store: &'a dyn ObjectStore,
    pub format: ArchiveFormat,
    pub passphrase: Option<&'a str>,
    pub temp_root: Option<&'a Path>,
    pub retry: &'a RetryPolicy,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a GlobalConfig, dumper: &'a dyn Dumper, store: &'a dyn ObjectStore) -> Self {
        Pipeline {
            dumper,
            store,
            format: config.archive_format,
            passphrase: config.archive_password.as_deref(),
            temp_root: config.temp_dir.as_deref(),
            retry: &config.upload_retry,
        }
    }

    /// Runs one database to a terminal state. The target's scratch directory
    /// is removed when this returns or when the future is dropped.
    pub async fn run(
        &self,
        spec: &ConnectionSpec,
        dest: &Destination,
        database: &str,
        taken_at: NaiveDateTime,
    ) -> BackupArtifact {
        let stem = dest
            .file_name
            .strip_suffix(self.format.extension())
            .and_then(|s| s.strip_suffix('.'))
            .unwrap_or(dest.file_name.as_str());
        let mut artifact = BackupArtifact {
            local_path: PathBuf::new(),
            database: database.to_string(),
            taken_at,
            size: None,
            bucket: dest.bucket.clone(),
            key: dest.key.clone(),
            outcome: Outcome::Done { attempts: 0 },
        };

        let workdir = match self.scratch_dir(database) {
            Ok(dir) => dir,
            Err(error) => {
                artifact.outcome = Outcome::Failed { stage: Stage::Pending, error };
                return artifact;
            }
        };
        let dump_path = workdir.path().join(format!("{}.dump", stem));
        let archive_path = workdir.path().join(&dest.file_name);

        let mut state = State::Pending;
        loop {
            let from = state.stage();
            state = match state {
                State::Pending => State::Dumping,
                State::Dumping => {
                    let dsn = spec.dsn_for_database(database);
                    match self.dumper.dump(&dsn, database, &dump_path).await {
                        Ok(()) if self.format.is_archive() => State::Compressing,
                        Ok(()) => {
                            artifact.size = file_size(&dump_path).await;
                            State::Uploading { artifact: dump_path.clone() }
                        }
                        Err(error) => State::Failed { stage: Stage::Dumping, error },
                    }
                }
                State::Compressing => {
                    let result = self.compress(&dump_path, &archive_path, stem).await;
                    remove_local(&dump_path).await;
                    match result {
                        Ok(size) => {
                            artifact.size = Some(size);
                            State::Uploading { artifact: archive_path.clone() }
                        }
                        Err(error) => State::Failed { stage: Stage::Compressing, error },
                    }
                }
                State::Uploading { artifact: path } => {
                    artifact.local_path = path.clone();
                    let result = upload_with_retry(self.store, &dest.bucket, &dest.key, &path, self.retry).await;
                    remove_local(&path).await;
                    match result {
                        Ok(attempts) => State::Done { attempts },
                        Err(error) => State::Failed { stage: Stage::Uploading, error },
                    }
                }
                State::Done { attempts } => {
                    info!(
                        "Backup of {} uploaded to s3://{}/{} ({} bytes, {} attempt(s))",
                        database,
                        dest.bucket,
                        dest.key,
                        artifact.size.unwrap_or(0),
                        attempts
                    );
                    artifact.outcome = Outcome::Done { attempts };
                    break;
                }
                State::Failed { stage, error } => {
                    warn!("Backup of {} failed while {:?}: {}", database, stage, error);
                    artifact.outcome = Outcome::Failed { stage, error };
                    break;
                }
            };
            debug!("{}: {:?} -> {:?}", database, from, state.stage());
        }
        if artifact.local_path.as_os_str().is_empty() {
            artifact.local_path = if self.format.is_archive() { archive_path } else { dump_path };
        }
        artifact
    }

    fn scratch_dir(&self, database: &str) -> Result<TempDir> {
        let prefix = format!("pgvault-{}-", database);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match self.temp_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    async fn compress(&self, dump_path: &Path, archive_path: &Path, stem: &str) -> Result<u64> {
        let format = self.format;
        let source = dump_path.to_path_buf();
        let dest = archive_path.to_path_buf();
        let entry_name = format!("{}.dump", stem);
        let passphrase = self.passphrase.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            compress_dump(format, &source, &entry_name, &dest, passphrase.as_deref())
        })
        .await
        .map_err(|e| BackupError::Compression(format!("compression task failed: {}", e)))?
        .map_err(|e| BackupError::Compression(format!("{:#}", e)))
    }
}

async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

async fn remove_local(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed local file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove local file {}: {}", path.display(), e),
    }
}
