// pgvault/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::path::Path;
use tar::Builder;
use tracing::debug;
use zip::write::{FileOptions, SimpleFileOptions};
use zip::{AesMode, CompressionMethod, ZipWriter};

use crate::config::ArchiveFormat;

/// Packs a single dump file into a GZipped TAR archive.
///
/// The archive holds one entry named `entry_name`. Returns the size of the
/// archive in bytes.
pub fn create_tar_gz_archive(source: &Path, entry_name: &str, archive_dest_path: &Path) -> Result<u64> {
    if !source.is_file() {
        anyhow::bail!("Source for archival is not a file: {}", source.display());
    }
    debug!(
        "Creating tar.gz archive from {} to {}",
        source.display(),
        archive_dest_path.display()
    );

    let archive_file = File::create(archive_dest_path)
        .with_context(|| format!("Failed to create archive file: {}", archive_dest_path.display()))?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);

    tar_builder
        .append_path_with_name(source, entry_name)
        .with_context(|| format!("Failed to append file {} as {} to archive", source.display(), entry_name))?;

    let encoder = tar_builder.into_inner().with_context(|| {
        format!(
            "Failed to get inner encoder from tar builder for archive: {}",
            archive_dest_path.display()
        )
    })?;
    encoder
        .finish()
        .with_context(|| format!("Failed to finish Gzip encoding for archive: {}", archive_dest_path.display()))?;

    archive_size(archive_dest_path)
}

/// Packs a single dump file into a deflated zip archive, AES-256 encrypted
/// when a passphrase is given.
pub fn create_zip_archive(
    source: &Path,
    entry_name: &str,
    archive_dest_path: &Path,
    passphrase: Option<&str>,
) -> Result<u64> {
    if !source.is_file() {
        anyhow::bail!("Source for archival is not a file: {}", source.display());
    }
    debug!(
        "Creating zip archive from {} to {} (encrypted: {})",
        source.display(),
        archive_dest_path.display(),
        passphrase.is_some()
    );

    let archive_file = File::create(archive_dest_path)
        .with_context(|| format!("Failed to create archive file: {}", archive_dest_path.display()))?;
    let mut writer = ZipWriter::new(archive_file);

    let base = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);
    let options: FileOptions<'_, ()> = match passphrase {
        Some(p) => base.with_aes_encryption(AesMode::Aes256, p),
        None => base,
    };

    writer
        .start_file(entry_name, options)
        .with_context(|| format!("Failed to start zip entry {}", entry_name))?;
    let mut input = File::open(source).with_context(|| format!("Failed to open dump file: {}", source.display()))?;
    std::io::copy(&mut input, &mut writer)
        .with_context(|| format!("Failed to write {} into zip archive", source.display()))?;
    writer
        .finish()
        .with_context(|| format!("Failed to finish zip archive: {}", archive_dest_path.display()))?;

    archive_size(archive_dest_path)
}

/// Compresses a dump according to the configured format. `Dump` needs no
/// work and is rejected here.
pub fn compress_dump(
    format: ArchiveFormat,
    dump_path: &Path,
    entry_name: &str,
    archive_dest_path: &Path,
    passphrase: Option<&str>,
) -> Result<u64> {
    match format {
        ArchiveFormat::Zip => create_zip_archive(dump_path, entry_name, archive_dest_path, passphrase),
        ArchiveFormat::TarGz => create_tar_gz_archive(dump_path, entry_name, archive_dest_path),
        ArchiveFormat::Dump => anyhow::bail!("raw dump format is uploaded without compression"),
    }
}

fn archive_size(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)
        .with_context(|| format!("Failed to read archive metadata: {}", path.display()))?
        .len())
}
