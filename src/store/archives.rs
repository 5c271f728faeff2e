use crate::error::{Error, Result};
use async_compression::tokio::bufread::GzipDecoder;
use std::path::Path;
use tokio::fs::{create_dir_all, read_dir, remove_dir_all, rename, File};
use tokio::io::BufReader;
use tokio_tar::ArchiveBuilder;

/// Unpacks a GitHub archive tarball into `target_dir`.
///
/// The archive endpoint wraps the tree in a single `<repo>-<rev>/` top-level
/// directory; the tarball is unpacked into `staging` and that wrapper is
/// renamed to `target_dir`, so `staging` must live on the same filesystem.
pub async fn unpack_github_archive(
    target_dir: &Path,
    archive_path: &Path,
    staging: &Path,
) -> Result<()> {
    if staging.exists() {
        remove_dir_all(staging).await?;
    }
    create_dir_all(staging).await?;

    let tar_gz = File::open(archive_path).await?;
    let gz_decoder = GzipDecoder::new(BufReader::new(tar_gz));
    let archive_builder = ArchiveBuilder::new(gz_decoder)
        .set_preserve_permissions(true)
        .set_ignore_zeros(true);
    let mut archive = archive_builder.build();

    archive.unpack(staging).await?;

    let mut entries = read_dir(staging).await?;
    let mut top_level = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        top_level.push(entry.path());
    }

    let [wrapper] = top_level.as_slice() else {
        remove_dir_all(staging).await?;
        return Err(Error::Acquisition(format!(
            "archive {} does not wrap a single top-level directory",
            archive_path.display()
        )));
    };

    if !wrapper.is_dir() {
        remove_dir_all(staging).await?;
        return Err(Error::Acquisition(format!(
            "archive {} unpacked to a file, expected a directory",
            archive_path.display()
        )));
    }

    rename(wrapper, target_dir).await?;
    remove_dir_all(staging).await?;

    Ok(())
}
