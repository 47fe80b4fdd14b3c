//! Release archive extraction

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::DeploydError;

/// Extract a gzipped tarball into `dest`, dropping its single top-level
/// directory.
///
/// Runs on the blocking pool. Metadata headers are skipped. Entries that
/// escape `dest`, links, and device files are rejected. `dest` may be left
/// partially written on error.
pub async fn extract_release(
    archive: &Path,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<usize, DeploydError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    let cancel = cancel.clone();

    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest, &cancel))
        .await
        .map_err(|e| DeploydError::Internal(format!("extraction task failed: {}", e)))?
}

fn extract_blocking(
    archive: &Path,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<usize, DeploydError> {
    let file = std::fs::File::open(archive)?;
    let mut tarball = Archive::new(GzDecoder::new(file));
    std::fs::create_dir_all(dest)?;

    let mut top: Option<OsString> = None;
    let mut extracted = 0;

    for entry in tarball.entries()? {
        if cancel.is_cancelled() {
            return Err(DeploydError::Cancelled("extraction interrupted".to_string()));
        }

        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        if is_metadata(entry_type) {
            debug!("Skipping {:?} archive entry", entry_type);
            continue;
        }

        let path = entry.path()?.into_owned();
        let parts = normal_components(&path)?;
        let Some((first, rest)) = parts.split_first() else {
            continue;
        };

        match &top {
            None => top = Some(first.clone()),
            Some(existing) if existing != first => {
                return Err(DeploydError::ArchiveError(format!(
                    "archive has more than one top-level entry: {:?} and {:?}",
                    existing, first
                )));
            }
            Some(_) => {}
        }

        let relative: PathBuf = rest.iter().collect();
        let target = dest.join(&relative);

        match entry_type {
            EntryType::Directory => {
                std::fs::create_dir_all(&target)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if relative.as_os_str().is_empty() {
                    return Err(DeploydError::ArchiveError(format!(
                        "archive top-level entry {} is not a directory",
                        path.display()
                    )));
                }
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry.unpack(&target)?;
                extracted += 1;
            }
            EntryType::Symlink | EntryType::Link => {
                return Err(DeploydError::ArchiveError(format!(
                    "links are not allowed in release archives: {}",
                    path.display()
                )));
            }
            other => {
                return Err(DeploydError::ArchiveError(format!(
                    "unsupported entry type {:?}: {}",
                    other,
                    path.display()
                )));
            }
        }
    }

    if top.is_none() {
        return Err(DeploydError::ArchiveError("archive is empty".to_string()));
    }

    debug!("Extracted {} file(s) into {}", extracted, dest.display());
    Ok(extracted)
}

/// Headers that describe other entries (`git archive` writes a PAX global
/// header first) rather than carrying files
fn is_metadata(entry_type: EntryType) -> bool {
    matches!(
        entry_type,
        EntryType::XGlobalHeader
            | EntryType::XHeader
            | EntryType::GNULongName
            | EntryType::GNULongLink
    )
}

fn normal_components(path: &Path) -> Result<Vec<OsString>, DeploydError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_os_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(DeploydError::ArchiveError(format!(
                    "path traversal in archive entry: {}",
                    path.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(DeploydError::ArchiveError(format!(
                    "absolute path in archive entry: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(parts)
}
