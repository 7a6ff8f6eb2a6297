//! Deletion of old versioned artifacts from a local directory.

use std::{io::ErrorKind, path::Path};

use super::ArtifactName;

/// The outcome of a cleanup pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// The versions which were deleted.
    pub deleted: Vec<u64>,
    /// The number of deletions which failed.
    pub failed: usize,
}

/// Whether an artifact of version `version` is old enough to be deleted.
///
/// Versions `<= current - keep` are expired. At least the current version is always kept.
pub fn is_expired(version: u64, current: u64, keep: u64) -> bool {
    version.saturating_add(keep.max(1)) <= current
}

/// Deletes the `{version}.{extension}` artifacts of `dir` which are expired for `current`.
///
/// Files that do not follow the naming scheme are left alone. Failures are logged and counted, but
/// never abort the pass.
pub async fn clean_dir(dir: &Path, extension: &str, current: u64, keep: u64) -> CleanupReport {
    let mut report = CleanupReport::default();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return report,
        Err(err) => {
            warn!("failed to read {} for cleanup: {}", dir.display(), err);
            report.failed += 1;
            return report;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!("failed to read {} for cleanup: {}", dir.display(), err);
                report.failed += 1;
                break;
            }
        };

        let name = match entry
            .file_name()
            .to_str()
            .and_then(|name| ArtifactName::parse(name, extension))
        {
            Some(name) => name,
            None => continue,
        };
        if !is_expired(name.version, current, keep) {
            continue;
        }

        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                debug!("deleted {}", entry.path().display());
                report.deleted.push(name.version);
            }
            Err(err) => {
                warn!("failed to delete {}: {}", entry.path().display(), err);
                report.failed += 1;
            }
        }
    }

    report.deleted.sort_unstable();
    if !report.deleted.is_empty() {
        info!(
            "deleted {} artifacts older than version {} from {}",
            report.deleted.len(),
            current.saturating_sub(keep.max(1)) + 1,
            dir.display()
        );
    }
    report
}
