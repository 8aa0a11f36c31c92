use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use relay_job::AppRecord;

/// `<root>/decrypted/<filename>` holds finished artifacts,
/// `<root>/encrypted/<bundleId>*` holds whatever the tool left mid-flight.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn decrypted_dir(&self) -> PathBuf {
        self.root.join("decrypted")
    }

    pub fn encrypted_dir(&self) -> PathBuf {
        self.root.join("encrypted")
    }

    /// Only the final path component of `filename` is honoured.
    pub fn decrypted_path(&self, filename: &str) -> Option<PathBuf> {
        let name = Path::new(filename).file_name()?;
        Some(self.decrypted_dir().join(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupTarget {
    pub filename: String,
    pub bundle_id: String,
}

impl From<&AppRecord> for CleanupTarget {
    fn from(r: &AppRecord) -> Self {
        Self {
            filename: r.filename.clone(),
            bundle_id: r.bundle_id.clone(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
}

impl CleanupReport {
    fn merge(self, other: Self) -> Self {
        Self {
            removed: self.removed + other.removed,
            failed: self.failed + other.failed,
        }
    }
}

async fn remove_quiet(path: &Path) -> CleanupReport {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed artifact");
            CleanupReport {
                removed: 1,
                failed: 0,
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => CleanupReport::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove artifact");
            CleanupReport {
                removed: 0,
                failed: 1,
            }
        }
    }
}

/// Removes regular files in `dir` whose name starts with `prefix`.
/// An empty prefix matches everything.
async fn remove_with_prefix(dir: &Path, prefix: &str) -> CleanupReport {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(v) => v,
        Err(e) if e.kind() == ErrorKind::NotFound => return CleanupReport::default(),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to list artifact dir");
            return CleanupReport {
                removed: 0,
                failed: 1,
            };
        }
    };

    let mut report = CleanupReport::default();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(e)) => e,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to read artifact dir entry");
                report.failed += 1;
                break;
            }
        };
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        match entry.file_type().await {
            Ok(t) if t.is_file() || t.is_symlink() => {}
            _ => continue,
        }
        report = report.merge(remove_quiet(&entry.path()).await);
    }
    report
}

/// Best-effort; never fails. Missing files are fine.
pub async fn remove_job_artifacts(layout: &ArtifactLayout, target: &CleanupTarget) -> CleanupReport {
    let mut report = CleanupReport::default();

    if let Some(path) = layout.decrypted_path(target.filename.trim()) {
        report = report.merge(remove_quiet(&path).await);
    }

    // An empty bundle id would turn the glob into "everything".
    let bundle_id = target.bundle_id.trim();
    if !bundle_id.is_empty() {
        report = report.merge(remove_with_prefix(&layout.encrypted_dir(), bundle_id).await);
    }

    tracing::info!(
        filename = %target.filename,
        bundle_id = %target.bundle_id,
        removed = report.removed,
        failed = report.failed,
        "artifact cleanup done"
    );
    report
}

pub async fn clear_dir(dir: &Path) -> CleanupReport {
    remove_with_prefix(dir, "").await
}
