//! On-disk layout for clips and snapshots.
//!
//! ```text
//! <root>/videos/<camera>/<YYYYmmdd_HHMMSS>.<ext>      raw segments
//! <root>/annotated/<camera>/<same file name>          file-review output
//! <root>/snapshots/<camera>/<YYYYmmdd_HHMMSS>.<ext>   alarm snapshots
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

use crate::camera::CameraId;

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Clone, Debug)]
pub struct MediaLayout {
    root: PathBuf,
}

impl MediaLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self, camera: CameraId) -> PathBuf {
        self.root.join("videos").join(camera.to_string())
    }

    pub fn annotated_dir(&self, camera: CameraId) -> PathBuf {
        self.root.join("annotated").join(camera.to_string())
    }

    pub fn snapshot_dir(&self, camera: CameraId) -> PathBuf {
        self.root.join("snapshots").join(camera.to_string())
    }

    /// Fresh path for a raw segment starting at `at`.
    pub fn new_clip_path(&self, camera: CameraId, at: DateTime<Local>, ext: &str) -> Result<PathBuf> {
        unique_stamped_path(&self.raw_dir(camera), at, ext)
    }

    /// Annotated counterpart of a raw segment: same file name, mirrored tree.
    pub fn annotated_path_for(&self, camera: CameraId, raw: &Path) -> Result<PathBuf> {
        let name = raw
            .file_name()
            .with_context(|| format!("clip path {} has no file name", raw.display()))?;
        let dir = self.annotated_dir(camera);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(dir.join(name))
    }

    pub fn new_snapshot_path(
        &self,
        camera: CameraId,
        at: DateTime<Local>,
        ext: &str,
    ) -> Result<PathBuf> {
        unique_stamped_path(&self.snapshot_dir(camera), at, ext)
    }
}

/// Second-granularity names; a numeric suffix separates collisions.
fn unique_stamped_path(dir: &Path, at: DateTime<Local>, ext: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let stem = at.format(STAMP_FORMAT).to_string();
    let mut candidate = dir.join(format!("{stem}.{ext}"));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_{n}.{ext}"));
        n += 1;
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn names_are_timestamped_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let layout = MediaLayout::new(dir.path());
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();

        let first = layout.new_clip_path(CameraId(2), at, "rwc").unwrap();
        assert!(first.ends_with("videos/2/20240309_070501.rwc"));
        fs::write(&first, b"x").unwrap();

        let second = layout.new_clip_path(CameraId(2), at, "rwc").unwrap();
        assert!(second.ends_with("videos/2/20240309_070501_1.rwc"));
    }

    #[test]
    fn annotated_tree_mirrors_raw_names() {
        let dir = tempfile::tempdir().unwrap();
        let layout = MediaLayout::new(dir.path());
        let raw = layout.raw_dir(CameraId(3)).join("20240101_000000.rwc");
        let annotated = layout.annotated_path_for(CameraId(3), &raw).unwrap();
        assert_eq!(
            annotated,
            dir.path().join("annotated/3/20240101_000000.rwc")
        );
        assert!(annotated.parent().unwrap().is_dir());
    }
}
