use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use directories::BaseDirs;
use tempfile::{Builder, NamedTempFile, TempDir};

use crate::error::HarvestError;

pub const DATE_PLACEHOLDER: &str = "{date}";
const OUTPUT_DIR: &str = "output";

#[derive(Debug, Clone)]
pub struct WorkDir {
    root: Utf8PathBuf,
}

impl WorkDir {
    pub fn default_root() -> Result<Utf8PathBuf, HarvestError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.home_dir().join(".cache").join("kira-dwca-harvester"),
                )
                .ok()
            })
            .ok_or_else(|| {
                HarvestError::Filesystem("unable to resolve working directory".to_string())
            })
    }

    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn output_dir(&self) -> Utf8PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    pub fn resolve(&self, path: &str) -> Utf8PathBuf {
        let candidate = Utf8Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }

    pub fn archive_path(&self, template: &str, date: NaiveDate) -> Utf8PathBuf {
        self.output_dir().join(archive_name(template, date))
    }

    pub fn ensure_root(&self) -> Result<(), HarvestError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }

    pub fn scratch_dir(&self, prefix: &str) -> Result<TempDir, HarvestError> {
        self.ensure_root()?;
        Builder::new()
            .prefix(prefix)
            .tempdir_in(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }
}

pub fn archive_name(template: &str, date: NaiveDate) -> String {
    template.replace(DATE_PLACEHOLDER, &date.format("%Y%m%d").to_string())
}

pub fn temp_file_beside(dest: &Utf8Path) -> Result<NamedTempFile, HarvestError> {
    let parent = dest
        .parent()
        .ok_or_else(|| HarvestError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Builder::new()
        .prefix(".kira-dwca-file")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))
}

/// Renames a finished temp file over `dest`. The previous file stays in
/// place until the rename succeeds.
pub fn persist_over(temp: NamedTempFile, dest: &Utf8Path) -> Result<(), HarvestError> {
    temp.persist(dest.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let workdir = WorkDir::new(Utf8PathBuf::from("/data/embl"));
        let date = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        assert_eq!(
            workdir.archive_path("sequences_{date}.zip", date),
            Utf8PathBuf::from("/data/embl/output/sequences_20260307.zip")
        );
        assert_eq!(
            workdir.resolve("raw/seq.tsv"),
            Utf8PathBuf::from("/data/embl/raw/seq.tsv")
        );
        assert_eq!(
            workdir.resolve("/tmp/seq.tsv"),
            Utf8PathBuf::from("/tmp/seq.tsv")
        );
    }

    #[test]
    fn scratch_dirs_are_unique_and_cleaned() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let workdir = WorkDir::new(root);
        let first = workdir.scratch_dir("temp_").unwrap();
        let second = workdir.scratch_dir("temp_").unwrap();
        assert_ne!(first.path(), second.path());
        let kept = first.path().to_path_buf();
        drop(first);
        assert!(!kept.exists());
    }

    #[test]
    fn persist_over_replaces_existing_file() {
        let temp = tempfile::tempdir().unwrap();
        let dest = Utf8PathBuf::from_path_buf(temp.path().join("out").join("a.zip")).unwrap();
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, "old").unwrap();

        let file = temp_file_beside(&dest).unwrap();
        fs::write(file.path(), "new").unwrap();
        persist_over(file, &dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "new");
    }

    #[test]
    fn failed_persist_leaves_destination_untouched() {
        let temp = tempfile::tempdir().unwrap();
        let dest = Utf8PathBuf::from_path_buf(temp.path().join("a.zip")).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("kept.txt"), "old").unwrap();

        let file = temp_file_beside(&dest).unwrap();
        let temp_path = file.path().to_path_buf();
        assert!(persist_over(file, &dest).is_err());
        assert_eq!(fs::read_to_string(dest.join("kept.txt")).unwrap(), "old");
        assert!(!temp_path.exists());
    }
}
