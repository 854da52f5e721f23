use std::fs;
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::error::HarvestError;

/// Zips every file below `dir` into `writer`, entries named relative to
/// `dir` and written in sorted order with a fixed timestamp, so identical
/// inputs give identical entries.
pub fn zip_dir<W: Write + Seek>(dir: &Path, writer: W) -> Result<W, HarvestError> {
    let mut files = walk_dir(dir)?
        .into_iter()
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();
    files.sort();

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    let mut zip = ZipWriter::new(writer);
    for path in files {
        let relative = path
            .strip_prefix(dir)
            .map_err(|err| HarvestError::Archive(err.to_string()))?;
        let name = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        debug!(entry = %name, "adding archive entry");
        zip.start_file(name, options)
            .map_err(|err| HarvestError::Archive(err.to_string()))?;
        let mut file = fs::File::open(&path)
            .map_err(|err| HarvestError::Filesystem(format!("open {}: {err}", path.display())))?;
        io::copy(&mut file, &mut zip).map_err(|err| HarvestError::Archive(err.to_string()))?;
    }
    zip.finish()
        .map_err(|err| HarvestError::Archive(err.to_string()))
}

/// Reads every entry to the end, failing on a corrupt archive.
pub fn validate_zip(zip_path: &Path) -> Result<Vec<String>, HarvestError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| HarvestError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| HarvestError::Archive(err.to_string()))?;

    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| HarvestError::Archive(err.to_string()))?;
        if entry.enclosed_name().is_none() {
            return Err(HarvestError::Archive(
                "zip entry path traversal detected".to_string(),
            ));
        }
        names.push(entry.name().to_string());
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| HarvestError::Archive(err.to_string()))?;
    }
    Ok(names)
}

/// Deletes each file that exists; missing files are not an error.
pub fn remove_files(paths: &[PathBuf]) -> Result<(), HarvestError> {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "raw data file deleted"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(HarvestError::Filesystem(format!(
                    "remove {}: {err}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, HarvestError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
