//! Filesystem operations module.
//!
//! This module provides the read-only filesystem queries the engine needs:
//! - Enumerating the regular files of a directory tree
//! - Pre-flight probes: writability and free space of a destination

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// A regular file found under a source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the enumerated root
    pub relative_path: PathBuf,
    /// Full path
    pub absolute_path: PathBuf,
    /// File size in bytes at enumeration time
    pub size: u64,
}

/// Enumerate every regular file under `root`, recursively.
///
/// Symlinks and special files are skipped, as the copy tool skips them by
/// default. The result is sorted by relative path so that two enumerations of
/// an unchanged tree are identical.
///
/// # Errors
/// Returns `EnumerationFailed` if any directory in the tree cannot be read;
/// a partial listing would silently shrink the set of verified files.
pub fn enumerate_files(root: &Path) -> Result<Vec<SourceFile>, EngineError> {
    fn recurse(dir: &Path, rel_path: &Path, files: &mut Vec<SourceFile>) -> Result<(), EngineError> {
        let enumeration_error = |source| EngineError::EnumerationFailed {
            path: dir.to_path_buf(),
            source,
        };

        for entry in fs::read_dir(dir).map_err(enumeration_error)? {
            let entry = entry.map_err(enumeration_error)?;
            let file_type = entry.file_type().map_err(enumeration_error)?;
            let entry_path = entry.path();
            let rel_full_path = rel_path.join(entry.file_name());

            if file_type.is_dir() {
                recurse(&entry_path, &rel_full_path, files)?;
            } else if file_type.is_file() {
                let metadata = entry.metadata().map_err(enumeration_error)?;
                files.push(SourceFile {
                    relative_path: rel_full_path,
                    absolute_path: entry_path,
                    size: metadata.len(),
                });
            } else {
                log::debug!("Skipping non-regular entry {}", entry_path.display());
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    recurse(root, Path::new(""), &mut files)?;
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// Sum of the sizes of `files`.
pub fn total_size(files: &[SourceFile]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// Check that a file can be created in `dir` by creating and removing a probe.
pub fn probe_writable(dir: &Path) -> Result<(), EngineError> {
    tempfile::Builder::new()
        .prefix(".offload-probe-")
        .tempfile_in(dir)
        .map(drop)
        .map_err(|source| EngineError::DestinationNotWritable {
            path: dir.to_path_buf(),
            source,
        })
}

/// Free space available to this user on the filesystem holding `dir`.
///
/// `None` when the platform cannot tell.
pub fn available_space(dir: &Path) -> Option<u64> {
    match fs2::available_space(dir) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::debug!("Free space unknown for {}: {}", dir.display(), e);
            None
        }
    }
}

/// True if `required` bytes fit into the usable share of `available`.
pub fn fits_in(required: u64, available: u64, usable_fraction: f64) -> bool {
    required as f64 <= available as f64 * usable_fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_enumerate_flat_directory() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();

        let mut file1 = fs::File::create(src.join("file1.txt")).expect("Failed to create file1");
        file1.write_all(b"test data 1").expect("Failed to write file1");
        drop(file1);
        fs::write(src.join("file2.txt"), b"test data 2").expect("Failed to write file2");

        let files = enumerate_files(src).expect("Failed to enumerate");

        assert_eq!(files.len(), 2, "Expected 2 files, got {}", files.len());
        assert_eq!(total_size(&files), 22);
    }

    #[test]
    fn test_enumerate_nested_directory_is_sorted_and_relative() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();
        fs::create_dir_all(src.join("CLIPS/A001")).expect("Failed to create subdirs");
        fs::create_dir(src.join("EMPTY")).expect("Failed to create empty dir");
        fs::write(src.join("z_last.xml"), b"z").expect("Failed to write");
        fs::write(src.join("CLIPS/A001/C001.mov"), b"frames").expect("Failed to write");
        fs::write(src.join("CLIPS/index.bin"), b"idx").expect("Failed to write");

        let files = enumerate_files(src).expect("Failed to enumerate");
        let rel: Vec<PathBuf> = files.iter().map(|f| f.relative_path.clone()).collect();

        assert_eq!(
            rel,
            vec![
                PathBuf::from("CLIPS/A001/C001.mov"),
                PathBuf::from("CLIPS/index.bin"),
                PathBuf::from("z_last.xml"),
            ]
        );
        assert_eq!(files[0].absolute_path, src.join("CLIPS/A001/C001.mov"));
        assert_eq!(files[0].size, 6);
    }

    #[cfg(unix)]
    #[test]
    fn test_enumerate_skips_symlinks() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();
        fs::write(src.join("real.mov"), b"frames").expect("Failed to write");
        std::os::unix::fs::symlink(src.join("real.mov"), src.join("link.mov"))
            .expect("Failed to symlink");

        let files = enumerate_files(src).expect("Failed to enumerate");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, PathBuf::from("real.mov"));
    }

    #[test]
    fn test_enumerate_nonexistent_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = enumerate_files(&temp_dir.path().join("nonexistent"));
        assert!(matches!(result, Err(EngineError::EnumerationFailed { .. })));
    }

    #[test]
    fn test_probe_writable_leaves_nothing_behind() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        probe_writable(temp_dir.path()).expect("Temp dir should be writable");
        let leftovers = fs::read_dir(temp_dir.path()).expect("Failed to list").count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_probe_writable_fails_for_missing_dir() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = probe_writable(&temp_dir.path().join("missing"));
        assert!(matches!(result, Err(EngineError::DestinationNotWritable { .. })));
    }

    #[test]
    fn test_available_space_is_reported_for_temp_dir() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        assert!(available_space(temp_dir.path()).is_some());
    }

    #[test]
    fn test_fits_in_applies_margin() {
        assert!(fits_in(95, 100, 0.95));
        assert!(!fits_in(96, 100, 0.95));
        assert!(fits_in(0, 0, 0.95));
    }
}
