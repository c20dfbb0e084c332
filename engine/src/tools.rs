//! Command lines for the external tools.
//!
//! The copy tool is driven with rclone's argument contract and the manifest
//! tool with ascmhl's. Both are plain argument vectors; nothing goes through
//! a shell.

use std::ffi::OsString;
use std::fmt;
use std::path::Path;

use crate::model::TransferRequest;

/// Copy-tool arguments for copying `request.source` into `destination`.
pub fn copy_args(request: &TransferRequest, destination: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::with_capacity(12);
    args.push("copy".into());
    args.push(request.source.clone().into_os_string());
    args.push(destination.as_os_str().to_owned());
    args.push("--checksum".into());
    args.push("--transfers".into());
    args.push(request.parallelism.to_string().into());
    args.push("--buffer-size".into());
    args.push(format_size_suffix(request.buffer_size).into());
    args.push("--progress".into());
    args.push("--stats".into());
    args.push("1s".into());
    args.push("-v".into());
    args
}

/// Render a byte count with the largest exact binary suffix rclone accepts.
pub fn format_size_suffix(bytes: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1 << 30, "G"), (1 << 20, "M"), (1 << 10, "K")];
    UNITS
        .iter()
        .find(|(unit, _)| bytes != 0 && bytes % unit == 0)
        .map(|(unit, suffix)| format!("{}{}", bytes / unit, suffix))
        .unwrap_or_else(|| format!("{}B", bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestMode {
    Create,
    Verify,
}

impl fmt::Display for ManifestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestMode::Create => write!(f, "create"),
            ManifestMode::Verify => write!(f, "verify"),
        }
    }
}

pub fn manifest_args(mode: ManifestMode, root: &Path) -> Vec<OsString> {
    vec![mode.to_string().into(), root.as_os_str().to_owned()]
}

/// Join arguments for logging. Not shell-safe.
pub fn display_command(program: &Path, args: &[OsString]) -> String {
    std::iter::once(program.as_os_str())
        .chain(args.iter().map(OsString::as_os_str))
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_copy_args_follow_rclone_contract() {
        let request = TransferRequest::new("/Volumes/A001", vec![PathBuf::from("/Volumes/RAID")])
            .with_parallelism(8)
            .with_buffer_size(32 * 1024 * 1024);
        let args = copy_args(&request, Path::new("/Volumes/RAID"));
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "copy",
                "/Volumes/A001",
                "/Volumes/RAID",
                "--checksum",
                "--transfers",
                "8",
                "--buffer-size",
                "32M",
                "--progress",
                "--stats",
                "1s",
                "-v",
            ]
        );
    }

    #[test]
    fn test_size_suffix() {
        assert_eq!(format_size_suffix(16 * 1024 * 1024), "16M");
        assert_eq!(format_size_suffix(2 * 1024 * 1024 * 1024), "2G");
        assert_eq!(format_size_suffix(1536), "1536B");
        assert_eq!(format_size_suffix(512 * 1024), "512K");
        assert_eq!(format_size_suffix(1000), "1000B");
        assert_eq!(format_size_suffix(0), "0B");
    }

    #[test]
    fn test_manifest_args() {
        let args = manifest_args(ManifestMode::Verify, Path::new("/Volumes/RAID"));
        assert_eq!(args, vec![OsString::from("verify"), OsString::from("/Volumes/RAID")]);
        assert_eq!(
            display_command(Path::new("ascmhl"), &manifest_args(ManifestMode::Create, Path::new("/d"))),
            "ascmhl create /d"
        );
    }
}
