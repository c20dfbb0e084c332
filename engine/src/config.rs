//! Engine configuration.
//!
//! An `EngineConfig` is built once at startup and passed by reference to
//! every `TransferMachine`. It holds the knobs that are properties of the
//! installation rather than of one transfer request.

use std::path::PathBuf;

use crate::supervisor::DEFAULT_TAIL_LINES;
use crate::verify::TimeoutPolicy;

pub const DEFAULT_COPY_TOOL: &str = "rclone";
pub const DEFAULT_MANIFEST_TOOL: &str = "ascmhl";

/// Share of a destination's free space a transfer may fill.
pub const DEFAULT_USABLE_SPACE_FRACTION: f64 = 0.95;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Copy tool, bare name (looked up on PATH) or explicit path
    pub copy_tool: PathBuf,
    /// Manifest tool, bare name or explicit path
    pub manifest_tool: PathBuf,
    /// Output lines kept per child process for error reports
    pub diagnostic_lines: usize,
    /// Verification pool size; `None` uses the request's parallelism
    pub verification_workers: Option<usize>,
    pub timeout_policy: TimeoutPolicy,
    /// The source must fit into this fraction of each destination's free space
    pub usable_space_fraction: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            copy_tool: PathBuf::from(DEFAULT_COPY_TOOL),
            manifest_tool: PathBuf::from(DEFAULT_MANIFEST_TOOL),
            diagnostic_lines: DEFAULT_TAIL_LINES,
            verification_workers: None,
            timeout_policy: TimeoutPolicy::default(),
            usable_space_fraction: DEFAULT_USABLE_SPACE_FRACTION,
        }
    }
}

impl EngineConfig {
    pub fn with_copy_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.copy_tool = tool.into();
        self
    }

    pub fn with_manifest_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.manifest_tool = tool.into();
        self
    }

    pub fn with_verification_workers(mut self, workers: usize) -> Self {
        self.verification_workers = Some(workers.max(1));
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    pub fn with_usable_space_fraction(mut self, fraction: f64) -> Self {
        self.usable_space_fraction = fraction.clamp(0.0, 1.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_name_the_standard_tools() {
        let config = EngineConfig::default();
        assert_eq!(config.copy_tool, PathBuf::from("rclone"));
        assert_eq!(config.manifest_tool, PathBuf::from("ascmhl"));
        assert_eq!(config.diagnostic_lines, 20);
        assert_eq!(config.verification_workers, None);
        assert!((config.usable_space_fraction - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_builders_clamp_their_inputs() {
        let config = EngineConfig::default()
            .with_verification_workers(0)
            .with_usable_space_fraction(1.5);
        assert_eq!(config.verification_workers, Some(1));
        assert!((config.usable_space_fraction - 1.0).abs() < f64::EPSILON);
    }
}
