//! Persisted CLI settings.
//!
//! The last-used source, destinations and transfer options live in a small
//! JSON file (`dit_config.json` by default). Values from the file are the
//! starting point; command-line flags override them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use engine::config::{DEFAULT_COPY_TOOL, DEFAULT_MANIFEST_TOOL};
use engine::model::{DEFAULT_BUFFER_SIZE, DEFAULT_PARALLELISM};
use engine::ChecksumAlgorithm;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "dit_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    pub src: Option<PathBuf>,
    pub destinations: Vec<PathBuf>,
    pub transfers: usize,
    pub buffer_size: u64,
    pub verify_checksum: bool,
    pub hash: ChecksumAlgorithm,
    pub verify_size: bool,
    pub generate_mhl: bool,
    pub copy_tool: PathBuf,
    pub manifest_tool: PathBuf,
    pub verify_workers: Option<usize>,

    // Older files only knew two fixed destinations.
    #[serde(skip_serializing)]
    dst1: Option<PathBuf>,
    #[serde(skip_serializing)]
    dst2: Option<PathBuf>,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        OffloadConfig {
            src: None,
            destinations: Vec::new(),
            transfers: DEFAULT_PARALLELISM,
            buffer_size: DEFAULT_BUFFER_SIZE,
            verify_checksum: true,
            hash: ChecksumAlgorithm::Sha256,
            verify_size: true,
            generate_mhl: false,
            copy_tool: PathBuf::from(DEFAULT_COPY_TOOL),
            manifest_tool: PathBuf::from(DEFAULT_MANIFEST_TOOL),
            verify_workers: None,
            dst1: None,
            dst2: None,
        }
    }
}

impl OffloadConfig {
    /// Load settings from `path`.
    ///
    /// A missing file yields the defaults. An unreadable or malformed file
    /// also yields the defaults, with a warning.
    pub fn load(path: &Path) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                return Self::default();
            }
            Err(e) => {
                log::warn!("Cannot read config {}: {}; using defaults", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_str::<OffloadConfig>(&text) {
            Ok(config) => config.upgrade(),
            Err(e) => {
                log::warn!("Ignoring malformed config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)?;
        log::info!("Saved settings to {}", path.display());
        Ok(())
    }

    fn upgrade(mut self) -> Self {
        let legacy: Vec<PathBuf> = [self.dst1.take(), self.dst2.take()]
            .into_iter()
            .flatten()
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        if self.destinations.is_empty() {
            self.destinations = legacy;
        }
        self
    }
}
