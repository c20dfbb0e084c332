//! Log setup: terminal plus one timestamped file per run.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, LevelFilter, TermLogger, TerminalMode,
    WriteLogger,
};

pub const DEFAULT_LOG_DIR: &str = "./dit_logs";

/// `transfer_YYYYMMDD_HHMMSS.log`
pub fn log_file_name(at: DateTime<Local>) -> String {
    format!("transfer_{}.log", at.format("%Y%m%d_%H%M%S"))
}

/// Install the global logger. Returns the path of this run's log file.
pub fn init(log_dir: &Path, verbose: bool) -> Result<PathBuf, String> {
    fs::create_dir_all(log_dir)
        .map_err(|e| format!("cannot create log directory {}: {}", log_dir.display(), e))?;
    let path = log_dir.join(log_file_name(Local::now()));
    let file = File::create(&path)
        .map_err(|e| format!("cannot create log file {}: {}", path.display(), e))?;

    let terminal_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let terminal_config = ConfigBuilder::new()
        .set_time_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .build();

    CombinedLogger::init(vec![
        TermLogger::new(
            terminal_level,
            terminal_config,
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Debug, Config::default(), file),
    ])
    .map_err(|e| format!("cannot install logger: {}", e))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_file_name_is_timestamped() {
        let at = Local
            .with_ymd_and_hms(2024, 5, 1, 9, 5, 7)
            .single()
            .expect("Failed to build timestamp");
        assert_eq!(log_file_name(at), "transfer_20240501_090507.log");
    }
}
