use std::fs::{self, File};
use std::path::{Path, PathBuf};

use env_logger::{Builder, Target};

use crate::config::LogLevel;

fn builder(level: LogLevel) -> Builder {
    let mut builder = Builder::new();
    builder
        .filter_level(level.into())
        .format_timestamp_secs()
        .parse_default_env();
    builder
}

/// Log to stderr; stdout stays reserved for tool output.
pub fn init_stderr(level: LogLevel) {
    if let Err(e) = builder(level).target(Target::Stderr).try_init() {
        eprintln!("logger already initialized: {e}");
    }
}

/// `<prefix>-YYYY-MM-DD-HH_MM_SS.log`
pub fn log_file_name(prefix: &str, now: chrono::DateTime<chrono::Local>) -> String {
    format!("{prefix}-{}.log", now.format("%Y-%m-%d-%H_%M_%S"))
}

/// Log to a new timestamped file inside `dir`, creating the directory.
pub fn init_file(level: LogLevel, dir: &Path, prefix: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(log_file_name(prefix, chrono::Local::now()));
    let file = File::create(&path)?;

    if let Err(e) = builder(level)
        .target(Target::Pipe(Box::new(file)))
        .write_style(env_logger::WriteStyle::Never)
        .try_init()
    {
        eprintln!("logger already initialized: {e}");
    }
    Ok(path)
}
