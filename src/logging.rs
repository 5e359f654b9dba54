//! File logging for the hosted library.
//!
//! The library lives inside somebody else's process, so it never writes to
//! the console and never replaces a subscriber the host already installed.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::HookError;
use crate::config::LogSettings;

/// Installs the global subscriber described by `settings`.
///
/// Returns `Ok(false)` when logging is disabled or another subscriber won.
pub fn init(settings: &LogSettings) -> Result<bool, HookError> {
    let Some(directive) = settings.filter.as_deref() else {
        return Ok(false);
    };
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&settings.file)?;

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_writer(Mutex::new(file))
        .try_init()
        .is_ok();
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_filter() {
        let settings = LogSettings {
            filter: None,
            file: "/nonexistent/dir/shellhook.log".into(),
        };
        assert!(!init(&settings).unwrap());
    }

    #[test]
    fn unopenable_file_is_an_error() {
        let settings = LogSettings {
            filter: Some("debug".into()),
            file: std::env::temp_dir().join("no-such-dir-for-shellhook").join("x.log"),
        };
        assert!(matches!(init(&settings), Err(HookError::Io(_))));
    }
}
