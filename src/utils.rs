use anyhow::Result;
use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Mutex;

// Terminal client helpers: the log sink and the display name prompt.

/// Crates that log every frame at debug; they are held at warn
const NOISY_TARGETS: &[&str] = &["tungstenite", "tokio_tungstenite", "mio"];

/// Writes records to the log file, or to stderr when there is none.
/// The terminal doubles as the chat window, so without a file only errors
/// are shown.
pub struct ClientLogger {
    level: LevelFilter,
    file: Option<Mutex<File>>,
}

impl ClientLogger {
    pub fn new(log_file: Option<&Path>, level: LevelFilter) -> Result<Self> {
        let file = match log_file {
            Some(path) => Some(Mutex::new(OpenOptions::new().create(true).append(true).open(path)?)),
            None => None,
        };
        Ok(Self { level, file })
    }

    fn limit_for(&self, target: &str) -> LevelFilter {
        let noisy = NOISY_TARGETS
            .iter()
            .any(|prefix| target == *prefix || target.starts_with(&format!("{}::", prefix)));
        if noisy {
            self.level.min(LevelFilter::Warn)
        } else {
            self.level
        }
    }
}

fn render(level: Level, target: &str, args: &std::fmt::Arguments<'_>) -> String {
    format!(
        "{} {:<5} {}: {}\n",
        Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
        level,
        target,
        args
    )
}

impl Log for ClientLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.limit_for(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = render(record.level(), record.target(), record.args());
        match &self.file {
            Some(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.write_all(line.as_bytes());
                }
            }
            None if record.level() == Level::Error => eprint!("{}", line),
            None => {}
        }
    }

    fn flush(&self) {
        match &self.file {
            Some(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.flush();
                }
            }
            None => {
                let _ = std::io::stderr().flush();
            }
        }
    }
}

pub fn setup_logging(log_file: Option<&Path>, level: LevelFilter) -> Result<()> {
    let logger = ClientLogger::new(log_file, level)?;
    log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;

    log::info!("{} {} logging at {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"), level);
    if let Some(path) = log_file {
        log::debug!("Log file: {}", path.display());
    }
    Ok(())
}

/// Ask on stderr and read one answer; an empty answer takes `default`
pub fn prompt(question: &str, default: &str) -> Result<String> {
    prompt_from(&mut std::io::stdin().lock(), question, default)
}

fn prompt_from(input: &mut impl BufRead, question: &str, default: &str) -> Result<String> {
    eprintln!("{} [{}]:", question, default);
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    let answer = answer.trim();
    Ok(if answer.is_empty() { default.to_string() } else { answer.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noisy_crates_are_capped_at_warn() {
        let logger = ClientLogger::new(None, LevelFilter::Debug).unwrap();
        assert_eq!(logger.limit_for("huddle::realtime::connection"), LevelFilter::Debug);
        assert_eq!(logger.limit_for("tungstenite::protocol"), LevelFilter::Warn);
        assert_eq!(logger.limit_for("tokio_tungstenite"), LevelFilter::Warn);
        // prefix match is per path segment
        assert_eq!(logger.limit_for("mioxide"), LevelFilter::Debug);

        let quiet = ClientLogger::new(None, LevelFilter::Error).unwrap();
        assert_eq!(quiet.limit_for("tungstenite"), LevelFilter::Error);
    }

    #[test]
    fn test_file_sink_receives_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huddle.log");
        let logger = ClientLogger::new(Some(&path), LevelFilter::Info).unwrap();

        logger.log(
            &Record::builder()
                .level(Level::Info)
                .target("huddle::relay")
                .args(format_args!("relay up"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .target("huddle::relay")
                .args(format_args!("too chatty"))
                .build(),
        );
        logger.flush();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 1);
        assert!(written.ends_with("INFO  huddle::relay: relay up\n"), "got {:?}", written);
    }

    #[test]
    fn test_prompt_falls_back_to_default() {
        let mut empty = std::io::Cursor::new("  \n");
        assert_eq!(prompt_from(&mut empty, "Name", "laptop").unwrap(), "laptop");
        let mut given = std::io::Cursor::new("Alice\n");
        assert_eq!(prompt_from(&mut given, "Name", "laptop").unwrap(), "Alice");
    }
}
