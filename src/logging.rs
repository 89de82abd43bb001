use crate::config::{LogFormat, LoggingConfig};
use chrono::{DateTime, Utc};
use log::{LevelFilter, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

pub type LogError = Box<dyn std::error::Error + Send + Sync>;

/// `log` backend writing to stdout and, optionally, a log file that is
/// truncated each time the logger starts.
pub struct ProxyLogger {
    level: LevelFilter,
    format: LogFormat,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl ProxyLogger {
    pub fn new(config: &LoggingConfig) -> Result<Self, LogError> {
        let mut writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>> =
            vec![Mutex::new(BufWriter::new(Box::new(std::io::stdout())))];

        if let Some(path) = &config.file {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .map_err(|e| format!("Cannot open log file {}: {}", path.display(), e))?;
            writers.push(Mutex::new(BufWriter::new(Box::new(file))));
        }

        Ok(Self {
            level: config.level.unwrap_or_default().to_filter(),
            format: config.format.unwrap_or_default(),
            writers,
        })
    }

    /// Installs the logger. With `RUST_LOG` set, `env_logger` takes over so
    /// per-module filters keep working.
    pub fn init(config: &LoggingConfig) -> Result<(), LogError> {
        if std::env::var_os("RUST_LOG").is_some() {
            return init_fallback(config);
        }

        let logger = Self::new(config)?;
        let level = logger.level;
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(level);
        Ok(())
    }

    fn format_text(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        format!(
            "{} [{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level().to_string().to_uppercase(),
            record.args()
        )
    }

    fn format_json(&self, record: &Record) -> String {
        json_line(record)
    }
}

fn json_line(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let log_entry = json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "message": record.args().to_string(),
    });
    log_entry.to_string()
}

impl log::Log for ProxyLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => self.format_json(record),
        };

        for writer in &self.writers {
            if let Ok(mut writer) = writer.lock() {
                let _ = writeln!(writer, "{}", message);
                let _ = writer.flush();
            }
        }
    }

    fn flush(&self) {
        for writer in &self.writers {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

fn init_fallback(config: &LoggingConfig) -> Result<(), LogError> {
    let level = config.level.unwrap_or_default().to_string();
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if config.format == Some(LogFormat::Json) {
        builder.format(|buf, record| writeln!(buf, "{}", json_line(record)));
    }
    builder.try_init()?;
    Ok(())
}
