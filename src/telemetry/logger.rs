//! JSONL writer for published fan events

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::TelemetryConfig;
use crate::error::Result;
use crate::fan::state::FanEvent;

const FILE_PREFIX: &str = "telemetry_";
const FILE_EXTENSION: &str = "jsonl";

/// Appends one JSON object per event, rotating files by record count
#[derive(Debug)]
pub struct TelemetryLogger {
    dir: PathBuf,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    current: Option<BufWriter<File>>,
    records_in_file: usize,
    files_opened: usize,
}

impl TelemetryLogger {
    /// Create the log directory; the first file is opened on the first record
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        let dir = PathBuf::from(&config.log_dir);
        fs::create_dir_all(&dir)?;
        info!("Telemetry logging to {}", dir.display());

        Ok(Self {
            dir,
            max_records_per_file: config.max_records_per_file.max(1),
            max_files_to_keep: config.max_files_to_keep.max(1),
            current: None,
            records_in_file: 0,
            files_opened: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `event` stamped with the current time
    pub fn log_event(&mut self, event: &FanEvent) -> Result<()> {
        self.log_event_at(event, Utc::now())
    }

    /// Write `event` stamped with `timestamp`
    pub fn log_event_at(&mut self, event: &FanEvent, timestamp: DateTime<Utc>) -> Result<()> {
        let mut record = serde_json::to_value(event)?;
        if let Value::Object(fields) = &mut record {
            fields.insert("timestamp".to_string(), Value::String(timestamp.to_rfc3339()));
        }

        if self.current.is_none() || self.records_in_file >= self.max_records_per_file {
            self.rotate(timestamp)?;
        }

        if let Some(writer) = self.current.as_mut() {
            serde_json::to_writer(&mut *writer, &record)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            self.records_in_file += 1;
        }
        Ok(())
    }

    fn rotate(&mut self, timestamp: DateTime<Utc>) -> Result<()> {
        if let Some(mut writer) = self.current.take() {
            writer.flush()?;
        }

        let name = format!(
            "{}{}_{:04}.{}",
            FILE_PREFIX,
            timestamp.format("%Y%m%d_%H%M%S"),
            self.files_opened,
            FILE_EXTENSION
        );
        let path = self.dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Opened telemetry file {}", path.display());

        self.current = Some(BufWriter::new(file));
        self.records_in_file = 0;
        self.files_opened += 1;

        self.prune();
        Ok(())
    }

    /// Delete the oldest telemetry files beyond the retention limit
    fn prune(&self) {
        let mut files = match self.log_files() {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to list telemetry files: {}", e);
                return;
            }
        };
        if files.len() <= self.max_files_to_keep {
            return;
        }

        files.sort();
        let excess = files.len() - self.max_files_to_keep;
        for path in files.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed old telemetry file {}", path.display()),
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }

    /// Telemetry files in the log directory, unordered
    pub fn log_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_log = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(FILE_PREFIX))
                && path.extension().is_some_and(|ext| ext == FILE_EXTENSION);
            if is_log {
                files.push(path);
            }
        }
        Ok(files)
    }
}
