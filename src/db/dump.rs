//! Disk spill for queries that exhausted their retries.
//!
//! Failed SQL is appended to a daily-rotating file so an operator can
//! replay it by hand. Records carry a comment header with the local
//! timestamp and the driver's `(code, message)`; writes are serialized
//! process-wide by one mutex.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use tracing::{error, info, warn};

use crate::error::Error;

/// Name of the file written at startup to validate the dump directory.
const PLACEHOLDER_NAME: &str = "placeholder";

/// Append-only sink for dumped queries.
///
/// Constructed disabled when the configured directory is empty; appends
/// then log a warning and drop the record.
pub struct SqlDump {
    dir: Option<PathBuf>,
    file_lock: Mutex<()>,
}

impl SqlDump {
    /// Creates a sink writing under `dump_dir`; an empty string disables
    /// dumping.
    pub fn new(dump_dir: &str) -> Self {
        Self {
            dir: (!dump_dir.is_empty()).then(|| PathBuf::from(dump_dir)),
            file_lock: Mutex::new(()),
        }
    }

    /// Whether a dump directory is configured.
    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Validates writability by creating the directory and truncating the
    /// `placeholder` file inside it.
    pub fn probe(&self) -> Result<(), Error> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        File::create(dir.join(PLACEHOLDER_NAME))?;
        Ok(())
    }

    /// Path of today's dump file.
    fn current_path(dir: &Path) -> PathBuf {
        let day = Local::now().format("%Y-%m-%d");
        dir.join(format!("{}_{:05}.log", day, std::process::id()))
    }

    /// Appends one failed query. Errors are logged, never propagated.
    pub fn append(&self, query: &str, err_code: u32, err_msg: &str) {
        let Some(dir) = &self.dir else {
            warn!("SQL dump is disabled");
            return;
        };

        let path = Self::current_path(dir);
        info!(path = %path.display(), "Writing SQL dump");

        let mut record = String::new();
        record.push_str(&format!(
            "-- {}: err_code = {}, err_msg = {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            err_code,
            err_msg
        ));
        if query.is_empty() {
            record.push_str("-- <low level access>");
        } else {
            record.push_str(query);
            record.push(';');
        }
        record.push_str("\n\n");

        let _lock = self.file_lock.lock().unwrap();
        let file = OpenOptions::new().create(true).append(true).open(&path);
        match file {
            Ok(mut file) => {
                if let Err(err) = file.write_all(record.as_bytes()) {
                    error!(path = %path.display(), error = %err, "Error writing SQL dump");
                }
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "Error creating SQL dump file");
            }
        }
    }
}
