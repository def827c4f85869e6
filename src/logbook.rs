//! Per-drone flight log files. Each authenticated drone gets
//! `logs/drone-{id}.log`; the file is closed when its session is reaped.
//! Service-level logging stays on `tracing`.

use chrono::Utc;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

pub struct LogBook {
    dir: PathBuf,
    files: Mutex<HashMap<String, File>>,
}

impl LogBook {
    pub fn new(dir: &str) -> Self {
        if let Err(e) = fs::create_dir_all(dir) {
            warn!("could not create log directory {}: {}", dir, e);
        }
        Self {
            dir: PathBuf::from(dir),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn log(&self, drone_id: &str, line: &str) {
        let mut files = match self.files.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if !files.contains_key(drone_id) {
            let path = self.dir.join(format!("drone-{}.log", drone_id));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => {
                    files.insert(drone_id.to_string(), f);
                }
                Err(e) => {
                    warn!("failed to open log file for {}: {}", drone_id, e);
                    return;
                }
            }
        }
        if let Some(f) = files.get_mut(drone_id) {
            let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
            if let Err(e) = writeln!(f, "{} {}", stamp, line) {
                warn!("failed to write log for {}: {}", drone_id, e);
            }
        }
    }

    pub fn close(&self, drone_id: &str) {
        if let Ok(mut files) = self.files.lock() {
            files.remove(drone_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_closes_per_drone_files() {
        let dir = std::env::temp_dir().join("fleetlink-logbook-test");
        let book = LogBook::new(dir.to_str().unwrap());
        book.log("abc123", "vehicle online");
        book.log("abc123", "vehicle armed");
        book.close("abc123");

        let content = fs::read_to_string(dir.join("drone-abc123.log")).unwrap();
        assert!(content.contains("vehicle online"));
        assert!(content.contains("vehicle armed"));
        let _ = fs::remove_dir_all(dir);
    }
}
