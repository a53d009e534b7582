// Death records: a worker's last word, read by the supervisor

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DeathRecord {
    pub fn new(success: bool, message: Option<String>) -> Self {
        Self { success, message }
    }

    pub fn path(death_dir: &Path, pid: u32) -> PathBuf {
        death_dir.join(pid.to_string())
    }

    pub fn exists(death_dir: &Path, pid: u32) -> bool {
        Self::path(death_dir, pid).exists()
    }

    pub fn write(&self, death_dir: &Path, pid: u32) -> Result<()> {
        let temp = death_dir.join(format!(".{}.tmp", pid));
        fs::write(&temp, serde_json::to_vec(self)?)?;
        fs::rename(&temp, Self::path(death_dir, pid))?;
        Ok(())
    }

    pub fn read(death_dir: &Path, pid: u32) -> Result<Option<Self>> {
        match fs::read_to_string(Self::path(death_dir, pid)) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads and deletes the record for `pid`.
    ///
    /// A record that exists but cannot be decoded still counts as evidence of
    /// death; it is deleted and reported as an unsuccessful exit.
    pub fn consume(death_dir: &Path, pid: u32) -> Result<Option<Self>> {
        let record = match Self::read(death_dir, pid) {
            Ok(record) => record,
            Err(e) => Some(Self::new(false, Some(format!("unreadable death record: {}", e)))),
        };

        if record.is_some() {
            match fs::remove_file(Self::path(death_dir, pid)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(record)
    }
}

/// Everything a worker needs to announce its own death, cheap to clone into
/// a signal handling thread.
#[derive(Debug, Clone)]
pub struct DeathNotice {
    death_dir: PathBuf,
    pid: u32,
}

impl DeathNotice {
    pub fn new(death_dir: &Path, pid: u32) -> Self {
        Self {
            death_dir: death_dir.to_path_buf(),
            pid,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn announce(&self, success: bool, message: Option<String>) -> Result<()> {
        DeathRecord::new(success, message).write(&self.death_dir, self.pid)
    }
}
