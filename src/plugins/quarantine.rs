// ShellGuard - Plugin Quarantine
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Isolation of rejected plugin files
//!
//! A JSON line is appended to the quarantine log before the file leaves the
//! plugin directory, so a moved file always has its reason on record. When the
//! move then fails, a `move_failed` line cancels the first one. The quarantine
//! directory is never scanned.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineStatus {
    #[default]
    Quarantined,
    /// The move announced by an earlier line did not happen
    MoveFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub identity: String,
    pub original_path: PathBuf,
    pub quarantined_path: PathBuf,
    pub reason: String,
    pub timestamp: String,
    pub sha256: String,
    #[serde(default)]
    pub status: QuarantineStatus,
}

#[derive(Debug, Error)]
pub enum QuarantineError {
    #[error("quarantine {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode quarantine entry: {0}")]
    Encode(#[from] serde_json::Error),
}

impl QuarantineError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        QuarantineError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuarantineManager {
    dir: PathBuf,
    log_path: PathBuf,
}

impl QuarantineManager {
    /// Create the quarantine directory and log, failing if either is unwritable
    pub fn open(dir: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Result<Self, QuarantineError> {
        let manager = Self {
            dir: dir.into(),
            log_path: log_path.into(),
        };
        manager.check_writable()?;
        Ok(manager)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn check_writable(&self) -> Result<(), QuarantineError> {
        fs::create_dir_all(&self.dir).map_err(|e| QuarantineError::io(&self.dir, e))?;
        tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| QuarantineError::io(&self.dir, e))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| QuarantineError::io(&self.log_path, e))?;
        Ok(())
    }

    /// Log why, then move `path` into quarantine
    pub fn quarantine(
        &self,
        identity: &str,
        path: &Path,
        reason: &str,
    ) -> Result<QuarantineEntry, QuarantineError> {
        let content = fs::read(path).map_err(|e| QuarantineError::io(path, e))?;
        let destination = self.unique_destination(path)?;

        let entry = QuarantineEntry {
            identity: identity.to_string(),
            original_path: path.to_path_buf(),
            quarantined_path: destination.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            sha256: hex_digest(&content),
            status: QuarantineStatus::Quarantined,
        };
        self.append(&entry)?;

        if let Err(e) = move_file(path, &destination) {
            let cancel = QuarantineEntry {
                reason: format!("move failed: {}", e),
                timestamp: Utc::now().to_rfc3339(),
                status: QuarantineStatus::MoveFailed,
                ..entry
            };
            if let Err(log_error) = self.append(&cancel) {
                crate::log_error!(
                    "Quarantine of {} failed and could not be logged: {}",
                    path.display(),
                    log_error
                );
            }
            return Err(e);
        }

        crate::log_warn!(
            "Quarantined plugin '{}' to {}: {}",
            identity,
            destination.display(),
            reason
        );
        Ok(entry)
    }

    /// Logged quarantines whose move went through, oldest first. Malformed
    /// lines are skipped.
    pub fn entries(&self) -> Result<Vec<QuarantineEntry>, QuarantineError> {
        let logged = self.logged()?;
        let failed: Vec<&Path> = logged
            .iter()
            .filter(|entry| entry.status == QuarantineStatus::MoveFailed)
            .map(|entry| entry.quarantined_path.as_path())
            .collect();
        Ok(logged
            .iter()
            .filter(|entry| {
                entry.status == QuarantineStatus::Quarantined
                    && !failed.contains(&entry.quarantined_path.as_path())
            })
            .cloned()
            .collect())
    }

    /// Every line of the log, including cancelled moves
    pub fn logged(&self) -> Result<Vec<QuarantineEntry>, QuarantineError> {
        let content = match fs::read_to_string(&self.log_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QuarantineError::io(&self.log_path, e)),
        };

        let mut entries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => crate::log_warn!(
                    "Skipping malformed quarantine log line {}: {}",
                    index + 1,
                    e
                ),
            }
        }
        Ok(entries)
    }

    fn append(&self, entry: &QuarantineEntry) -> Result<(), QuarantineError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| QuarantineError::io(&self.log_path, e))?;
        log.write_all(line.as_bytes())
            .and_then(|_| log.sync_data())
            .map_err(|e| QuarantineError::io(&self.log_path, e))
    }

    /// `name.lua`, then `name_1.lua`, `name_2.lua`, ...
    fn unique_destination(&self, path: &Path) -> Result<PathBuf, QuarantineError> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plugin".to_string());
        let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
        let file_name = |suffix: String| match &extension {
            Some(ext) => format!("{}{}.{}", stem, suffix, ext),
            None => format!("{}{}", stem, suffix),
        };

        let mut candidate = self.dir.join(file_name(String::new()));
        let mut counter = 1u32;
        while candidate.exists() {
            candidate = self.dir.join(file_name(format!("_{}", counter)));
            counter += 1;
        }
        Ok(candidate)
    }
}

fn move_file(from: &Path, to: &Path) -> Result<(), QuarantineError> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => copy_then_remove(from, to),
        Err(e) => Err(QuarantineError::io(from, e)),
    }
}

fn copy_then_remove(from: &Path, to: &Path) -> Result<(), QuarantineError> {
    let dir = to.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| QuarantineError::io(dir, e))?;
    let content = fs::read(from).map_err(|e| QuarantineError::io(from, e))?;
    temp.write_all(&content)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| QuarantineError::io(to, e))?;
    temp.persist_noclobber(to)
        .map_err(|e| QuarantineError::io(to, e.error))?;

    if let Err(e) = fs::remove_file(from) {
        let _ = fs::remove_file(to);
        return Err(QuarantineError::io(from, e));
    }
    Ok(())
}

fn hex_digest(content: &[u8]) -> String {
    Sha256::digest(content)
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}
