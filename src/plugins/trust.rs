// ShellGuard - Import Trust
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persisted operator decisions about which plugins may import modules
//!
//! The store is a TOML file of `[[plugins]]` records. It is the only authority
//! for import trust and is written atomically: a new file is written next to
//! the store, synced, then renamed over it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub identity: String,
    pub trusted: bool,
    /// Modules the operator approved for this identity
    #[serde(default)]
    pub imports: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<String>,
}

impl TrustRecord {
    pub fn covers(&self, imports: &BTreeSet<String>) -> bool {
        self.trusted && imports.is_subset(&self.imports)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustFile {
    #[serde(default)]
    plugins: Vec<TrustRecord>,
}

#[derive(Debug, Error)]
pub enum TrustStoreError {
    #[error("trust store {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("trust store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode trust store: {0}")]
    Encode(#[from] toml::ser::Error),
}

impl TrustStoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        TrustStoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug)]
pub struct TrustStore {
    path: PathBuf,
    records: BTreeMap<String, TrustRecord>,
}

impl TrustStore {
    /// Open the store, treating a missing file as empty
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TrustStoreError> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(content) => parse_records(&path, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(TrustStoreError::io(&path, e)),
        };
        crate::log_debug!("Trust store {} holds {} record(s)", path.display(), records.len());
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, identity: &str) -> Option<&TrustRecord> {
        self.records.get(identity)
    }

    pub fn is_trusted(&self, identity: &str, imports: &BTreeSet<String>) -> bool {
        self.records
            .get(identity)
            .is_some_and(|record| record.covers(imports))
    }

    pub fn records(&self) -> impl Iterator<Item = &TrustRecord> {
        self.records.values()
    }

    /// Mark `identity` trusted for `imports`. Returns `false` (and writes
    /// nothing) when an existing record already covers them.
    pub fn approve(
        &mut self,
        identity: &str,
        imports: &BTreeSet<String>,
    ) -> Result<bool, TrustStoreError> {
        if self.is_trusted(identity, imports) {
            return Ok(false);
        }

        let mut updated = self.records.clone();
        let record = updated
            .entry(identity.to_string())
            .or_insert_with(|| TrustRecord {
                identity: identity.to_string(),
                trusted: false,
                imports: BTreeSet::new(),
                approved_at: None,
            });
        record.trusted = true;
        record.imports.extend(imports.iter().cloned());
        record.approved_at = Some(Utc::now().to_rfc3339());

        // Memory follows disk: only adopt the change once it is persisted
        write_records(&self.path, &updated)?;
        self.records = updated;
        Ok(true)
    }

    /// Check the store location accepts writes without touching the store itself
    pub fn check_writable(&self) -> Result<(), TrustStoreError> {
        let dir = parent_dir(&self.path);
        std::fs::create_dir_all(dir).map_err(|e| TrustStoreError::io(dir, e))?;
        tempfile::NamedTempFile::new_in(dir)
            .map(|_| ())
            .map_err(|e| TrustStoreError::io(dir, e))
    }
}

fn parse_records(path: &Path, content: &str) -> Result<BTreeMap<String, TrustRecord>, TrustStoreError> {
    let file: TrustFile = toml::from_str(content).map_err(|e| TrustStoreError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut records = BTreeMap::new();
    for record in file.plugins {
        if record.identity.trim().is_empty() {
            return Err(TrustStoreError::Corrupt {
                path: path.to_path_buf(),
                message: "record with an empty identity".to_string(),
            });
        }
        if records.insert(record.identity.clone(), record).is_some() {
            return Err(TrustStoreError::Corrupt {
                path: path.to_path_buf(),
                message: "duplicate identity".to_string(),
            });
        }
    }
    Ok(records)
}

fn write_records(path: &Path, records: &BTreeMap<String, TrustRecord>) -> Result<(), TrustStoreError> {
    let file = TrustFile {
        plugins: records.values().cloned().collect(),
    };
    let content = toml::to_string_pretty(&file)?;

    let dir = parent_dir(path);
    std::fs::create_dir_all(dir).map_err(|e| TrustStoreError::io(dir, e))?;
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| TrustStoreError::io(dir, e))?;
    temp.write_all(content.as_bytes())
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| TrustStoreError::io(path, e))?;
    temp.persist(path)
        .map_err(|e| TrustStoreError::io(path, e.error))?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Asks the operator whether a plugin may use its declared imports
pub trait TrustPrompt: Send + Sync {
    fn confirm(&self, identity: &str, imports: &BTreeSet<String>) -> bool;
}

/// Interactive y/N prompt on the terminal
pub struct StdinPrompt;

impl TrustPrompt for StdinPrompt {
    fn confirm(&self, identity: &str, imports: &BTreeSet<String>) -> bool {
        let modules: Vec<&str> = imports.iter().map(String::as_str).collect();
        let mut stderr = std::io::stderr();
        let _ = write!(
            stderr,
            "Plugin '{}' wants to import: {}\nAllow? [y/N] ",
            identity,
            modules.join(", ")
        );
        let _ = stderr.flush();

        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => false,
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        }
    }
}

/// Denies every request; used for non-interactive runs
pub struct DenyAll;

impl TrustPrompt for DenyAll {
    fn confirm(&self, identity: &str, _imports: &BTreeSet<String>) -> bool {
        crate::log_notice!("Import trust for '{}' denied (non-interactive)", identity);
        false
    }
}

/// Approval waiting for its plugin to finish loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGrant {
    pub identity: String,
    pub imports: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// No imports declared
    NotRequired,
    AlreadyTrusted,
    /// Operator approved; persist with [`TrustManager::commit`] once loaded
    Approved(PendingGrant),
    Denied,
}

impl TrustDecision {
    pub fn allowed(&self) -> bool {
        !matches!(self, TrustDecision::Denied)
    }
}

pub struct TrustManager {
    store: TrustStore,
    prompt: Box<dyn TrustPrompt>,
}

impl TrustManager {
    pub fn new(store: TrustStore, prompt: Box<dyn TrustPrompt>) -> Self {
        Self { store, prompt }
    }

    pub fn store(&self) -> &TrustStore {
        &self.store
    }

    pub fn evaluate(&self, identity: &str, imports: &BTreeSet<String>) -> TrustDecision {
        if imports.is_empty() {
            return TrustDecision::NotRequired;
        }
        if self.store.is_trusted(identity, imports) {
            crate::log_debug!("Plugin '{}' is already trusted for its imports", identity);
            return TrustDecision::AlreadyTrusted;
        }
        if self.prompt.confirm(identity, imports) {
            crate::log_info!("Operator approved imports for plugin '{}'", identity);
            TrustDecision::Approved(PendingGrant {
                identity: identity.to_string(),
                imports: imports.clone(),
            })
        } else {
            crate::log_warn!("Operator denied imports for plugin '{}'", identity);
            TrustDecision::Denied
        }
    }

    /// Persist an approval. Returns whether the store changed.
    pub fn commit(&mut self, grant: &PendingGrant) -> Result<bool, TrustStoreError> {
        self.store.approve(&grant.identity, &grant.imports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Scripted {
        answer: bool,
        asked: Arc<AtomicUsize>,
    }

    impl TrustPrompt for Scripted {
        fn confirm(&self, _identity: &str, _imports: &BTreeSet<String>) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn imports(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn manager(dir: &TempDir, answer: bool) -> (TrustManager, Arc<AtomicUsize>) {
        let asked = Arc::new(AtomicUsize::new(0));
        let store = TrustStore::open(dir.path().join("trust.toml")).unwrap();
        let prompt = Scripted {
            answer,
            asked: Arc::clone(&asked),
        };
        (TrustManager::new(store, Box::new(prompt)), asked)
    }

    #[test]
    fn test_missing_store_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = TrustStore::open(temp_dir.path().join("trust.toml")).unwrap();
        assert_eq!(store.records().count(), 0);
        assert!(!store.is_trusted("weather", &imports(&["http"])));
        store.check_writable().unwrap();
    }

    #[test]
    fn test_no_imports_never_prompts() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, asked) = manager(&temp_dir, false);
        assert_eq!(manager.evaluate("hello", &BTreeSet::new()), TrustDecision::NotRequired);
        assert_eq!(asked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_approval_is_pending_until_committed() {
        let temp_dir = TempDir::new().unwrap();
        let (mut manager, asked) = manager(&temp_dir, true);
        let wanted = imports(&["http", "json"]);

        let grant = match manager.evaluate("weather", &wanted) {
            TrustDecision::Approved(grant) => grant,
            other => panic!("expected approval, got {:?}", other),
        };
        assert!(!temp_dir.path().join("trust.toml").exists());

        assert!(manager.commit(&grant).unwrap());
        let reopened = TrustStore::open(temp_dir.path().join("trust.toml")).unwrap();
        assert!(reopened.is_trusted("weather", &wanted));
        assert!(reopened.get("weather").unwrap().approved_at.is_some());

        assert_eq!(manager.evaluate("weather", &wanted), TrustDecision::AlreadyTrusted);
        assert_eq!(asked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_approval_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("trust.toml");
        let mut store = TrustStore::open(&path).unwrap();
        let wanted = imports(&["json"]);

        assert!(store.approve("greeter", &wanted).unwrap());
        let before = std::fs::read_to_string(&path).unwrap();
        assert!(!store.approve("greeter", &wanted).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
        assert_eq!(before.matches("[[plugins]]").count(), 1);
    }

    #[test]
    fn test_new_import_prompts_again_and_widens() {
        let temp_dir = TempDir::new().unwrap();
        let (mut manager, asked) = manager(&temp_dir, true);

        let grant = PendingGrant {
            identity: "weather".to_string(),
            imports: imports(&["http"]),
        };
        manager.commit(&grant).unwrap();

        let decision = manager.evaluate("weather", &imports(&["http", "process"]));
        assert!(matches!(decision, TrustDecision::Approved(_)));
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        if let TrustDecision::Approved(grant) = decision {
            manager.commit(&grant).unwrap();
        }
        assert_eq!(
            manager.store().get("weather").unwrap().imports,
            imports(&["http", "process"])
        );
        assert!(manager.store().is_trusted("weather", &imports(&["http"])));
    }

    #[test]
    fn test_denial_persists_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, _) = manager(&temp_dir, false);
        assert_eq!(manager.evaluate("shady", &imports(&["process"])), TrustDecision::Denied);
        assert!(!temp_dir.path().join("trust.toml").exists());
    }

    #[test]
    fn test_corrupt_store_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("trust.toml");
        std::fs::write(&path, "[[plugins]\nidentity = ").unwrap();
        assert!(matches!(
            TrustStore::open(&path).unwrap_err(),
            TrustStoreError::Corrupt { .. }
        ));

        std::fs::write(
            &path,
            "[[plugins]]\nidentity = \"a\"\ntrusted = true\n\n[[plugins]]\nidentity = \"a\"\ntrusted = true\n",
        )
        .unwrap();
        assert!(matches!(
            TrustStore::open(&path).unwrap_err(),
            TrustStoreError::Corrupt { .. }
        ));
    }

    #[test]
    fn test_untrusted_record_does_not_cover() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("trust.toml");
        std::fs::write(
            &path,
            "[[plugins]]\nidentity = \"weather\"\ntrusted = false\nimports = [\"http\"]\n",
        )
        .unwrap();
        let store = TrustStore::open(&path).unwrap();
        assert!(!store.is_trusted("weather", &imports(&["http"])));
    }
}
