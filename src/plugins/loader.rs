//! Plugin discovery and the per-plugin admission pipeline
//!
//! A candidate moves through validation, trust, sandboxed execution, the
//! `register_commands` contract and finally the registry. Every failure is
//! local to the candidate. Operator approvals come back as pending grants for
//! the caller to persist.

use crate::config::{SandboxLimits, PLUGIN_EXTENSION};
use crate::plugins::api::is_sanctioned;
use crate::plugins::contract::{collect_commands, ContractError};
use crate::plugins::registry::{CommandRegistry, RegistryError};
use crate::plugins::sandbox::{create_sandbox, TrustTier};
use crate::plugins::trust::{PendingGrant, TrustDecision, TrustManager};
use crate::plugins::validator::{validate_source, Violation};
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// A plugin file read from the plugin directory
#[derive(Debug, Clone)]
pub struct PluginCandidate {
    pub identity: String,
    pub path: PathBuf,
    pub source: String,
    pub discovered_at: DateTime<Utc>,
}

impl PluginCandidate {
    pub fn read(path: &Path) -> Result<Self, AdmissionError> {
        let identity = identity_of(path)
            .ok_or_else(|| AdmissionError::Unreadable(format!("{} has no file name", path.display())))?;
        let bytes = fs::read(path).map_err(|e| AdmissionError::Unreadable(e.to_string()))?;
        let source = String::from_utf8(bytes).map_err(|_| {
            AdmissionError::StructuralViolation(Violation::encoding("source is not valid UTF-8"))
        })?;
        Ok(Self {
            identity,
            path: path.to_path_buf(),
            source,
            discovered_at: Utc::now(),
        })
    }
}

/// Plugin identity: the file stem
pub fn identity_of(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
}

/// Plugin files in `dir`, sorted by file name. A missing directory is empty.
pub fn discover_candidates(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let is_plugin = path.extension().is_some_and(|ext| ext == PLUGIN_EXTENSION);
        if !hidden && is_plugin && entry.file_type()?.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginState {
    Discovered,
    Validating,
    TrustPending,
    Trusted,
    Quarantined,
    Loaded,
    Error,
}

impl PluginState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PluginState::Quarantined | PluginState::Loaded | PluginState::Error)
    }

    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Discovered, Validating)
                | (Discovered, Error)
                | (Discovered, Quarantined)
                | (Validating, TrustPending)
                | (Validating, Trusted)
                | (Validating, Quarantined)
                | (Validating, Error)
                | (TrustPending, Trusted)
                | (TrustPending, Quarantined)
                | (Trusted, Loaded)
                | (Trusted, Quarantined)
                | (Trusted, Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Discovered => "discovered",
            PluginState::Validating => "validating",
            PluginState::TrustPending => "trust-pending",
            PluginState::Trusted => "trusted",
            PluginState::Quarantined => "quarantined",
            PluginState::Loaded => "loaded",
            PluginState::Error => "error",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One plugin's progress through a reload
#[derive(Debug, Clone)]
pub struct PluginInstance {
    pub identity: String,
    pub state: PluginState,
    pub description: Option<String>,
    /// Commands registered, once Loaded
    pub commands: Vec<String>,
}

impl PluginInstance {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            state: PluginState::Discovered,
            description: None,
            commands: Vec::new(),
        }
    }

    pub fn advance(&mut self, next: PluginState) {
        if !self.state.can_transition_to(next) {
            crate::log_error!(
                "Plugin '{}' made an unexpected transition {} -> {}",
                self.identity,
                self.state,
                next
            );
        }
        crate::log_debug!("Plugin '{}': {} -> {}", self.identity, self.state, next);
        self.state = next;
    }
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("structural violation: {0}")]
    StructuralViolation(#[from] Violation),
    #[error("imports not trusted: {}", .0.join(", "))]
    ImportNotTrusted(Vec<String>),
    #[error("contract violation: {0}")]
    ContractViolation(ContractError),
    #[error("load failed: {0}")]
    LoadExecutionError(String),
    #[error("registry collision: {0}")]
    RegistryCollision(#[from] RegistryError),
    #[error("unreadable plugin file: {0}")]
    Unreadable(String),
}

impl AdmissionError {
    /// Terminal state a plugin reaches when admission fails with this error
    pub fn terminal_state(&self) -> PluginState {
        match self {
            AdmissionError::LoadExecutionError(_) | AdmissionError::Unreadable(_) => PluginState::Error,
            _ => PluginState::Quarantined,
        }
    }
}

impl From<ContractError> for AdmissionError {
    fn from(error: ContractError) -> Self {
        match error {
            // The entry point raised: that is code failing during load
            ContractError::EntryPointFailed(message) => AdmissionError::LoadExecutionError(message),
            other => AdmissionError::ContractViolation(other),
        }
    }
}

/// Run one candidate through the pipeline, merging its commands into `registry`.
/// A fresh operator approval is returned, not persisted.
pub fn admit(
    candidate: &PluginCandidate,
    instance: &mut PluginInstance,
    trust: &TrustManager,
    registry: &mut CommandRegistry,
    limits: SandboxLimits,
) -> Result<Option<PendingGrant>, AdmissionError> {
    let identity = candidate.identity.as_str();

    instance.advance(PluginState::Validating);
    let outline = validate_source(&candidate.source)?;
    instance.description = outline.description.clone();

    if let Some(unknown) = outline.imports.iter().find(|module| !is_sanctioned(module)) {
        return Err(AdmissionError::LoadExecutionError(format!(
            "module '{}' is not available to plugins",
            unknown
        )));
    }

    let decision = if outline.imports.is_empty() {
        TrustDecision::NotRequired
    } else {
        instance.advance(PluginState::TrustPending);
        trust.evaluate(identity, &outline.imports)
    };
    if !decision.allowed() {
        return Err(AdmissionError::ImportNotTrusted(
            outline.imports.iter().cloned().collect(),
        ));
    }
    instance.advance(PluginState::Trusted);

    let tier = TrustTier::for_imports(&outline.imports);
    let sandbox = create_sandbox(identity, &tier, limits)
        .map_err(|e| AdmissionError::LoadExecutionError(e.to_string()))?;
    sandbox
        .exec(&candidate.source)
        .map_err(|e| AdmissionError::LoadExecutionError(e.to_string()))?;
    let sandbox = Arc::new(sandbox);

    let entries = collect_commands(&sandbox, &outline)?;
    let names: Vec<String> = entries.iter().map(|entry| entry.name.clone()).collect();
    registry.register_plugin(identity, entries)?;

    instance.commands = names;
    instance.advance(PluginState::Loaded);
    Ok(match decision {
        TrustDecision::Approved(grant) => Some(grant),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::trust::{DenyAll, TrustPrompt, TrustStore};
    use crate::plugins::validator::ViolationKind;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    struct AllowAll;

    impl TrustPrompt for AllowAll {
        fn confirm(&self, _identity: &str, _imports: &BTreeSet<String>) -> bool {
            true
        }
    }

    fn candidate(identity: &str, source: &str) -> PluginCandidate {
        PluginCandidate {
            identity: identity.to_string(),
            path: PathBuf::from(format!("{}.lua", identity)),
            source: source.to_string(),
            discovered_at: Utc::now(),
        }
    }

    fn run(
        temp_dir: &TempDir,
        prompt: Box<dyn TrustPrompt>,
        registry: &mut CommandRegistry,
        candidate: &PluginCandidate,
    ) -> (PluginInstance, Result<(), AdmissionError>) {
        let store = TrustStore::open(temp_dir.path().join("trust.toml")).unwrap();
        let mut trust = TrustManager::new(store, prompt);
        let mut instance = PluginInstance::new(&candidate.identity);
        let result = admit(candidate, &mut instance, &trust, registry, SandboxLimits::default());
        if let Ok(Some(grant)) = &result {
            trust.commit(grant).unwrap();
        }
        (instance, result.map(|_| ()))
    }

    #[test]
    fn test_discover_sorted_lua_files_only() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["b.lua", "a.lua", "notes.txt", ".hidden.lua"] {
            fs::write(temp_dir.path().join(name), "").unwrap();
        }
        fs::create_dir(temp_dir.path().join("dir.lua")).unwrap();

        let found: Vec<String> = discover_candidates(temp_dir.path())
            .unwrap()
            .iter()
            .filter_map(|p| identity_of(p))
            .collect();
        assert_eq!(found, vec!["a", "b"]);
        assert!(discover_candidates(&temp_dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_state_machine() {
        assert!(PluginState::Discovered.can_transition_to(PluginState::Validating));
        assert!(PluginState::TrustPending.can_transition_to(PluginState::Quarantined));
        assert!(!PluginState::Loaded.can_transition_to(PluginState::Validating));
        assert!(!PluginState::Discovered.can_transition_to(PluginState::Loaded));
        assert!(PluginState::Error.is_terminal());
        assert!(!PluginState::Trusted.is_terminal());
    }

    #[test]
    fn test_admit_minimal_plugin() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = CommandRegistry::new();
        let source = r#"--[[ Greeter ]]
function hello(args) return "hi " .. (args[1] or "there") end
function register_commands() return { hello = hello } end
"#;
        let (instance, result) = run(&temp_dir, Box::new(DenyAll), &mut registry, &candidate("greeter", source));
        result.unwrap();
        assert_eq!(instance.state, PluginState::Loaded);
        assert_eq!(instance.commands, vec!["hello"]);
        assert_eq!(instance.description.as_deref(), Some("Greeter"));
        let output = registry.lookup("hello").unwrap().handler.invoke(&["bob".to_string()]).unwrap();
        assert_eq!(output, "hi bob");
    }

    #[test]
    fn test_bare_statement_is_structural() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = CommandRegistry::new();
        let (instance, result) = run(&temp_dir, Box::new(DenyAll), &mut registry, &candidate("bad", "print('x')"));
        let err = result.unwrap_err();
        assert!(matches!(&err, AdmissionError::StructuralViolation(v) if v.kind == ViolationKind::Call));
        assert_eq!(err.terminal_state(), PluginState::Quarantined);
        assert_eq!(instance.state, PluginState::Validating);
    }

    #[test]
    fn test_denied_imports() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = CommandRegistry::new();
        let source = "local json = require('json')\nfunction register_commands() return {} end\n";
        let (_, result) = run(&temp_dir, Box::new(DenyAll), &mut registry, &candidate("j", source));
        assert!(matches!(result.unwrap_err(), AdmissionError::ImportNotTrusted(m) if m == vec!["json"]));
        assert!(!temp_dir.path().join("trust.toml").exists());
    }

    #[test]
    fn test_approved_imports_commit_after_load() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = CommandRegistry::new();
        let source = r#"local json = require("json")
function enc(args) return json.encode(args) end
function register_commands() return { enc = enc } end
"#;
        let (instance, result) = run(&temp_dir, Box::new(AllowAll), &mut registry, &candidate("enc", source));
        result.unwrap();
        assert_eq!(instance.state, PluginState::Loaded);
        let store = TrustStore::open(temp_dir.path().join("trust.toml")).unwrap();
        assert!(store.is_trusted("enc", &["json".to_string()].into_iter().collect()));
        let output = registry.lookup("enc").unwrap().handler.invoke(&["a".to_string()]).unwrap();
        assert_eq!(output, r#"["a"]"#);
    }

    #[test]
    fn test_admit_returns_grant_without_writing_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = TrustStore::open(temp_dir.path().join("trust.toml")).unwrap();
        let trust = TrustManager::new(store, Box::new(AllowAll));
        let mut registry = CommandRegistry::new();
        let mut instance = PluginInstance::new("clock");
        let source = "local time = require('time')\nfunction register_commands() return {} end\n";

        let grant = admit(
            &candidate("clock", source),
            &mut instance,
            &trust,
            &mut registry,
            SandboxLimits::default(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(grant.identity, "clock");
        assert!(grant.imports.contains("time"));
        assert_eq!(instance.state, PluginState::Loaded);
        assert!(!temp_dir.path().join("trust.toml").exists());

        let mut instance = PluginInstance::new("plain");
        let none = admit(
            &candidate("plain", "function register_commands() return {} end\n"),
            &mut instance,
            &trust,
            &mut registry,
            SandboxLimits::default(),
        )
        .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_approval_not_committed_when_load_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = CommandRegistry::new();
        let source = "local json = require('json')\nfunction register_commands() return { sudo = print } end\n";
        let (_, result) = run(&temp_dir, Box::new(AllowAll), &mut registry, &candidate("p", source));
        assert!(matches!(result.unwrap_err(), AdmissionError::ContractViolation(_)));
        assert!(!temp_dir.path().join("trust.toml").exists());
    }

    #[test]
    fn test_unknown_module_fails_without_prompt() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = CommandRegistry::new();
        let source = "local socket = require('socket')\nfunction register_commands() return {} end\n";
        let (_, result) = run(&temp_dir, Box::new(AllowAll), &mut registry, &candidate("s", source));
        let err = result.unwrap_err();
        assert_eq!(err.terminal_state(), PluginState::Error);
    }

    #[test]
    fn test_entry_point_raising_is_load_error() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = CommandRegistry::new();
        let source = "function register_commands() error('nope') end\n";
        let (_, result) = run(&temp_dir, Box::new(DenyAll), &mut registry, &candidate("r", source));
        assert!(matches!(result.unwrap_err(), AdmissionError::LoadExecutionError(_)));
    }

    #[test]
    fn test_invalid_utf8_is_structural() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bin.lua");
        fs::write(&path, [0xff, 0xfe, 0x00]).unwrap();
        assert!(matches!(
            PluginCandidate::read(&path).unwrap_err(),
            AdmissionError::StructuralViolation(_)
        ));
    }
}
