// ShellGuard - Plugin Host
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reload controller and the live command table
//!
//! A reload builds a brand new [`CommandRegistry`] off to the side and swaps
//! it in only once every candidate reached a terminal state. Dispatch clones
//! the current snapshot `Arc`, so a command always runs against one
//! generation. Only one reload runs at a time; the reload lock also guards
//! the trust store and the quarantine directory.

use crate::config::HostConfig;
use crate::core::logger::{log_task_complete_with_details, log_task_failed, log_task_start};
use crate::plugins::loader::{
    admit, discover_candidates, identity_of, AdmissionError, PluginCandidate, PluginInstance,
    PluginState,
};
use crate::plugins::quarantine::{QuarantineEntry, QuarantineError, QuarantineManager};
use crate::plugins::registry::{CommandError, CommandRegistry};
use crate::plugins::trust::{PendingGrant, TrustManager, TrustPrompt, TrustStore, TrustStoreError};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Conditions that must stop the shell from starting
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    TrustStore(#[from] TrustStoreError),
    #[error(transparent)]
    Quarantine(#[from] QuarantineError),
    #[error("plugin directory {path}: {source}")]
    PluginDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("a plugin reload is already in progress")]
    InProgress,
    #[error("failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    TrustStore(#[from] TrustStoreError),
    #[error(transparent)]
    Quarantine(#[from] QuarantineError),
}

/// Terminal result for one plugin in a reload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginOutcome {
    pub identity: String,
    pub state: PluginState,
    pub reason: Option<String>,
    pub description: Option<String>,
    pub commands: Vec<String>,
    pub quarantined_to: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ReloadReport {
    pub generation: u64,
    pub outcomes: Vec<PluginOutcome>,
    pub elapsed: Duration,
}

impl ReloadReport {
    pub fn outcome(&self, identity: &str) -> Option<&PluginOutcome> {
        self.outcomes.iter().find(|outcome| outcome.identity == identity)
    }

    pub fn count(&self, state: PluginState) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.state == state).count()
    }
}

impl fmt::Display for ReloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Reload #{}: {} loaded, {} quarantined, {} failed",
            self.generation,
            self.count(PluginState::Loaded),
            self.count(PluginState::Quarantined),
            self.count(PluginState::Error)
        )?;
        for outcome in &self.outcomes {
            write!(f, "  {:<20} {:<12}", outcome.identity, outcome.state)?;
            match &outcome.reason {
                Some(reason) => write!(f, " {}", reason)?,
                None if outcome.commands.is_empty() => write!(f, " (no commands)")?,
                None => write!(f, " {}", outcome.commands.join(", "))?,
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

struct ReloadState {
    trust: TrustManager,
    quarantine: QuarantineManager,
    generation: u64,
}

pub struct PluginHost {
    config: HostConfig,
    live: RwLock<Arc<CommandRegistry>>,
    last_report: RwLock<Option<ReloadReport>>,
    quarantine_log: QuarantineManager,
    reload_lock: Mutex<ReloadState>,
}

impl PluginHost {
    /// Prepare the plugin, trust and quarantine locations. Nothing is loaded
    /// until the first [`PluginHost::reload`].
    pub fn open(config: HostConfig, prompt: Box<dyn TrustPrompt>) -> Result<Self, HostError> {
        std::fs::create_dir_all(&config.plugin_dir).map_err(|source| HostError::PluginDir {
            path: config.plugin_dir.clone(),
            source,
        })?;

        let store = TrustStore::open(&config.trust_file)?;
        store.check_writable()?;
        let quarantine = QuarantineManager::open(&config.quarantine_dir, &config.quarantine_log)?;

        crate::log_info!(
            "Plugin host ready (plugins: {}, quarantine: {})",
            config.plugin_dir.display(),
            config.quarantine_dir.display()
        );

        Ok(Self {
            live: RwLock::new(Arc::new(CommandRegistry::new())),
            last_report: RwLock::new(None),
            quarantine_log: quarantine.clone(),
            reload_lock: Mutex::new(ReloadState {
                trust: TrustManager::new(store, prompt),
                quarantine,
                generation: 0,
            }),
            config,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The registry snapshot currently serving dispatch
    pub fn snapshot(&self) -> Arc<CommandRegistry> {
        self.live.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last_report(&self) -> Option<ReloadReport> {
        self.last_report.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn quarantine_entries(&self) -> Result<Vec<QuarantineEntry>, QuarantineError> {
        self.quarantine_log.entries()
    }

    /// Run a plugin command. `None` when no plugin owns `name`.
    pub fn dispatch(&self, name: &str, args: &[String]) -> Option<Result<String, CommandError>> {
        let snapshot = self.snapshot();
        let entry = snapshot.lookup(name)?;
        crate::log_debug!("Dispatching '{}' to plugin '{}'", name, entry.owner);
        Some(entry.handler.invoke(args))
    }

    /// Re-scan the plugin directory and publish a new registry snapshot
    pub fn reload(&self) -> Result<ReloadReport, ReloadError> {
        let mut state = match self.reload_lock.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => return Err(ReloadError::InProgress),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        state.generation += 1;
        let generation = state.generation;
        let task = format!("Plugin reload #{}", generation);
        log_task_start(&task);

        let result = self
            .rebuild(&mut state, generation)
            .and_then(|(registry, report, grants)| {
                // Approvals land only once the whole reload has succeeded
                for grant in &grants {
                    state.trust.commit(grant)?;
                }
                Ok((registry, report))
            });

        match result {
            Ok((registry, report)) => {
                *self.live.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(registry);
                *self.last_report.write().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
                log_task_complete_with_details(
                    &task,
                    &format!(
                        "{} loaded, {} rejected",
                        report.count(PluginState::Loaded),
                        report.outcomes.len() - report.count(PluginState::Loaded)
                    ),
                );
                Ok(report)
            }
            Err(e) => {
                log_task_failed(&task, &e.to_string());
                Err(e)
            }
        }
    }

    fn rebuild(
        &self,
        state: &mut ReloadState,
        generation: u64,
    ) -> Result<(CommandRegistry, ReloadReport, Vec<PendingGrant>), ReloadError> {
        let started = Instant::now();
        state.quarantine.check_writable()?;

        let plugin_dir = &self.config.plugin_dir;
        let paths = discover_candidates(plugin_dir).map_err(|source| ReloadError::Scan {
            path: plugin_dir.clone(),
            source,
        })?;

        let mut registry = CommandRegistry::new();
        let mut outcomes = Vec::with_capacity(paths.len());
        let mut grants = Vec::new();
        for path in paths {
            let identity = identity_of(&path).unwrap_or_default();
            let mut instance = PluginInstance::new(identity.as_str());

            let result = PluginCandidate::read(&path).and_then(|candidate| {
                admit(
                    &candidate,
                    &mut instance,
                    &state.trust,
                    &mut registry,
                    self.config.limits,
                )
            });

            let outcome = match result {
                Ok(grant) => {
                    grants.extend(grant);
                    crate::log_info!(
                        "Loaded plugin '{}' ({} command(s))",
                        identity,
                        instance.commands.len()
                    );
                    PluginOutcome {
                        identity,
                        state: PluginState::Loaded,
                        reason: None,
                        description: instance.description,
                        commands: instance.commands,
                        quarantined_to: None,
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    crate::log_warn!("Rejected plugin '{}': {}", identity, reason);
                    let quarantined_to = match &e {
                        // Nothing to move when the file could not be read
                        AdmissionError::Unreadable(_) => None,
                        _ => Some(state.quarantine.quarantine(&identity, &path, &reason)?.quarantined_path),
                    };
                    instance.advance(e.terminal_state());
                    PluginOutcome {
                        identity,
                        state: instance.state,
                        reason: Some(reason),
                        description: instance.description,
                        commands: Vec::new(),
                        quarantined_to,
                    }
                }
            };
            debug_assert!(outcome.state.is_terminal());
            outcomes.push(outcome);
        }

        let report = ReloadReport {
            generation,
            outcomes,
            elapsed: started.elapsed(),
        };
        Ok((registry, report, grants))
    }
}
