//! Registry of plugin-provided shell commands
//!
//! A registry is built fresh on every reload and published as an immutable
//! snapshot, so the dispatcher never observes a half-populated table.

use crate::config::is_protected_command;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by a command handler at invocation time
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Runtime(String),
    #[error("command timed out")]
    Timeout,
}

/// Something the dispatcher can invoke with the words after the command name
pub trait CommandHandler: Send + Sync {
    fn invoke(&self, args: &[String]) -> Result<String, CommandError>;
}

impl<F> CommandHandler for F
where
    F: Fn(&[String]) -> Result<String, CommandError> + Send + Sync,
{
    fn invoke(&self, args: &[String]) -> Result<String, CommandError> {
        self(args)
    }
}

#[derive(Clone)]
pub struct CommandEntry {
    pub name: String,
    /// Plugin identity that registered the command
    pub owner: String,
    pub usage: String,
    pub handler: Arc<dyn CommandHandler>,
}

impl std::fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEntry")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command '{name}' is already registered by plugin '{owner}'")]
    Collision { name: String, owner: String },
    #[error("command '{0}' is reserved by the shell")]
    Protected(String),
    #[error("command '{0}' is declared twice")]
    Duplicate(String),
}

#[derive(Debug, Default, Clone)]
pub struct CommandRegistry {
    commands: BTreeMap<String, CommandEntry>,
    plugins: BTreeSet<String>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every command of one plugin, or none of them
    pub fn register_plugin(
        &mut self,
        owner: &str,
        entries: Vec<CommandEntry>,
    ) -> Result<usize, RegistryError> {
        let mut seen = BTreeSet::new();
        for entry in &entries {
            if is_protected_command(&entry.name) {
                return Err(RegistryError::Protected(entry.name.clone()));
            }
            if let Some(existing) = self.commands.get(&entry.name) {
                return Err(RegistryError::Collision {
                    name: entry.name.clone(),
                    owner: existing.owner.clone(),
                });
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(RegistryError::Duplicate(entry.name.clone()));
            }
        }

        let count = entries.len();
        for entry in entries {
            crate::log_debug!("Registered command '{}' from plugin '{}'", entry.name, owner);
            self.commands.insert(entry.name.clone(), entry);
        }
        self.plugins.insert(owner.to_string());
        Ok(count)
    }

    pub fn lookup(&self, name: &str) -> Option<&CommandEntry> {
        self.commands.get(name)
    }

    /// All commands, sorted by name
    pub fn list(&self) -> impl Iterator<Item = &CommandEntry> {
        self.commands.values()
    }

    /// Command names starting with `prefix`
    pub fn complete(&self, prefix: &str) -> Vec<String> {
        self.commands
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Identities of plugins with at least a registration in this snapshot
    pub fn plugins(&self) -> &BTreeSet<String> {
        &self.plugins
    }

    pub fn commands_of<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a CommandEntry> + 'a {
        self.commands.values().filter(move |entry| entry.owner == owner)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, owner: &str) -> CommandEntry {
        let reply = format!("{} from {}", name, owner);
        CommandEntry {
            name: name.to_string(),
            owner: owner.to_string(),
            usage: String::new(),
            handler: Arc::new(move |_: &[String]| -> Result<String, CommandError> {
                Ok(reply.clone())
            }),
        }
    }

    #[test]
    fn test_registry_empty() {
        let registry = CommandRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.lookup("hello").is_none());
        assert!(registry.complete("").is_empty());
    }

    #[test]
    fn test_register_and_invoke() {
        let mut registry = CommandRegistry::new();
        let count = registry
            .register_plugin("greeter", vec![entry("hello", "greeter"), entry("bye", "greeter")])
            .unwrap();
        assert_eq!(count, 2);

        let hello = registry.lookup("hello").unwrap();
        assert_eq!(hello.handler.invoke(&[]).unwrap(), "hello from greeter");
        let names: Vec<&str> = registry.list().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["bye", "hello"]);
        assert!(registry.plugins().contains("greeter"));
    }

    #[test]
    fn test_collision_rejects_whole_plugin() {
        let mut registry = CommandRegistry::new();
        registry.register_plugin("a", vec![entry("hello", "a")]).unwrap();

        let err = registry
            .register_plugin("b", vec![entry("world", "b"), entry("hello", "b")])
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Collision {
                name: "hello".to_string(),
                owner: "a".to_string()
            }
        );
        assert!(registry.lookup("world").is_none());
        assert_eq!(registry.lookup("hello").unwrap().owner, "a");
        assert!(!registry.plugins().contains("b"));
    }

    #[test]
    fn test_protected_names_rejected() {
        let mut registry = CommandRegistry::new();
        let err = registry
            .register_plugin("evil", vec![entry("fine", "evil"), entry("Sudo", "evil")])
            .unwrap_err();
        assert_eq!(err, RegistryError::Protected("Sudo".to_string()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_within_plugin() {
        let mut registry = CommandRegistry::new();
        let err = registry
            .register_plugin("p", vec![entry("x", "p"), entry("x", "p")])
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("x".to_string()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_complete_by_prefix() {
        let mut registry = CommandRegistry::new();
        registry
            .register_plugin(
                "p",
                vec![entry("weather", "p"), entry("web", "p"), entry("hello", "p")],
            )
            .unwrap();
        assert_eq!(registry.complete("we"), vec!["weather", "web"]);
        assert_eq!(registry.complete("wea"), vec!["weather"]);
        assert!(registry.complete("z").is_empty());
        assert_eq!(registry.commands_of("p").count(), 3);
    }
}
