use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Directory layout under the shell home
pub const DEFAULT_HOME_DIR: &str = ".shellguard";
pub const HOME_ENV_VAR: &str = "SHELLGUARD_HOME";
pub const PLUGIN_DIR_NAME: &str = "plugins";
pub const QUARANTINE_DIR_NAME: &str = "quarantine";
pub const TRUST_FILE_NAME: &str = "trust.toml";
pub const QUARANTINE_LOG_NAME: &str = "quarantine.log";
pub const CONFIG_FILE_NAME: &str = "config.toml";

pub const PLUGIN_EXTENSION: &str = "lua";

/// Global function every plugin must define
pub const ENTRY_POINT: &str = "register_commands";

// Sandbox budgets
pub const DEFAULT_LOAD_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MEMORY_LIMIT_MB: usize = 32;
/// Instructions between two budget checks in the Lua hook
pub const HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;
/// Cap on `print` output buffered for one load or command
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// HTTP timeout for the sanctioned `http` module and `install`
pub const HTTP_TIMEOUT_SECONDS: u64 = 10;

/// Command names plugins may never claim
pub const PROTECTED_COMMANDS: &[&str] = &[
    "cat", "cd", "chmod", "chown", "clear", "cp", "curl", "exit", "help", "history", "install",
    "ls", "mv", "pip", "plugins", "python", "python3", "quit", "rm", "shellguard", "ssh", "su",
    "sudo", "wget",
];

pub fn is_protected_command(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    PROTECTED_COMMANDS.contains(&lowered.as_str())
}

#[derive(Parser, Debug)]
#[command(author, version, about = "An interactive shell with sandboxed Lua plugins")]
pub struct Cli {
    /// Shell home directory (default: $SHELLGUARD_HOME or ~/.shellguard)
    #[arg(long)]
    pub home: Option<PathBuf>,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,

    /// Emit logs in journald format
    #[arg(long)]
    pub journald: bool,

    /// Deny every import trust request without prompting
    #[arg(long)]
    pub deny_imports: bool,

    /// Run a single command and exit
    #[arg(short = 'c', long = "command")]
    pub command: Option<String>,
}

/// Optional `config.toml` in the shell home
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub sandbox: SandboxSection,
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub load_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub memory_limit_mb: usize,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            load_timeout_ms: DEFAULT_LOAD_TIMEOUT_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
        }
    }
}

/// Resource limits applied to every plugin VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub load_timeout: Duration,
    pub command_timeout: Duration,
    pub memory_limit_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        SandboxSection::default().into()
    }
}

impl From<SandboxSection> for SandboxLimits {
    fn from(section: SandboxSection) -> Self {
        Self {
            load_timeout: Duration::from_millis(section.load_timeout_ms.max(1)),
            command_timeout: Duration::from_millis(section.command_timeout_ms.max(1)),
            memory_limit_bytes: section.memory_limit_mb.max(1) * 1024 * 1024,
        }
    }
}

/// Fully resolved host configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub home: PathBuf,
    pub plugin_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub trust_file: PathBuf,
    pub quarantine_log: PathBuf,
    pub limits: SandboxLimits,
}

impl HostConfig {
    /// Standard layout rooted at `home` with default limits
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            plugin_dir: home.join(PLUGIN_DIR_NAME),
            quarantine_dir: home.join(QUARANTINE_DIR_NAME),
            trust_file: home.join(TRUST_FILE_NAME),
            quarantine_log: home.join(QUARANTINE_LOG_NAME),
            limits: SandboxLimits::default(),
            home,
        }
    }

    /// Resolve home from CLI, environment, then `$HOME`, and apply `config.toml`
    pub fn resolve(cli_home: Option<&Path>) -> anyhow::Result<(Self, FileConfig)> {
        let home = match cli_home {
            Some(path) => path.to_path_buf(),
            None => default_home()?,
        };
        let file_config = load_file_config(&home.join(CONFIG_FILE_NAME))?;
        let mut config = Self::with_home(home);
        config.limits = file_config.sandbox.clone().into();
        Ok((config, file_config))
    }
}

fn default_home() -> anyhow::Result<PathBuf> {
    if let Ok(home) = std::env::var(HOME_ENV_VAR) {
        if !home.trim().is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    let user_home = std::env::var("HOME")
        .map_err(|_| anyhow::anyhow!("HOME is not set; pass --home or set {}", HOME_ENV_VAR))?;
    Ok(PathBuf::from(user_home).join(DEFAULT_HOME_DIR))
}

fn load_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    toml::from_str(&content).map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_protected_commands_case_insensitive() {
        assert!(is_protected_command("sudo"));
        assert!(is_protected_command("SUDO"));
        assert!(is_protected_command("plugins"));
        assert!(!is_protected_command("hello"));
    }

    #[test]
    fn test_layout_under_home() {
        let config = HostConfig::with_home("/tmp/sg");
        assert_eq!(config.plugin_dir, PathBuf::from("/tmp/sg/plugins"));
        assert_eq!(config.quarantine_dir, PathBuf::from("/tmp/sg/quarantine"));
        assert_eq!(config.trust_file, PathBuf::from("/tmp/sg/trust.toml"));
        assert_eq!(config.limits, SandboxLimits::default());
    }

    #[test]
    fn test_config_file_overrides_limits() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join(CONFIG_FILE_NAME),
            "[sandbox]\nload_timeout_ms = 500\nmemory_limit_mb = 8\n",
        )
        .unwrap();

        let (config, file) = HostConfig::resolve(Some(temp_dir.path())).unwrap();
        assert_eq!(config.limits.load_timeout, Duration::from_millis(500));
        assert_eq!(config.limits.command_timeout, Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS));
        assert_eq!(config.limits.memory_limit_bytes, 8 * 1024 * 1024);
        assert!(!file.debug);
    }

    #[test]
    fn test_invalid_config_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(CONFIG_FILE_NAME), "[sandbox\n").unwrap();
        assert!(HostConfig::resolve(Some(temp_dir.path())).is_err());
    }
}
