//! # ShellGuard
//!
//! An interactive command shell that can be extended with Lua plugins without
//! handing them the keys to the host session.
//!
//! Every plugin file is admitted through a fixed pipeline before any of its
//! commands become callable:
//! - static validation of the plugin's top level
//! - operator approval for declared imports, persisted across restarts
//! - execution in an allow-listed Lua sandbox with time and memory budgets
//! - validation of the command map returned by `register_commands()`
//! - all-or-nothing merge into an atomically swapped command table
//!
//! Rejected plugins are moved to a quarantine directory with a logged reason.
//!
//! ## Library usage
//!
//! ```no_run
//! use shellguard::config::HostConfig;
//! use shellguard::plugins::{DenyAll, PluginHost};
//!
//! fn main() -> anyhow::Result<()> {
//!     let host = PluginHost::open(HostConfig::with_home("/tmp/shellguard"), Box::new(DenyAll))?;
//!     let report = host.reload()?;
//!     print!("{}", report);
//!
//!     if let Some(output) = host.dispatch("hello", &["world".to_string()]) {
//!         println!("{}", output?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod plugins;
pub mod shell;

pub use plugins::{PluginHost, ReloadReport};
pub use shell::Shell;
