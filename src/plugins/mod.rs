//! Plugin admission and sandboxing pipeline
//!
//! Plugins are single Lua files in the plugin directory. On every reload each
//! file goes through:
//!
//! 1. `validator` - static check that the top level only holds imports,
//!    function definitions, static tables and a leading doc comment
//! 2. `trust` - operator approval for declared imports, persisted in `trust.toml`
//! 3. `sandbox` - execution in a fresh Lua VM with an allow-listed environment
//! 4. `contract` - validation of the `register_commands()` command map
//! 5. `registry` - merge into the next command table snapshot
//!
//! Any failure quarantines that plugin (`quarantine`) and the reload moves on.
//! `host` owns the live snapshot and swaps it atomically.
//!
//! # Plugin API
//!
//! ```lua
//! --[[ Greeter plugin ]]
//! local json = require("json")
//!
//! -- usage: hello [name]
//! function hello(args)
//!     print("hello " .. (args[1] or "world"))
//! end
//!
//! function register_commands()
//!     return { hello = hello }
//! end
//! ```

pub mod api;
pub mod contract;
pub mod host;
pub mod lexer;
pub mod loader;
pub mod quarantine;
pub mod registry;
pub mod sandbox;
pub mod trust;
pub mod validator;

pub use host::{HostError, PluginHost, PluginOutcome, ReloadError, ReloadReport};
pub use loader::{PluginInstance, PluginState};
pub use registry::{CommandEntry, CommandError, CommandHandler, CommandRegistry};
pub use trust::{DenyAll, StdinPrompt, TrustPrompt};
pub use validator::{validate_source, SourceOutline, Violation, ViolationKind};
