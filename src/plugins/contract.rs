// ShellGuard - register_commands Contract
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Validation of the command map a plugin hands back from `register_commands`
//!
//! The entry point must return a table whose keys are command names and whose
//! values are either handler functions or `{ run = function, usage = "..." }`.
//! One bad entry rejects the whole map.

use crate::config::{is_protected_command, ENTRY_POINT};
use crate::plugins::registry::{CommandEntry, CommandError, CommandHandler};
use crate::plugins::sandbox::{Sandbox, BUDGET_EXCEEDED};
use crate::plugins::validator::SourceOutline;
use mlua::{Function, Table, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

static COMMAND_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,31}$").expect("valid command name pattern"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("register_commands is not defined")]
    MissingEntryPoint,
    #[error("register_commands failed: {0}")]
    EntryPointFailed(String),
    #[error("register_commands returned {0}, expected a table")]
    NotATable(String),
    #[error("command table key of type {0} is not a string")]
    InvalidKey(String),
    #[error("invalid command name '{0}'")]
    InvalidName(String),
    #[error("command name '{0}' is reserved by the shell")]
    ProtectedName(String),
    #[error("handler for '{name}' is a {found}, expected a function")]
    NotCallable { name: String, found: String },
    #[error("usage for '{0}' must be a string")]
    InvalidUsage(String),
}

pub fn is_valid_command_name(name: &str) -> bool {
    COMMAND_NAME_RE.is_match(name)
}

/// A plugin function exposed as a shell command
pub struct LuaCommand {
    sandbox: Arc<Sandbox>,
    function: Function,
    timeout: Duration,
}

impl CommandHandler for LuaCommand {
    fn invoke(&self, args: &[String]) -> Result<String, CommandError> {
        let (returned, mut output) = self
            .sandbox
            .call::<Value>(&self.function, args.to_vec(), self.timeout)
            .map_err(|e| {
                let message = e.to_string();
                if message.contains(BUDGET_EXCEEDED) {
                    CommandError::Timeout
                } else {
                    CommandError::Runtime(message)
                }
            })?;

        match returned {
            Value::Nil => {}
            Value::String(s) => output.push_str(&s.to_string_lossy()),
            Value::Integer(i) => output.push_str(&i.to_string()),
            Value::Number(n) => output.push_str(&n.to_string()),
            Value::Boolean(b) => output.push_str(&b.to_string()),
            other => {
                return Err(CommandError::Runtime(format!(
                    "handler returned a {}",
                    other.type_name()
                )));
            }
        }
        Ok(output)
    }
}

/// Run the entry point and turn its result into registry entries
pub fn collect_commands(
    sandbox: &Arc<Sandbox>,
    outline: &SourceOutline,
) -> Result<Vec<CommandEntry>, ContractError> {
    let entry_point = match sandbox.env().get::<Value>(ENTRY_POINT) {
        Ok(Value::Function(function)) => function,
        _ => return Err(ContractError::MissingEntryPoint),
    };

    let limits = sandbox.limits();
    let (returned, printed) = sandbox
        .call::<Value>(&entry_point, (), limits.load_timeout)
        .map_err(|e| ContractError::EntryPointFailed(e.to_string()))?;
    if !printed.is_empty() {
        crate::log_debug!(
            "Plugin '{}' printed during {}: {}",
            sandbox.identity(),
            ENTRY_POINT,
            printed.trim_end()
        );
    }

    let table = match returned {
        Value::Table(table) => table,
        other => return Err(ContractError::NotATable(other.type_name().to_string())),
    };

    let mut raw = Vec::new();
    for pair in table.pairs::<Value, Value>() {
        let (key, value) = pair.map_err(|e| ContractError::EntryPointFailed(e.to_string()))?;
        let name = match key {
            Value::String(s) => s.to_string_lossy(),
            other => return Err(ContractError::InvalidKey(other.type_name().to_string())),
        };
        raw.push((name, value));
    }
    // Table order is unspecified; sort so the first reported error is stable
    raw.sort_by(|a, b| a.0.cmp(&b.0));

    let mut entries = Vec::with_capacity(raw.len());
    for (name, value) in raw {
        if !is_valid_command_name(&name) {
            return Err(ContractError::InvalidName(name));
        }
        if is_protected_command(&name) {
            return Err(ContractError::ProtectedName(name));
        }
        let (function, usage) = handler_parts(&name, value)?;
        let usage = usage
            .or_else(|| documented_usage(&function, outline))
            .unwrap_or_default();

        entries.push(CommandEntry {
            name,
            owner: sandbox.identity().to_string(),
            usage,
            handler: Arc::new(LuaCommand {
                sandbox: Arc::clone(sandbox),
                function,
                timeout: limits.command_timeout,
            }),
        });
    }
    Ok(entries)
}

fn handler_parts(name: &str, value: Value) -> Result<(Function, Option<String>), ContractError> {
    match value {
        Value::Function(function) => Ok((function, None)),
        Value::Table(spec) => spec_parts(name, &spec),
        other => Err(ContractError::NotCallable {
            name: name.to_string(),
            found: other.type_name().to_string(),
        }),
    }
}

fn spec_parts(name: &str, spec: &Table) -> Result<(Function, Option<String>), ContractError> {
    let function = match spec.raw_get::<Value>("run") {
        Ok(Value::Function(function)) => function,
        Ok(other) => {
            return Err(ContractError::NotCallable {
                name: name.to_string(),
                found: other.type_name().to_string(),
            });
        }
        Err(e) => return Err(ContractError::EntryPointFailed(e.to_string())),
    };
    let usage = match spec.raw_get::<Value>("usage") {
        Ok(Value::Nil) => None,
        Ok(Value::String(s)) => Some(s.to_string_lossy()),
        _ => return Err(ContractError::InvalidUsage(name.to_string())),
    };
    Ok((function, usage))
}

fn documented_usage(function: &Function, outline: &SourceOutline) -> Option<String> {
    let line = function.info().line_defined?;
    outline.function_docs.get(&line).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxLimits;
    use crate::plugins::sandbox::{create_sandbox, TrustTier};
    use crate::plugins::validator::validate_source;

    fn collect(source: &str) -> Result<Vec<CommandEntry>, ContractError> {
        let outline = validate_source(source).expect("source should validate");
        let sandbox = Arc::new(
            create_sandbox("contract", &TrustTier::Minimal, SandboxLimits::default()).unwrap(),
        );
        sandbox.exec(source).unwrap();
        collect_commands(&sandbox, &outline)
    }

    #[test]
    fn test_command_name_pattern() {
        assert!(is_valid_command_name("hello"));
        assert!(is_valid_command_name("git-log_2"));
        assert!(!is_valid_command_name(""));
        assert!(!is_valid_command_name("Hello"));
        assert!(!is_valid_command_name("2fast"));
        assert!(!is_valid_command_name("with space"));
        assert!(!is_valid_command_name(&"a".repeat(33)));
    }

    #[test]
    fn test_valid_map_with_docs_and_usage() {
        let source = r#"
-- Say hello
function hello(args)
    print("hello " .. (args[1] or "world"))
end

function register_commands()
    return {
        hello = hello,
        bye = { run = function(args) return "bye " .. #args end, usage = "bye [names...]" },
    }
end
"#;
        let entries = collect(source).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["bye", "hello"]);
        assert_eq!(entries[0].usage, "bye [names...]");
        assert_eq!(entries[1].usage, "Say hello");
        assert_eq!(entries[1].owner, "contract");

        let output = entries[1].handler.invoke(&["rust".to_string()]).unwrap();
        assert_eq!(output, "hello rust\n");
        let output = entries[0].handler.invoke(&["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(output, "bye 2");
    }

    #[test]
    fn test_empty_map_is_accepted() {
        let entries = collect("function register_commands() return {} end").unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_missing_entry_point() {
        assert_eq!(
            collect("function other() end").unwrap_err(),
            ContractError::MissingEntryPoint
        );
    }

    #[test]
    fn test_wrong_return_shape() {
        assert_eq!(
            collect("function register_commands() return 'nope' end").unwrap_err(),
            ContractError::NotATable("string".to_string())
        );
        assert!(matches!(
            collect("function register_commands() return { 'positional' } end").unwrap_err(),
            ContractError::InvalidKey(_)
        ));
        assert!(matches!(
            collect("function register_commands() return { hello = 42 } end").unwrap_err(),
            ContractError::NotCallable { .. }
        ));
    }

    #[test]
    fn test_protected_name_rejects_everything() {
        let source = r#"
function ok() return "fine" end
function register_commands()
    return { ok = ok, sudo = ok }
end
"#;
        assert_eq!(
            collect(source).unwrap_err(),
            ContractError::ProtectedName("sudo".to_string())
        );
    }

    #[test]
    fn test_entry_point_raising() {
        let err = collect("function register_commands() error('boom') end").unwrap_err();
        assert!(matches!(err, ContractError::EntryPointFailed(msg) if msg.contains("boom")));
    }

    #[test]
    fn test_handler_runtime_error_is_reported() {
        let source = r#"
function fail(args) error("bad input") end
function register_commands() return { fail = fail } end
"#;
        let entries = collect(source).unwrap();
        let err = entries[0].handler.invoke(&[]).unwrap_err();
        assert!(matches!(err, CommandError::Runtime(msg) if msg.contains("bad input")));
    }
}
