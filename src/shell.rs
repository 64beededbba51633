// ShellGuard - Interactive Shell
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Host shell surface: built-in commands, plugin dispatch and completion

pub mod install;

use crate::plugins::{PluginHost, PluginState};
use install::{install_plugin, Fetcher};
use std::io::{self, Write};
use std::sync::Arc;

pub const PROMPT: &str = "shellguard> ";

/// Built-in commands and their one-line help
pub const BUILTINS: &[(&str, &str)] = &[
    ("help", "Show built-in and plugin commands"),
    ("plugins", "plugins [list|reload|quarantine] - manage plugins"),
    ("install", "install <url> - fetch a .lua plugin and reload"),
    ("exit", "Leave the shell"),
    ("quit", "Leave the shell"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Shell {
    host: Arc<PluginHost>,
    fetcher: Box<dyn Fetcher>,
}

impl Shell {
    pub fn new(host: Arc<PluginHost>, fetcher: Box<dyn Fetcher>) -> Self {
        Self { host, fetcher }
    }

    pub fn host(&self) -> &PluginHost {
        &self.host
    }

    /// Run one input line
    pub fn execute_line(&self, line: &str, out: &mut dyn Write) -> io::Result<Flow> {
        let words = match shell_words::split(line) {
            Ok(words) => words,
            Err(e) => {
                writeln!(out, "shellguard: {}", e)?;
                return Ok(Flow::Continue);
            }
        };
        let Some((name, args)) = words.split_first() else {
            return Ok(Flow::Continue);
        };

        match name.as_str() {
            "exit" | "quit" => return Ok(Flow::Exit),
            "help" => self.help(out)?,
            "plugins" => self.plugins(args, out)?,
            "install" => self.install(args, out)?,
            _ => {
                if !self.dispatch(name, args, out)? {
                    writeln!(out, "{}: command not found", name)?;
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Run a plugin command. Returns whether a plugin owns `name`.
    pub fn dispatch(&self, name: &str, args: &[String], out: &mut dyn Write) -> io::Result<bool> {
        match self.host.dispatch(name, args) {
            None => Ok(false),
            Some(Ok(output)) => {
                out.write_all(output.as_bytes())?;
                if !output.is_empty() && !output.ends_with('\n') {
                    writeln!(out)?;
                }
                Ok(true)
            }
            Some(Err(e)) => {
                crate::log_warn!("Command '{}' failed: {}", name, e);
                writeln!(out, "{}: {}", name, e)?;
                Ok(true)
            }
        }
    }

    /// Built-in and plugin command names starting with `prefix`
    pub fn complete(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = BUILTINS
            .iter()
            .map(|(name, _)| name.to_string())
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.extend(self.host.snapshot().complete(prefix));
        names.sort();
        names.dedup();
        names
    }

    fn help(&self, out: &mut dyn Write) -> io::Result<()> {
        let mut text = String::new();
        text.push_str("ShellGuard - Command Help\n");
        text.push_str(&"=".repeat(60));
        text.push_str("\n\nBUILT-IN COMMANDS:\n");
        text.push_str(&"-".repeat(40));
        text.push('\n');
        for (name, usage) in BUILTINS {
            text.push_str(&format!("{:<20} - {}\n", name, usage));
        }

        let snapshot = self.host.snapshot();
        text.push_str("\nPLUGIN COMMANDS:\n");
        text.push_str(&"-".repeat(40));
        text.push('\n');
        if snapshot.is_empty() {
            text.push_str("(none loaded)\n");
        }
        for entry in snapshot.list() {
            let mut usage = entry.usage.lines();
            let first = usage.next().unwrap_or("");
            text.push_str(&format!("{:<20} - {} [{}]\n", entry.name, first, entry.owner));
            for line in usage {
                text.push_str(&format!("{:<20}   {}\n", "", line));
            }
        }
        out.write_all(text.as_bytes())
    }

    fn plugins(&self, args: &[String], out: &mut dyn Write) -> io::Result<()> {
        match args.first().map(String::as_str) {
            None | Some("list") => self.list_plugins(out),
            Some("reload") => {
                match self.host.reload() {
                    Ok(report) => write!(out, "{}", report)?,
                    Err(e) => writeln!(out, "plugins reload: {}", e)?,
                }
                Ok(())
            }
            Some("quarantine") => self.list_quarantine(out),
            Some(other) => writeln!(
                out,
                "plugins: unknown subcommand '{}' (expected list, reload or quarantine)",
                other
            ),
        }
    }

    fn list_plugins(&self, out: &mut dyn Write) -> io::Result<()> {
        let Some(report) = self.host.last_report() else {
            return writeln!(out, "No plugins have been loaded yet");
        };
        if report.outcomes.is_empty() {
            return writeln!(out, "No plugins in {}", self.host.config().plugin_dir.display());
        }
        for outcome in &report.outcomes {
            let detail = match (&outcome.state, &outcome.reason) {
                (PluginState::Loaded, _) => outcome.commands.join(", "),
                (_, Some(reason)) => reason.clone(),
                (_, None) => String::new(),
            };
            writeln!(out, "{:<20} {:<12} {}", outcome.identity, outcome.state, detail)?;
            if let Some(description) = &outcome.description {
                writeln!(out, "{:<20} {}", "", description.lines().next().unwrap_or(""))?;
            }
        }
        Ok(())
    }

    fn list_quarantine(&self, out: &mut dyn Write) -> io::Result<()> {
        match self.host.quarantine_entries() {
            Ok(entries) if entries.is_empty() => writeln!(out, "Quarantine is empty"),
            Ok(entries) => {
                for entry in entries {
                    writeln!(
                        out,
                        "{}  {}  {}\n    -> {}",
                        entry.timestamp,
                        entry.identity,
                        entry.reason,
                        entry.quarantined_path.display()
                    )?;
                }
                Ok(())
            }
            Err(e) => writeln!(out, "plugins quarantine: {}", e),
        }
    }

    fn install(&self, args: &[String], out: &mut dyn Write) -> io::Result<()> {
        let [url] = args else {
            return writeln!(out, "usage: install <url>");
        };
        let plugin_dir = &self.host.config().plugin_dir;
        match install_plugin(self.fetcher.as_ref(), plugin_dir, url) {
            Ok(path) => {
                writeln!(out, "Installed {}", path.display())?;
                match self.host.reload() {
                    Ok(report) => write!(out, "{}", report),
                    Err(e) => writeln!(out, "plugins reload: {}", e),
                }
            }
            Err(e) => {
                crate::log_warn!("Install from {} failed: {:#}", url, e);
                writeln!(out, "install: {:#}", e)
            }
        }
    }
}

/// Read commands until EOF or `exit`. `read_line` must not hold the input
/// locked between calls: the trust prompt reads from the same terminal.
pub fn run_repl<F>(shell: &Shell, mut read_line: F, out: &mut dyn Write) -> io::Result<()>
where
    F: FnMut(&mut String) -> io::Result<usize>,
{
    let mut line = String::new();
    loop {
        write!(out, "{}", PROMPT)?;
        out.flush()?;

        line.clear();
        if read_line(&mut line)? == 0 {
            writeln!(out)?;
            return Ok(());
        }
        if shell.execute_line(&line, out)? == Flow::Exit {
            return Ok(());
        }
    }
}
