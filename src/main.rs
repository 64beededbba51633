/*
 * ShellGuard - Interactive shell with sandboxed Lua plugins
 * Copyright (C) 2025 Akaere Networks
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;

use shellguard::config::{Cli, HostConfig};
use shellguard::core::logger::{self, LogLevel};
use shellguard::plugins::{DenyAll, PluginHost, StdinPrompt, TrustPrompt};
use shellguard::shell::install::HttpFetcher;
use shellguard::shell::{run_repl, Flow, Shell};
use shellguard::{log_error, log_info};

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Cli::parse();

    logger::init_from_args(args.debug, args.journald)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    let (config, file_config) = HostConfig::resolve(args.home.as_deref())?;
    if file_config.debug && !args.debug {
        logger::set_global_level(LogLevel::Debug);
    }
    log_info!("Using shell home {}", config.home.display());

    let interactive = atty::is(atty::Stream::Stdin);
    let prompt: Box<dyn TrustPrompt> = if args.deny_imports || !interactive {
        Box::new(DenyAll)
    } else {
        Box::new(StdinPrompt)
    };

    // Trust store corruption or an unwritable quarantine stops startup
    let host = match PluginHost::open(config, prompt) {
        Ok(host) => host,
        Err(e) => {
            log_error!("Cannot start plugin host: {}", e);
            return Err(e).context("startup blocked");
        }
    };
    let report = host.reload().context("initial plugin load failed")?;
    if args.command.is_none() {
        eprint!("{}", report);
    }

    let fetcher = HttpFetcher::new()?;
    let shell = Shell::new(Arc::new(host), Box::new(fetcher));

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match args.command {
        Some(command) => {
            if shell.execute_line(&command, &mut out)? == Flow::Exit {
                log_info!("Exit requested by -c command");
            }
        }
        None => run_repl(&shell, |line| std::io::stdin().read_line(line), &mut out)?,
    }
    out.flush()?;
    Ok(())
}
