// ShellGuard - Plugin Installer
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! `install <url>`: fetch a plugin file into the plugin directory
//!
//! The download never overwrites an existing plugin and lands atomically, so
//! a reload never sees a partially written file.

use crate::config::{HTTP_TIMEOUT_SECONDS, PLUGIN_EXTENSION};
use anyhow::{Context, Result, anyhow, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Largest plugin file accepted from the network
pub const MAX_PLUGIN_BYTES: usize = 1024 * 1024;

static PLUGIN_STEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("valid plugin name pattern"));

/// Retrieves plugin source text
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &Url) -> Result<String>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .user_agent(format!("shellguard/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &Url) -> Result<String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .with_context(|| format!("Request to {} failed", url))?;

        if !response.status().is_success() {
            bail!("{} returned HTTP {}", url, response.status());
        }
        if response
            .content_length()
            .is_some_and(|length| length > MAX_PLUGIN_BYTES as u64)
        {
            bail!("{} is larger than {} bytes", url, MAX_PLUGIN_BYTES);
        }

        response
            .text()
            .with_context(|| format!("Failed to read response from {}", url))
    }
}

/// Validate an install URL and derive the plugin file name from its last path segment
pub fn plugin_file_name(raw_url: &str) -> Result<(Url, String)> {
    let url = Url::parse(raw_url).with_context(|| format!("Invalid URL '{}'", raw_url))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("Unsupported URL scheme '{}'", url.scheme());
    }

    let file_name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| anyhow!("URL '{}' does not name a file", raw_url))?
        .to_string();

    let stem = file_name
        .strip_suffix(&format!(".{}", PLUGIN_EXTENSION))
        .ok_or_else(|| anyhow!("'{}' is not a .{} file", file_name, PLUGIN_EXTENSION))?;
    if !PLUGIN_STEM_RE.is_match(stem) {
        bail!("'{}' is not a valid plugin name", stem);
    }
    Ok((url, file_name))
}

/// Download a plugin into `plugin_dir`, returning where it landed
pub fn install_plugin(fetcher: &dyn Fetcher, plugin_dir: &Path, raw_url: &str) -> Result<PathBuf> {
    let (url, file_name) = plugin_file_name(raw_url)?;
    let destination = plugin_dir.join(&file_name);
    if destination.exists() {
        bail!("Plugin {} already exists", destination.display());
    }

    crate::log_info!("Installing plugin {} from {}", file_name, url);
    let source = fetcher.fetch(&url)?;
    if source.len() > MAX_PLUGIN_BYTES {
        bail!("{} is larger than {} bytes", url, MAX_PLUGIN_BYTES);
    }

    let mut temp = tempfile::NamedTempFile::new_in(plugin_dir)
        .with_context(|| format!("Failed to create a file in {}", plugin_dir.display()))?;
    temp.write_all(source.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist_noclobber(&destination)
        .map_err(|e| anyhow!("Failed to write {}: {}", destination.display(), e.error))?;

    Ok(destination)
}
