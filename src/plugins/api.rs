//! Host modules a trusted plugin may `require`
//!
//! A plugin only ever sees the modules it declared at its top level and the
//! operator approved. The catalog:
//! - `json`: `encode(value)`, `decode(text)`
//! - `http`: `get(url)` returning `{ status, body }` (http/https only)
//! - `time`: `now()`, `unix()`, `format(pattern)`
//! - `env`: `get(name)`
//! - `fs`: read-only `read(path)`, `exists(path)`, `list(dir)`
//! - `process`: `run(program, args)` returning `{ code, stdout, stderr }`, no shell
//!
//! The logging table is not a module: every plugin gets `log.info/warn/error`.

use crate::config::HTTP_TIMEOUT_SECONDS;
use mlua::{Lua, LuaSerdeExt, Table, Value};
use std::fmt::Write as _;
use std::time::Duration;

pub const SANCTIONED_MODULES: &[&str] = &["env", "fs", "http", "json", "process", "time"];

/// Upper bound for `fs.read`
const MAX_READ_BYTES: u64 = 4 * 1024 * 1024;

pub fn is_sanctioned(module: &str) -> bool {
    SANCTIONED_MODULES.contains(&module)
}

/// Build a catalog module, or `None` when the name is not sanctioned
pub fn build_module(lua: &Lua, name: &str) -> mlua::Result<Option<Table>> {
    let module = match name {
        "env" => env_module(lua)?,
        "fs" => fs_module(lua)?,
        "http" => http_module(lua)?,
        "json" => json_module(lua)?,
        "process" => process_module(lua)?,
        "time" => time_module(lua)?,
        _ => return Ok(None),
    };
    Ok(Some(module))
}

/// Register the `log` table in a plugin environment
pub fn register_logging_api(lua: &Lua, env: &Table, identity: &str) -> mlua::Result<()> {
    let log = lua.create_table()?;

    let plugin = identity.to_string();
    log.set(
        "info",
        lua.create_function(move |_, msg: String| {
            crate::log_info!("[plugin:{}] {}", plugin, msg);
            Ok(())
        })?,
    )?;

    let plugin = identity.to_string();
    log.set(
        "warn",
        lua.create_function(move |_, msg: String| {
            crate::log_warn!("[plugin:{}] {}", plugin, msg);
            Ok(())
        })?,
    )?;

    let plugin = identity.to_string();
    log.set(
        "error",
        lua.create_function(move |_, msg: String| {
            crate::log_error!("[plugin:{}] {}", plugin, msg);
            Ok(())
        })?,
    )?;

    env.set("log", log)?;
    Ok(())
}

fn json_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "encode",
        lua.create_function(|_, value: Value| {
            serde_json::to_string(&value)
                .map_err(|e| mlua::Error::runtime(format!("json.encode failed: {}", e)))
        })?,
    )?;
    module.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let parsed: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| mlua::Error::runtime(format!("json.decode failed: {}", e)))?;
            lua.to_value(&parsed)
        })?,
    )?;
    Ok(module)
}

fn http_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    let user_agent = format!("shellguard-plugin/{}", env!("CARGO_PKG_VERSION"));

    let get = lua.create_function(move |lua, url: String| {
        let url = checked_http_url(&url)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .user_agent(user_agent.as_str())
            .build()
            .map_err(|e| mlua::Error::runtime(format!("Failed to create HTTP client: {}", e)))?;

        let response = client
            .get(url)
            .send()
            .map_err(|e| mlua::Error::runtime(format!("HTTP request failed: {}", e)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| mlua::Error::runtime(format!("Failed to read response body: {}", e)))?;

        let result = lua.create_table()?;
        result.set("status", status)?;
        result.set("body", body)?;
        Ok(result)
    })?;

    module.set("get", get)?;
    Ok(module)
}

/// Only absolute http(s) URLs with a host are allowed
fn checked_http_url(raw: &str) -> mlua::Result<url::Url> {
    let parsed = url::Url::parse(raw).map_err(|e| mlua::Error::runtime(format!("Invalid URL: {}", e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(mlua::Error::runtime(format!(
            "Unsupported URL scheme '{}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(mlua::Error::runtime("URL has no host"));
    }
    Ok(parsed)
}

fn time_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "now",
        lua.create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))?,
    )?;
    module.set(
        "unix",
        lua.create_function(|_, ()| Ok(chrono::Utc::now().timestamp()))?,
    )?;
    module.set(
        "format",
        lua.create_function(|_, pattern: String| {
            let mut out = String::new();
            write!(out, "{}", chrono::Local::now().format(&pattern))
                .map_err(|_| mlua::Error::runtime(format!("Invalid time format '{}'", pattern)))?;
            Ok(out)
        })?,
    )?;
    Ok(module)
}

fn env_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "get",
        lua.create_function(|_, key: String| Ok(std::env::var(&key).ok()))?,
    )?;
    Ok(module)
}

fn fs_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "read",
        lua.create_function(|_, path: String| {
            let metadata = std::fs::metadata(&path)
                .map_err(|e| mlua::Error::runtime(format!("fs.read {}: {}", path, e)))?;
            if metadata.len() > MAX_READ_BYTES {
                return Err(mlua::Error::runtime(format!("fs.read {}: file too large", path)));
            }
            std::fs::read_to_string(&path)
                .map_err(|e| mlua::Error::runtime(format!("fs.read {}: {}", path, e)))
        })?,
    )?;
    module.set(
        "exists",
        lua.create_function(|_, path: String| Ok(std::path::Path::new(&path).exists()))?,
    )?;
    module.set(
        "list",
        lua.create_function(|_, path: String| {
            let entries = std::fs::read_dir(&path)
                .map_err(|e| mlua::Error::runtime(format!("fs.list {}: {}", path, e)))?;
            let mut names: Vec<String> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            Ok(names)
        })?,
    )?;
    Ok(module)
}

fn process_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "run",
        lua.create_function(|lua, (program, args): (String, Option<Vec<String>>)| {
            let output = std::process::Command::new(&program)
                .args(args.unwrap_or_default())
                .output()
                .map_err(|e| mlua::Error::runtime(format!("process.run {}: {}", program, e)))?;

            let result = lua.create_table()?;
            result.set("code", output.status.code())?;
            result.set("stdout", String::from_utf8_lossy(&output.stdout).into_owned())?;
            result.set("stderr", String::from_utf8_lossy(&output.stderr).into_owned())?;
            Ok(result)
        })?,
    )?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_builds_every_sanctioned_module() {
        let lua = Lua::new();
        for name in SANCTIONED_MODULES {
            assert!(build_module(&lua, name).unwrap().is_some(), "{} missing", name);
        }
        assert!(build_module(&lua, "socket").unwrap().is_none());
        assert!(!is_sanctioned("os"));
    }

    #[test]
    fn test_json_round_trip_through_lua() {
        let lua = Lua::new();
        let json = build_module(&lua, "json").unwrap().unwrap();
        lua.globals().set("json", json).unwrap();
        let name: String = lua
            .load(r#"return json.decode('{"name":"shell","tags":[1,2]}').name"#)
            .eval()
            .unwrap();
        assert_eq!(name, "shell");
        let encoded: String = lua.load(r#"return json.encode({ ok = true })"#).eval().unwrap();
        assert_eq!(encoded, r#"{"ok":true}"#);
        assert!(lua.load("return json.decode('{oops')").eval::<Value>().is_err());
    }

    #[test]
    fn test_http_url_checks() {
        assert_eq!(
            checked_http_url("https://wttr.in/Berlin").unwrap().host_str(),
            Some("wttr.in")
        );
        assert!(checked_http_url("file:///etc/passwd").is_err());
        assert!(checked_http_url("not a url").is_err());
    }

    #[test]
    fn test_fs_module_is_read_only() {
        let lua = Lua::new();
        let fs = build_module(&lua, "fs").unwrap().unwrap();
        assert!(fs.contains_key("read").unwrap());
        assert!(!fs.contains_key("write").unwrap());
        assert!(!fs.contains_key("remove").unwrap());
    }

    #[test]
    fn test_time_format_rejects_bad_patterns() {
        let lua = Lua::new();
        lua.globals()
            .set("time", build_module(&lua, "time").unwrap().unwrap())
            .unwrap();
        let year: String = lua.load("return time.format('%Y')").eval().unwrap();
        assert_eq!(year.len(), 4);
        assert!(lua.load("return time.format('%Q')").eval::<String>().is_err());
    }
}
