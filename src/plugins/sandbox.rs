//! Restricted execution environment for admitted plugins
//!
//! Every plugin gets its own Lua VM. The chunk never sees the VM globals: it
//! runs in a fresh environment table filled from an explicit allow-list, so a
//! primitive that is not listed here does not exist for the plugin.
//!
//! Two capability tiers:
//! - minimal: safe base functions, `string`/`table`/`math`/`utf8`/`coroutine`,
//!   a captured `print`, the `log` table and a `require` that resolves nothing
//! - extended: the same, plus `require` resolving the approved sanctioned modules
//!
//! `load`, `dofile`, `loadfile`, `collectgarbage`, `debug`, `os`, `io` and
//! `package` are unavailable in both tiers, and chunks are loaded as text only.
//!
//! Loads and commands run under a wall-clock budget enforced by an instruction
//! hook. Once the deadline has passed, `pcall`, `xpcall`, `coroutine.resume`
//! and `coroutine.close` re-raise instead of returning, so a plugin cannot
//! catch its way past the budget.

use crate::config::{SandboxLimits, HOOK_INSTRUCTION_INTERVAL, MAX_OUTPUT_BYTES};
use crate::plugins::api::{build_module, register_logging_api};
use mlua::{
    ChunkMode, FromLuaMulti, Function, HookTriggers, IntoLuaMulti, Lua, LuaOptions, StdLib, Table,
    Value, Variadic, VmState,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Base functions copied into every plugin environment
pub const SAFE_GLOBALS: &[&str] = &[
    "assert",
    "error",
    "getmetatable",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "rawequal",
    "rawget",
    "rawlen",
    "rawset",
    "select",
    "setmetatable",
    "tonumber",
    "tostring",
    "type",
    "xpcall",
    "_VERSION",
];

/// Standard libraries copied (shallowly) into every plugin environment
pub const SAFE_LIBRARIES: &[&str] = &["coroutine", "math", "string", "table", "utf8"];

/// Error text raised when a budget runs out
pub const BUDGET_EXCEEDED: &str = "execution time limit exceeded";

/// Error text raised when `print` output passes [`MAX_OUTPUT_BYTES`]
pub const OUTPUT_EXCEEDED: &str = "print output limit exceeded";

/// Builtins that catch errors and must not swallow a spent budget
const ERROR_CATCHERS: &[(&str, &str)] = &[
    ("_G", "pcall"),
    ("_G", "xpcall"),
    ("coroutine", "resume"),
    ("coroutine", "close"),
];

// Re-raises the budget error after the wrapped catcher returns
const BUDGET_GUARD: &str = r#"
local catcher, exceeded, message = ...
local error = error
local function settle(...)
    if exceeded() then
        error(message, 0)
    end
    return ...
end
return function(...)
    return settle(catcher(...))
end
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustTier {
    Minimal,
    /// Approved module names
    Extended(BTreeSet<String>),
}

impl TrustTier {
    pub fn for_imports(imports: &BTreeSet<String>) -> Self {
        if imports.is_empty() {
            TrustTier::Minimal
        } else {
            TrustTier::Extended(imports.clone())
        }
    }

    fn approved(&self) -> impl Iterator<Item = &String> {
        let modules = match self {
            TrustTier::Minimal => None,
            TrustTier::Extended(modules) => Some(modules),
        };
        modules.into_iter().flatten()
    }
}

/// Text written by `print` during one load or command
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<String>>);

impl OutputBuffer {
    fn lock(&self) -> MutexGuard<'_, String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one line; fails once the buffer would pass `MAX_OUTPUT_BYTES`
    pub fn push_line(&self, line: &str) -> mlua::Result<()> {
        let mut buffer = self.lock();
        if buffer.len() + line.len() + 1 > MAX_OUTPUT_BYTES {
            return Err(mlua::Error::runtime(OUTPUT_EXCEEDED));
        }
        buffer.push_str(line);
        buffer.push('\n');
        Ok(())
    }

    pub fn take(&self) -> String {
        std::mem::take(&mut *self.lock())
    }
}

/// Wall-clock deadline checked from the instruction hook
#[derive(Debug, Clone, Default)]
pub struct ExecutionBudget {
    deadline: Arc<Mutex<Option<Instant>>>,
    /// Set once the hook has raised for the current run
    tripped: Arc<AtomicBool>,
}

impl ExecutionBudget {
    fn set(&self, deadline: Option<Instant>) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = deadline;
    }

    fn trip(&self) {
        self.tripped.store(true, Ordering::SeqCst);
    }

    pub fn exceeded(&self) -> bool {
        self.deadline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Run `f` with the deadline armed for `limit`. Once the hook has fired,
    /// the run fails even if the plugin caught the error and returned.
    pub fn run<T>(&self, limit: Duration, f: impl FnOnce() -> mlua::Result<T>) -> mlua::Result<T> {
        self.tripped.store(false, Ordering::SeqCst);
        self.set(Some(Instant::now() + limit));
        let result = f();
        self.set(None);
        if self.tripped.swap(false, Ordering::SeqCst) {
            return Err(mlua::Error::runtime(BUDGET_EXCEEDED));
        }
        result
    }
}

pub struct Sandbox {
    identity: String,
    lua: Lua,
    env: Table,
    output: OutputBuffer,
    budget: ExecutionBudget,
    limits: SandboxLimits,
    /// Serializes command invocations so captured output is not interleaved
    call_lock: Mutex<()>,
}

/// Create a secure Lua state for one plugin
pub fn create_sandbox(identity: &str, tier: &TrustTier, limits: SandboxLimits) -> mlua::Result<Sandbox> {
    let lua = Lua::new_with(
        StdLib::COROUTINE | StdLib::MATH | StdLib::STRING | StdLib::TABLE | StdLib::UTF8,
        LuaOptions::default(),
    )?;
    lua.set_memory_limit(limits.memory_limit_bytes)?;

    let globals = lua.globals();
    // Shared with the string metatable, so strip it at the source
    globals.get::<Table>("string")?.set("dump", Value::Nil)?;

    let env = lua.create_table()?;
    for name in SAFE_GLOBALS {
        env.set(*name, globals.get::<Value>(*name)?)?;
    }
    for name in SAFE_LIBRARIES {
        let library: Table = globals.get(*name)?;
        let copy = lua.create_table()?;
        for pair in library.pairs::<Value, Value>() {
            let (key, value) = pair?;
            copy.set(key, value)?;
        }
        env.set(*name, copy)?;
    }
    env.set("_G", env.clone())?;

    let output = OutputBuffer::default();
    let print_output = output.clone();
    let print = lua.create_function(move |lua, values: Variadic<Value>| {
        let tostring: Function = lua.globals().get("tostring")?;
        let mut parts = Vec::with_capacity(values.len());
        for value in values {
            parts.push(tostring.call::<String>(value)?);
        }
        print_output.push_line(&parts.join("\t"))
    })?;
    env.set("print", print)?;

    register_logging_api(&lua, &env, identity)?;

    let modules = lua.create_table()?;
    for name in tier.approved() {
        if let Some(module) = build_module(&lua, name)? {
            modules.set(name.as_str(), module)?;
        }
    }
    let plugin = identity.to_string();
    let require = lua.create_function(move |_, name: String| match modules.get::<Value>(name.as_str())? {
        Value::Table(module) => Ok(module),
        _ => Err(mlua::Error::runtime(format!(
            "module '{}' is not available to plugin '{}'",
            name, plugin
        ))),
    })?;
    env.set("require", require)?;

    let budget = ExecutionBudget::default();
    guard_error_catchers(&lua, &env, &budget)?;

    // Global so coroutines created by the plugin inherit it
    let hook_budget = budget.clone();
    lua.set_global_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_, _| {
            if hook_budget.exceeded() {
                hook_budget.trip();
                Err(mlua::Error::runtime(BUDGET_EXCEEDED))
            } else {
                Ok(VmState::Continue)
            }
        },
    )?;

    Ok(Sandbox {
        identity: identity.to_string(),
        lua,
        env,
        output,
        budget,
        limits,
        call_lock: Mutex::new(()),
    })
}

/// Replace the error-catching builtins in `env` with versions that re-raise
/// the budget error once the deadline has passed
fn guard_error_catchers(lua: &Lua, env: &Table, budget: &ExecutionBudget) -> mlua::Result<()> {
    let guard_budget = budget.clone();
    let exceeded = lua.create_function(move |_, ()| Ok(guard_budget.exceeded()))?;

    for (library, name) in ERROR_CATCHERS {
        let table: Table = if *library == "_G" { env.clone() } else { env.get(*library)? };
        let catcher: Function = table.get(*name)?;
        let guarded: Function = lua
            .load(BUDGET_GUARD)
            .set_name("=budget")
            .call((catcher, exceeded.clone(), BUDGET_EXCEEDED))?;
        table.set(*name, guarded)?;
    }
    Ok(())
}

impl Sandbox {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    /// Plugin environment (where its globals land)
    pub fn env(&self) -> &Table {
        &self.env
    }

    /// Run the plugin chunk under the load budget
    pub fn exec(&self, source: &str) -> mlua::Result<()> {
        let _guard = self.call_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.budget.run(self.limits.load_timeout, || {
            self.lua
                .load(source)
                .set_name(format!("={}", self.identity))
                .set_mode(ChunkMode::Text)
                .set_environment(self.env.clone())
                .exec()
        })
    }

    /// Call a plugin function under `limit`; returns its result and what it printed
    pub fn call<R: FromLuaMulti>(
        &self,
        function: &Function,
        args: impl IntoLuaMulti,
        limit: Duration,
    ) -> mlua::Result<(R, String)> {
        let _guard = self.call_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.output.take();
        let result = self.budget.run(limit, || function.call::<R>(args));
        let printed = self.output.take();
        result.map(|value| (value, printed))
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("identity", &self.identity)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
