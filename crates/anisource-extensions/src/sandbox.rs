//! Lua sandbox construction.
//!
//! Each extension gets its own Lua state with only the `string`, `table`,
//! `math` and `utf8` libraries, a heap limit, and an instruction hook that
//! aborts the guest when a call runs out of budget, passes its deadline,
//! or is cancelled by the host.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mlua::{HookTriggers, Lua, LuaOptions, StdLib, VmState};

use crate::config::SandboxConfig;
use crate::error::ExtensionError;

/// Instructions between two hook checks.
const HOOK_INTERVAL: u32 = 1_000;

/// Globals removed before any script runs.
const REMOVED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "package",
    "require",
    "dofile",
    "loadfile",
    "load",
    "loadstring",
    "print",
    "debug",
    "collectgarbage",
];

/// Why the guest was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    InstructionBudget,
    Deadline,
    Cancelled,
}

impl Interrupt {
    pub(crate) fn into_error(self, extension: &str) -> ExtensionError {
        match self {
            Self::InstructionBudget | Self::Deadline => ExtensionError::Timeout(extension.into()),
            Self::Cancelled => ExtensionError::Cancelled(extension.into()),
        }
    }
}

#[derive(Debug, Default)]
struct GuardState {
    cancel: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
    executed: u64,
    interrupted: Option<Interrupt>,
}

/// Per-call limits checked by the instruction hook and by capabilities.
///
/// Lives on the worker thread only.
#[derive(Debug, Clone)]
pub(crate) struct CallGuard {
    state: Rc<RefCell<GuardState>>,
    closed: Arc<AtomicBool>,
    instruction_limit: u64,
    call_timeout: std::time::Duration,
}

impl CallGuard {
    fn new(config: &SandboxConfig, closed: Arc<AtomicBool>) -> Self {
        Self {
            state: Rc::new(RefCell::new(GuardState::default())),
            closed,
            instruction_limit: config.instruction_limit,
            call_timeout: config.call_timeout,
        }
    }

    /// Arm the guard for one guest invocation.
    pub(crate) fn begin(&self, cancel: Arc<AtomicBool>) {
        let mut state = self.state.borrow_mut();
        state.cancel = Some(cancel);
        state.deadline = Some(Instant::now() + self.call_timeout);
        state.executed = 0;
        state.interrupted = None;
    }

    /// Disarm the guard, returning what stopped the guest, if anything.
    pub(crate) fn finish(&self) -> Option<Interrupt> {
        let mut state = self.state.borrow_mut();
        state.cancel = None;
        state.deadline = None;
        state.interrupted.take()
    }

    /// Current interrupt condition, without counting instructions.
    pub(crate) fn check(&self) -> Option<Interrupt> {
        let mut state = self.state.borrow_mut();
        Self::evaluate(&mut state, &self.closed)
    }

    fn tick(&self) -> Option<Interrupt> {
        let mut state = self.state.borrow_mut();
        state.executed += u64::from(HOOK_INTERVAL);
        if state.executed > self.instruction_limit {
            state.interrupted = Some(Interrupt::InstructionBudget);
            return state.interrupted;
        }
        Self::evaluate(&mut state, &self.closed)
    }

    fn evaluate(state: &mut GuardState, closed: &AtomicBool) -> Option<Interrupt> {
        if let Some(reason) = state.interrupted {
            return Some(reason);
        }
        let cancelled = closed.load(Ordering::Relaxed)
            || state
                .cancel
                .as_ref()
                .is_some_and(|c| c.load(Ordering::Relaxed));
        let reason = if cancelled {
            Some(Interrupt::Cancelled)
        } else if state.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(Interrupt::Deadline)
        } else {
            None
        };
        state.interrupted = reason;
        reason
    }
}

/// Build a fresh restricted Lua state and its call guard.
///
/// `closed` is the runtime-wide flag set by `close()`; it stops any guest
/// code still running.
pub(crate) fn new_lua(
    config: &SandboxConfig,
    closed: Arc<AtomicBool>,
) -> Result<(Lua, CallGuard), ExtensionError> {
    let libs = StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8;
    let lua = Lua::new_with(libs, LuaOptions::default())
        .map_err(|e| ExtensionError::Runtime(format!("failed to create Lua state: {e}")))?;

    lua.set_memory_limit(config.memory_limit)
        .map_err(|e| ExtensionError::Runtime(e.to_string()))?;

    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals
            .set(*name, mlua::Value::Nil)
            .map_err(|e| ExtensionError::Runtime(e.to_string()))?;
    }

    let guard = CallGuard::new(config, closed);
    let hook_guard = guard.clone();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_lua, _debug| match hook_guard.tick() {
            Some(reason) => Err(mlua::Error::RuntimeError(format!(
                "extension interrupted: {reason:?}"
            ))),
            None => Ok(VmState::Continue),
        },
    );

    Ok((lua, guard))
}
