//! JavaScript engine infrastructure.
//!
//! Provides the strategy trait every embedded engine implements, the error
//! type they report through, and the concrete engines themselves.

#[cfg(feature = "boa")]
mod boa;
#[cfg(feature = "quickjs")]
mod quickjs;

#[cfg(feature = "boa")]
pub use boa::BoaRuntime;
#[cfg(feature = "quickjs")]
pub use quickjs::QuickJsRuntime;

use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::guest::{Artifact, GuestModuleSource, ShimConfig};

/// Which engine hosts the guest modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Boa: runs each script to completion and flushes its job queue before
    /// returning, so the entry promise is expected to be settled already.
    #[default]
    Interpreter,
    /// QuickJS: promise continuations sit in the runtime's job queue until
    /// the host executes them one by one.
    Isolate,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Interpreter => "interpreter",
            BackendKind::Isolate => "isolate",
        }
    }

    /// Whether this backend was compiled in.
    pub fn is_available(&self) -> bool {
        match self {
            BackendKind::Interpreter => cfg!(feature = "boa"),
            BackendKind::Isolate => cfg!(feature = "quickjs"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic detail for a value thrown or rejected by guest code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFault {
    pub message: String,
    pub location: Option<String>,
    pub trace: Option<String>,
}

impl GuestFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
            trace: None,
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    pub fn with_trace(mut self, trace: Option<String>) -> Self {
        self.trace = trace.filter(|trace| !trace.trim().is_empty());
        self
    }

    /// Pull a `line N, col M` position out of an engine error message.
    pub(crate) fn locate(message: &str) -> Option<String> {
        static LOCATION_RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?i)line\s*:?\s*(\d+)\s*,\s*col(?:umn)?\s*:?\s*(\d+)").unwrap()
        });

        LOCATION_RE
            .captures(message)
            .map(|caps| format!("{}:{}", &caps[1], &caps[2]))
    }
}

impl fmt::Display for GuestFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(location) = &self.location {
            write!(f, " (at {location})")?;
        }
        Ok(())
    }
}

/// Why the resolver gave up on a pending promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    StepLimit,
    Deadline,
    /// Still pending with nothing left in the job queue.
    QueueExhausted,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutReason::StepLimit => "drain step limit reached",
            TimeoutReason::Deadline => "deadline elapsed",
            TimeoutReason::QueueExhausted => "job queue empty while still pending",
        })
    }
}

/// Ceilings for the job-queue drain loop.
///
/// On the isolate backend `deadline` also caps each synchronous script run
/// before the drain. The interpreter backend settles in a single pass and
/// ignores both ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveLimits {
    pub max_drain_steps: Option<u64>,
    pub deadline: Option<Duration>,
}

impl Default for ResolveLimits {
    fn default() -> Self {
        Self {
            max_drain_steps: Some(100_000),
            deadline: Some(Duration::from_secs(30)),
        }
    }
}

impl ResolveLimits {
    pub fn unbounded() -> Self {
        Self {
            max_drain_steps: None,
            deadline: None,
        }
    }
}

/// Failures produced by engines.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("guest code threw: {0}")]
    Thrown(GuestFault),
    #[error("guest promise rejected: {0}")]
    Rejected(GuestFault),
    #[error("guest promise still pending after the job queue was flushed")]
    StillPending,
    #[error("gave up after {steps} drain steps in {elapsed:?}: {reason}")]
    Timeout {
        steps: u64,
        elapsed: Duration,
        reason: TimeoutReason,
    },
    #[error("javascript engine error: {0}")]
    Other(String),
}

/// Convenience alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;

/// One initialized engine instance, exclusively owned by a single
/// invocation.
///
/// Callers go through the methods in declaration order: modules, host
/// values, shim, driver phases, then [`GuestRuntime::resolve`] on the
/// handle returned by [`GuestRuntime::invoke_async`].
pub trait GuestRuntime {
    /// Reference to the pending entry-point promise, valid for this runtime
    /// only.
    type Handle;

    fn backend(&self) -> BackendKind;

    /// Evaluate a module at global scope.
    fn load_module(&mut self, module: &GuestModuleSource) -> EngineResult<()>;

    /// Bind `text` as a global string named `name`.
    fn inject_text(&mut self, name: &str, text: &str) -> EngineResult<()>;

    fn install_shim(&mut self, shim: &ShimConfig) -> EngineResult<()>;

    /// Bound every later synchronous evaluation (module load, shim, driver
    /// phases) by wall-clock time. Engines that cannot interrupt running
    /// script ignore it.
    fn set_script_deadline(&mut self, _deadline: Option<Duration>) {}

    /// Run a driver script for its side effects.
    fn run_phase(&mut self, script: &str) -> EngineResult<()>;

    /// Run the script that produces the entry-point promise.
    fn invoke_async(&mut self, script: &str) -> EngineResult<Self::Handle>;

    /// Drive the engine until the promise settles and export its value.
    fn resolve(&mut self, handle: Self::Handle, limits: &ResolveLimits) -> EngineResult<Artifact>;
}

/// Write one forwarded guest `console.*` call to the host log.
pub(crate) fn log_guest_console(level: &str, text: &str) {
    match level {
        "warn" | "error" => log::warn!(target: "guest", "{text}"),
        _ => log::info!(target: "guest", "{text}"),
    }
}

/// Decode the object returned by [`crate::guest::driver::export_script`].
pub(crate) fn decode_export(kind: &str, payload: String) -> EngineResult<Artifact> {
    Artifact::from_export(kind, payload).map_err(EngineError::Other)
}
