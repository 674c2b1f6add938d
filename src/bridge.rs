//! High level bridge orchestration.
//!
//! Wires together backend selection, module loading, host value injection,
//! the timer/console shim, the entry-point driver and the async resolver to
//! expose a single call that turns guest modules plus host input into an
//! [`Artifact`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::BridgeConfig;
#[cfg(feature = "boa")]
use crate::external_deps::interpreters::BoaRuntime;
#[cfg(feature = "quickjs")]
use crate::external_deps::interpreters::QuickJsRuntime;
use crate::external_deps::interpreters::{
    BackendKind, EngineError, GuestFault, GuestRuntime, ResolveLimits, TimeoutReason,
};
use crate::guest::{
    Artifact, ConsoleMode, DriverPhase, EntryDriver, GuestModuleSource, GuestModules,
    HostInputBundle,
};
use crate::modules::events::{
    BridgeEvent, EntryInvokedEvent, EventDispatcher, EventHandler, FailedEvent, LoggingHandler,
    ModuleLoadedEvent, ResolveStartedEvent, SettledEvent,
};

/// Result alias used across the bridge.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Failure surfaced to the caller. Nothing here is retried: every variant is
/// deterministic for the same modules and input.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("could not load guest module {module}: {fault}")]
    Load { module: String, fault: GuestFault },
    #[error("guest failed during {phase}: {message}")]
    Execution {
        phase: DriverPhase,
        message: String,
        location: Option<String>,
    },
    #[error("document promise rejected: {0}")]
    Rejected(GuestFault),
    #[error("internal resolver violation: {0}")]
    ResolverViolation(String),
    #[error("document promise unresolved after {steps} drain steps ({elapsed:?}): {reason}")]
    Timeout {
        steps: u64,
        elapsed: Duration,
        reason: TimeoutReason,
    },
    #[error("could not bind host value {name}: {message}")]
    Injection { name: String, message: String },
    #[error("javascript engine error: {0}")]
    Engine(String),
    #[error("backend `{0}` is not compiled into this build")]
    BackendUnavailable(BackendKind),
}

impl BridgeError {
    /// Driver phase that threw, for execution errors.
    pub fn phase(&self) -> Option<DriverPhase> {
        match self {
            BridgeError::Execution { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Rejection detail, for rejected document promises.
    pub fn rejection(&self) -> Option<&GuestFault> {
        match self {
            BridgeError::Rejected(fault) => Some(fault),
            _ => None,
        }
    }

    fn from_load(module: &GuestModuleSource, err: EngineError) -> Self {
        match err {
            EngineError::Thrown(fault) => BridgeError::Load {
                module: module.name().to_string(),
                fault,
            },
            other => BridgeError::from_engine(other),
        }
    }

    fn from_phase(phase: DriverPhase, err: EngineError) -> Self {
        match err {
            EngineError::Thrown(fault) => BridgeError::Execution {
                phase,
                message: fault.message,
                location: fault.location,
            },
            other => BridgeError::from_engine(other),
        }
    }

    fn from_resolve(backend: BackendKind, err: EngineError) -> Self {
        match err {
            EngineError::Rejected(fault) => BridgeError::Rejected(fault),
            EngineError::StillPending => BridgeError::ResolverViolation(format!(
                "{backend} backend returned a pending document promise; the guest scheduled \
                 asynchronous work the shim could not force"
            )),
            other => BridgeError::from_engine(other),
        }
    }

    fn from_engine(err: EngineError) -> Self {
        match err {
            EngineError::Timeout {
                steps,
                elapsed,
                reason,
            } => BridgeError::Timeout {
                steps,
                elapsed,
                reason,
            },
            other => BridgeError::Engine(other.to_string()),
        }
    }
}

/// Fluent builder for [`DocumentBridge`].
pub struct DocumentBridgeBuilder {
    config: BridgeConfig,
    handlers: Vec<Arc<dyn EventHandler>>,
    logging: bool,
}

impl DocumentBridgeBuilder {
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
            handlers: Vec::new(),
            logging: true,
        }
    }

    /// Replace every setting at once, e.g. with a config read from disk.
    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn with_console_mode(mut self, mode: ConsoleMode) -> Self {
        self.config.console = mode;
        self
    }

    pub fn with_timer_seed(mut self, seed: u32) -> Self {
        self.config.timer_seed = seed;
        self
    }

    pub fn with_entry_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.entry_namespace = namespace.into();
        self
    }

    pub fn with_limits(mut self, limits: ResolveLimits) -> Self {
        self.config.max_drain_steps = limits.max_drain_steps;
        self.config.deadline_ms = limits
            .deadline
            .map(|deadline| deadline.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Drop the default [`LoggingHandler`].
    pub fn disable_logging(mut self) -> Self {
        self.logging = false;
        self
    }

    pub fn build(self) -> BridgeResult<DocumentBridge> {
        if !self.config.backend.is_available() {
            return Err(BridgeError::BackendUnavailable(self.config.backend));
        }

        let mut events = EventDispatcher::new();
        if self.logging {
            events.register_handler(Arc::new(LoggingHandler));
        }
        for handler in self.handlers {
            events.register_handler(handler);
        }

        Ok(DocumentBridge {
            config: self.config,
            events: Arc::new(events),
        })
    }
}

impl Default for DocumentBridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the document generation module on the configured backend.
///
/// Every call creates, uses and drops its own engine instance; the bridge
/// itself holds only immutable configuration and can be shared freely.
#[derive(Clone)]
pub struct DocumentBridge {
    config: BridgeConfig,
    events: Arc<EventDispatcher>,
}

impl DocumentBridge {
    /// Bridge with default configuration.
    pub fn new() -> BridgeResult<Self> {
        DocumentBridgeBuilder::new().build()
    }

    pub fn builder() -> DocumentBridgeBuilder {
        DocumentBridgeBuilder::new()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn backend(&self) -> BackendKind {
        self.config.backend
    }

    /// Generate one document on the calling thread.
    pub fn generate(&self, modules: &GuestModules, input: &HostInputBundle) -> BridgeResult<Artifact> {
        let started = Instant::now();
        let backend = self.config.backend;
        let result = self.dispatch(modules, input);

        match &result {
            Ok(artifact) => self.events.dispatch(BridgeEvent::Settled(SettledEvent {
                backend,
                artifact_kind: artifact.kind(),
                artifact_len: artifact.len(),
                elapsed: started.elapsed(),
                timestamp: chrono::Utc::now(),
            })),
            Err(err) => self.events.dispatch(BridgeEvent::Failed(FailedEvent {
                backend,
                error: err.to_string(),
                elapsed: started.elapsed(),
                timestamp: chrono::Utc::now(),
            })),
        }

        result
    }

    /// Generate one document on a blocking worker thread. Concurrent calls
    /// each get their own engine instance.
    pub async fn generate_async(
        &self,
        modules: GuestModules,
        input: HostInputBundle,
    ) -> BridgeResult<Artifact> {
        let bridge = self.clone();
        tokio::task::spawn_blocking(move || bridge.generate(&modules, &input))
            .await
            .map_err(|err| BridgeError::Engine(format!("generation task failed: {err}")))?
    }

    fn dispatch(&self, modules: &GuestModules, input: &HostInputBundle) -> BridgeResult<Artifact> {
        match self.config.backend {
            #[cfg(feature = "boa")]
            BackendKind::Interpreter => self.run(BoaRuntime::new(), modules, input),
            #[cfg(feature = "quickjs")]
            BackendKind::Isolate => {
                let runtime =
                    QuickJsRuntime::new().map_err(|err| BridgeError::Engine(err.to_string()))?;
                self.run(runtime, modules, input)
            }
            #[allow(unreachable_patterns)]
            other => Err(BridgeError::BackendUnavailable(other)),
        }
    }

    fn run<R: GuestRuntime>(
        &self,
        mut runtime: R,
        modules: &GuestModules,
        input: &HostInputBundle,
    ) -> BridgeResult<Artifact> {
        let backend = runtime.backend();
        let limits = self.config.limits();
        runtime.set_script_deadline(limits.deadline);

        for module in modules.load_order() {
            load_module(&mut runtime, module)?;
            self.events.dispatch(BridgeEvent::ModuleLoaded(ModuleLoadedEvent {
                backend,
                module: module.name().to_string(),
                timestamp: chrono::Utc::now(),
            }));
        }

        inject_inputs(&mut runtime, input)?;
        runtime
            .install_shim(&self.config.shim())
            .map_err(|err| BridgeError::Engine(err.to_string()))?;

        let driver = EntryDriver::new(self.config.entry_namespace.clone());
        let handle = invoke_entry_point(&mut runtime, &driver)?;
        self.events.dispatch(BridgeEvent::EntryInvoked(EntryInvokedEvent {
            backend,
            namespace: driver.namespace().to_string(),
            timestamp: chrono::Utc::now(),
        }));

        self.events.dispatch(BridgeEvent::ResolveStarted(ResolveStartedEvent {
            backend,
            timestamp: chrono::Utc::now(),
        }));
        runtime
            .resolve(handle, &limits)
            .map_err(|err| BridgeError::from_resolve(backend, err))
    }
}

/// Evaluate one guest module; a parse error or top-level throw is a
/// [`BridgeError::Load`].
pub fn load_module<R: GuestRuntime>(runtime: &mut R, module: &GuestModuleSource) -> BridgeResult<()> {
    runtime
        .load_module(module)
        .map_err(|err| BridgeError::from_load(module, err))
}

/// Bind every input field as a global string.
pub fn inject_inputs<R: GuestRuntime>(runtime: &mut R, input: &HostInputBundle) -> BridgeResult<()> {
    for (name, text) in input.text_bindings() {
        runtime
            .inject_text(name, &text)
            .map_err(|err| BridgeError::Injection {
                name: name.to_string(),
                message: err.to_string(),
            })?;
    }
    Ok(())
}

/// Run the driver phases and return the handle of the document promise.
pub fn invoke_entry_point<R: GuestRuntime>(
    runtime: &mut R,
    driver: &EntryDriver,
) -> BridgeResult<R::Handle> {
    for phase in DriverPhase::ALL {
        let script = driver.script(phase);
        if phase == DriverPhase::DocumentBuildInvoke {
            return runtime
                .invoke_async(&script)
                .map_err(|err| BridgeError::from_phase(phase, err));
        }
        runtime
            .run_phase(&script)
            .map_err(|err| BridgeError::from_phase(phase, err))?;
    }

    Err(BridgeError::Engine("driver has no document build phase".into()))
}
