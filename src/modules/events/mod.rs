//! Event system for bridge invocations.
//!
//! Provides hooks for logging and custom reactions around each step of a
//! document generation run.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::external_deps::interpreters::BackendKind;

#[derive(Debug, Clone)]
pub struct ModuleLoadedEvent {
    pub backend: BackendKind,
    pub module: String,
    pub timestamp: DateTime<Utc>,
}

/// The entry point returned its promise.
#[derive(Debug, Clone)]
pub struct EntryInvokedEvent {
    pub backend: BackendKind,
    pub namespace: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResolveStartedEvent {
    pub backend: BackendKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SettledEvent {
    pub backend: BackendKind,
    pub artifact_kind: &'static str,
    pub artifact_len: usize,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub backend: BackendKind,
    pub error: String,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    ModuleLoaded(ModuleLoadedEvent),
    EntryInvoked(EntryInvokedEvent),
    ResolveStarted(ResolveStartedEvent),
    Settled(SettledEvent),
    Failed(FailedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &BridgeEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: BridgeEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::ModuleLoaded(loaded) => {
                log::debug!("[{}] loaded {}", loaded.backend, loaded.module);
            }
            BridgeEvent::EntryInvoked(invoked) => {
                log::debug!("[{}] {}.getDocument invoked", invoked.backend, invoked.namespace);
            }
            BridgeEvent::ResolveStarted(started) => {
                log::debug!("[{}] awaiting document promise", started.backend);
            }
            BridgeEvent::Settled(settled) => {
                log::info!(
                    "[{}] document ready: {} ({} bytes) in {:.3}s",
                    settled.backend,
                    settled.artifact_kind,
                    settled.artifact_len,
                    settled.elapsed.as_secs_f64()
                );
            }
            BridgeEvent::Failed(failed) => {
                log::warn!(
                    "[{}] generation failed after {:.3}s: {}",
                    failed.backend,
                    failed.elapsed.as_secs_f64(),
                    failed.error
                );
            }
        }
    }
}
