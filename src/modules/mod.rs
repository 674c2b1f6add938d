//! Cross-cutting services module
//!
//! Lifecycle events and the handlers that observe them.

pub mod events;

// Re-export commonly used types
pub use events::{
    BridgeEvent, EntryInvokedEvent, EventDispatcher, EventHandler, FailedEvent, LoggingHandler,
    ModuleLoadedEvent, ResolveStartedEvent, SettledEvent,
};
