//! # proofbridge
//!
//! Hosts a scripted proof-document generator inside an embedded JavaScript
//! engine, feeds it host-provided input, calls its asynchronous entry point
//! and hands back the generated artifact once the promise settles.
//!
//! Two interchangeable backends are available:
//!
//! - **Interpreter** (Boa): runs scripts to completion on one cooperative
//!   thread; timers are collapsed to immediate calls so the document promise
//!   has settled by the time the entry script returns.
//! - **Isolate** (QuickJS): keeps promise continuations in a job queue that
//!   the bridge pumps step by step, bounded by a step count and a deadline.
//!
//! Callers never see the difference: inputs, the [`Artifact`] and the
//! [`BridgeError`] taxonomy are the same for both.
//!
//! ## Example
//!
//! ```no_run
//! use proofbridge::{BackendKind, DocumentBridge, GuestModules, HostInputBundle};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let modules = GuestModules::from_files("web-polyfill.js", "pdf-tools.js")?;
//!     let input = HostInputBundle::from_files("holder-config.json", "vaccination.json")?;
//!
//!     let bridge = DocumentBridge::builder()
//!         .with_backend(BackendKind::Isolate)
//!         .build()?;
//!     let document = bridge.generate(&modules, &input)?;
//!     println!("{} artifact, {} bytes", document.kind(), document.len());
//!     Ok(())
//! }
//! ```

mod bridge;

pub mod config;
pub mod external_deps;
pub mod guest;
pub mod modules;

pub use crate::bridge::{
    BridgeError,
    BridgeResult,
    DocumentBridge,
    DocumentBridgeBuilder,
    inject_inputs,
    invoke_entry_point,
    load_module,
};

pub use crate::config::{BridgeConfig, ConfigError, ConfigResult};

pub use crate::external_deps::interpreters::{
    BackendKind,
    EngineError,
    EngineResult,
    GuestFault,
    GuestRuntime,
    ResolveLimits,
    TimeoutReason,
};

#[cfg(feature = "boa")]
pub use crate::external_deps::interpreters::BoaRuntime;
#[cfg(feature = "quickjs")]
pub use crate::external_deps::interpreters::QuickJsRuntime;

pub use crate::guest::{
    Artifact,
    ConsoleMode,
    DriverPhase,
    EntryDriver,
    GuestModuleSource,
    GuestModules,
    HostInputBundle,
    ShimConfig,
};

pub use crate::modules::{BridgeEvent, EventDispatcher, EventHandler, LoggingHandler};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
