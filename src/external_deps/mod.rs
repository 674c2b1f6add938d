//! Integrations that rely on third-party engines.
//!
//! This module groups the embedded JavaScript runtimes that host the guest
//! modules on behalf of the bridge.

pub mod interpreters;

#[cfg(feature = "boa")]
pub use interpreters::BoaRuntime;
#[cfg(feature = "quickjs")]
pub use interpreters::QuickJsRuntime;
