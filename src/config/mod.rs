//! Settings and host-side input loading.
//!
//! Provides:
//! - JSON-loadable bridge configuration with defaults for every field
//! - File helpers that read the guest modules and input blobs from disk

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::external_deps::interpreters::{BackendKind, ResolveLimits};
use crate::guest::{
    ConsoleMode, DEFAULT_TIMER_SEED, GuestModuleSource, GuestModules, HostInputBundle, ShimConfig,
};

/// Failures while reading configuration or input files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid bridge configuration: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Process-level bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub backend: BackendKind,
    pub console: ConsoleMode,
    pub timer_seed: u32,
    /// Global object exposing `parseProofData` and `getDocument`.
    pub entry_namespace: String,
    /// `null` disables the step ceiling.
    pub max_drain_steps: Option<u64>,
    /// `null` disables the wall-clock ceiling. On the isolate backend it also
    /// bounds each synchronous script run.
    pub deadline_ms: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let limits = ResolveLimits::default();
        Self {
            backend: BackendKind::default(),
            console: ConsoleMode::default(),
            timer_seed: DEFAULT_TIMER_SEED,
            entry_namespace: "pdfTools".to_string(),
            max_drain_steps: limits.max_drain_steps,
            deadline_ms: limits
                .deadline
                .map(|deadline| deadline.as_millis().min(u64::MAX as u128) as u64),
        }
    }
}

impl BridgeConfig {
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::from_json_str(&read_text(path.as_ref())?)
    }

    pub fn shim(&self) -> ShimConfig {
        ShimConfig {
            console: self.console,
            timer_seed: self.timer_seed,
        }
    }

    pub fn limits(&self) -> ResolveLimits {
        ResolveLimits {
            max_drain_steps: self.max_drain_steps,
            deadline: self.deadline_ms.map(Duration::from_millis),
        }
    }
}

fn read_text(path: &Path) -> ConfigResult<String> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn module_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl GuestModules {
    /// Read the polyfill and document modules; file names become module names.
    pub fn from_files(polyfill: impl AsRef<Path>, document: impl AsRef<Path>) -> ConfigResult<Self> {
        let polyfill = polyfill.as_ref();
        let document = document.as_ref();
        Ok(Self::from_sources(
            GuestModuleSource::new(module_name(polyfill), read_text(polyfill)?),
            GuestModuleSource::new(module_name(document), read_text(document)?),
        ))
    }
}

impl HostInputBundle {
    /// Read the holder configuration and vaccination blobs verbatim.
    pub fn from_files(
        holder_config: impl AsRef<Path>,
        vaccination: impl AsRef<Path>,
    ) -> ConfigResult<Self> {
        Ok(Self::new(
            read_text(holder_config.as_ref())?,
            read_text(vaccination.as_ref())?,
        ))
    }
}
