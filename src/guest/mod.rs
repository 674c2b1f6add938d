//! Host-side data handed to the guest environment and the artifact it
//! produces.
//!
//! Everything here is backend-independent: the same [`GuestModules`] and
//! [`HostInputBundle`] drive either engine, and both engines hand back the
//! same [`Artifact`] shape.

pub mod driver;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};

pub use driver::{ConsoleMode, DriverPhase, EntryDriver, ShimConfig, DEFAULT_TIMER_SEED};

/// Immutable source text of one guest module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestModuleSource {
    name: String,
    source: String,
}

impl GuestModuleSource {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    /// Name used in diagnostics and load errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// The two guest modules, held in the order they must be evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestModules {
    polyfill: GuestModuleSource,
    document: GuestModuleSource,
}

impl GuestModules {
    pub fn new(polyfill: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            polyfill: GuestModuleSource::new("web-polyfill.js", polyfill),
            document: GuestModuleSource::new("pdf-tools.js", document),
        }
    }

    pub fn from_sources(polyfill: GuestModuleSource, document: GuestModuleSource) -> Self {
        Self { polyfill, document }
    }

    pub fn polyfill(&self) -> &GuestModuleSource {
        &self.polyfill
    }

    pub fn document(&self) -> &GuestModuleSource {
        &self.document
    }

    /// Modules in evaluation order: the polyfill defines globals the document
    /// module reads while it is being evaluated.
    pub fn load_order(&self) -> [&GuestModuleSource; 2] {
        [&self.polyfill, &self.document]
    }
}

/// Global names the host binds before the entry point runs.
pub mod bindings {
    pub const HOLDER_CONFIG: &str = "holderConfigJSON";
    pub const VACCINATION: &str = "vaccinationJSON";
    pub const LOCALE: &str = "bridgeLocale";
    pub const QR_SIZE_IN_CM: &str = "bridgeQrSizeInCm";
    pub const CREATED_AT: &str = "bridgeCreatedAt";
    pub const INTERNATIONAL_PROOF_SCANNED: &str = "bridgeInternationalProofScanned";
}

/// Raw inputs for one document generation request.
///
/// The JSON blobs are never parsed on the host; malformed input only shows up
/// once the guest tries to parse it.
#[derive(Debug, Clone, PartialEq)]
pub struct HostInputBundle {
    holder_config: String,
    vaccination: String,
    locale: String,
    qr_size_in_cm: f64,
    international_proof_scanned: bool,
    created_at: DateTime<Utc>,
}

impl HostInputBundle {
    pub fn new(holder_config: impl Into<String>, vaccination: impl Into<String>) -> Self {
        Self {
            holder_config: holder_config.into(),
            vaccination: vaccination.into(),
            locale: "nl".to_string(),
            qr_size_in_cm: 8.0,
            international_proof_scanned: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_qr_size_in_cm(mut self, size: f64) -> Self {
        self.qr_size_in_cm = size;
        self
    }

    pub fn with_international_proof_scanned(mut self, scanned: bool) -> Self {
        self.international_proof_scanned = scanned;
        self
    }

    /// Pin the creation timestamp; required for reproducible output.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn holder_config(&self) -> &str {
        &self.holder_config
    }

    pub fn vaccination(&self) -> &str {
        &self.vaccination
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn qr_size_in_cm(&self) -> f64 {
        self.qr_size_in_cm
    }

    pub fn international_proof_scanned(&self) -> bool {
        self.international_proof_scanned
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Every field encoded as text under its global name.
    pub fn text_bindings(&self) -> Vec<(&'static str, String)> {
        vec![
            (bindings::HOLDER_CONFIG, self.holder_config.clone()),
            (bindings::VACCINATION, self.vaccination.clone()),
            (bindings::LOCALE, self.locale.clone()),
            (bindings::QR_SIZE_IN_CM, self.qr_size_in_cm.to_string()),
            (
                bindings::CREATED_AT,
                self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            (
                bindings::INTERNATIONAL_PROOF_SCANNED,
                self.international_proof_scanned.to_string(),
            ),
        ]
    }
}

/// Value the document builder settled with.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    /// Typed array or `ArrayBuffer` contents.
    Bytes(Bytes),
    Text(String),
    /// Any other object, round-tripped through `JSON.stringify`.
    Json(serde_json::Value),
    /// `undefined` or `null`.
    Empty,
}

impl Artifact {
    /// Build an artifact from the `(kind, payload)` pair emitted by the guest
    /// export routine.
    pub(crate) fn from_export(kind: &str, payload: String) -> Result<Self, String> {
        match kind {
            "bytes" => Ok(Artifact::Bytes(latin1_to_bytes(&payload)?)),
            "text" => Ok(Artifact::Text(payload)),
            "json" => serde_json::from_str(&payload)
                .map(Artifact::Json)
                .map_err(|err| format!("artifact is not valid JSON: {err}")),
            "empty" => Ok(Artifact::Empty),
            other => Err(format!("unknown artifact kind `{other}`")),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Artifact::Bytes(_) => "bytes",
            Artifact::Text(_) => "text",
            Artifact::Json(_) => "json",
            Artifact::Empty => "empty",
        }
    }

    /// Payload size in bytes; JSON counts its compact serialization.
    pub fn len(&self) -> usize {
        match self {
            Artifact::Bytes(bytes) => bytes.len(),
            Artifact::Text(text) => text.len(),
            Artifact::Json(value) => value.to_string().len(),
            Artifact::Empty => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Artifact::Bytes(bytes) => bytes.is_empty(),
            Artifact::Text(text) => text.is_empty(),
            Artifact::Json(_) => false,
            Artifact::Empty => true,
        }
    }

    /// Raw bytes for binary artifacts, UTF-8 for text.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Artifact::Bytes(bytes) => Some(bytes),
            Artifact::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }
}

fn latin1_to_bytes(payload: &str) -> Result<Bytes, String> {
    payload
        .chars()
        .map(|ch| u8::try_from(u32::from(ch)).map_err(|_| format!("byte payload holds {ch:?}")))
        .collect::<Result<Vec<u8>, String>>()
        .map(Bytes::from)
}
