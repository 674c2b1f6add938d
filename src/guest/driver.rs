//! Guest-side scripts the bridge evaluates around the opaque modules.
//!
//! The shim prelude, the four entry-point phases and the artifact export
//! routine are plain JavaScript so that both engines run exactly the same
//! code and therefore observe the same ordering and produce the same bytes.

use std::fmt;

use serde::Deserialize;

use super::bindings;

/// First handle returned by the `setTimeout` stand-in.
pub const DEFAULT_TIMER_SEED: u32 = 42;

/// Native function the forwarding console calls with `(level, text)`.
pub const HOST_LOG_FUNCTION: &str = "__bridgeHostLog";

/// Global that temporarily holds the settled value during export.
pub const SETTLED_GLOBAL: &str = "__bridgeSettled";

/// What happens to guest `console.*` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleMode {
    /// Every console method is a no-op.
    #[default]
    Silent,
    /// Console calls are formatted in the guest and written to the host log
    /// under the `guest` target.
    Forward,
}

/// Settings for the timer/console stand-ins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShimConfig {
    pub console: ConsoleMode,
    pub timer_seed: u32,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            console: ConsoleMode::Silent,
            timer_seed: DEFAULT_TIMER_SEED,
        }
    }
}

impl ShimConfig {
    /// Script installing `console`, `setTimeout` and `clearTimeout`.
    ///
    /// Timer callbacks run synchronously inside `setTimeout`; the delay is
    /// ignored. Guest code that depends on real delay ordering will diverge
    /// from a browser.
    pub fn prelude(&self) -> String {
        let console = match self.console {
            ConsoleMode::Silent => r#"{
        log: noop,
        info: noop,
        debug: noop,
        warn: noop,
        error: noop
    }"#
            .to_string(),
            ConsoleMode::Forward => format!(
                r#"(function () {{
        var sink = global["{host_log}"];
        function forward(level) {{
            return function () {{
                sink(level, Array.prototype.map.call(arguments, String).join(" "));
            }};
        }}
        return {{
            log: forward("log"),
            info: forward("info"),
            debug: forward("debug"),
            warn: forward("warn"),
            error: forward("error")
        }};
    }})()"#,
                host_log = HOST_LOG_FUNCTION
            ),
        };

        format!(
            r#"
(function (global) {{
    var nextHandle = {seed};
    function noop() {{}}
    global.console = {console};
    global.setTimeout = function (callback, delay) {{
        var args = Array.prototype.slice.call(arguments, 2);
        if (typeof callback === "function") {{
            callback.apply(undefined, args);
        }}
        return nextHandle++;
    }};
    global.clearTimeout = function () {{}};
}})(globalThis);
"#,
            seed = self.timer_seed,
            console = console
        )
    }
}

/// Steps of the entry-point driver, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverPhase {
    ConfigParse,
    VaccinationParse,
    ProofParse,
    DocumentBuildInvoke,
}

impl DriverPhase {
    pub const ALL: [DriverPhase; 4] = [
        DriverPhase::ConfigParse,
        DriverPhase::VaccinationParse,
        DriverPhase::ProofParse,
        DriverPhase::DocumentBuildInvoke,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DriverPhase::ConfigParse => "config-parse",
            DriverPhase::VaccinationParse => "vaccination-parse",
            DriverPhase::ProofParse => "proof-parse",
            DriverPhase::DocumentBuildInvoke => "document-build-invoke",
        }
    }
}

impl fmt::Display for DriverPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the per-phase scripts that call into the document module.
#[derive(Debug, Clone)]
pub struct EntryDriver {
    namespace: String,
}

impl EntryDriver {
    /// `namespace` is the global object exposing `parseProofData` and
    /// `getDocument`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn namespace_expr(&self) -> String {
        // A JSON string literal is also a valid JS string literal.
        let quoted = serde_json::to_string(&self.namespace).unwrap_or_else(|_| "\"\"".into());
        format!("globalThis[{quoted}]")
    }

    /// Script for `phase`. The last phase evaluates to a promise.
    pub fn script(&self, phase: DriverPhase) -> String {
        let ns = self.namespace_expr();
        match phase {
            DriverPhase::ConfigParse => format!(
                "globalThis.__bridgeHolderConfig = JSON.parse({});",
                bindings::HOLDER_CONFIG
            ),
            DriverPhase::VaccinationParse => format!(
                "globalThis.__bridgeVaccination = JSON.parse({});",
                bindings::VACCINATION
            ),
            DriverPhase::ProofParse => format!(
                "globalThis.__bridgeProofs = {ns}.parseProofData(__bridgeVaccination, __bridgeHolderConfig, {locale});",
                ns = ns,
                locale = bindings::LOCALE
            ),
            DriverPhase::DocumentBuildInvoke => format!(
                r#"
(function () {{
    var options = {{
        proofs: __bridgeProofs,
        locale: {locale},
        qrSizeInCm: Number({qr_size}),
        createdAt: new Date({created_at}),
        internationalProofScanned: {scanned} === "true"
    }};
    return Promise.resolve({ns}.getDocument(options));
}})();
"#,
                ns = ns,
                locale = bindings::LOCALE,
                qr_size = bindings::QR_SIZE_IN_CM,
                created_at = bindings::CREATED_AT,
                scanned = bindings::INTERNATIONAL_PROOF_SCANNED
            ),
        }
    }
}

/// Script turning the value stored in [`SETTLED_GLOBAL`] into
/// `{ kind, payload }` strings. Bytes travel as a latin1 string.
pub fn export_script() -> String {
    format!(
        r#"
(function (value) {{
    delete globalThis["{settled}"];
    if (value === undefined || value === null) {{
        return {{ kind: "empty", payload: "" }};
    }}
    if (typeof value === "string") {{
        return {{ kind: "text", payload: value }};
    }}
    var view = null;
    if (value instanceof ArrayBuffer) {{
        view = new Uint8Array(value);
    }} else if (ArrayBuffer.isView(value)) {{
        view = new Uint8Array(value.buffer, value.byteOffset, value.byteLength);
    }}
    if (view !== null) {{
        var chunks = [];
        for (var i = 0; i < view.length; i += 8192) {{
            chunks.push(String.fromCharCode.apply(null, view.subarray(i, i + 8192)));
        }}
        return {{ kind: "bytes", payload: chunks.join("") }};
    }}
    var json = JSON.stringify(value);
    if (json === undefined) {{
        return {{ kind: "empty", payload: "" }};
    }}
    return {{ kind: "json", payload: json }};
}})(globalThis["{settled}"]);
"#,
        settled = SETTLED_GLOBAL
    )
}
