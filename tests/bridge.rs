use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proofbridge::{
    Artifact, BackendKind, BoaRuntime, BridgeError, BridgeEvent, ConsoleMode, DocumentBridge,
    DriverPhase, EventHandler, GuestModuleSource, GuestModules, HostInputBundle, QuickJsRuntime,
    ResolveLimits, TimeoutReason, load_module,
};

const POLYFILL: &str = include_str!("fixtures/web-polyfill.js");
const PDF_TOOLS: &str = include_str!("fixtures/pdf-tools.js");

const HOLDER_CONFIG: &str = r#"{"issuer":"CIBG"}"#;
const VACCINATION: &str = r#"{"events":[{"id":"v1"},{"id":"v2"}]}"#;

const BACKENDS: [BackendKind; 2] = [BackendKind::Interpreter, BackendKind::Isolate];

fn bridge(backend: BackendKind) -> DocumentBridge {
    DocumentBridge::builder()
        .with_backend(backend)
        .disable_logging()
        .build()
        .unwrap()
}

fn input() -> HostInputBundle {
    HostInputBundle::new(HOLDER_CONFIG, VACCINATION)
        .with_created_at(Utc.with_ymd_and_hms(2021, 7, 1, 12, 0, 0).unwrap())
}

fn fixture_modules() -> GuestModules {
    GuestModules::new(POLYFILL, PDF_TOOLS)
}

/// Document module with the given `getDocument` body and a pass-through parser.
fn document_module(get_document: &str) -> GuestModules {
    let document = format!(
        r#"
var pdfTools = {{
    parseProofData: function (vaccination, config, locale) {{
        return vaccination.events;
    }},
    getDocument: {get_document}
}};
"#
    );
    GuestModules::new(POLYFILL, document)
}

#[derive(Default)]
struct RecordingHandler(Mutex<Vec<&'static str>>);

impl RecordingHandler {
    fn seen(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, event: &BridgeEvent) {
        let name = match event {
            BridgeEvent::ModuleLoaded(_) => "module_loaded",
            BridgeEvent::EntryInvoked(_) => "entry_invoked",
            BridgeEvent::ResolveStarted(_) => "resolve_started",
            BridgeEvent::Settled(_) => "settled",
            BridgeEvent::Failed(_) => "failed",
        };
        self.0.lock().unwrap().push(name);
    }
}

#[test]
fn fulfilled_document_is_identical_across_backends() {
    let expected = concat!(
        "%PDF-",
        r#"{"proofs":[{"id":"v1","issuer":"CIBG","locale":"nl"},{"id":"v2","issuer":"CIBG","locale":"nl"}],"#,
        r#""locale":"nl","qr":8,"createdAt":"2021-07-01T12:00:00.000Z","international":false}"#
    );

    let artifacts: Vec<Artifact> = BACKENDS
        .iter()
        .map(|backend| bridge(*backend).generate(&fixture_modules(), &input()).unwrap())
        .collect();

    for artifact in &artifacts {
        assert_eq!(artifact.kind(), "bytes");
        assert_eq!(artifact.as_bytes().unwrap(), expected.as_bytes());
    }
    assert_eq!(artifacts[0], artifacts[1]);
}

#[test]
fn input_parameters_reach_the_options_record() {
    let modules = document_module(
        "function (options) { return { locale: options.locale, qr: options.qrSizeInCm, \
         international: options.internationalProofScanned, year: options.createdAt.getUTCFullYear(), \
         proofs: options.proofs.length }; }",
    );
    let input = input()
        .with_locale("en")
        .with_qr_size_in_cm(6.5)
        .with_international_proof_scanned(true);

    for backend in BACKENDS {
        let artifact = bridge(backend).generate(&modules, &input).unwrap();
        assert_eq!(
            artifact,
            Artifact::Json(serde_json::json!({
                "locale": "en",
                "qr": 6.5,
                "international": true,
                "year": 2021,
                "proofs": 2
            })),
            "backend {backend}"
        );
    }
}

#[test]
fn rejection_message_is_surfaced_on_both_backends() {
    let thrown = document_module("async function () { await null; throw new Error('boom'); }");
    let rejected = document_module("function () { return Promise.reject('boom'); }");

    for backend in BACKENDS {
        for modules in [&thrown, &rejected] {
            let err = bridge(backend).generate(modules, &input()).unwrap_err();
            let fault = err.rejection().unwrap_or_else(|| panic!("{backend}: {err}"));
            assert_eq!(fault.message, "boom", "backend {backend}");
        }
    }
}

#[test]
fn proof_parse_failure_never_reaches_resolver() {
    let modules = GuestModules::new(
        POLYFILL,
        r#"
var pdfTools = {
    parseProofData: function () { throw new Error("unknown event type"); },
    getDocument: function () { return "unreachable"; }
};
"#,
    );

    for backend in BACKENDS {
        let recorder = Arc::new(RecordingHandler::default());
        let bridge = DocumentBridge::builder()
            .with_backend(backend)
            .with_event_handler(recorder.clone())
            .build()
            .unwrap();

        let err = bridge.generate(&modules, &input()).unwrap_err();
        assert_eq!(err.phase(), Some(DriverPhase::ProofParse), "backend {backend}");
        match err {
            BridgeError::Execution { message, .. } => assert_eq!(message, "unknown event type"),
            other => panic!("unexpected error: {other}"),
        }

        let seen = recorder.seen();
        assert!(!seen.contains(&"entry_invoked"));
        assert!(!seen.contains(&"resolve_started"));
        assert_eq!(seen.last(), Some(&"failed"));
    }
}

#[test]
fn malformed_input_fails_in_the_matching_parse_phase() {
    for backend in BACKENDS {
        let bad_config = HostInputBundle::new("{not json", VACCINATION);
        let err = bridge(backend).generate(&fixture_modules(), &bad_config).unwrap_err();
        assert_eq!(err.phase(), Some(DriverPhase::ConfigParse));

        let bad_vaccination = HostInputBundle::new(HOLDER_CONFIG, "");
        let err = bridge(backend)
            .generate(&fixture_modules(), &bad_vaccination)
            .unwrap_err();
        assert_eq!(err.phase(), Some(DriverPhase::VaccinationParse));
    }
}

#[test]
fn synchronous_build_throw_is_an_invoke_phase_error() {
    let modules = document_module("function () { throw new TypeError('no options'); }");
    for backend in BACKENDS {
        let err = bridge(backend).generate(&modules, &input()).unwrap_err();
        assert_eq!(err.phase(), Some(DriverPhase::DocumentBuildInvoke));
    }
}

#[test]
fn timer_handles_start_at_seed_and_increase() {
    let modules = document_module(
        "async function () { var order = []; \
         var handles = [1, 2, 3].map(function (n) { return setTimeout(function (v) { order.push(v); }, 1000, n); }); \
         return handles.join(',') + '|' + order.join(','); }",
    );

    for backend in BACKENDS {
        let artifact = bridge(backend).generate(&modules, &input()).unwrap();
        assert_eq!(artifact, Artifact::Text("42,43,44|1,2,3".into()));

        let seeded = DocumentBridge::builder()
            .with_backend(backend)
            .with_timer_seed(100)
            .disable_logging()
            .build()
            .unwrap();
        assert_eq!(
            seeded.generate(&modules, &input()).unwrap(),
            Artifact::Text("100,101,102|1,2,3".into())
        );
    }
}

#[test]
fn timer_counter_is_scoped_to_one_runtime() {
    let modules = document_module("function () { return String(setTimeout(function () {}, 0)); }");
    for backend in BACKENDS {
        let bridge = bridge(backend);
        for _ in 0..3 {
            assert_eq!(
                bridge.generate(&modules, &input()).unwrap(),
                Artifact::Text("42".into())
            );
        }
    }
}

#[test]
fn clear_timeout_is_a_no_op() {
    let modules = document_module(
        "async function () { var ran = false; \
         var handle = setTimeout(function () { ran = true; }, 10); \
         clearTimeout(handle); clearTimeout(9999); clearTimeout('nonsense'); clearTimeout(); \
         return 'ran=' + ran; }",
    );
    for backend in BACKENDS {
        assert_eq!(
            bridge(backend).generate(&modules, &input()).unwrap(),
            Artifact::Text("ran=true".into())
        );
    }
}

#[test]
fn repeated_invocations_are_bit_identical() {
    for backend in BACKENDS {
        let bridge = bridge(backend);
        let first = bridge.generate(&fixture_modules(), &input()).unwrap();
        let second = bridge.generate(&fixture_modules(), &input()).unwrap();
        assert_eq!(first, second);
    }
}

#[test]
fn document_module_before_polyfill_fails_to_load() {
    let polyfill = GuestModuleSource::new("web-polyfill.js", POLYFILL);
    let document = GuestModuleSource::new("pdf-tools.js", PDF_TOOLS);

    let mut boa = BoaRuntime::new();
    assert!(matches!(
        load_module(&mut boa, &document),
        Err(BridgeError::Load { .. })
    ));
    let mut boa = BoaRuntime::new();
    load_module(&mut boa, &polyfill).unwrap();
    load_module(&mut boa, &document).unwrap();

    let mut quickjs = QuickJsRuntime::new().unwrap();
    assert!(matches!(
        load_module(&mut quickjs, &document),
        Err(BridgeError::Load { .. })
    ));
    let mut quickjs = QuickJsRuntime::new().unwrap();
    load_module(&mut quickjs, &polyfill).unwrap();
    load_module(&mut quickjs, &document).unwrap();
}

#[test]
fn swapped_module_order_is_reported_as_load_error() {
    let swapped = GuestModules::from_sources(
        GuestModuleSource::new("pdf-tools.js", PDF_TOOLS),
        GuestModuleSource::new("web-polyfill.js", POLYFILL),
    );
    for backend in BACKENDS {
        match bridge(backend).generate(&swapped, &input()) {
            Err(BridgeError::Load { module, .. }) => assert_eq!(module, "pdf-tools.js"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}

#[test]
fn syntax_errors_in_modules_are_load_errors() {
    let broken = GuestModules::new(POLYFILL, "var pdfTools = {;");
    for backend in BACKENDS {
        let err = bridge(backend).generate(&broken, &input()).unwrap_err();
        assert!(matches!(err, BridgeError::Load { .. }), "backend {backend}: {err}");
    }
}

#[test]
fn never_settling_promise_differs_only_in_diagnosis() {
    let modules = document_module("function () { return new Promise(function () {}); }");

    let err = bridge(BackendKind::Interpreter)
        .generate(&modules, &input())
        .unwrap_err();
    assert!(matches!(err, BridgeError::ResolverViolation(_)));

    let err = bridge(BackendKind::Isolate)
        .generate(&modules, &input())
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Timeout {
            reason: TimeoutReason::QueueExhausted,
            ..
        }
    ));
}

#[test]
fn runaway_guest_is_cut_off_by_step_limit() {
    let modules = document_module("async function () { while (true) { await null; } }");
    let bridge = DocumentBridge::builder()
        .with_backend(BackendKind::Isolate)
        .with_limits(ResolveLimits {
            max_drain_steps: Some(1_000),
            deadline: Some(Duration::from_secs(10)),
        })
        .disable_logging()
        .build()
        .unwrap();

    match bridge.generate(&modules, &input()) {
        Err(BridgeError::Timeout { steps, reason, .. }) => {
            assert_eq!(steps, 1_000);
            assert_eq!(reason, TimeoutReason::StepLimit);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn busy_continuation_is_cut_off_by_deadline() {
    let modules = document_module("async function () { await null; while (true) {} }");
    let bridge = DocumentBridge::builder()
        .with_backend(BackendKind::Isolate)
        .with_limits(ResolveLimits {
            max_drain_steps: None,
            deadline: Some(Duration::from_millis(200)),
        })
        .disable_logging()
        .build()
        .unwrap();

    let started = std::time::Instant::now();
    match bridge.generate(&modules, &input()) {
        Err(BridgeError::Timeout { reason, .. }) => assert_eq!(reason, TimeoutReason::Deadline),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn looping_module_load_is_cut_off_by_deadline() {
    let modules = GuestModules::new(POLYFILL, "while (true) {}");
    let bridge = DocumentBridge::builder()
        .with_backend(BackendKind::Isolate)
        .with_limits(ResolveLimits {
            max_drain_steps: Some(10),
            deadline: Some(Duration::from_millis(200)),
        })
        .disable_logging()
        .build()
        .unwrap();

    match bridge.generate(&modules, &input()) {
        Err(BridgeError::Timeout { steps, reason, .. }) => {
            assert_eq!(steps, 0);
            assert_eq!(reason, TimeoutReason::Deadline);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn sloppy_mode_modules_behave_the_same_on_both_backends() {
    let polyfill = format!(
        "{POLYFILL}\nleaked = 5;\nfunction markGlobal() {{ this.marked = 1; }}\nmarkGlobal();\n"
    );
    let document = r#"
var pdfTools = {
    parseProofData: function (vaccination) { return vaccination.events; },
    getDocument: function (options) {
        detected = (function () { return this; })() === globalThis;
        return "leaked=" + leaked + ",marked=" + marked + ",detected=" + detected;
    }
};
"#;
    let modules = GuestModules::new(polyfill, document);

    for backend in BACKENDS {
        let artifact = bridge(backend).generate(&modules, &input()).unwrap();
        assert_eq!(
            artifact,
            Artifact::Text("leaked=5,marked=1,detected=true".into()),
            "backend {backend}"
        );
    }
}

#[test]
fn non_promise_and_empty_results_are_accepted() {
    let text = document_module("function () { return 'plain'; }");
    let empty = document_module("async function () {}");
    let buffer = document_module("function () { return new Uint8Array([0, 127, 255]).buffer; }");

    for backend in BACKENDS {
        let bridge = bridge(backend);
        assert_eq!(bridge.generate(&text, &input()).unwrap(), Artifact::Text("plain".into()));
        assert_eq!(bridge.generate(&empty, &input()).unwrap(), Artifact::Empty);
        assert_eq!(
            bridge.generate(&buffer, &input()).unwrap().as_bytes().unwrap(),
            &[0u8, 127, 255]
        );
    }
}

#[test]
fn forwarded_console_does_not_change_results() {
    let modules = document_module(
        "function (options) { console.log('building', options.locale); console.error('warn me'); return 'ok'; }",
    );
    for backend in BACKENDS {
        let bridge = DocumentBridge::builder()
            .with_backend(backend)
            .with_console_mode(ConsoleMode::Forward)
            .build()
            .unwrap();
        assert_eq!(bridge.generate(&modules, &input()).unwrap(), Artifact::Text("ok".into()));
    }
}

#[test]
fn custom_namespace_is_used_for_entry_points() {
    let modules = GuestModules::new(
        POLYFILL,
        "var proofs = { parseProofData: function () { return []; }, getDocument: function () { return 'custom'; } };",
    );
    for backend in BACKENDS {
        let bridge = DocumentBridge::builder()
            .with_backend(backend)
            .with_entry_namespace("proofs")
            .disable_logging()
            .build()
            .unwrap();
        assert_eq!(bridge.generate(&modules, &input()).unwrap(), Artifact::Text("custom".into()));

        let err = DocumentBridge::builder()
            .with_backend(backend)
            .disable_logging()
            .build()
            .unwrap()
            .generate(&modules, &input())
            .unwrap_err();
        assert_eq!(err.phase(), Some(DriverPhase::ProofParse));
    }
}

#[tokio::test]
async fn concurrent_async_invocations_use_separate_runtimes() {
    let interpreter = bridge(BackendKind::Interpreter);
    let isolate = bridge(BackendKind::Isolate);

    let (left, right) = tokio::join!(
        interpreter.generate_async(fixture_modules(), input()),
        isolate.generate_async(fixture_modules(), input()),
    );

    assert_eq!(left.unwrap(), right.unwrap());
}
