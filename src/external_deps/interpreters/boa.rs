use boa_engine::builtins::promise::PromiseState;
use boa_engine::object::builtins::JsPromise;
use boa_engine::property::Attribute;
use boa_engine::{Context, JsError, JsResult, JsString, JsValue, NativeFunction, Source, js_string};

use super::{
    BackendKind, EngineError, EngineResult, GuestFault, GuestRuntime, ResolveLimits,
    decode_export, log_guest_console,
};
use crate::guest::driver::{HOST_LOG_FUNCTION, SETTLED_GLOBAL, export_script};
use crate::guest::{Artifact, ConsoleMode, GuestModuleSource, ShimConfig};

/// Cooperative interpreter backed by the Boa JavaScript engine.
///
/// Every script run ends with a full flush of the promise job queue, so by the
/// time the entry script returns its promise has already settled unless the
/// guest scheduled work nothing here can force.
pub struct BoaRuntime {
    context: Context,
}

impl BoaRuntime {
    pub fn new() -> Self {
        Self {
            context: Context::default(),
        }
    }

    fn eval(&mut self, source: &str) -> EngineResult<JsValue> {
        let value = self
            .context
            .eval(Source::from_bytes(source))
            .map_err(|err| EngineError::Thrown(self.fault_from_error(&err)))?;

        self.context
            .run_jobs()
            .map_err(|err| EngineError::Thrown(self.fault_from_error(&err)))?;

        Ok(value)
    }

    fn fault_from_error(&mut self, err: &JsError) -> GuestFault {
        let thrown = err.to_opaque(&mut self.context);
        let fault = describe_value(&thrown, &mut self.context);
        if fault.location.is_some() {
            return fault;
        }
        let location = GuestFault::locate(&err.to_string());
        fault.with_location(location)
    }

    fn export(&mut self, value: JsValue) -> EngineResult<Artifact> {
        self.context
            .global_object()
            .set(JsString::from(SETTLED_GLOBAL), value, false, &mut self.context)
            .map_err(|err| EngineError::Other(err.to_string()))?;

        let exported = self
            .context
            .eval(Source::from_bytes(&export_script()))
            .map_err(|err| EngineError::Other(err.to_string()))?;

        let Some(object) = exported.as_object() else {
            return Err(EngineError::Other("artifact export returned a non-object".into()));
        };

        let kind = object
            .get(js_string!("kind"), &mut self.context)
            .and_then(|kind| kind.to_string(&mut self.context))
            .map_err(|err| EngineError::Other(err.to_string()))?
            .to_std_string_escaped();
        let payload = object
            .get(js_string!("payload"), &mut self.context)
            .and_then(|payload| payload.to_string(&mut self.context))
            .map_err(|err| EngineError::Other(err.to_string()))?
            .to_std_string_escaped();

        decode_export(&kind, payload)
    }

    #[cfg(test)]
    fn eval_to_string(&mut self, source: &str) -> String {
        let value = self.eval(source).unwrap();
        display(&value, &mut self.context)
    }
}

impl Default for BoaRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestRuntime for BoaRuntime {
    type Handle = JsPromise;

    fn backend(&self) -> BackendKind {
        BackendKind::Interpreter
    }

    fn load_module(&mut self, module: &GuestModuleSource) -> EngineResult<()> {
        self.eval(module.source()).map(|_| ())
    }

    fn inject_text(&mut self, name: &str, text: &str) -> EngineResult<()> {
        self.context
            .register_global_property(JsString::from(name), JsString::from(text), Attribute::all())
            .map_err(|err| EngineError::Other(err.to_string()))
    }

    fn install_shim(&mut self, shim: &ShimConfig) -> EngineResult<()> {
        if shim.console == ConsoleMode::Forward {
            self.context
                .register_global_callable(
                    JsString::from(HOST_LOG_FUNCTION),
                    2,
                    NativeFunction::from_fn_ptr(forward_console),
                )
                .map_err(|err| EngineError::Other(err.to_string()))?;
        }

        self.eval(&shim.prelude())
            .map(|_| ())
            .map_err(|err| EngineError::Other(format!("shim install failed: {err}")))
    }

    fn run_phase(&mut self, script: &str) -> EngineResult<()> {
        self.eval(script).map(|_| ())
    }

    fn invoke_async(&mut self, script: &str) -> EngineResult<JsPromise> {
        let value = self.eval(script)?;
        value
            .as_object()
            .and_then(|object| JsPromise::from_object(object.clone()).ok())
            .ok_or_else(|| EngineError::Other("entry script did not evaluate to a promise".into()))
    }

    fn resolve(&mut self, handle: JsPromise, _limits: &ResolveLimits) -> EngineResult<Artifact> {
        // Nothing to drain here: the job queue was flushed when the entry
        // script returned.
        match handle.state() {
            PromiseState::Fulfilled(value) => self.export(value),
            PromiseState::Rejected(reason) => Err(EngineError::Rejected(describe_value(
                &reason,
                &mut self.context,
            ))),
            PromiseState::Pending => Err(EngineError::StillPending),
        }
    }
}

fn forward_console(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let level = args
        .first()
        .map(|value| display(value, context))
        .unwrap_or_default();
    let text = args
        .get(1)
        .map(|value| display(value, context))
        .unwrap_or_default();
    log_guest_console(&level, &text);
    Ok(JsValue::undefined())
}

fn display(value: &JsValue, context: &mut Context) -> String {
    value
        .to_string(context)
        .map(|text| text.to_std_string_escaped())
        .unwrap_or_else(|_| "<unprintable value>".to_string())
}

/// Describe a thrown or rejected value, preferring `Error.message`.
fn describe_value(value: &JsValue, context: &mut Context) -> GuestFault {
    let text = display(value, context);
    let Some(object) = value.as_object() else {
        return GuestFault::new(text);
    };

    let message = object
        .get(js_string!("message"), context)
        .ok()
        .filter(|message| !message.is_undefined())
        .map(|message| display(&message, context))
        .unwrap_or_else(|| text.clone());
    let trace = object
        .get(js_string!("stack"), context)
        .ok()
        .filter(|stack| !stack.is_undefined())
        .map(|stack| display(&stack, context));

    GuestFault::new(message)
        .with_location(GuestFault::locate(&text))
        .with_trace(trace)
}
