use std::time::{Duration, Instant};

use rquickjs::context::EvalOptions;
use rquickjs::promise::PromiseState;
use rquickjs::{
    CatchResultExt, CaughtError, Context, Ctx, FromJs, Function, Object, Persistent, Promise,
    Runtime, Value,
};

use super::{
    BackendKind, EngineError, EngineResult, GuestFault, GuestRuntime, ResolveLimits,
    TimeoutReason, decode_export, log_guest_console,
};
use crate::guest::driver::{HOST_LOG_FUNCTION, SETTLED_GLOBAL, export_script};
use crate::guest::{Artifact, ConsoleMode, GuestModuleSource, ShimConfig};

/// Isolate engine backed by QuickJS.
///
/// Promise continuations stay in the runtime's job queue until the host runs
/// them, so [`GuestRuntime::resolve`] pumps the queue one job at a time and
/// re-inspects the promise after each step.
pub struct QuickJsRuntime {
    runtime: Runtime,
    context: Context,
    script_deadline: Option<Duration>,
}

impl QuickJsRuntime {
    pub fn new() -> EngineResult<Self> {
        let runtime = Runtime::new().map_err(engine_error)?;
        let context = Context::full(&runtime).map_err(engine_error)?;
        Ok(Self {
            runtime,
            context,
            script_deadline: None,
        })
    }

    /// Run one synchronous evaluation under the script deadline, if any.
    /// An evaluation that throws after the cutoff was interrupted.
    fn guarded<T>(&self, run: impl FnOnce() -> EngineResult<T>) -> EngineResult<T> {
        let Some(deadline) = self.script_deadline else {
            return run();
        };

        let started = Instant::now();
        let cutoff = started + deadline;
        self.runtime
            .set_interrupt_handler(Some(Box::new(move || Instant::now() >= cutoff)));
        let outcome = run();
        self.runtime.set_interrupt_handler(None);

        match outcome {
            Err(EngineError::Thrown(_)) if started.elapsed() >= deadline => {
                Err(EngineError::Timeout {
                    steps: 0,
                    elapsed: started.elapsed(),
                    reason: TimeoutReason::Deadline,
                })
            }
            other => other,
        }
    }

    fn eval_unit(&self, source: &str) -> EngineResult<()> {
        self.guarded(|| {
            self.context.with(|ctx| {
                ctx.eval_with_options::<(), _>(source, script_options())
                    .catch(&ctx)
                    .map_err(|caught| EngineError::Thrown(fault_from_caught(&ctx, caught)))
            })
        })
    }

    fn state(&self, handle: &Persistent<Promise<'static>>) -> EngineResult<PromiseState> {
        self.context.with(|ctx| {
            handle
                .clone()
                .restore(&ctx)
                .map(|promise| promise.state())
                .map_err(engine_error)
        })
    }

    /// Export the settled value, or describe the rejection reason.
    fn settle(&self, handle: Persistent<Promise<'static>>) -> EngineResult<Artifact> {
        self.context.with(|ctx| {
            let promise = handle.restore(&ctx).map_err(engine_error)?;
            match promise.result::<Value>() {
                Some(result) => match result.catch(&ctx) {
                    Ok(value) => export_value(&ctx, value),
                    Err(caught) => Err(EngineError::Rejected(fault_from_caught(&ctx, caught))),
                },
                None => Err(EngineError::StillPending),
            }
        })
    }

    fn drain(
        &self,
        handle: Persistent<Promise<'static>>,
        limits: &ResolveLimits,
        started: Instant,
    ) -> EngineResult<Artifact> {
        let timeout = |steps: u64, reason: TimeoutReason| EngineError::Timeout {
            steps,
            elapsed: started.elapsed(),
            reason,
        };
        let past_deadline = || limits.deadline.is_some_and(|deadline| started.elapsed() >= deadline);

        let mut steps = 0u64;
        loop {
            match self.state(&handle)? {
                PromiseState::Resolved | PromiseState::Rejected => return self.settle(handle),
                PromiseState::Pending => {}
            }

            if limits.max_drain_steps.is_some_and(|max| steps >= max) {
                return Err(timeout(steps, TimeoutReason::StepLimit));
            }
            if past_deadline() {
                return Err(timeout(steps, TimeoutReason::Deadline));
            }

            let ran = match self.runtime.execute_pending_job() {
                Ok(ran) => ran,
                Err(_) if past_deadline() => {
                    return Err(timeout(steps + 1, TimeoutReason::Deadline));
                }
                Err(err) => return Err(EngineError::Other(format!("pending job failed: {err}"))),
            };
            if !ran {
                return Err(timeout(steps, TimeoutReason::QueueExhausted));
            }
            steps += 1;

            // A job cut short by the interrupt handler may have rejected the
            // promise with a bogus reason; report the deadline instead.
            if past_deadline() {
                return Err(timeout(steps, TimeoutReason::Deadline));
            }
        }
    }

    #[cfg(test)]
    fn eval_to_string(&self, source: &str) -> String {
        self.context.with(|ctx| {
            let value: Value = ctx.eval_with_options(source, script_options()).unwrap();
            display(&ctx, value)
        })
    }
}

impl GuestRuntime for QuickJsRuntime {
    type Handle = Persistent<Promise<'static>>;

    fn backend(&self) -> BackendKind {
        BackendKind::Isolate
    }

    fn load_module(&mut self, module: &GuestModuleSource) -> EngineResult<()> {
        self.eval_unit(module.source())
    }

    fn inject_text(&mut self, name: &str, text: &str) -> EngineResult<()> {
        self.context
            .with(|ctx| ctx.globals().set(name, text))
            .map_err(engine_error)
    }

    fn install_shim(&mut self, shim: &ShimConfig) -> EngineResult<()> {
        if shim.console == ConsoleMode::Forward {
            self.context
                .with(|ctx| {
                    let sink = Function::new(ctx.clone(), |level: String, text: String| {
                        log_guest_console(&level, &text);
                    })?;
                    ctx.globals().set(HOST_LOG_FUNCTION, sink)
                })
                .map_err(engine_error)?;
        }

        self.eval_unit(&shim.prelude())
            .map_err(|err| EngineError::Other(format!("shim install failed: {err}")))
    }

    fn run_phase(&mut self, script: &str) -> EngineResult<()> {
        self.eval_unit(script)
    }

    fn set_script_deadline(&mut self, deadline: Option<Duration>) {
        self.script_deadline = deadline;
    }

    fn invoke_async(&mut self, script: &str) -> EngineResult<Self::Handle> {
        self.guarded(|| {
            self.context.with(|ctx| {
                let value = ctx
                    .eval_with_options::<Value, _>(script, script_options())
                    .catch(&ctx)
                    .map_err(|caught| EngineError::Thrown(fault_from_caught(&ctx, caught)))?;
                let promise = Promise::from_js(&ctx, value).map_err(|_| {
                    EngineError::Other("entry script did not evaluate to a promise".into())
                })?;
                Ok(Persistent::save(&ctx, promise))
            })
        })
    }

    fn resolve(&mut self, handle: Self::Handle, limits: &ResolveLimits) -> EngineResult<Artifact> {
        let started = Instant::now();
        if let Some(deadline) = limits.deadline {
            let cutoff = started + deadline;
            self.runtime
                .set_interrupt_handler(Some(Box::new(move || Instant::now() >= cutoff)));
        }

        let outcome = self.drain(handle, limits, started);
        self.runtime.set_interrupt_handler(None);
        outcome
    }
}

/// Global, non-strict evaluation: the same rules a classic `<script>` and the
/// interpreter backend apply.
fn script_options() -> EvalOptions {
    let mut options = EvalOptions::default();
    options.strict = false;
    options
}

fn engine_error(err: rquickjs::Error) -> EngineError {
    EngineError::Other(format!("QuickJS: {err}"))
}

fn display<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> String {
    ctx.globals()
        .get::<_, Function>("String")
        .and_then(|to_string| to_string.call::<_, String>((value,)))
        .unwrap_or_else(|_| "<unprintable value>".to_string())
}

fn fault_from_caught<'js>(ctx: &Ctx<'js>, caught: CaughtError<'js>) -> GuestFault {
    match caught {
        CaughtError::Exception(exception) => {
            let object = exception.as_object();
            let file = object.get::<_, Option<String>>("fileName").ok().flatten();
            let line = object.get::<_, Option<i32>>("lineNumber").ok().flatten();
            let location = match (file, line) {
                (Some(file), Some(line)) => Some(format!("{file}:{line}")),
                (None, Some(line)) => Some(format!("line {line}")),
                _ => None,
            };
            let message = exception
                .message()
                .unwrap_or_else(|| display(ctx, object.clone().into_value()));

            GuestFault::new(message)
                .with_location(location)
                .with_trace(exception.stack())
        }
        CaughtError::Value(value) => GuestFault::new(display(ctx, value)),
        CaughtError::Error(err) => GuestFault::new(err.to_string()),
    }
}

fn export_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> EngineResult<Artifact> {
    ctx.globals()
        .set(SETTLED_GLOBAL, value)
        .map_err(engine_error)?;

    let exported = ctx
        .eval_with_options::<Object, _>(export_script(), script_options())
        .catch(ctx)
        .map_err(|caught| EngineError::Other(fault_from_caught(ctx, caught).to_string()))?;
    let kind: String = exported.get("kind").map_err(engine_error)?;
    let payload: String = exported.get("payload").map_err(engine_error)?;

    decode_export(&kind, payload)
}
