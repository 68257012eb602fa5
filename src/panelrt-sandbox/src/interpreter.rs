//! The per-slot interpreter and the single-poll suspend/resume driver
//! (§4.1, §4.4, §9).
//!
//! Suspension is implemented on top of QuickJS's native async/await, not a
//! bespoke continuation system: `$ext.<name>.<method>(...)` returns a
//! JS-level deferred Promise (`bindings::begin_suspension`). After the
//! handler call returns, the driver drains the job queue one step at a time
//! (`Runtime::execute_pending_job`) and inspects the top-level handler
//! Promise. If it is still pending once the queue is empty, that can only be
//! because it is blocked on the extension promise we just created — by
//! construction nothing else in this sandbox can leave a promise pending.
//! That is the suspension point; `resume` settles the deferred promise and
//! resumes draining.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use anyhow::{anyhow, Context as _};
use panelrt_common::error::ErrorCode;
use panelrt_common::{AsyncResult, RuntimeError, SuspensionDetails, SuspensionId};
use rquickjs::{Ctx, Function, Module, Persistent, Promise, PromiseState, Runtime, Value};
use serde_json::Value as Json;
use tracing::instrument;

use crate::bindings::{self, SharedHost};
use crate::bytecode::Bytecode;

pub(crate) struct PendingSuspension {
    pub details: SuspensionDetails,
    pub resolve: Persistent<Function<'static>>,
    pub reject: Persistent<Function<'static>>,
}

pub(crate) type PendingSlot = Rc<RefCell<Option<PendingSuspension>>>;

/// What the call suspended on, carried by the caller (the interpreter pool
/// slot) between `execute`/`resume` invocations, so the frozen interpreter
/// can be re-entered later (§3's `InterpreterSlot.current-context slot`).
pub struct Frozen {
    top_level: Persistent<Promise<'static>>,
    resolve: Persistent<Function<'static>>,
    reject: Persistent<Function<'static>>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Success { return_value: Option<Json> },
    Error(RuntimeError),
    Suspended(SuspensionDetails),
}

/// A single QuickJS runtime + context, reused across many invocations.
///
/// `Runtime`/`Context` are not `Send` because they hold raw pointers, purely
/// as a lint rather than an actual soundness concern here: every public
/// method of `Interpreter` takes `&mut self`, so there is never concurrent
/// access, and the pool that owns this type moves it wholesale between its
/// worker task and an idle slot list rather than sharing it.
pub struct Interpreter {
    runtime: Runtime,
    context: rquickjs::Context,
}

unsafe impl Send for Interpreter {}

impl Interpreter {
    pub fn new(max_memory_bytes: usize) -> anyhow::Result<Self> {
        let runtime = Runtime::new().context("failed to initialize QuickJS runtime")?;
        if max_memory_bytes > 0 {
            runtime.set_memory_limit(max_memory_bytes);
        }
        let context = rquickjs::Context::full(&runtime).context("failed to create QuickJS context")?;
        Ok(Self { runtime, context })
    }

    pub fn memory_used_bytes(&self) -> u64 {
        self.runtime.memory_usage().memory_used_size as u64
    }

    fn arm_deadline(&self, deadline: Instant) {
        self.runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));
    }

    fn disarm_deadline(&self) {
        self.runtime.set_interrupt_handler(None);
    }

    #[instrument(skip_all, level = "debug")]
    pub fn execute(
        &mut self,
        bytecode: &Bytecode,
        host: SharedHost,
        args: Json,
        deadline: Instant,
    ) -> anyhow::Result<(RunOutcome, Option<Frozen>)> {
        self.arm_deadline(deadline);
        let result = self.context.with(|ctx| -> anyhow::Result<(RunOutcome, Option<Frozen>)> {
            let pending: PendingSlot = Rc::new(RefCell::new(None));
            bindings::install(&ctx, host, pending.clone())
                .map_err(|e| translate_js_error(&ctx, e, deadline))?;

            let source = bytecode.wrapped_source.to_string();
            let module = match Module::declare(ctx.clone(), "handler.js", source) {
                Ok(m) => m,
                Err(e) => {
                    return Ok((
                        RunOutcome::Error(RuntimeError::new(
                            ErrorCode::CompilationError,
                            describe_exception(&ctx, e),
                        )),
                        None,
                    ))
                }
            };
            let (module, eval_promise) = match module.eval() {
                Ok(pair) => pair,
                Err(e) => {
                    return Ok((
                        RunOutcome::Error(RuntimeError::new(
                            ErrorCode::CompilationError,
                            describe_exception(&ctx, e),
                        )),
                        None,
                    ))
                }
            };
            drain_jobs(&self.runtime, deadline)?;
            if eval_promise.state() == PromiseState::Rejected {
                let reason: Value = eval_promise.result().unwrap_or(Ok(Value::new_undefined(ctx.clone())))?;
                return Ok((RunOutcome::Error(error_from_value(&ctx, reason, ErrorCode::CompilationError)), None));
            }

            let handler_func: Function = match module.get("handler") {
                Ok(f) => f,
                Err(_) => {
                    return Ok((
                        RunOutcome::Error(RuntimeError::new(
                            ErrorCode::InvalidHandler,
                            "handler script does not export a `handler` function",
                        )),
                        None,
                    ))
                }
            };

            let arg_json = serde_json::to_string(&args).unwrap_or_else(|_| "null".to_string());
            let arg_value = ctx.json_parse(arg_json).map_err(|e| translate_js_error(&ctx, e, deadline))?;

            let call_result: Result<Value, rquickjs::Error> = handler_func.call((arg_value,));
            let result_value = match call_result {
                Ok(v) => v,
                Err(rquickjs::Error::Exception) => {
                    let exc = ctx.catch();
                    return Ok((RunOutcome::Error(error_from_value(&ctx, exc, ErrorCode::ExecutionError)), None));
                }
                Err(e) => return Err(translate_js_error(&ctx, e, deadline)),
            };

            settle(&self.runtime, &ctx, result_value, pending, deadline)
        });
        self.disarm_deadline();
        result
    }

    #[instrument(skip_all, level = "debug")]
    pub fn resume(
        &mut self,
        frozen: Frozen,
        host: SharedHost,
        async_result: AsyncResult,
        deadline: Instant,
    ) -> anyhow::Result<(RunOutcome, Option<Frozen>)> {
        self.arm_deadline(deadline);
        let result = self.context.with(|ctx| -> anyhow::Result<(RunOutcome, Option<Frozen>)> {
            // host bindings are stateless wrt the frozen promise (the accumulators
            // live in `host`), but handler code could call $ext/$state again
            // before suspending anew, so bindings must be reinstalled with a
            // fresh pending slot exactly like `execute` does.
            let pending: PendingSlot = Rc::new(RefCell::new(None));
            bindings::install(&ctx, host, pending.clone()).map_err(|e| translate_js_error(&ctx, e, deadline))?;

            let resolve = frozen.resolve.restore(&ctx).map_err(|e| translate_js_error(&ctx, e, deadline))?;
            let reject = frozen.reject.restore(&ctx).map_err(|e| translate_js_error(&ctx, e, deadline))?;
            let top_level = frozen.top_level.restore(&ctx).map_err(|e| translate_js_error(&ctx, e, deadline))?;

            let settle_call: Result<Value, rquickjs::Error> = if async_result.success {
                let value_json = serde_json::to_string(&async_result.value.unwrap_or(Json::Null)).unwrap();
                let value = ctx.json_parse(value_json).map_err(|e| translate_js_error(&ctx, e, deadline))?;
                resolve.call((value,))
            } else {
                let message = async_result.error.unwrap_or_else(|| "extension call failed".to_string());
                reject.call((message,))
            };
            if let Err(e) = settle_call {
                return Err(translate_js_error(&ctx, e, deadline));
            }

            drain_jobs(&self.runtime, deadline)?;
            inspect_promise(&ctx, top_level, pending)
        });
        self.disarm_deadline();
        result
    }
}

/// Installs the deferred promise for an `$ext` call and stashes the
/// resolve/reject handles; called from `bindings::install`'s `$ext`
/// dispatcher closure.
pub(crate) fn begin_suspension<'js>(
    ctx: &Ctx<'js>,
    pending: &PendingSlot,
    extension_name: String,
    method_name: String,
    args: Json,
) -> rquickjs::Result<Value<'js>> {
    let deferred: rquickjs::Array = ctx.eval(bindings::DEFERRED_HELPER)?;
    let promise: Value = deferred.get(0)?;
    let resolve: Function = deferred.get(1)?;
    let reject: Function = deferred.get(2)?;
    let details = SuspensionDetails {
        suspension_id: SuspensionId::new(),
        extension_name,
        method_name,
        args,
    };
    *pending.borrow_mut() = Some(PendingSuspension {
        details,
        resolve: Persistent::save(ctx, resolve),
        reject: Persistent::save(ctx, reject),
    });
    Ok(promise)
}

/// Drains the job queue, then inspects `result_value` (which must be the
/// handler's return value, whether or not it is a promise) to decide
/// whether this invocation finished or suspended.
fn settle<'js>(
    runtime: &Runtime,
    ctx: &Ctx<'js>,
    result_value: Value<'js>,
    pending: PendingSlot,
    deadline: Instant,
) -> anyhow::Result<(RunOutcome, Option<Frozen>)> {
    drain_jobs(runtime, deadline)?;

    let Some(promise) = result_value.as_promise().cloned() else {
        // A synchronous (non-async) handler: the return value is final.
        let json = value_to_json(ctx, result_value)?;
        return Ok((RunOutcome::Success { return_value: Some(json) }, None));
    };

    inspect_promise(ctx, promise, pending)
}

/// Inspects an already-drained top-level handler promise and decides
/// whether the invocation finished or is suspended on an `$ext` call.
fn inspect_promise<'js>(
    ctx: &Ctx<'js>,
    promise: Promise<'js>,
    pending: PendingSlot,
) -> anyhow::Result<(RunOutcome, Option<Frozen>)> {
    match promise.state() {
        PromiseState::Pending => {
            let Some(frozen_suspension) = pending.borrow_mut().take() else {
                return Err(anyhow!(
                    "handler promise is pending with no recorded suspension; this is an internal bug"
                ));
            };
            let top_level = Persistent::save(ctx, promise);
            Ok((
                RunOutcome::Suspended(frozen_suspension.details),
                Some(Frozen {
                    top_level,
                    resolve: frozen_suspension.resolve,
                    reject: frozen_suspension.reject,
                }),
            ))
        }
        PromiseState::Fulfilled => {
            let value: Value = promise.result().unwrap_or(Ok(Value::new_undefined(ctx.clone())))?;
            let json = value_to_json(ctx, value)?;
            Ok((RunOutcome::Success { return_value: Some(json) }, None))
        }
        PromiseState::Rejected => {
            let value: Value = promise.result().unwrap_or(Ok(Value::new_undefined(ctx.clone())))?;
            Ok((RunOutcome::Error(error_from_value(ctx, value, ErrorCode::ExecutionError)), None))
        }
    }
}

fn drain_jobs(runtime: &Runtime, deadline: Instant) -> anyhow::Result<()> {
    loop {
        if Instant::now() >= deadline {
            return Err(anyhow!(TIMEOUT_SENTINEL));
        }
        match runtime.execute_pending_job() {
            Ok(true) => continue,
            Ok(false) => return Ok(()),
            Err(e) => return Err(anyhow!("error executing pending job: {e}")),
        }
    }
}

fn value_to_json(ctx: &Ctx<'_>, value: Value<'_>) -> anyhow::Result<Json> {
    if value.type_of() == rquickjs::Type::Undefined {
        return Ok(Json::Null);
    }
    let text = ctx
        .json_stringify(value)
        .map_err(|e| anyhow!("failed to stringify handler result: {e}"))?
        .map(|s| s.to_string())
        .transpose()
        .map_err(|e| anyhow!("failed to stringify handler result: {e}"))?
        .unwrap_or_else(|| "null".to_string());
    Ok(serde_json::from_str(&text).unwrap_or(Json::Null))
}

fn error_from_value(ctx: &Ctx<'_>, value: Value<'_>, fallback: ErrorCode) -> RuntimeError {
    if let Some(obj) = value.as_object() {
        let code = obj
            .get::<_, String>("code")
            .ok()
            .and_then(|c| code_from_str(&c))
            .unwrap_or(fallback);
        let message = obj
            .get::<_, String>("message")
            .unwrap_or_else(|_| describe_value(ctx, &value));
        return RuntimeError::new(code, message);
    }
    RuntimeError::new(fallback, describe_value(ctx, &value))
}

fn code_from_str(s: &str) -> Option<ErrorCode> {
    Some(match s {
        "TIMEOUT" => ErrorCode::Timeout,
        "MEMORY_LIMIT" => ErrorCode::MemoryLimit,
        "RESOURCE_LIMIT" => ErrorCode::ResourceLimit,
        "COMPILATION_ERROR" => ErrorCode::CompilationError,
        "EXECUTION_ERROR" => ErrorCode::ExecutionError,
        "PERMISSION_DENIED" => ErrorCode::PermissionDenied,
        "EXTENSION_NOT_FOUND" => ErrorCode::ExtensionNotFound,
        "METHOD_NOT_FOUND" => ErrorCode::MethodNotFound,
        "INVALID_HANDLER" => ErrorCode::InvalidHandler,
        "INTERNAL_ERROR" => ErrorCode::InternalError,
        _ => return None,
    })
}

fn describe_value(ctx: &Ctx<'_>, value: &Value<'_>) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    ctx.json_stringify(value.clone())
        .ok()
        .flatten()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| "unknown error".to_string())
}

fn describe_exception(ctx: &Ctx<'_>, _err: rquickjs::Error) -> String {
    let exc = ctx.catch();
    describe_value(ctx, &exc)
}

/// Folds timeouts (detected via the deadline, since QuickJS's interrupt
/// mechanism does not distinguish "interrupted" from other engine errors in
/// a way this crate's rquickjs feature set exposes) ahead of generic engine
/// error translation.
fn translate_js_error(ctx: &Ctx<'_>, err: rquickjs::Error, deadline: Instant) -> anyhow::Error {
    if Instant::now() >= deadline {
        return anyhow!(TIMEOUT_SENTINEL);
    }
    match err {
        rquickjs::Error::Exception => {
            let exc = ctx.catch();
            anyhow!("unhandled js exception: {}", describe_value(ctx, &exc))
        }
        other => anyhow!("js engine error: {other}"),
    }
}

/// Sentinel recognized by `panelrt-core`'s pool to distinguish a deadline
/// trip from a genuine internal bug, without needing `anyhow::Error` to
/// carry a typed payload through `Context::with`'s `'js`-bounded closure.
pub const TIMEOUT_SENTINEL: &str = "__panelrt_timeout__";
