//! Installs the `$state`/`$emit`/`$view`/`$ext`/`$log` host surface (§4.1's
//! table) plus `console`/`crypto` conveniences and forbidden-global
//! shadowing (§4.1). Re-installed fresh on every invocation — nothing here
//! is relied on to survive pool reuse.

use std::sync::{Arc, Mutex};

use panelrt_common::error::ErrorCode;
use panelrt_common::{EmittedEvent, RuntimeError, StateMutation, ViewCommand};
use rquickjs::{Ctx, Function, Object, Value};
use serde_json::Value as Json;

use crate::context::HostContext;
use crate::crypto;
use crate::interpreter::PendingSlot;

pub type SharedHost = Arc<Mutex<dyn HostContext + Send>>;

/// Builds an `rquickjs::Error` carrying a JS-visible `{code, message}`
/// object so handler code can `try { ... } catch (e) { e.code === "..." }`.
pub fn throw_runtime_error<'js>(ctx: &Ctx<'js>, err: RuntimeError) -> rquickjs::Error {
    let code = match err.code {
        ErrorCode::Timeout => "TIMEOUT",
        ErrorCode::MemoryLimit => "MEMORY_LIMIT",
        ErrorCode::ResourceLimit => "RESOURCE_LIMIT",
        ErrorCode::CompilationError => "COMPILATION_ERROR",
        ErrorCode::ExecutionError => "EXECUTION_ERROR",
        ErrorCode::PermissionDenied => "PERMISSION_DENIED",
        ErrorCode::ExtensionNotFound => "EXTENSION_NOT_FOUND",
        ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
        ErrorCode::InvalidHandler => "INVALID_HANDLER",
        ErrorCode::InternalError => "INTERNAL_ERROR",
    };
    let obj = match Object::new(ctx.clone()) {
        Ok(obj) => obj,
        Err(e) => return e,
    };
    let _ = obj.set("code", code);
    let _ = obj.set("message", err.message.clone());
    ctx.throw(Value::from_object(obj))
}

fn json_arg(raw: &str) -> Json {
    serde_json::from_str(raw).unwrap_or(Json::Null)
}

pub fn install<'js>(
    ctx: &Ctx<'js>,
    host: SharedHost,
    pending: PendingSlot,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    // --- $state -----------------------------------------------------
    {
        let host = host.clone();
        let f = Function::new(ctx.clone(), move |ctx: Ctx<'js>, key: String| -> rquickjs::Result<String> {
            let mut h = host.lock().unwrap();
            h.note_host_call().map_err(|e| throw_runtime_error(&ctx, e))?;
            let required = format!("state:read:{key}");
            if !h.check_capability(&required) {
                return Err(throw_runtime_error(&ctx, RuntimeError::permission_denied(&required)));
            }
            let value = h.state_get(&key).unwrap_or(Json::Null);
            Ok(serde_json::to_string(&value).unwrap_or_else(|_| "null".into()))
        })?;
        globals.set("__state_get", f)?;
    }
    {
        let host = host.clone();
        let f = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, key: String, value_json: String| -> rquickjs::Result<()> {
                let mut h = host.lock().unwrap();
                h.note_host_call().map_err(|e| throw_runtime_error(&ctx, e))?;
                let required = format!("state:write:{key}");
                if !h.check_capability(&required) {
                    return Err(throw_runtime_error(&ctx, RuntimeError::permission_denied(&required)));
                }
                if h.state_is_computed(&key) {
                    return Err(throw_runtime_error(
                        &ctx,
                        RuntimeError::new(ErrorCode::InvalidHandler, format!("{key} backs a computed slot")),
                    ));
                }
                h.push_mutation(StateMutation::set(key, json_arg(&value_json)));
                Ok(())
            },
        )?;
        globals.set("__state_set", f)?;
    }
    {
        let host = host.clone();
        let f = Function::new(ctx.clone(), move |ctx: Ctx<'js>, key: String| -> rquickjs::Result<()> {
            let mut h = host.lock().unwrap();
            h.note_host_call().map_err(|e| throw_runtime_error(&ctx, e))?;
            let required = format!("state:write:{key}");
            if !h.check_capability(&required) {
                return Err(throw_runtime_error(&ctx, RuntimeError::permission_denied(&required)));
            }
            if h.state_is_computed(&key) {
                return Err(throw_runtime_error(
                    &ctx,
                    RuntimeError::new(ErrorCode::InvalidHandler, format!("{key} backs a computed slot")),
                ));
            }
            h.push_mutation(StateMutation::delete(key));
            Ok(())
        })?;
        globals.set("__state_delete", f)?;
    }
    {
        let host = host.clone();
        let f = Function::new(ctx.clone(), move |ctx: Ctx<'js>, key: String| -> rquickjs::Result<bool> {
            let mut h = host.lock().unwrap();
            h.note_host_call().map_err(|e| throw_runtime_error(&ctx, e))?;
            let required = format!("state:read:{key}");
            if !h.check_capability(&required) {
                return Err(throw_runtime_error(&ctx, RuntimeError::permission_denied(&required)));
            }
            Ok(h.state_has(&key))
        })?;
        globals.set("__state_has", f)?;
    }
    {
        let host = host.clone();
        let f = Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<String> {
            let mut h = host.lock().unwrap();
            h.note_host_call().map_err(|e| throw_runtime_error(&ctx, e))?;
            if !h.check_capability("state:read:*") {
                return Err(throw_runtime_error(&ctx, RuntimeError::permission_denied("state:read:*")));
            }
            Ok(serde_json::to_string(&h.state_keys()).unwrap_or_else(|_| "[]".into()))
        })?;
        globals.set("__state_keys", f)?;
    }

    // --- $emit / $emit.toast -----------------------------------------
    {
        let host = host.clone();
        let f = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: String, payload_json: String| -> rquickjs::Result<()> {
                let mut h = host.lock().unwrap();
                h.note_host_call().map_err(|e| throw_runtime_error(&ctx, e))?;
                let required = format!("events:emit:{name}");
                if !h.check_capability(&required) {
                    return Err(throw_runtime_error(&ctx, RuntimeError::permission_denied(&required)));
                }
                let timestamp = h.now_unix_ms();
                h.push_event(EmittedEvent { name, payload: json_arg(&payload_json), timestamp });
                Ok(())
            },
        )?;
        globals.set("__emit", f)?;
    }
    {
        let host = host.clone();
        let f = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, kind: String, message: String| -> rquickjs::Result<()> {
                let mut h = host.lock().unwrap();
                h.note_host_call().map_err(|e| throw_runtime_error(&ctx, e))?;
                let required = "events:emit:toast".to_string();
                if !h.check_capability(&required) {
                    return Err(throw_runtime_error(&ctx, RuntimeError::permission_denied(&required)));
                }
                let timestamp = h.now_unix_ms();
                h.push_event(EmittedEvent {
                    name: "toast".to_string(),
                    payload: serde_json::json!({ "kind": kind, "message": message }),
                    timestamp,
                });
                Ok(())
            },
        )?;
        globals.set("__emit_toast", f)?;
    }

    // --- $view.<id>.<method>(...) -------------------------------------
    {
        let host = host.clone();
        let f = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, component_id: String, command: String, params_json: String| -> rquickjs::Result<()> {
                let mut h = host.lock().unwrap();
                h.note_host_call().map_err(|e| throw_runtime_error(&ctx, e))?;
                let required = format!("view:update:{component_id}");
                if !h.check_capability(&required) {
                    return Err(throw_runtime_error(&ctx, RuntimeError::permission_denied(&required)));
                }
                h.push_view_command(ViewCommand {
                    component_id,
                    command,
                    params: json_arg(&params_json),
                });
                Ok(())
            },
        )?;
        globals.set("__view_dispatch", f)?;
    }

    // --- $ext.<name>.<method>(...) — the sole suspension point --------
    {
        let host = host.clone();
        let f = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: String, method: String, args_json: String| -> rquickjs::Result<Value<'js>> {
                {
                    let mut h = host.lock().unwrap();
                    h.note_host_call().map_err(|e| throw_runtime_error(&ctx, e))?;
                    let required = format!("ext:{name}");
                    if !h.check_capability(&required) {
                        return Err(throw_runtime_error(&ctx, RuntimeError::permission_denied(&required)));
                    }
                    if !h.extension_exists(&name) {
                        return Err(throw_runtime_error(
                            &ctx,
                            RuntimeError::new(ErrorCode::ExtensionNotFound, format!("unknown extension: {name}")),
                        ));
                    }
                    if !h.extension_has_method(&name, &method) {
                        return Err(throw_runtime_error(
                            &ctx,
                            RuntimeError::new(
                                ErrorCode::MethodNotFound,
                                format!("extension {name} has no method {method}"),
                            ),
                        ));
                    }
                }
                crate::interpreter::begin_suspension(&ctx, &pending, name, method, json_arg(&args_json))
            },
        )?;
        globals.set("__ext_dispatch", f)?;
    }

    // --- $log ----------------------------------------------------------
    {
        let host = host.clone();
        let f = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, level: String, message: String, data_json: Option<String>| -> rquickjs::Result<()> {
                let mut h = host.lock().unwrap();
                h.note_host_call().map_err(|e| throw_runtime_error(&ctx, e))?;
                let data = data_json.map(|raw| json_arg(&raw));
                h.push_log(level, message, data);
                Ok(())
            },
        )?;
        globals.set("__log", f)?;
    }

    crypto::install(ctx)?;

    ctx.eval::<(), _>(PRELUDE)?;
    ctx.eval::<(), _>(FORBIDDEN_GLOBALS)?;
    Ok(())
}

/// Builds a pending `[promise, resolve, reject]` triple; used by the `$ext`
/// dispatcher to turn a host call into something a handler can `await`.
pub(crate) const DEFERRED_HELPER: &str = r#"
(function () {
  let resolve, reject;
  const promise = new Promise(function (res, rej) { resolve = res; reject = rej; });
  return [promise, resolve, reject];
})()
"#;

const PRELUDE: &str = r#"
(function () {
  globalThis.$state = {
    get: function (key) { return JSON.parse(__state_get(key)); },
    set: function (key, value) { return __state_set(key, JSON.stringify(value === undefined ? null : value)); },
    delete: function (key) { return __state_delete(key); },
    has: function (key) { return __state_has(key); },
    keys: function () { return JSON.parse(__state_keys()); },
  };

  const emit = function (name, payload) { return __emit(name, JSON.stringify(payload === undefined ? null : payload)); };
  emit.toast = function (kind, message) { return __emit_toast(kind, message); };
  globalThis.$emit = emit;

  globalThis.$view = new Proxy({}, {
    get: function (_target, id) {
      return new Proxy({}, {
        get: function (_t, method) {
          return function (...args) { return __view_dispatch(String(id), String(method), JSON.stringify(args)); };
        },
      });
    },
  });

  globalThis.$ext = new Proxy({}, {
    get: function (_target, name) {
      return new Proxy({}, {
        get: function (_t, method) {
          return function (...args) { return __ext_dispatch(String(name), String(method), JSON.stringify(args)); };
        },
      });
    },
  });

  globalThis.$log = function (level, message, data) {
    return __log(String(level), String(message), data === undefined ? undefined : JSON.stringify(data));
  };

  globalThis.console = {
    log: function (...args) { return __log("info", args.map(String).join(" ")); },
    info: function (...args) { return __log("info", args.map(String).join(" ")); },
    warn: function (...args) { return __log("warn", args.map(String).join(" ")); },
    error: function (...args) { return __log("error", args.map(String).join(" ")); },
    debug: function (...args) { return __log("debug", args.map(String).join(" ")); },
  };
})();
"#;

/// Shadows browser/host globals that have no meaning (or are actively
/// dangerous) inside a handler sandbox (§4.1). Reapplied every invocation.
const FORBIDDEN_GLOBALS: &str = r#"
(function () {
  const forbidden = [
    "window", "document", "globalThis", "self",
    "fetch", "XMLHttpRequest", "WebSocket",
    "setTimeout", "setInterval", "setImmediate", "clearTimeout", "clearInterval",
    "Function", "eval",
    "require", "process", "importScripts",
  ];
  for (const name of forbidden) {
    if (name === "globalThis") continue; // would shadow the shadowing mechanism itself
    try {
      Object.defineProperty(globalThis, name, {
        configurable: true,
        enumerable: false,
        get: function () { throw new Error("access to '" + name + "' is forbidden in this sandbox"); },
        set: function () { throw new Error("access to '" + name + "' is forbidden in this sandbox"); },
      });
    } catch (e) { /* already non-configurable; leave as-is */ }
  }
})();
"#;
