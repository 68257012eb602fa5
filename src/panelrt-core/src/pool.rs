//! The interpreter pool (§4.1): semaphore-gated slot acquisition, a shared
//! compile cache, and frozen-slot storage for in-flight suspensions.
//!
//! Grounded on the teacher's `SandboxBuilder`/`JSSandbox` lifecycle
//! (`build()` → execute → drop), generalized from "one sandbox" to "a pool
//! of reusable slots" per §4.1's pool-behavior paragraph. QuickJS calls
//! happen via `tokio::task::block_in_place` rather than `spawn_blocking`,
//! since the captured `Interpreter`/`SharedHost` pair borrows non-`Send`
//! rquickjs internals across the call and `block_in_place` runs
//! synchronously on the calling worker thread instead of requiring the
//! closure to move onto a fresh blocking thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use panelrt_common::{AsyncResult, ErrorCode, ExecutionMetrics, ExecutionResult, ExecutionStatus, RuntimeError, SuspensionId};
use panelrt_sandbox::{Bytecode, CompileCache, Frozen, Interpreter, RunOutcome, SharedHost};
use serde_json::Value as Json;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, instrument, warn};

use crate::config::PoolConfig;

struct FrozenSlot {
    interpreter: Interpreter,
    frozen: Frozen,
    /// Keeps the semaphore permit alive for the lifetime of the suspension,
    /// so the slot still counts against `maxInstances` while frozen (§4.1).
    _permit: tokio::sync::OwnedSemaphorePermit,
    invocation_deadline: Instant,
}

#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    pub total_executions: u64,
    pub active_instances: usize,
    pub available_instances: usize,
    pub cache_hit_rate: f64,
    pub avg_execution_time_us: u64,
    pub total_memory_bytes: u64,
}

pub struct InterpreterPool {
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Interpreter>>,
    frozen: DashMap<SuspensionId, FrozenSlot>,
    cache: CompileCache,
    total_executions: AtomicU64,
    cache_hits: AtomicU64,
    total_exec_time_us: AtomicU64,
}

impl InterpreterPool {
    pub fn new(config: PoolConfig) -> anyhow::Result<Arc<Self>> {
        let mut idle = VecDeque::with_capacity(config.min_instances);
        for _ in 0..config.min_instances {
            idle.push_back(Interpreter::new(config.max_memory_bytes)?);
        }
        let pool = Self {
            semaphore: Arc::new(Semaphore::new(config.max_instances)),
            idle: Mutex::new(idle),
            frozen: DashMap::new(),
            cache: CompileCache::new(),
            total_executions: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            total_exec_time_us: AtomicU64::new(0),
            config,
        };
        Ok(Arc::new(pool))
    }

    pub fn precompile(&self, source: &str) -> Bytecode {
        self.cache.get_or_insert(source).0
    }

    /// Compiles (or fetches from cache) `source` and runs it to first
    /// success/error/suspension.
    #[instrument(skip_all, fields(panel = %host_panel_id))]
    pub async fn execute(
        &self,
        source: &str,
        host: SharedHost,
        args: Json,
        timeout: Duration,
        host_panel_id: &str,
    ) -> anyhow::Result<ExecutionResult> {
        let (bytecode, cache_hit) = self.cache.get_or_insert(source);
        self.execute_compiled_inner(&bytecode, host, args, timeout, cache_hit).await
    }

    #[instrument(skip_all)]
    pub async fn execute_compiled(
        &self,
        bytecode: &Bytecode,
        host: SharedHost,
        args: Json,
        timeout: Duration,
    ) -> anyhow::Result<ExecutionResult> {
        self.execute_compiled_inner(bytecode, host, args, timeout, true).await
    }

    async fn execute_compiled_inner(
        &self,
        bytecode: &Bytecode,
        host: SharedHost,
        args: Json,
        timeout: Duration,
        cache_hit: bool,
    ) -> anyhow::Result<ExecutionResult> {
        let permit = self.acquire_permit().await?;
        let mut interpreter = self.take_or_spawn_interpreter().await?;
        let started = Instant::now();
        let deadline = started + timeout.min(self.config.max_total_execution());
        let bytecode = bytecode.clone();

        let run_result = tokio::task::block_in_place(|| interpreter.execute(&bytecode, host, args, deadline));

        self.total_executions.fetch_add(1, Ordering::Relaxed);
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        let elapsed_us = started.elapsed().as_micros() as u64;
        self.total_exec_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
        let memory_used = interpreter.memory_used_bytes();
        crate::metrics::record_execution(elapsed_us, cache_hit);

        let (outcome, frozen) = match run_result {
            Ok(pair) => pair,
            Err(e) => {
                // The slot misbehaved (deadline trip or an internal engine
                // error); §4.1's failure semantics say reset rather than
                // return it to the idle pool.
                drop(interpreter);
                return Ok(self.finish(outcome_for_engine_error(e), elapsed_us, memory_used, cache_hit));
            }
        };
        match (outcome, frozen) {
            (RunOutcome::Suspended(details), Some(frozen)) => {
                let suspension_id = details.suspension_id;
                self.frozen.insert(
                    suspension_id,
                    FrozenSlot {
                        interpreter,
                        frozen,
                        _permit: permit,
                        invocation_deadline: deadline,
                    },
                );
                Ok(ExecutionResult {
                    status: ExecutionStatus::Suspended,
                    return_value: None,
                    state_mutations: Vec::new(),
                    events: Vec::new(),
                    view_commands: Vec::new(),
                    suspension: Some(details),
                    error: None,
                    metrics: ExecutionMetrics {
                        execution_time_us: elapsed_us,
                        memory_used_bytes: memory_used,
                        memory_peak_bytes: memory_used,
                        host_calls: 0,
                        cache_hit,
                        capabilities_inferred: false,
                    },
                })
            }
            (outcome, _) => {
                self.return_interpreter(interpreter).await;
                Ok(self.finish(outcome, elapsed_us, memory_used, cache_hit))
            }
        }
    }

    /// Feeds `async_result` back into the interpreter frozen at
    /// `suspension_id` (§4.1's `resume`, §4.4 step 7). An unknown id is an
    /// `INTERNAL_ERROR` per spec.md §8 invariant 7, and never touches the
    /// pool's state.
    #[instrument(skip(self, async_result))]
    pub async fn resume(&self, suspension_id: SuspensionId, host: SharedHost, async_result: AsyncResult) -> anyhow::Result<ExecutionResult> {
        let Some((_, slot)) = self.frozen.remove(&suspension_id) else {
            return Ok(ExecutionResult {
                status: ExecutionStatus::Error,
                return_value: None,
                state_mutations: Vec::new(),
                events: Vec::new(),
                view_commands: Vec::new(),
                suspension: None,
                error: Some(RuntimeError::new(
                    ErrorCode::InternalError,
                    format!("unknown suspension id {suspension_id}"),
                )),
                metrics: ExecutionMetrics::default(),
            });
        };

        let FrozenSlot { mut interpreter, frozen, _permit, invocation_deadline } = slot;
        let started = Instant::now();
        let run_result = tokio::task::block_in_place(|| interpreter.resume(frozen, host, async_result, invocation_deadline));

        self.total_executions.fetch_add(1, Ordering::Relaxed);
        let elapsed_us = started.elapsed().as_micros() as u64;
        self.total_exec_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
        let memory_used = interpreter.memory_used_bytes();
        crate::metrics::record_execution(elapsed_us, true);

        let (outcome, new_frozen) = match run_result {
            Ok(pair) => pair,
            Err(e) => {
                drop(interpreter);
                return Ok(self.finish(outcome_for_engine_error(e), elapsed_us, memory_used, true));
            }
        };
        match (outcome, new_frozen) {
            (RunOutcome::Suspended(details), Some(new_frozen)) => {
                let new_id = details.suspension_id;
                self.frozen.insert(
                    new_id,
                    FrozenSlot {
                        interpreter,
                        frozen: new_frozen,
                        _permit,
                        invocation_deadline,
                    },
                );
                Ok(ExecutionResult {
                    status: ExecutionStatus::Suspended,
                    return_value: None,
                    state_mutations: Vec::new(),
                    events: Vec::new(),
                    view_commands: Vec::new(),
                    suspension: Some(details),
                    error: None,
                    metrics: ExecutionMetrics {
                        execution_time_us: elapsed_us,
                        memory_used_bytes: memory_used,
                        memory_peak_bytes: memory_used,
                        host_calls: 0,
                        cache_hit: true,
                        capabilities_inferred: false,
                    },
                })
            }
            (outcome, _) => {
                self.return_interpreter(interpreter).await;
                Ok(self.finish(outcome, elapsed_us, memory_used, true))
            }
        }
    }

    /// Drops a frozen slot without resuming it (panel destruction, §4.6),
    /// releasing its permit back to the pool.
    pub fn discard_suspension(&self, suspension_id: SuspensionId) -> bool {
        self.frozen.remove(&suspension_id).is_some()
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.total_executions.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let total_time = self.total_exec_time_us.load(Ordering::Relaxed);
        PoolStats {
            total_executions: total,
            active_instances: self.config.max_instances - self.semaphore.available_permits(),
            available_instances: self.semaphore.available_permits(),
            cache_hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            avg_execution_time_us: if total == 0 { 0 } else { total_time / total },
            total_memory_bytes: 0,
        }
    }

    async fn acquire_permit(&self) -> anyhow::Result<tokio::sync::OwnedSemaphorePermit> {
        tokio::time::timeout(self.config.acquire_timeout(), self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for an interpreter slot"))?
            .map_err(|e| anyhow::anyhow!("semaphore closed: {e}"))
    }

    async fn take_or_spawn_interpreter(&self) -> anyhow::Result<Interpreter> {
        if let Some(interp) = self.idle.lock().await.pop_front() {
            return Ok(interp);
        }
        debug!("spawning a fresh interpreter slot beyond the pre-warmed pool");
        Interpreter::new(self.config.max_memory_bytes)
    }

    async fn return_interpreter(&self, interpreter: Interpreter) {
        self.idle.lock().await.push_back(interpreter);
    }

    fn finish(&self, outcome: RunOutcome, elapsed_us: u64, memory_used: u64, cache_hit: bool) -> ExecutionResult {
        let metrics = ExecutionMetrics {
            execution_time_us: elapsed_us,
            memory_used_bytes: memory_used,
            memory_peak_bytes: memory_used,
            host_calls: 0,
            cache_hit,
            capabilities_inferred: false,
        };
        match outcome {
            RunOutcome::Success { return_value } => ExecutionResult {
                status: ExecutionStatus::Success,
                return_value,
                state_mutations: Vec::new(),
                events: Vec::new(),
                view_commands: Vec::new(),
                suspension: None,
                error: None,
                metrics,
            },
            RunOutcome::Error(error) => ExecutionResult {
                status: ExecutionStatus::Error,
                return_value: None,
                state_mutations: Vec::new(),
                events: Vec::new(),
                view_commands: Vec::new(),
                suspension: None,
                error: Some(error),
                metrics,
            },
            RunOutcome::Suspended(_) => unreachable!("suspended outcomes are handled before calling finish"),
        }
    }
}

/// Recognizes the sandbox crate's timeout sentinel (it cannot carry a typed
/// payload through `Context::with`'s lifetime-bounded closure) ahead of
/// folding any other engine error into `INTERNAL_ERROR` (§7: TIMEOUT and
/// INTERNAL_ERROR are both terminal and both outside the handler's own
/// try/catch).
fn outcome_for_engine_error(err: anyhow::Error) -> RunOutcome {
    if err.to_string().contains(panelrt_sandbox::TIMEOUT_SENTINEL) {
        warn!("handler execution exceeded its deadline");
        RunOutcome::Error(RuntimeError::timeout("handler execution exceeded its deadline"))
    } else {
        warn!(error = %err, "interpreter slot reset after an internal engine error");
        RunOutcome::Error(RuntimeError::internal(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_prewarms_to_min_instances_and_reports_stats() {
        let pool = InterpreterPool::new(PoolConfig {
            min_instances: 2,
            max_instances: 4,
            ..PoolConfig::default()
        })
        .unwrap();
        let stats = pool.stats();
        assert_eq!(stats.available_instances, 4);
        assert_eq!(stats.active_instances, 0);
    }
}
