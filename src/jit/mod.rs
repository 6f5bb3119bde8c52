//! JIT compilation for stackvm.
//!
//! Functions start out interpreted. Every call is counted, and once a
//! function is hot (or on its first call under `JitMode::Always`) it is
//! compiled into a native closure:
//! - `compiler`: two-pass translation to a resolved instruction list
//! - `inline`: splicing of small leaf callees into their call sites
//! - `native`: the closure backend with a top-of-stack register cache
//! - `function_table`: per-function compile state and counters
//!
//! A function that fails to compile is marked as such and stays interpreted.
//!
//! Compiled code calls compiled code on the Rust stack. At most
//! `MAX_NATIVE_DEPTH` compiled activations are nested this way; calls made
//! beyond that run in the interpreter, whose own call stack is a heap
//! vector. Recursion depth is then limited only by `max_call_depth`.
//! This module is only compiled when the `jit` feature is enabled.

pub mod compiler;
pub mod function_table;
pub mod inline;
pub mod native;

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{JitMode, RuntimeConfig};
use crate::vm::{BytecodeModule, ExecutionContext, RuntimeError};

use compiler::{compile, CompileOptions};
use function_table::JitFunctionTable;

/// Compiled activations allowed on the Rust stack at once.
pub const MAX_NATIVE_DEPTH: usize = 64;

/// JIT events go to `info` when `trace_jit` is set, `debug` otherwise.
macro_rules! jit_event {
    ($trace:expr, $($arg:tt)+) => {
        if $trace {
            info!(target: "stackvm::jit", $($arg)+);
        } else {
            debug!(target: "stackvm::jit", $($arg)+);
        }
    };
}

/// Per-function JIT statistics, as reported by `VM::jit_stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JitFunctionStats {
    pub function: u16,
    pub call_count: u64,
    pub compile_count: u32,
    pub native_executions: u64,
    pub native_time: Duration,
    pub compiled: bool,
    pub failed: bool,
    pub inlined_calls: usize,
    pub has_loops: bool,
}

/// Hot-function detection and the compiled-code cache for one module.
pub struct JitRuntime {
    mode: JitMode,
    threshold: u64,
    trace: bool,
    options: CompileOptions,
    table: JitFunctionTable,
    /// Compiled activations currently on the Rust stack.
    native_depth: usize,
}

impl JitRuntime {
    pub fn new(config: &RuntimeConfig, function_count: usize) -> Self {
        Self {
            mode: config.jit_mode,
            threshold: config.jit_threshold as u64,
            trace: config.trace_jit,
            options: CompileOptions {
                inline: config.jit_inline,
                ..CompileOptions::default()
            },
            table: JitFunctionTable::new(function_count),
            native_depth: 0,
        }
    }

    /// Count a call to `function` and compile it if it just became hot.
    /// Returns whether compiled code is available for it.
    pub fn on_call(&mut self, module: &BytecodeModule, function: u16) -> bool {
        if self.mode == JitMode::Off {
            return false;
        }
        let Some(record) = self.table.get_mut(function) else {
            return false;
        };
        record.call_count += 1;
        if record.compiled().is_some() {
            return true;
        }
        if record.is_failed() {
            return false;
        }

        let calls = record.call_count;
        if self.mode == JitMode::On {
            if calls < self.threshold {
                return false;
            }
            jit_event!(self.trace, function, calls, "hot function detected");
        }
        self.ensure_compiled(module, function)
    }

    /// Compile `function` unless it is already compiled or has failed
    /// before. Returns whether compiled code is available.
    pub fn ensure_compiled(&mut self, module: &BytecodeModule, function: u16) -> bool {
        match self.table.get(function) {
            None => return false,
            Some(record) if record.compiled().is_some() => return true,
            Some(record) if record.is_failed() => return false,
            Some(_) => {}
        }

        match compile(module, function, &self.options) {
            Ok(program) => {
                jit_event!(
                    self.trace,
                    function,
                    instructions = program.insts.len(),
                    inlined = program.inlined_calls,
                    loops = program.has_loops,
                    "compiled function"
                );
                self.table.install(function, native::build(program));
                true
            }
            Err(e) => {
                warn!(target: "stackvm::jit", function, error = %e, "compilation failed, staying interpreted");
                self.table.mark_failed(function, e.to_string());
                false
            }
        }
    }

    pub fn is_compiled(&self, function: u16) -> bool {
        self.table
            .get(function)
            .is_some_and(|r| r.compiled().is_some())
    }

    pub fn is_failed(&self, function: u16) -> bool {
        self.table.get(function).is_some_and(|r| r.is_failed())
    }

    pub fn compiled_count(&self) -> usize {
        self.table
            .iter()
            .filter(|(_, r)| r.compiled().is_some())
            .count()
    }

    pub fn table(&self) -> &JitFunctionTable {
        &self.table
    }

    pub fn stats(&self) -> Vec<JitFunctionStats> {
        self.table
            .iter()
            .map(|(function, record)| {
                let code = record.compiled();
                JitFunctionStats {
                    function,
                    call_count: record.call_count,
                    compile_count: record.compile_count,
                    native_executions: record.native_executions,
                    native_time: record.native_time,
                    compiled: code.is_some(),
                    failed: record.is_failed(),
                    inlined_calls: code.map_or(0, |c| c.inlined_calls),
                    has_loops: code.is_some_and(|c| c.has_loops),
                }
            })
            .collect()
    }
}

/// Run `function` natively if it is compiled: push its frame (moving
/// arguments off the operand stack), then run the compiled body. Returns
/// `Ok(false)` without touching any state when there is no compiled code or
/// `MAX_NATIVE_DEPTH` compiled activations are already running.
pub fn try_execute(
    ctx: &mut ExecutionContext<'_>,
    function: u16,
    return_function: u16,
    return_address: usize,
) -> Result<bool, RuntimeError> {
    if ctx.jit.native_depth >= MAX_NATIVE_DEPTH {
        return Ok(false);
    }
    let Some(code) = ctx.jit.table.compiled(function) else {
        return Ok(false);
    };
    ctx.enter_frame(function, return_function, return_address)?;

    ctx.jit.native_depth += 1;
    let start = Instant::now();
    let result = code.invoke(ctx);
    ctx.jit.table.record_execution(function, start.elapsed());
    ctx.jit.native_depth -= 1;
    result?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{assemble_ops, FunctionInfo, Op};

    fn module() -> BytecodeModule {
        BytecodeModule {
            version: 1,
            global_count: 0,
            entry: 0,
            functions: vec![
                FunctionInfo::new(0, 0, 0, assemble_ops(&[Op::Call(1), Op::Halt])),
                FunctionInfo::new(1, 0, 0, assemble_ops(&[Op::PushInt(1), Op::Ret])),
                FunctionInfo::new(2, 0, 0, assemble_ops(&[Op::Jmp(100)])),
            ],
        }
    }

    fn runtime(mode: JitMode, threshold: u32) -> JitRuntime {
        let config = RuntimeConfig {
            jit_mode: mode,
            jit_threshold: threshold,
            ..RuntimeConfig::default()
        };
        JitRuntime::new(&config, 3)
    }

    #[test]
    fn test_threshold_promotion() {
        let m = module();
        let mut jit = runtime(JitMode::On, 3);
        assert!(!jit.on_call(&m, 1));
        assert!(!jit.on_call(&m, 1));
        assert!(jit.on_call(&m, 1));
        assert!(jit.is_compiled(1));
        assert!(jit.on_call(&m, 1));
        assert_eq!(jit.table().get(1).unwrap().call_count, 4);
        assert_eq!(jit.table().get(1).unwrap().compile_count, 1);
    }

    #[test]
    fn test_off_never_compiles() {
        let m = module();
        let mut jit = runtime(JitMode::Off, 1);
        for _ in 0..5 {
            assert!(!jit.on_call(&m, 1));
        }
        assert_eq!(jit.compiled_count(), 0);
    }

    #[test]
    fn test_always_compiles_on_first_call() {
        let m = module();
        let mut jit = runtime(JitMode::Always, 1000);
        assert!(jit.on_call(&m, 0));
    }

    #[test]
    fn test_failure_is_permanent() {
        let m = module();
        let mut jit = runtime(JitMode::Always, 1);
        assert!(!jit.on_call(&m, 2));
        assert!(jit.is_failed(2));
        assert!(!jit.ensure_compiled(&m, 2));
        assert!(!jit.on_call(&m, 2));
        assert_eq!(jit.table().get(2).unwrap().compile_count, 0);
        assert_eq!(jit.table().get(2).unwrap().call_count, 2);
    }

    #[test]
    fn test_unknown_function_ignored() {
        let m = module();
        let mut jit = runtime(JitMode::Always, 1);
        assert!(!jit.on_call(&m, 9));
        assert!(!jit.ensure_compiled(&m, 9));
    }

    #[test]
    fn test_stats() {
        let m = module();
        let mut jit = runtime(JitMode::Always, 1);
        jit.on_call(&m, 0);
        jit.on_call(&m, 2);
        let stats = jit.stats();
        assert_eq!(stats.len(), 3);
        assert!(stats[0].compiled);
        assert_eq!(stats[0].inlined_calls, 1);
        assert!(!stats[1].compiled);
        assert!(stats[2].failed);
        let json = serde_json::to_string(&stats[0]).unwrap();
        assert!(json.contains("\"inlined_calls\":1"));
    }
}
