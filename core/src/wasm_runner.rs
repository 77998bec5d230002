/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * Wasmtime Runtime Execution for Cinder WASM Binaries.
 *
 * Instantiates a lowered module with the `cinder_rt` imports bound to the
 * host runtime, calls `main`, and captures what the program printed.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use crate::runtime::{binop, unop, LinearMemory, Runtime, RuntimeError, RuntimeStats};
use crate::value::{RuntimeFn, Value, PAGE_SIZE, RUNTIME_MODULE};
use crate::wasm_codegen::CompiledModule;
use thiserror::Error;
use tracing::debug;
use wasmtime::{Caller, Engine, Extern, Linker, Memory, Module, Store, Trap, Val};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to load module: {0}")]
    Load(String),
    #[error("failed to link '{name}': {message}")]
    Link { name: &'static str, message: String },
    #[error("failed to instantiate: {0}")]
    Instantiate(String),
    #[error("missing export '{0}'")]
    MissingExport(String),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("execution trapped: {message}")]
    Trap {
        message: String,
        trap: Option<Trap>,
    },
}

impl RunError {
    fn from_execution(err: wasmtime::Error) -> Self {
        if let Some(runtime) = err.downcast_ref::<RuntimeError>() {
            return RunError::Runtime(runtime.clone());
        }
        RunError::Trap {
            message: err.to_string(),
            trap: err.downcast_ref::<Trap>().copied(),
        }
    }
}

// =============================================================================
// Host State
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct HostState {
    pub runtime: Runtime,
}

/// The guest's linear memory, seen through the caller of a host function.
struct GuestMemory<'c, 'a> {
    caller: &'c mut Caller<'a, HostState>,
    memory: Memory,
}

impl LinearMemory for GuestMemory<'_, '_> {
    fn size(&self) -> u32 {
        self.memory.data_size(&*self.caller) as u32
    }

    fn grow(&mut self, pages: u32) -> Result<(), RuntimeError> {
        debug!(pages, "growing guest memory");
        self.memory
            .grow(&mut *self.caller, pages as u64)
            .map(|_| ())
            .map_err(|_| RuntimeError::OutOfMemory {
                size: pages.saturating_mul(PAGE_SIZE),
            })
    }

    fn read_word(&self, address: u32) -> Result<i64, RuntimeError> {
        let mut word = [0u8; 8];
        self.memory
            .read(&*self.caller, address as usize, &mut word)
            .map_err(|_| RuntimeError::OutOfBounds { address })?;
        Ok(i64::from_le_bytes(word))
    }

    fn write_word(&mut self, address: u32, word: i64) -> Result<(), RuntimeError> {
        self.memory
            .write(&mut *self.caller, address as usize, &word.to_le_bytes())
            .map_err(|_| RuntimeError::OutOfBounds { address })
    }
}

/// Runs `f` against the runtime and the guest memory. The runtime is moved
/// out of the store for the duration so both can be borrowed mutably.
fn with_runtime<T>(
    caller: &mut Caller<'_, HostState>,
    f: impl FnOnce(&mut Runtime, &mut dyn LinearMemory) -> Result<T, RuntimeError>,
) -> wasmtime::Result<T> {
    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => memory,
        _ => return Err(wasmtime::Error::msg("module does not export its memory")),
    };
    let mut runtime = std::mem::take(&mut caller.data_mut().runtime);
    let result = {
        let mut guest = GuestMemory {
            caller: &mut *caller,
            memory,
        };
        f(&mut runtime, &mut guest)
    };
    caller.data_mut().runtime = runtime;
    result.map_err(wasmtime::Error::new)
}

// =============================================================================
// Output
// =============================================================================

/// Result of executing a lowered program.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Everything `print` wrote.
    pub stdout: String,
    pub printed: Vec<Value>,
    pub dropped: Vec<Value>,
    pub stats: RuntimeStats,
    /// What `main` returned.
    pub exit_code: i32,
}

// =============================================================================
// Public API
// =============================================================================

pub fn run_module(module: &CompiledModule) -> Result<RunOutput, RunError> {
    run_wasm(&module.bytes)
}

/// Runs a lowered module's `main` and captures its output.
pub fn run_wasm(bytes: &[u8]) -> Result<RunOutput, RunError> {
    let engine = Engine::default();
    let module =
        Module::from_binary(&engine, bytes).map_err(|e| RunError::Load(e.to_string()))?;

    let mut linker = Linker::<HostState>::new(&engine);
    link_runtime(&mut linker)?;

    let mut store = Store::new(&engine, HostState::default());
    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|e| RunError::Instantiate(e.to_string()))?;

    let heap_base = match instance
        .get_global(&mut store, "__heap_base")
        .map(|g| g.get(&mut store))
    {
        Some(Val::I32(base)) => base as u32,
        _ => return Err(RunError::MissingExport("__heap_base".to_string())),
    };
    store.data_mut().runtime = Runtime::new(heap_base);
    debug!(heap_base, "instantiated module");

    let main = instance
        .get_typed_func::<(), i32>(&mut store, "main")
        .map_err(|_| RunError::MissingExport("main".to_string()))?;
    let exit_code = main
        .call(&mut store, ())
        .map_err(RunError::from_execution)?;

    let runtime = std::mem::take(&mut store.data_mut().runtime);
    let stats = runtime.stats();
    debug!(exit_code, ?stats, "program finished");
    Ok(RunOutput {
        stdout: runtime.output,
        printed: runtime.printed,
        dropped: runtime.dropped,
        stats,
        exit_code,
    })
}

// =============================================================================
// Runtime Imports
// =============================================================================

fn link_error(f: RuntimeFn) -> impl FnOnce(wasmtime::Error) -> RunError {
    move |e| RunError::Link {
        name: f.name(),
        message: e.to_string(),
    }
}

/// Binds every `cinder_rt` import to the host runtime.
fn link_runtime(linker: &mut Linker<HostState>) -> Result<(), RunError> {
    linker
        .func_wrap(
            RUNTIME_MODULE,
            RuntimeFn::Copy.name(),
            |mut caller: Caller<'_, HostState>, tag: i64, payload: i64| {
                with_runtime(&mut caller, |rt, mem| rt.copy(mem, Value::new(tag, payload)))
                    .map(|v| (v.tag, v.payload))
            },
        )
        .map_err(link_error(RuntimeFn::Copy))?;

    linker
        .func_wrap(
            RUNTIME_MODULE,
            RuntimeFn::Drop.name(),
            |mut caller: Caller<'_, HostState>, tag: i64, payload: i64| {
                with_runtime(&mut caller, |rt, mem| {
                    rt.drop_value(mem, Value::new(tag, payload))
                })
            },
        )
        .map_err(link_error(RuntimeFn::Drop))?;

    linker
        .func_wrap(
            RUNTIME_MODULE,
            RuntimeFn::Unop.name(),
            |tag: i64, payload: i64, op: i32| -> wasmtime::Result<(i64, i64)> {
                let v = unop(Value::new(tag, payload), op as u32).map_err(wasmtime::Error::new)?;
                Ok((v.tag, v.payload))
            },
        )
        .map_err(link_error(RuntimeFn::Unop))?;

    linker
        .func_wrap(
            RUNTIME_MODULE,
            RuntimeFn::Binop.name(),
            |lhs_tag: i64,
             lhs_payload: i64,
             rhs_tag: i64,
             rhs_payload: i64,
             op: i32|
             -> wasmtime::Result<(i64, i64)> {
                let v = binop(
                    Value::new(lhs_tag, lhs_payload),
                    Value::new(rhs_tag, rhs_payload),
                    op as u32,
                )
                .map_err(wasmtime::Error::new)?;
                Ok((v.tag, v.payload))
            },
        )
        .map_err(link_error(RuntimeFn::Binop))?;

    linker
        .func_wrap(
            RUNTIME_MODULE,
            RuntimeFn::Print.name(),
            |mut caller: Caller<'_, HostState>, tag: i64, payload: i64| {
                caller.data_mut().runtime.print(Value::new(tag, payload));
            },
        )
        .map_err(link_error(RuntimeFn::Print))?;

    linker
        .func_wrap(
            RUNTIME_MODULE,
            RuntimeFn::Alloc.name(),
            |mut caller: Caller<'_, HostState>, size: i32| {
                with_runtime(&mut caller, |rt, mem| rt.alloc(mem, size as u32)).map(|a| a as i32)
            },
        )
        .map_err(link_error(RuntimeFn::Alloc))?;

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use crate::wasm_codegen::{lower, CodegenOptions};

    fn run(source: &str) -> Result<RunOutput, RunError> {
        let program = parse_source(source).expect("parse failed");
        let module = lower(&program, CodegenOptions::default()).expect("lowering failed");
        run_module(&module)
    }

    fn stdout(source: &str) -> String {
        match run(source) {
            Ok(output) => output.stdout,
            Err(e) => panic!("run failed: {e}"),
        }
    }

    #[test]
    fn test_run_globals_and_arithmetic() {
        let output = run("var x = 1\nvar y = 2\nprint(x + y)").expect("run failed");
        assert_eq!(output.stdout, "3\n");
        assert_eq!(output.printed, vec![Value::integer(3)]);
        assert_eq!(output.exit_code, 0);
    }

    #[test]
    fn test_print_formats() {
        let out = stdout("print(1.5 * 2.0)\nprint(!false)\nprint(print)\nvar j\nprint(j)");
        assert_eq!(out, "3.000000\ntrue\n$function\n$junk\n");
    }

    #[test]
    fn test_loop_variable_dropped_once_at_scope_exit() {
        let source = "fun f() {
            var i = 0
            while i < 3 { i = i + 1 }
            ret 0
        }
        print(f())";
        let output = run(source).expect("run failed");
        assert_eq!(output.stdout, "0\n");
        let threes = output
            .dropped
            .iter()
            .filter(|v| **v == Value::integer(3))
            .count();
        assert_eq!(threes, 1);
    }

    fn drop_count(output: &RunOutput, value: Value) -> usize {
        output.dropped.iter().filter(|v| **v == value).count()
    }

    #[test]
    fn test_loop_variable_dropped_once_at_brace_exit() {
        let source = "fun loop() { var i = 0; while i < 3 { print(i); i = i + 1 } }
        loop()";
        let output = run(source).expect("run failed");
        assert_eq!(output.stdout, "0\n1\n2\n");
        assert_eq!(drop_count(&output, Value::integer(3)), 1);
    }

    #[test]
    fn test_brk_and_nxt_drop_nested_scopes_once() {
        let source = "fun f() {
            var k = 0
            while true {
                var t = 77
                {
                    var u = 88
                    if k == 1 { brk }
                    k = k + 1
                    nxt
                }
            }
            ret k
        }
        print(f())";
        let output = run(source).expect("run failed");
        assert_eq!(output.stdout, "1\n");
        assert_eq!(drop_count(&output, Value::integer(77)), 2);
        assert_eq!(drop_count(&output, Value::integer(88)), 2);
    }

    #[test]
    fn test_if_with_one_returning_arm_falls_through() {
        let source = "fun g(c) {
            if c { ret 1 }
            var z = 5
            ret z
        }
        print(g(true))
        print(g(false))";
        let output = run(source).expect("run failed");
        assert_eq!(output.stdout, "1\n5\n");
        assert_eq!(drop_count(&output, Value::integer(5)), 1);
    }

    #[test]
    fn test_brk_and_nxt() {
        let source = "var i = 0
        var s = 0
        while true {
            i = i + 1
            if i == 2 { nxt }
            if i > 4 { brk }
            s = s + i
        }
        print(s)";
        assert_eq!(stdout(source), "8\n");
    }

    #[test]
    fn test_captures_are_copies() {
        let source = "fun f() {
            var a = 1
            fun g() { ret a }
            a = 2
            ret g()
        }
        print(f())";
        assert_eq!(stdout(source), "1\n");
    }

    #[test]
    fn test_closure_returned_from_function() {
        let source = "fun adder(k) {
            fun add(v) { ret v + k }
            ret add
        }
        var plus2 = adder(2)
        print(plus2(40))";
        assert_eq!(stdout(source), "42\n");
    }

    #[test]
    fn test_functions_as_arguments() {
        let source = "fun twice(f, x) { ret f(f(x)) }
        fun add3(v) { ret v + 3 }
        print(twice(add3, 1))";
        assert_eq!(stdout(source), "7\n");
    }

    #[test]
    fn test_global_mutation_from_function() {
        let source = "var n = 0
        fun inc() { n = n + 1\nret n }
        inc()
        inc()
        print(n)";
        assert_eq!(stdout(source), "2\n");
    }

    #[test]
    fn test_local_recursion_through_own_name() {
        let source = "fun outer(n) {
            fun fact(k) {
                if k < 2 { ret 1 }
                ret k * fact(k - 1)
            }
            ret fact(n)
        }
        print(outer(5))";
        assert_eq!(stdout(source), "120\n");
    }

    #[test]
    fn test_assignment_keeps_previous_value_alive() {
        let source = "fun mk(v) {
            fun get() { ret v }
            ret get
        }
        fun main2() {
            var h = mk(1)
            h = mk(2)
            ret h()
        }
        print(main2())";
        let output = run(source).expect("run failed");
        assert_eq!(output.stdout, "2\n");
        // The environment first stored in `h` is never released.
        assert!(output.stats.live_blocks >= 1, "stats: {:?}", output.stats);
    }

    #[test]
    fn test_non_bool_condition_traps() {
        match run("if 1 { print(1) }") {
            Err(RunError::Trap { trap, .. }) => {
                assert_eq!(trap, Some(Trap::UnreachableCodeReached))
            }
            other => panic!("expected trap, got {other:?}"),
        }
    }

    #[test]
    fn test_calling_non_function_traps() {
        match run("var x = 3\nx(1)") {
            Err(RunError::Trap { trap, .. }) => {
                assert_eq!(trap, Some(Trap::UnreachableCodeReached))
            }
            other => panic!("expected trap, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_arity_traps() {
        let result = run("fun f(a) { ret a }\nprint(f(1, 2))");
        assert!(matches!(result, Err(RunError::Trap { .. })), "got {result:?}");
    }

    #[test]
    fn test_operator_misuse_is_runtime_error() {
        match run("print(1 / 0)") {
            Err(RunError::Runtime(RuntimeError::DivisionByZero)) => {}
            other => panic!("expected division by zero, got {other:?}"),
        }
        assert!(matches!(
            run("print(1 + true)"),
            Err(RunError::Runtime(RuntimeError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_runaway_recursion_traps() {
        let result = run("fun r(n) { ret r(n + 1) }\nr(0)");
        assert!(matches!(result, Err(RunError::Trap { .. })), "got {result:?}");
    }
}
