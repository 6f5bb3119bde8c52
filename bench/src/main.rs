use serde::Serialize;
use stackvm::asm;
use stackvm::config::{JitMode, RuntimeConfig};
use stackvm::vm::{BytecodeModule, Io, VM};
use std::time::Instant;

const PROGRAMS: &[(&str, &str)] = &[
    ("sum_loop", include_str!("../programs/sum_loop.sasm")),
    ("nested_loop", include_str!("../programs/nested_loop.sasm")),
    ("fibonacci", include_str!("../programs/fibonacci.sasm")),
    ("array_sum", include_str!("../programs/array_sum.sasm")),
    ("leaf_calls", include_str!("../programs/leaf_calls.sasm")),
];

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    result: Option<i64>,
    jit_on_secs: f64,
    jit_off_secs: f64,
    rust_time_secs: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

// Rust reference implementations

fn rust_sum_loop() -> i64 {
    (1..=1_000_000i64).sum()
}

fn rust_nested_loop() -> i64 {
    let mut sum: i64 = 0;
    for i in 0..500 {
        for j in 0..500 {
            sum += i * j;
        }
    }
    sum
}

fn rust_fibonacci(n: i64) -> i64 {
    if n < 2 {
        n
    } else {
        rust_fibonacci(n - 1) + rust_fibonacci(n - 2)
    }
}

fn rust_array_sum() -> i64 {
    let arr: Vec<i64> = (0..100_000).collect();
    arr.iter().sum()
}

fn rust_reference(name: &str) -> i64 {
    match name {
        "sum_loop" => rust_sum_loop(),
        "nested_loop" => rust_nested_loop(),
        "fibonacci" => rust_fibonacci(25),
        "array_sum" => rust_array_sum(),
        _ => (0..1_000_000).map(|_| 1i64).sum(),
    }
}

fn time_rust(name: &str) -> f64 {
    let start = Instant::now();
    let value = rust_reference(name);
    let elapsed = start.elapsed().as_secs_f64();
    eprintln!("{}: rust {}", name, value);
    elapsed
}

/// Run `module` once and return (result, seconds).
fn run_vm_benchmark(name: &str, module: &BytecodeModule, jit_enabled: bool) -> (Option<i64>, f64) {
    let config = RuntimeConfig {
        jit_mode: if jit_enabled {
            JitMode::On
        } else {
            JitMode::Off
        },
        jit_threshold: 1, // Compile immediately for benchmarking
        ..Default::default()
    };
    let (io, _output) = Io::capture("");
    let mut vm = VM::with_io(module.clone(), config, io);

    let start = Instant::now();
    let result = vm.run();
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(value) => (Some(value), elapsed),
        Err(e) => {
            eprintln!("{} (jit={}) failed: {}", name, jit_enabled, e);
            (None, elapsed)
        }
    }
}

fn main() {
    let mut results = Vec::new();

    for (name, source) in PROGRAMS {
        let module = match asm::assemble(source) {
            Ok(module) => module,
            Err(e) => {
                eprintln!("{}: {}", name, e);
                continue;
            }
        };
        let rust_time = time_rust(name);
        let (result, jit_on) = run_vm_benchmark(name, &module, true);
        let (_, jit_off) = run_vm_benchmark(name, &module, false);
        results.push(BenchmarkResult {
            name: name.to_string(),
            result,
            jit_on_secs: jit_on,
            jit_off_secs: jit_off,
            rust_time_secs: rust_time,
        });
    }

    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to serialize results: {}", e),
    }
}
