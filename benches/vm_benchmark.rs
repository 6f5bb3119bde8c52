//! VM performance benchmarks comparing the interpreter with the JIT.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use stackvm::asm;
use stackvm::config::{JitMode, RuntimeConfig};
use stackvm::vm::{BytecodeModule, Io, VM};
use std::time::Duration;

fn program(source: &str) -> BytecodeModule {
    asm::assemble(source).expect("benchmark program should assemble")
}

/// Run `module` once under `mode` and return its result.
fn run_module(module: &BytecodeModule, mode: JitMode) -> i64 {
    let config = RuntimeConfig {
        jit_mode: mode,
        ..RuntimeConfig::default()
    };
    let (io, _) = Io::capture("");
    let mut vm = VM::with_io(module.clone(), config, io);
    vm.run().expect("benchmark should succeed")
}

const MODES: [(&str, JitMode); 2] = [("interpreter", JitMode::Off), ("jit", JitMode::Always)];

fn bench_loops(c: &mut Criterion) {
    let mut group = c.benchmark_group("loops");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    let programs = [
        ("sum_loop", program(include_str!("../bench/programs/sum_loop.sasm"))),
        ("nested_loop", program(include_str!("../bench/programs/nested_loop.sasm"))),
    ];
    for (name, module) in &programs {
        for (mode_name, mode) in MODES {
            group.bench_with_input(BenchmarkId::new(*name, mode_name), module, |b, m| {
                b.iter(|| run_module(black_box(m), mode))
            });
        }
    }

    group.finish();
}

fn bench_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("calls");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    let programs = [
        ("fibonacci", program(include_str!("../bench/programs/fibonacci.sasm"))),
        ("leaf_calls", program(include_str!("../bench/programs/leaf_calls.sasm"))),
    ];
    for (name, module) in &programs {
        for (mode_name, mode) in MODES {
            group.bench_with_input(BenchmarkId::new(*name, mode_name), module, |b, m| {
                b.iter(|| run_module(black_box(m), mode))
            });
        }
    }

    group.finish();
}

fn bench_array_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("array_operations");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    let module = program(include_str!("../bench/programs/array_sum.sasm"));
    for (mode_name, mode) in MODES {
        group.bench_with_input(BenchmarkId::new("array_sum", mode_name), &module, |b, m| {
            b.iter(|| run_module(black_box(m), mode))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_loops, bench_calls, bench_array_operations);
criterion_main!(benches);
