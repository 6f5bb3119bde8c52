use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use stackvm::asm;
use stackvm::config::{JitMode, RuntimeConfig, StatsFormat};
use stackvm::vm::{bytecode, BytecodeModule, GcStats, VM};

#[cfg(feature = "jit")]
use stackvm::jit::JitFunctionStats;

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JitModeArg {
    Off,
    On,
    Always,
}

impl From<JitModeArg> for JitMode {
    fn from(arg: JitModeArg) -> Self {
        match arg {
            JitModeArg::Off => JitMode::Off,
            JitModeArg::On => JitMode::On,
            JitModeArg::Always => JitMode::Always,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatsFormatArg {
    Human,
    Json,
}

impl From<StatsFormatArg> for StatsFormat {
    fn from(arg: StatsFormatArg) -> Self {
        match arg {
            StatsFormatArg::Human => StatsFormat::Human,
            StatsFormatArg::Json => StatsFormat::Json,
        }
    }
}

#[derive(Parser)]
#[command(name = "stackvm")]
#[command(about = "A stack-based bytecode virtual machine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a bytecode module (or a .sasm source file)
    Run {
        file: PathBuf,

        /// JIT compilation mode (off, on, always)
        #[arg(long, value_enum)]
        jit: Option<JitModeArg>,

        /// Calls before a function is compiled
        #[arg(long)]
        jit_threshold: Option<u32>,

        /// Disable leaf-call inlining
        #[arg(long)]
        no_inline: bool,

        /// Report JIT compilation events
        #[arg(long)]
        trace_jit: bool,

        /// Trace every interpreted instruction
        #[arg(long)]
        trace: bool,

        /// Disable automatic garbage collection
        #[arg(long)]
        no_gc: bool,

        /// Live heap words that trigger a collection
        #[arg(long)]
        gc_threshold: Option<usize>,

        /// Print GC and JIT statistics after the run
        #[arg(long, value_enum, require_equals = true, num_args = 0..=1, default_missing_value = "human")]
        stats: Option<StatsFormatArg>,

        /// Load runtime settings from a TOML file; flags override it
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Assemble a .sasm source file into a bytecode module
    Asm {
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },
    /// Disassemble every function of a module
    Dump { file: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            file,
            jit,
            jit_threshold,
            no_inline,
            trace_jit,
            trace,
            no_gc,
            gc_threshold,
            stats,
            config,
        } => {
            init_logging(trace_jit, trace);
            let config = config
                .as_deref()
                .map(RuntimeConfig::load)
                .transpose()
                .map_err(|e| e.to_string())
                .map(|base| {
                    let mut config = base.unwrap_or_default();
                    if let Some(mode) = jit {
                        config.jit_mode = mode.into();
                    }
                    if let Some(threshold) = jit_threshold {
                        config.jit_threshold = threshold;
                    }
                    if let Some(threshold) = gc_threshold {
                        config.gc_threshold = threshold;
                    }
                    config.jit_inline &= !no_inline;
                    config.gc_enabled &= !no_gc;
                    config.trace_jit |= trace_jit;
                    config.trace_exec |= trace;
                    config
                });
            let stats = stats
                .map(StatsFormat::from)
                .or_else(|| config.as_ref().ok().filter(|c| c.gc_stats).map(|_| StatsFormat::Human));
            config.and_then(|config| run_file(&file, config, stats))
        }
        Commands::Asm { input, output } => {
            init_logging(false, false);
            assemble_file(&input, &output)
        }
        Commands::Dump { file } => {
            init_logging(false, false);
            load_module(&file).map(|module| print!("{}", bytecode::disassemble_module(&module)))
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Install the stderr subscriber. `RUST_LOG` takes precedence over flags.
fn init_logging(trace_jit: bool, trace: bool) {
    let mut default = String::from("warn");
    if trace_jit {
        default.push_str(",stackvm::jit=info");
    }
    if trace {
        default.push_str(",stackvm::exec=trace");
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_module(path: &Path) -> Result<BytecodeModule, String> {
    if path.extension().is_some_and(|ext| ext == "sasm") {
        let source = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        return asm::assemble(&source).map_err(|e| format!("{}: {}", path.display(), e));
    }
    bytecode::load_file(path).map_err(|e| format!("{}: {}", path.display(), e))
}

fn assemble_file(input: &Path, output: &Path) -> Result<(), String> {
    let source = fs::read_to_string(input)
        .map_err(|e| format!("failed to read {}: {}", input.display(), e))?;
    let bytes = asm::assemble_to_bytes(&source).map_err(|e| format!("{}: {}", input.display(), e))?;
    fs::write(output, bytes).map_err(|e| format!("failed to write {}: {}", output.display(), e))
}

fn run_file(path: &Path, config: RuntimeConfig, stats: Option<StatsFormat>) -> Result<(), String> {
    let module = load_module(path)?;
    let mut vm = VM::with_config(module, config);
    let result = vm.run();
    if let Some(format) = stats {
        print_stats(&vm, format)?;
    }
    let value = result.map_err(|e| e.to_string())?;
    println!("result: {}", value);
    Ok(())
}

#[derive(Serialize)]
struct RunStats<'a> {
    gc: &'a GcStats,
    #[cfg(feature = "jit")]
    jit: Vec<JitFunctionStats>,
}

fn print_stats(vm: &VM, format: StatsFormat) -> Result<(), String> {
    let stats = RunStats {
        gc: vm.gc_stats(),
        #[cfg(feature = "jit")]
        jit: vm.jit_stats(),
    };
    match format {
        StatsFormat::Json => {
            let json = serde_json::to_string_pretty(&stats).map_err(|e| e.to_string())?;
            eprintln!("{}", json);
        }
        StatsFormat::Human => {
            let gc = stats.gc;
            eprintln!(
                "[GC] cycles: {}, arrays freed: {}, live words: {}, total pause: {:?}, max pause: {:?}",
                gc.cycles, gc.arrays_freed, gc.live_words, gc.total_pause, gc.max_pause
            );
            #[cfg(feature = "jit")]
            for f in stats.jit.iter().filter(|f| f.call_count > 0) {
                let state = if f.compiled {
                    "compiled"
                } else if f.failed {
                    "failed"
                } else {
                    "interpreted"
                };
                eprintln!(
                    "[JIT] fn {}: {} calls, {}, {} native runs in {:?}, {} inlined calls",
                    f.function, f.call_count, state, f.native_executions, f.native_time, f.inlined_calls
                );
            }
        }
    }
    Ok(())
}
