//! stackvm - a stack-based bytecode virtual machine
//!
//! This library provides the module loader, the interpreter with its
//! mark-sweep heap, the closure JIT and a text assembler.

pub mod asm;
pub mod config;
#[cfg(feature = "jit")]
pub mod jit;
pub mod vm;

// Re-export commonly used types
pub use config::{JitMode, RuntimeConfig, StatsFormat};
pub use vm::{BytecodeModule, Fault, RuntimeError, VM, Value};
