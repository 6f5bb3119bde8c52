mod value;
mod ops;
mod memory;
mod heap;
mod gc;
mod vm;
pub mod bytecode;
pub mod debug;
pub mod error;

pub use value::{Handle, Value, CANONICAL_NAN, HANDLE_TAG, MAX_GENERATION};
pub use ops::{assemble_ops, decode, operand_size, Op};
pub use memory::{CallStack, Globals, Memory, OperandStack, StackFrame, RETURN_SENTINEL};
pub use heap::{Heap, DEFAULT_GC_THRESHOLD};
pub use gc::GcStats;
pub use vm::{ExecutionContext, Io, OutputBuffer, VM};
pub(crate) use vm::{binary_fn, unary_fn, BinaryFn, UnaryFn};
pub use debug::TraceEvent;
pub use error::{Fault, LoadError, Location, RuntimeError};

/// A loaded function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    /// Position in the module's function table.
    pub index: u16,
    pub arity: u8,
    /// Size of the local array; parameters occupy the first `arity` slots.
    pub locals_count: u8,
    pub code: Vec<u8>,
}

impl FunctionInfo {
    pub fn new(index: u16, arity: u8, locals_count: u8, code: Vec<u8>) -> Self {
        Self {
            index,
            arity,
            locals_count,
            code,
        }
    }
}

/// A loaded bytecode module. Immutable once loaded; per-function JIT state
/// lives in the JIT runtime, keyed by function index.
#[derive(Debug, Clone, PartialEq)]
pub struct BytecodeModule {
    pub version: u16,
    pub global_count: u16,
    pub entry: u16,
    pub functions: Vec<FunctionInfo>,
}

impl BytecodeModule {
    pub fn function(&self, index: u16) -> Option<&FunctionInfo> {
        self.functions.get(index as usize)
    }

    pub fn entry_function(&self) -> Option<&FunctionInfo> {
        self.function(self.entry)
    }

    /// Module with a single entry function and no globals.
    pub fn single(code: Vec<u8>) -> Self {
        Self {
            version: bytecode::VERSION,
            global_count: 0,
            entry: 0,
            functions: vec![FunctionInfo::new(0, 0, 0, code)],
        }
    }
}
