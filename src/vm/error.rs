//! Error types for loading and running modules.

use std::fmt;
use std::io;

use thiserror::Error;

/// Errors raised while parsing a binary module. Loading never succeeds
/// partially.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("module too short: {len} bytes (header needs {needed})")]
    TooShort { len: usize, needed: usize },

    #[error("invalid magic number: {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported version: {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },

    #[error("function {index}: header or code truncated (needs {needed} bytes, {available} available)")]
    TruncatedFunction {
        index: usize,
        needed: usize,
        available: usize,
    },

    #[error("function {index}: local count {locals} is smaller than arity {arity}")]
    LocalsBelowArity { index: usize, arity: u8, locals: u8 },

    #[error("entry point {entry} does not name one of {count} functions")]
    InvalidEntryPoint { entry: u16, count: usize },

    #[error("{count} trailing bytes after the function table")]
    TrailingBytes { count: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The reason a run was aborted. Interpreter and JIT raise the same kinds for
/// the same program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("operand stack overflow (limit {limit})")]
    StackOverflow { limit: usize },

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("call stack overflow (limit {limit})")]
    CallStackOverflow { limit: usize },

    #[error("division by zero")]
    DivisionByZero,

    #[error("modulo by zero")]
    ModuloByZero,

    #[error("array index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("negative array length {0}")]
    NegativeArrayLength(i64),

    #[error("cannot allocate an array of length {0}")]
    OutOfMemory(i64),

    #[error("invalid or dead heap handle {0:#018x}")]
    InvalidHandle(u64),

    #[error("value {0:#018x} is not an array handle")]
    NotAnArray(u64),

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("truncated operand for opcode {0:#04x}")]
    TruncatedInstruction(u8),

    #[error("local slot {index} out of range ({count} locals)")]
    InvalidLocal { index: u8, count: usize },

    #[error("global slot {index} out of range ({count} globals)")]
    InvalidGlobal { index: u16, count: usize },

    #[error("call to undefined function {0}")]
    InvalidFunction(u16),

    #[error("function {function} has {locals} locals for {arity} parameters")]
    LocalsBelowArity { function: u16, arity: u8, locals: u8 },

    #[error("jump target {0} outside the function")]
    JumpOutOfRange(i64),

    #[error("invalid integer input {0:?}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Where a fault happened: the function index and the byte offset of the
/// faulting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub function: u16,
    pub pc: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function {} at pc {:#06x}", self.function, self.pc)
    }
}

fn fmt_location(location: &Option<Location>) -> String {
    match location {
        Some(loc) => format!(" ({})", loc),
        None => String::new(),
    }
}

/// A fatal error that terminated `VM::run`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("runtime error: {fault}{}", fmt_location(.location))]
pub struct RuntimeError {
    pub fault: Fault,
    pub location: Option<Location>,
}

impl RuntimeError {
    /// Attach a location unless an inner frame already recorded one.
    pub fn locate(mut self, function: u16, pc: usize) -> Self {
        if self.location.is_none() {
            self.location = Some(Location { function, pc });
        }
        self
    }
}

impl From<Fault> for RuntimeError {
    fn from(fault: Fault) -> Self {
        RuntimeError {
            fault,
            location: None,
        }
    }
}

impl From<io::Error> for Fault {
    fn from(e: io::Error) -> Self {
        Fault::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_display() {
        let err = RuntimeError::from(Fault::DivisionByZero).locate(2, 0x1c);
        assert_eq!(
            err.to_string(),
            "runtime error: division by zero (function 2 at pc 0x001c)"
        );
    }

    #[test]
    fn test_locate_keeps_innermost() {
        let err = RuntimeError::from(Fault::StackUnderflow)
            .locate(3, 4)
            .locate(0, 9);
        assert_eq!(
            err.location,
            Some(Location {
                function: 3,
                pc: 4
            })
        );
    }
}
