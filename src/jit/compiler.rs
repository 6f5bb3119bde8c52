//! JIT compiler front half: bytecode to a resolved instruction list.
//!
//! Compilation runs in two passes. The first decodes the function, recording
//! the instruction index of every byte offset (and splicing eligible leaf
//! callees in place of their calls). The second patches jump targets from
//! byte offsets to instruction indices once every instruction is known.
//! Backward jumps mark the function as containing loops.

use std::collections::HashMap;

use thiserror::Error;

use super::inline::{inline_body, MAX_INLINE_INSTRUCTIONS};
use crate::vm::{binary_fn, decode, unary_fn, BinaryFn, BytecodeModule, Fault, Op, UnaryFn, Value};

/// Why a function could not be compiled. Never surfaced to the program: the
/// function simply stays interpreted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("function {0} does not exist")]
    UnknownFunction(u16),

    #[error("undecodable instruction at {pc:#06x}: {fault}")]
    Decode { pc: usize, fault: Fault },

    #[error("jump at {pc:#06x} leaves the function (target {target})")]
    JumpOutOfRange { pc: usize, target: i64 },

    #[error("jump at {pc:#06x} lands inside an instruction (target {target:#06x})")]
    JumpIntoInstruction { pc: usize, target: usize },
}

/// A resolved instruction. Jump operands are instruction indices; an index
/// equal to the program length means "fall off the end".
#[derive(Debug, Clone, Copy)]
pub enum Inst {
    Nop,
    Push(Value),
    Pop,
    Dup,
    Binary(BinaryFn),
    Unary(UnaryFn),
    Jump(usize),
    JumpIfZero(usize),
    JumpIfNotZero(usize),
    Call(u16),
    Ret,
    LoadLocal(u8),
    StoreLocal(u8),
    LoadGlobal(u16),
    StoreGlobal(u16),
    ArrayNew,
    ArrayLoad,
    ArrayStore,
    ArrayLen,
    PrintInt,
    ReadInt,
    Halt,
    /// Start of an inlined leaf call: the call-depth check the call would do.
    InlineEnter(u16),
    /// End of an inlined leaf call: the callee's `ret`.
    InlineExit,
}

/// An instruction plus the bytecode location it came from, used to report
/// faults exactly where the interpreter would.
#[derive(Debug, Clone, Copy)]
pub struct JitInst {
    pub inst: Inst,
    pub function: u16,
    pub pc: usize,
}

/// Output of the compiler front half for one function.
#[derive(Debug, Clone)]
pub struct Program {
    pub function: u16,
    pub insts: Vec<JitInst>,
    pub has_loops: bool,
    pub inlined_calls: usize,
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Splice eligible leaf callees into their call sites
    pub inline: bool,
    /// Largest callee (in instructions, trailing `ret` included) to inline
    pub max_inline_size: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            inline: true,
            max_inline_size: MAX_INLINE_INSTRUCTIONS,
        }
    }
}

/// Compile `function` of `module`.
pub fn compile(
    module: &BytecodeModule,
    function: u16,
    options: &CompileOptions,
) -> Result<Program, CompileError> {
    let func = module
        .function(function)
        .ok_or(CompileError::UnknownFunction(function))?;
    let code = &func.code;

    // Pass 1: decode, recording labels (byte offset -> instruction index).
    let mut insts = Vec::new();
    let mut labels: HashMap<usize, usize> = HashMap::new();
    // (instruction index, pc of the jump, target byte offset)
    let mut forward_refs: Vec<(usize, usize, usize)> = Vec::new();
    let mut inlined_calls = 0;

    let mut pc = 0;
    while pc < code.len() {
        let (op, size) = decode(code, pc).map_err(|fault| CompileError::Decode { pc, fault })?;
        labels.insert(pc, insts.len());

        if let Some(offset) = op.jump_offset() {
            let target = (pc + size) as i64 + offset as i64;
            if target < 0 || target > code.len() as i64 {
                return Err(CompileError::JumpOutOfRange { pc, target });
            }
            forward_refs.push((insts.len(), pc, target as usize));
        }

        match op {
            Op::Call(callee) if options.inline && callee != function => {
                if let Some(body) = inline_body(module, callee, options.max_inline_size) {
                    insts.push(JitInst {
                        inst: Inst::InlineEnter(callee),
                        function,
                        pc,
                    });
                    for &(body_pc, body_op) in &body.ops {
                        insts.push(JitInst {
                            inst: lower(body_op),
                            function: callee,
                            pc: body_pc,
                        });
                    }
                    insts.push(JitInst {
                        inst: Inst::InlineExit,
                        function: callee,
                        pc: body.ret_pc,
                    });
                    inlined_calls += 1;
                } else {
                    insts.push(JitInst {
                        inst: lower(op),
                        function,
                        pc,
                    });
                }
            }
            _ => insts.push(JitInst {
                inst: lower(op),
                function,
                pc,
            }),
        }
        pc += size;
    }
    labels.insert(code.len(), insts.len());

    // Pass 2: patch jump targets.
    let mut has_loops = false;
    for (index, jump_pc, target) in forward_refs {
        let resolved = *labels
            .get(&target)
            .ok_or(CompileError::JumpIntoInstruction {
                pc: jump_pc,
                target,
            })?;
        if resolved <= index {
            has_loops = true;
        }
        let slot = &mut insts[index].inst;
        *slot = match *slot {
            Inst::Jump(_) => Inst::Jump(resolved),
            Inst::JumpIfZero(_) => Inst::JumpIfZero(resolved),
            Inst::JumpIfNotZero(_) => Inst::JumpIfNotZero(resolved),
            other => other,
        };
    }

    Ok(Program {
        function,
        insts,
        has_loops,
        inlined_calls,
    })
}

/// Translate one decoded operation. Jump targets are left at zero for
/// pass 2 to patch.
fn lower(op: Op) -> Inst {
    if let Some(f) = binary_fn(op) {
        return Inst::Binary(f);
    }
    if let Some(f) = unary_fn(op) {
        return Inst::Unary(f);
    }
    match op {
        Op::Nop => Inst::Nop,
        Op::PushInt(n) => Inst::Push(Value::from_int(n)),
        Op::PushDouble(f) => Inst::Push(Value::from_f64(f)),
        Op::Pop => Inst::Pop,
        Op::Dup => Inst::Dup,
        Op::Jmp(_) => Inst::Jump(0),
        Op::JmpIfZero(_) => Inst::JumpIfZero(0),
        Op::JmpIfNotZero(_) => Inst::JumpIfNotZero(0),
        Op::Call(callee) => Inst::Call(callee),
        Op::Ret => Inst::Ret,
        Op::LoadLocal(i) => Inst::LoadLocal(i),
        Op::StoreLocal(i) => Inst::StoreLocal(i),
        Op::LoadGlobal(i) => Inst::LoadGlobal(i),
        Op::StoreGlobal(i) => Inst::StoreGlobal(i),
        Op::ArrayNew => Inst::ArrayNew,
        Op::ArrayLoad => Inst::ArrayLoad,
        Op::ArrayStore => Inst::ArrayStore,
        Op::ArrayLen => Inst::ArrayLen,
        Op::PrintInt => Inst::PrintInt,
        Op::ReadInt => Inst::ReadInt,
        Op::Halt => Inst::Halt,
        // Arithmetic is covered by binary_fn/unary_fn above.
        _ => Inst::Nop,
    }
}
