//! Leaf-call inlining.
//!
//! A callee is spliced into its caller when executing its body in place is
//! indistinguishable from calling it: no parameters, no locals, no control
//! flow and nothing but a single `ret` at the very end. The splice keeps the
//! callee's frame semantics through `InlineEnter`/`InlineExit` markers (the
//! call-depth check and the return-value rule), and every spliced
//! instruction keeps the callee's (function, pc) for fault reporting.

use crate::vm::{decode, BytecodeModule, Op};

/// Default size limit, in instructions including the trailing `ret`.
pub const MAX_INLINE_INSTRUCTIONS: usize = 16;

/// Decoded body of an inlinable callee.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineBody {
    /// Body instructions with their byte offsets, `ret` excluded
    pub ops: Vec<(usize, Op)>,
    /// Byte offset of the trailing `ret`
    pub ret_pc: usize,
}

/// The body of `callee` if it can be inlined, `None` otherwise.
pub fn inline_body(module: &BytecodeModule, callee: u16, max_size: usize) -> Option<InlineBody> {
    let func = module.function(callee)?;
    if func.arity != 0 || func.locals_count != 0 {
        return None;
    }

    let code = &func.code;
    let mut ops = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let (op, size) = decode(code, pc).ok()?;
        if ops.len() >= max_size {
            return None;
        }
        match op {
            Op::Ret => {
                return (pc + size == code.len()).then_some(InlineBody { ops, ret_pc: pc });
            }
            Op::Jmp(_)
            | Op::JmpIfZero(_)
            | Op::JmpIfNotZero(_)
            | Op::Call(_)
            | Op::LoadLocal(_)
            | Op::StoreLocal(_) => return None,
            _ => ops.push((pc, op)),
        }
        pc += size;
    }
    // No trailing ret: the callee falls off its end, which halts.
    None
}
