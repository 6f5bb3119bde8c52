//! Closure backend.
//!
//! A compiled function is a boxed closure over its resolved instruction list.
//! The closure runs its own dispatch loop and keeps up to two top-of-stack
//! values in a register cache. The cache is flushed to the real operand stack
//! before anything that can observe it from outside: calls, returns, halts,
//! allocation (the GC scans the operand stack), global and array access,
//! and I/O.
//!
//! The closure expects its frame to be on the call stack already; see
//! `jit::try_execute`.

#[cfg(debug_assertions)]
use tracing::debug;

use crate::vm::{ExecutionContext, Fault, Op, OperandStack, RuntimeError, Value};

use super::compiler::{Inst, JitInst, Program};
use super::try_execute;

/// Back-edges between "long-running loop" reports in debug builds.
#[cfg(debug_assertions)]
const LONG_LOOP_REPORT: u64 = 1 << 24;

/// Entry point of a compiled function.
pub type NativeCode = Box<dyn Fn(&mut ExecutionContext<'_>) -> Result<(), RuntimeError>>;

/// A function compiled to a native closure.
pub struct CompiledFunction {
    pub function: u16,
    pub has_loops: bool,
    pub inlined_calls: usize,
    pub instruction_count: usize,
    code: NativeCode,
}

impl CompiledFunction {
    /// Run the function body against `ctx`. Its frame must be the top of
    /// the call stack.
    pub fn invoke(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), RuntimeError> {
        (self.code)(ctx)
    }
}

impl std::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("function", &self.function)
            .field("has_loops", &self.has_loops)
            .field("inlined_calls", &self.inlined_calls)
            .field("instruction_count", &self.instruction_count)
            .finish()
    }
}

/// Build the executable closure for a compiled program.
pub fn build(program: Program) -> CompiledFunction {
    let Program {
        function,
        insts,
        has_loops,
        inlined_calls,
    } = program;

    // Without loops or calls the logical stack grows by at most one value per
    // pushing instruction, so overflow checks can be skipped whenever that
    // much headroom exists on entry.
    let needs_checks = has_loops || insts.iter().any(|i| matches!(i.inst, Inst::Call(_)));
    let max_growth = insts.iter().filter(|i| grows_stack(i.inst)).count();
    let instruction_count = insts.len();
    let insts: Box<[JitInst]> = insts.into_boxed_slice();

    let code: NativeCode = Box::new(move |ctx| {
        let stack = &ctx.memory.stack;
        let checked = needs_checks || stack.len() + max_growth > stack.limit();
        run(function, &insts, checked, ctx)
    });

    CompiledFunction {
        function,
        has_loops,
        inlined_calls,
        instruction_count,
        code,
    }
}

fn grows_stack(inst: Inst) -> bool {
    matches!(
        inst,
        Inst::Push(_)
            | Inst::Dup
            | Inst::LoadLocal(_)
            | Inst::LoadGlobal(_)
            | Inst::ReadInt
            | Inst::InlineExit
    )
}

/// Top-of-stack register cache. Logically the cached values sit above the
/// real operand stack, `regs[len - 1]` being the top.
#[derive(Debug, Default)]
struct RegisterCache {
    regs: [Value; 2],
    len: usize,
}

impl RegisterCache {
    #[inline]
    fn push(&mut self, stack: &mut OperandStack, value: Value, checked: bool) -> Result<(), Fault> {
        if checked && stack.len() + self.len >= stack.limit() {
            return Err(Fault::StackOverflow {
                limit: stack.limit(),
            });
        }
        if self.len == self.regs.len() {
            stack.push(self.regs[0])?;
            self.regs[0] = self.regs[1];
            self.len -= 1;
        }
        self.regs[self.len] = value;
        self.len += 1;
        Ok(())
    }

    #[inline]
    fn pop(&mut self, stack: &mut OperandStack) -> Result<Value, Fault> {
        if self.len > 0 {
            self.len -= 1;
            Ok(self.regs[self.len])
        } else {
            stack.pop()
        }
    }

    #[inline]
    fn peek(&self, stack: &OperandStack) -> Result<Value, Fault> {
        if self.len > 0 {
            Ok(self.regs[self.len - 1])
        } else {
            stack.peek()
        }
    }

    #[inline]
    fn flush(&mut self, stack: &mut OperandStack) -> Result<(), Fault> {
        for &value in &self.regs[..self.len] {
            stack.push(value)?;
        }
        self.len = 0;
        Ok(())
    }

    fn is_logically_empty(&self, stack: &OperandStack) -> bool {
        self.len == 0 && stack.is_empty()
    }
}

enum Flow {
    Next,
    Jump(usize),
    Exit,
}

fn run(
    function: u16,
    insts: &[JitInst],
    checked: bool,
    ctx: &mut ExecutionContext<'_>,
) -> Result<(), RuntimeError> {
    let mut cache = RegisterCache::default();
    let mut ip = 0;
    // Diagnostics only: loops are never cut short.
    #[cfg(debug_assertions)]
    let mut back_edges: u64 = 0;

    while let Some(inst) = insts.get(ip) {
        let flow = step(inst, function, &mut cache, checked, ctx)
            .map_err(|e| e.locate(inst.function, inst.pc))?;
        match flow {
            Flow::Next => ip += 1,
            Flow::Jump(target) => {
                #[cfg(debug_assertions)]
                if target <= ip {
                    back_edges += 1;
                    if back_edges % LONG_LOOP_REPORT == 0 {
                        debug!(target: "stackvm::jit", function, back_edges, "long-running native loop");
                    }
                }
                ip = target;
            }
            Flow::Exit => return Ok(()),
        }
    }
    // Falling off the end behaves like `halt`.
    cache.flush(&mut ctx.memory.stack)?;
    ctx.halt();
    Ok(())
}

#[inline]
fn step(
    inst: &JitInst,
    function: u16,
    cache: &mut RegisterCache,
    checked: bool,
    ctx: &mut ExecutionContext<'_>,
) -> Result<Flow, RuntimeError> {
    match inst.inst {
        Inst::Nop => {}
        Inst::Push(v) => cache.push(&mut ctx.memory.stack, v, checked)?,
        Inst::Pop => {
            cache.pop(&mut ctx.memory.stack)?;
        }
        Inst::Dup => {
            let v = cache.peek(&ctx.memory.stack)?;
            cache.push(&mut ctx.memory.stack, v, checked)?;
        }
        Inst::Binary(f) => {
            let b = cache.pop(&mut ctx.memory.stack)?;
            let a = cache.pop(&mut ctx.memory.stack)?;
            cache.push(&mut ctx.memory.stack, f(a, b)?, checked)?;
        }
        Inst::Unary(f) => {
            let a = cache.pop(&mut ctx.memory.stack)?;
            cache.push(&mut ctx.memory.stack, f(a)?, checked)?;
        }

        Inst::Jump(target) => return Ok(Flow::Jump(target)),
        Inst::JumpIfZero(target) => {
            if cache.pop(&mut ctx.memory.stack)?.is_zero() {
                return Ok(Flow::Jump(target));
            }
        }
        Inst::JumpIfNotZero(target) => {
            if !cache.pop(&mut ctx.memory.stack)?.is_zero() {
                return Ok(Flow::Jump(target));
            }
        }

        Inst::LoadLocal(index) => {
            let v = ctx.load_local(index)?;
            cache.push(&mut ctx.memory.stack, v, checked)?;
        }
        Inst::StoreLocal(index) => {
            let v = cache.pop(&mut ctx.memory.stack)?;
            ctx.store_local(index, v)?;
        }
        Inst::LoadGlobal(index) => {
            cache.flush(&mut ctx.memory.stack)?;
            let v = ctx.memory.globals.load(index)?;
            ctx.push(v)?;
        }
        Inst::StoreGlobal(index) => {
            let v = cache.pop(&mut ctx.memory.stack)?;
            cache.flush(&mut ctx.memory.stack)?;
            ctx.memory.globals.store(index, v)?;
        }

        Inst::ArrayNew => {
            let len = cache.pop(&mut ctx.memory.stack)?;
            cache.flush(&mut ctx.memory.stack)?;
            let array = ctx.alloc_array(len)?;
            ctx.push(array)?;
        }
        Inst::ArrayLoad => {
            let index = cache.pop(&mut ctx.memory.stack)?;
            let array = cache.pop(&mut ctx.memory.stack)?;
            cache.flush(&mut ctx.memory.stack)?;
            let v = ctx.memory.heap.load(array, index)?;
            ctx.push(v)?;
        }
        Inst::ArrayStore => {
            let value = cache.pop(&mut ctx.memory.stack)?;
            let index = cache.pop(&mut ctx.memory.stack)?;
            let array = cache.pop(&mut ctx.memory.stack)?;
            cache.flush(&mut ctx.memory.stack)?;
            ctx.memory.heap.store(array, index, value)?;
        }
        Inst::ArrayLen => {
            let array = cache.pop(&mut ctx.memory.stack)?;
            cache.flush(&mut ctx.memory.stack)?;
            let len = ctx.memory.heap.len(array)?;
            ctx.push(Value::from_int(len as i64))?;
        }

        Inst::PrintInt => {
            let v = cache.pop(&mut ctx.memory.stack)?;
            cache.flush(&mut ctx.memory.stack)?;
            ctx.print_int(v)?;
        }
        Inst::ReadInt => {
            cache.flush(&mut ctx.memory.stack)?;
            let v = ctx.read_int()?;
            ctx.push(v)?;
        }

        Inst::Call(callee) => {
            cache.flush(&mut ctx.memory.stack)?;
            return call(ctx, function, callee, inst.pc + Op::Call(callee).size());
        }
        Inst::Ret => {
            cache.flush(&mut ctx.memory.stack)?;
            ctx.leave_frame()?;
            return Ok(Flow::Exit);
        }
        Inst::Halt => {
            cache.flush(&mut ctx.memory.stack)?;
            ctx.halt();
            return Ok(Flow::Exit);
        }

        Inst::InlineEnter(_) => ctx.memory.frames.check_room()?,
        Inst::InlineExit => {
            // `ret` pops the top value (zero if none) and pushes it back for
            // the caller, which only changes an empty stack.
            if cache.is_logically_empty(&ctx.memory.stack) {
                cache.push(&mut ctx.memory.stack, Value::ZERO, checked)?;
            }
        }
    }
    Ok(Flow::Next)
}

/// A call out of compiled code: native if the callee is (or just became)
/// compiled, otherwise a nested interpreter run that stops when the callee
/// returns.
fn call(
    ctx: &mut ExecutionContext<'_>,
    caller: u16,
    callee: u16,
    resume: usize,
) -> Result<Flow, RuntimeError> {
    let module = ctx.module;
    if ctx.jit.on_call(module, callee) && try_execute(ctx, callee, caller, resume)? {
        return Ok(if ctx.halted { Flow::Exit } else { Flow::Next });
    }

    let depth = ctx.memory.frames.depth();
    ctx.enter_frame(callee, caller, resume)?;
    ctx.function = callee;
    ctx.pc = 0;
    ctx.execute(depth + 1)?;
    Ok(if ctx.halted { Flow::Exit } else { Flow::Next })
}
