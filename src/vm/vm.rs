use std::cell::RefCell;
use std::io::{self, BufRead, BufReader, Write};
use std::rc::Rc;

use tracing::trace;

use super::debug::{TraceEvent, TraceHook};
use super::error::{Fault, RuntimeError};
use super::gc::{self, GcStats};
use super::heap::Heap;
use super::memory::{Memory, StackFrame, RETURN_SENTINEL};
use super::ops::decode;
use super::{BytecodeModule, FunctionInfo, Op, Value};
use crate::config::RuntimeConfig;

#[cfg(feature = "jit")]
use crate::jit::{self, JitFunctionStats, JitRuntime};

// =============================================================================
// I/O
// =============================================================================

/// Input and output streams used by `print_int` and `read_int`.
pub struct Io {
    input: Box<dyn BufRead>,
    output: Box<dyn Write>,
}

impl Io {
    /// Process stdin and stdout.
    pub fn stdio() -> Self {
        Self {
            input: Box::new(BufReader::new(io::stdin())),
            output: Box::new(io::BufWriter::new(io::stdout())),
        }
    }

    pub fn new(input: impl BufRead + 'static, output: impl Write + 'static) -> Self {
        Self {
            input: Box::new(input),
            output: Box::new(output),
        }
    }

    /// Read from `input` and write into an in-memory buffer.
    pub fn capture(input: &str) -> (Self, OutputBuffer) {
        let output = OutputBuffer::default();
        let io = Self::new(io::Cursor::new(input.as_bytes().to_vec()), output.clone());
        (io, output)
    }

    fn print_int(&mut self, n: i64) -> Result<(), Fault> {
        writeln!(self.output, "{}", n)?;
        Ok(())
    }

    /// One integer per line. End of input reads as zero.
    fn read_int(&mut self) -> Result<i64, Fault> {
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(0);
        }
        let text = line.trim();
        text.parse::<i64>()
            .map_err(|_| Fault::InvalidInput(text.to_string()))
    }

    fn flush(&mut self) -> Result<(), Fault> {
        self.output.flush()?;
        Ok(())
    }
}

/// Shared in-memory output sink.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Rc<RefCell<Vec<u8>>>);

impl OutputBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Arithmetic shared by the interpreter and compiled code
// =============================================================================

pub(crate) type BinaryFn = fn(Value, Value) -> Result<Value, Fault>;
pub(crate) type UnaryFn = fn(Value) -> Result<Value, Fault>;

/// Implementation of a two-operand instruction (`a b -> r`).
pub(crate) fn binary_fn(op: Op) -> Option<BinaryFn> {
    let f: BinaryFn = match op {
        Op::Add => |a, b| Ok(Value::from_int(a.as_int().wrapping_add(b.as_int()))),
        Op::Sub => |a, b| Ok(Value::from_int(a.as_int().wrapping_sub(b.as_int()))),
        Op::Mul => |a, b| Ok(Value::from_int(a.as_int().wrapping_mul(b.as_int()))),
        Op::Div => |a, b| match b.as_int() {
            0 => Err(Fault::DivisionByZero),
            d => Ok(Value::from_int(a.as_int().wrapping_div(d))),
        },
        Op::Mod => |a, b| match b.as_int() {
            0 => Err(Fault::ModuloByZero),
            d => Ok(Value::from_int(a.as_int().wrapping_rem(d))),
        },
        Op::Eq => |a, b| Ok(Value::from_bool(a.as_int() == b.as_int())),
        Op::Ne => |a, b| Ok(Value::from_bool(a.as_int() != b.as_int())),
        Op::Lt => |a, b| Ok(Value::from_bool(a.as_int() < b.as_int())),
        Op::Le => |a, b| Ok(Value::from_bool(a.as_int() <= b.as_int())),
        Op::Gt => |a, b| Ok(Value::from_bool(a.as_int() > b.as_int())),
        Op::Ge => |a, b| Ok(Value::from_bool(a.as_int() >= b.as_int())),
        Op::DAdd => |a, b| Ok(Value::from_f64(a.as_f64() + b.as_f64())),
        Op::DSub => |a, b| Ok(Value::from_f64(a.as_f64() - b.as_f64())),
        Op::DMul => |a, b| Ok(Value::from_f64(a.as_f64() * b.as_f64())),
        Op::DDiv => |a, b| {
            let d = b.as_f64();
            if d == 0.0 {
                return Err(Fault::DivisionByZero);
            }
            Ok(Value::from_f64(a.as_f64() / d))
        },
        Op::DMod => |a, b| {
            let d = b.as_f64();
            if d == 0.0 {
                return Err(Fault::ModuloByZero);
            }
            Ok(Value::from_f64(a.as_f64() % d))
        },
        Op::DEq => |a, b| Ok(Value::from_bool(a.as_f64() == b.as_f64())),
        Op::DNe => |a, b| Ok(Value::from_bool(a.as_f64() != b.as_f64())),
        Op::DLt => |a, b| Ok(Value::from_bool(a.as_f64() < b.as_f64())),
        Op::DLe => |a, b| Ok(Value::from_bool(a.as_f64() <= b.as_f64())),
        Op::DGt => |a, b| Ok(Value::from_bool(a.as_f64() > b.as_f64())),
        Op::DGe => |a, b| Ok(Value::from_bool(a.as_f64() >= b.as_f64())),
        _ => return None,
    };
    Some(f)
}

/// Implementation of a one-operand instruction (`a -> r`).
pub(crate) fn unary_fn(op: Op) -> Option<UnaryFn> {
    let f: UnaryFn = match op {
        Op::Neg => |a| Ok(Value::from_int(a.as_int().wrapping_neg())),
        Op::DNeg => |a| Ok(Value::from_f64(-a.as_f64())),
        Op::IntToDouble => |a| Ok(Value::from_f64(a.as_int() as f64)),
        Op::DoubleToInt => |a| Ok(Value::from_int(a.as_f64() as i64)),
        Op::DSqrt => |a| Ok(Value::from_f64(a.as_f64().sqrt())),
        _ => return None,
    };
    Some(f)
}

/// Absolute target of a relative jump, checked against the code length.
#[inline]
pub(crate) fn jump_target(next: usize, offset: i32, code_len: usize) -> Result<usize, Fault> {
    let target = next as i64 + offset as i64;
    if target < 0 || target > code_len as i64 {
        return Err(Fault::JumpOutOfRange(target));
    }
    Ok(target as usize)
}

// =============================================================================
// ExecutionContext
// =============================================================================

/// State of one `VM::run`: the module, the memory it mutates, and the
/// interpreter registers. Compiled code runs against the same context.
pub struct ExecutionContext<'a> {
    pub(crate) module: &'a BytecodeModule,
    pub(crate) memory: &'a mut Memory,
    pub(crate) io: &'a mut Io,
    pub(crate) config: &'a RuntimeConfig,
    pub(crate) gc_stats: &'a mut GcStats,
    #[cfg(feature = "jit")]
    pub(crate) jit: &'a mut JitRuntime,
    trace_hook: Option<&'a mut TraceHook>,
    /// Function whose code the interpreter is executing
    pub function: u16,
    /// Byte offset of the next instruction
    pub pc: usize,
    pub halted: bool,
    pub result: Value,
}

impl<'a> ExecutionContext<'a> {
    pub fn module(&self) -> &'a BytecodeModule {
        self.module
    }

    pub fn memory(&self) -> &Memory {
        self.memory
    }

    #[inline]
    pub fn push(&mut self, value: Value) -> Result<(), Fault> {
        self.memory.stack.push(value)
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Value, Fault> {
        self.memory.stack.pop()
    }

    /// Run a full collection now. Returns the number of arrays freed.
    pub fn collect_garbage(&mut self) -> usize {
        gc::collect(self.memory, self.gc_stats)
    }

    pub(crate) fn function_info(&self, index: u16) -> Result<&'a FunctionInfo, Fault> {
        self.module
            .function(index)
            .ok_or(Fault::InvalidFunction(index))
    }

    /// Push a frame for `callee`, moving its arguments from the operand stack
    /// into locals `0..arity` in call order. The entry frame
    /// (`RETURN_SENTINEL`) takes no arguments; its parameters start at zero.
    pub(crate) fn enter_frame(
        &mut self,
        callee: u16,
        return_function: u16,
        return_address: usize,
    ) -> Result<(), Fault> {
        let info = self.function_info(callee)?;
        // Only the loader and assembler enforce this for modules they build.
        if info.locals_count < info.arity {
            return Err(Fault::LocalsBelowArity {
                function: callee,
                arity: info.arity,
                locals: info.locals_count,
            });
        }
        self.memory.frames.check_room()?;
        let mut frame = StackFrame::new(
            callee,
            return_function,
            return_address,
            info.locals_count as usize,
        );
        if return_address != RETURN_SENTINEL {
            for slot in frame.locals[..info.arity as usize].iter_mut().rev() {
                *slot = self.memory.stack.pop()?;
            }
        }
        self.memory.frames.push(frame)
    }

    /// Return from the active frame. The return value is the top of the
    /// operand stack, or zero if it is empty. Returning from the entry frame
    /// halts with that value; otherwise it is pushed for the caller and the
    /// caller's resume point is returned.
    pub(crate) fn leave_frame(&mut self) -> Result<Option<(u16, usize)>, Fault> {
        let value = self.memory.stack.pop_or_zero();
        let frame = self.memory.frames.pop()?;
        if frame.is_entry() {
            self.finish(value);
            return Ok(None);
        }
        self.memory.stack.push(value)?;
        Ok(Some((frame.return_function, frame.return_address)))
    }

    /// `halt`: the result is the top of the operand stack, or zero.
    pub(crate) fn halt(&mut self) {
        let value = self.memory.stack.pop_or_zero();
        self.finish(value);
    }

    fn finish(&mut self, value: Value) {
        self.result = value;
        self.halted = true;
    }

    #[inline]
    pub(crate) fn load_local(&self, index: u8) -> Result<Value, Fault> {
        self.memory.frames.top()?.load(index)
    }

    #[inline]
    pub(crate) fn store_local(&mut self, index: u8, value: Value) -> Result<(), Fault> {
        self.memory.frames.top_mut()?.store(index, value)
    }

    /// Allocate an array, collecting first if the heap is over its
    /// threshold. Operands must already be off the stack.
    pub(crate) fn alloc_array(&mut self, len: Value) -> Result<Value, Fault> {
        if self.memory.heap.should_gc() {
            self.collect_garbage();
        }
        self.memory.heap.alloc_value(len.as_int())
    }

    pub(crate) fn print_int(&mut self, value: Value) -> Result<(), Fault> {
        self.io.print_int(value.as_int())
    }

    pub(crate) fn read_int(&mut self) -> Result<Value, Fault> {
        self.io.read_int().map(Value::from_int)
    }

    /// Start the entry function and run until the program halts.
    pub(crate) fn run_entry(&mut self) -> Result<Value, RuntimeError> {
        let entry = self.module.entry;

        #[cfg(feature = "jit")]
        if self.jit.on_call(self.module, entry)
            && jit::try_execute(self, entry, entry, RETURN_SENTINEL)
                .map_err(|e| e.locate(entry, 0))?
        {
            return Ok(self.result);
        }

        self.enter_frame(entry, entry, RETURN_SENTINEL)
            .map_err(|f| RuntimeError::from(f).locate(entry, 0))?;
        self.function = entry;
        self.pc = 0;
        self.execute(1)?;
        Ok(self.result)
    }

    /// Interpret until the program halts or the call stack drops below
    /// `stop_depth` frames.
    pub(crate) fn execute(&mut self, stop_depth: usize) -> Result<(), RuntimeError> {
        while !self.halted {
            let function = self.function;
            let pc = self.pc;
            let code = &self.function_info(function)?.code;

            // Falling off the end behaves like `halt`.
            if pc >= code.len() {
                self.halt();
                break;
            }

            let (op, size) =
                decode(code, pc).map_err(|f| RuntimeError::from(f).locate(function, pc))?;

            if self.trace_hook.is_some() || self.config.trace_exec {
                self.trace(op, pc);
            }

            self.pc = pc + size;
            self.step(op, code.len())
                .map_err(|e| e.locate(function, pc))?;

            if self.memory.frames.depth() < stop_depth {
                break;
            }
        }
        Ok(())
    }

    fn trace(&mut self, op: Op, pc: usize) {
        let event = TraceEvent {
            function: self.function,
            pc,
            op,
            stack_depth: self.memory.stack.len(),
            call_depth: self.memory.frames.depth(),
        };
        if self.config.trace_exec {
            trace!(target: "stackvm::exec", "{}", event);
        }
        if let Some(hook) = self.trace_hook.as_mut() {
            hook(&event);
        }
    }

    /// Execute one decoded instruction. `self.pc` already points past it.
    fn step(&mut self, op: Op, code_len: usize) -> Result<(), RuntimeError> {
        match op {
            Op::Nop => {}
            Op::PushInt(n) => self.push(Value::from_int(n))?,
            Op::PushDouble(f) => self.push(Value::from_f64(f))?,
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let v = self.memory.stack.peek()?;
                self.push(v)?;
            }

            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Eq
            | Op::Ne
            | Op::Lt
            | Op::Le
            | Op::Gt
            | Op::Ge
            | Op::DAdd
            | Op::DSub
            | Op::DMul
            | Op::DDiv
            | Op::DMod
            | Op::DEq
            | Op::DNe
            | Op::DLt
            | Op::DLe
            | Op::DGt
            | Op::DGe => {
                let b = self.pop()?;
                let a = self.pop()?;
                let f = binary_fn(op).ok_or(Fault::UnknownOpcode(op.opcode()))?;
                self.push(f(a, b)?)?;
            }
            Op::Neg | Op::DNeg | Op::IntToDouble | Op::DoubleToInt | Op::DSqrt => {
                let a = self.pop()?;
                let f = unary_fn(op).ok_or(Fault::UnknownOpcode(op.opcode()))?;
                self.push(f(a)?)?;
            }

            Op::Jmp(offset) => {
                self.pc = jump_target(self.pc, offset, code_len)?;
            }
            Op::JmpIfZero(offset) => {
                if self.pop()?.is_zero() {
                    self.pc = jump_target(self.pc, offset, code_len)?;
                }
            }
            Op::JmpIfNotZero(offset) => {
                if !self.pop()?.is_zero() {
                    self.pc = jump_target(self.pc, offset, code_len)?;
                }
            }
            Op::Call(callee) => {
                let caller = self.function;
                let resume = self.pc;

                #[cfg(feature = "jit")]
                if self.jit.on_call(self.module, callee)
                    && jit::try_execute(self, callee, caller, resume)?
                {
                    self.function = caller;
                    self.pc = resume;
                    return Ok(());
                }

                self.enter_frame(callee, caller, resume)?;
                self.function = callee;
                self.pc = 0;
            }
            Op::Ret => {
                if let Some((function, pc)) = self.leave_frame()? {
                    self.function = function;
                    self.pc = pc;
                }
            }

            Op::LoadLocal(index) => {
                let v = self.load_local(index)?;
                self.push(v)?;
            }
            Op::StoreLocal(index) => {
                let v = self.pop()?;
                self.store_local(index, v)?;
            }
            Op::LoadGlobal(index) => {
                let v = self.memory.globals.load(index)?;
                self.push(v)?;
            }
            Op::StoreGlobal(index) => {
                let v = self.pop()?;
                self.memory.globals.store(index, v)?;
            }

            Op::ArrayNew => {
                let len = self.pop()?;
                let array = self.alloc_array(len)?;
                self.push(array)?;
            }
            Op::ArrayLoad => {
                let index = self.pop()?;
                let array = self.pop()?;
                let v = self.memory.heap.load(array, index)?;
                self.push(v)?;
            }
            Op::ArrayStore => {
                let value = self.pop()?;
                let index = self.pop()?;
                let array = self.pop()?;
                self.memory.heap.store(array, index, value)?;
            }
            Op::ArrayLen => {
                let array = self.pop()?;
                let len = self.memory.heap.len(array)?;
                self.push(Value::from_int(len as i64))?;
            }

            Op::PrintInt => {
                let v = self.pop()?;
                self.print_int(v)?;
            }
            Op::ReadInt => {
                let v = self.read_int()?;
                self.push(v)?;
            }
            Op::Halt => self.halt(),
        }
        Ok(())
    }
}

// =============================================================================
// VM
// =============================================================================

/// The stackvm virtual machine: one loaded module plus everything needed to
/// run it repeatedly.
pub struct VM {
    module: BytecodeModule,
    config: RuntimeConfig,
    memory: Memory,
    io: Io,
    gc_stats: GcStats,
    #[cfg(feature = "jit")]
    jit: JitRuntime,
    trace_hook: Option<TraceHook>,
}

impl VM {
    pub fn new(module: BytecodeModule) -> Self {
        Self::with_config(module, RuntimeConfig::default())
    }

    pub fn with_config(module: BytecodeModule, config: RuntimeConfig) -> Self {
        Self::with_io(module, config, Io::stdio())
    }

    /// Create a VM with full configuration.
    ///
    /// # Arguments
    /// * `module` - The loaded module to run
    /// * `config` - Limits, JIT and GC policy
    /// * `io` - Streams used by `print_int` and `read_int`
    pub fn with_io(module: BytecodeModule, config: RuntimeConfig, io: Io) -> Self {
        let heap = Heap::new_with_config(config.gc_threshold, config.gc_enabled);
        let memory = Memory::new(
            config.max_stack,
            config.max_call_depth,
            module.global_count as usize,
            heap,
        );
        Self {
            #[cfg(feature = "jit")]
            jit: JitRuntime::new(&config, module.functions.len()),
            module,
            config,
            memory,
            io,
            gc_stats: GcStats::default(),
            trace_hook: None,
        }
    }

    /// Run the entry function from a clean state and return its result.
    pub fn run(&mut self) -> Result<i64, RuntimeError> {
        self.run_value().map(Value::as_int)
    }

    /// Like `run`, returning the raw result word.
    pub fn run_value(&mut self) -> Result<Value, RuntimeError> {
        self.memory.reset(self.module.global_count as usize);
        let result = self.context().run_entry();
        let flushed = self.io.flush();
        let value = result?;
        flushed?;
        Ok(value)
    }

    fn context(&mut self) -> ExecutionContext<'_> {
        ExecutionContext {
            module: &self.module,
            memory: &mut self.memory,
            io: &mut self.io,
            config: &self.config,
            gc_stats: &mut self.gc_stats,
            #[cfg(feature = "jit")]
            jit: &mut self.jit,
            trace_hook: self.trace_hook.as_mut(),
            function: self.module.entry,
            pc: 0,
            halted: false,
            result: Value::ZERO,
        }
    }

    /// Run a full collection against the current memory state.
    pub fn collect_garbage(&mut self) -> usize {
        gc::collect(&mut self.memory, &mut self.gc_stats)
    }

    /// Call `hook` before every interpreted instruction.
    pub fn set_trace_hook(&mut self, hook: impl FnMut(&TraceEvent) + 'static) {
        self.trace_hook = Some(Box::new(hook));
    }

    pub fn gc_stats(&self) -> &GcStats {
        &self.gc_stats
    }

    #[cfg(feature = "jit")]
    pub fn jit_stats(&self) -> Vec<JitFunctionStats> {
        self.jit.stats()
    }

    #[cfg(feature = "jit")]
    pub fn jit(&self) -> &JitRuntime {
        &self.jit
    }

    pub fn module(&self) -> &BytecodeModule {
        &self.module
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn heap(&self) -> &Heap {
        &self.memory.heap
    }

    pub fn globals(&self) -> &[Value] {
        self.memory.globals.as_slice()
    }
}
