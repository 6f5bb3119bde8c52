//! Operand stack, call stack and globals.
//!
//! Together with the heap these make up the memory a single run mutates. All
//! bounds are enforced here so the interpreter and the JIT fault identically.

use super::error::Fault;
use super::heap::Heap;
use super::Value;

/// Return address of the entry frame. Returning through it halts the run.
pub const RETURN_SENTINEL: usize = usize::MAX;

/// Bounded LIFO of values.
#[derive(Debug)]
pub struct OperandStack {
    values: Vec<Value>,
    limit: usize,
}

impl OperandStack {
    pub fn new(limit: usize) -> Self {
        Self {
            values: Vec::with_capacity(limit.min(1024)),
            limit,
        }
    }

    #[inline]
    pub fn push(&mut self, value: Value) -> Result<(), Fault> {
        if self.values.len() >= self.limit {
            return Err(Fault::StackOverflow { limit: self.limit });
        }
        self.values.push(value);
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Value, Fault> {
        self.values.pop().ok_or(Fault::StackUnderflow)
    }

    /// Pop the top value, or zero when the stack is empty (the value a void
    /// function returns).
    #[inline]
    pub fn pop_or_zero(&mut self) -> Value {
        self.values.pop().unwrap_or(Value::ZERO)
    }

    #[inline]
    pub fn peek(&self) -> Result<Value, Fault> {
        self.values.last().copied().ok_or(Fault::StackUnderflow)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Activation record of one call.
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// Function executing in this frame.
    pub function: u16,
    /// Function to resume on return.
    pub return_function: u16,
    /// Byte offset in `return_function` to resume at, or `RETURN_SENTINEL`.
    pub return_address: usize,
    /// Exactly `locals_count` slots; parameters occupy `0..arity`.
    pub locals: Box<[Value]>,
}

impl StackFrame {
    pub fn new(function: u16, return_function: u16, return_address: usize, locals: usize) -> Self {
        Self {
            function,
            return_function,
            return_address,
            locals: vec![Value::ZERO; locals].into_boxed_slice(),
        }
    }

    pub fn is_entry(&self) -> bool {
        self.return_address == RETURN_SENTINEL
    }

    #[inline]
    pub fn load(&self, index: u8) -> Result<Value, Fault> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or(Fault::InvalidLocal {
                index,
                count: self.locals.len(),
            })
    }

    #[inline]
    pub fn store(&mut self, index: u8, value: Value) -> Result<(), Fault> {
        let count = self.locals.len();
        let slot = self
            .locals
            .get_mut(index as usize)
            .ok_or(Fault::InvalidLocal { index, count })?;
        *slot = value;
        Ok(())
    }
}

/// Bounded stack of frames.
#[derive(Debug)]
pub struct CallStack {
    frames: Vec<StackFrame>,
    limit: usize,
}

impl CallStack {
    pub fn new(limit: usize) -> Self {
        Self {
            frames: Vec::with_capacity(limit.min(64)),
            limit,
        }
    }

    pub fn push(&mut self, frame: StackFrame) -> Result<(), Fault> {
        self.check_room()?;
        self.frames.push(frame);
        Ok(())
    }

    /// Fails the same way `push` would, without pushing.
    #[inline]
    pub fn check_room(&self) -> Result<(), Fault> {
        if self.frames.len() >= self.limit {
            return Err(Fault::CallStackOverflow { limit: self.limit });
        }
        Ok(())
    }

    pub fn pop(&mut self) -> Result<StackFrame, Fault> {
        self.frames.pop().ok_or(Fault::StackUnderflow)
    }

    pub fn top(&self) -> Result<&StackFrame, Fault> {
        self.frames.last().ok_or(Fault::StackUnderflow)
    }

    pub fn top_mut(&mut self) -> Result<&mut StackFrame, Fault> {
        self.frames.last_mut().ok_or(Fault::StackUnderflow)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Fixed-size global variable table.
#[derive(Debug, Default)]
pub struct Globals {
    values: Vec<Value>,
}

impl Globals {
    pub fn new(count: usize) -> Self {
        Self {
            values: vec![Value::ZERO; count],
        }
    }

    #[inline]
    pub fn load(&self, index: u16) -> Result<Value, Fault> {
        self.values
            .get(index as usize)
            .copied()
            .ok_or(Fault::InvalidGlobal {
                index,
                count: self.values.len(),
            })
    }

    #[inline]
    pub fn store(&mut self, index: u16, value: Value) -> Result<(), Fault> {
        let count = self.values.len();
        let slot = self
            .values
            .get_mut(index as usize)
            .ok_or(Fault::InvalidGlobal { index, count })?;
        *slot = value;
        Ok(())
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }
}

/// All mutable state of a run: stacks, globals and the heap.
#[derive(Debug)]
pub struct Memory {
    pub stack: OperandStack,
    pub frames: CallStack,
    pub globals: Globals,
    pub heap: Heap,
}

impl Memory {
    pub fn new(max_stack: usize, max_call_depth: usize, global_count: usize, heap: Heap) -> Self {
        Self {
            stack: OperandStack::new(max_stack),
            frames: CallStack::new(max_call_depth),
            globals: Globals::new(global_count),
            heap,
        }
    }

    /// Drop every value and array, keeping the configured limits.
    pub fn reset(&mut self, global_count: usize) {
        self.stack.clear();
        self.frames.clear();
        self.globals = Globals::new(global_count);
        self.heap.clear();
    }

    /// Every value the collector treats as a root.
    pub fn roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.stack
            .as_slice()
            .iter()
            .chain(self.frames.frames().iter().flat_map(|f| f.locals.iter()))
            .chain(self.globals.as_slice().iter())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_limits() {
        let mut stack = OperandStack::new(2);
        stack.push(Value::from_int(1)).unwrap();
        stack.push(Value::from_int(2)).unwrap();
        assert_eq!(
            stack.push(Value::from_int(3)),
            Err(Fault::StackOverflow { limit: 2 })
        );
        assert_eq!(stack.pop().unwrap().as_int(), 2);
        assert_eq!(stack.pop().unwrap().as_int(), 1);
        assert_eq!(stack.pop(), Err(Fault::StackUnderflow));
        assert_eq!(stack.pop_or_zero(), Value::ZERO);
    }

    #[test]
    fn test_call_stack_limit() {
        let mut frames = CallStack::new(1);
        frames
            .push(StackFrame::new(0, 0, RETURN_SENTINEL, 0))
            .unwrap();
        let err = frames.push(StackFrame::new(1, 0, 3, 0)).unwrap_err();
        assert_eq!(err, Fault::CallStackOverflow { limit: 1 });
        assert!(frames.top().unwrap().is_entry());
    }

    #[test]
    fn test_frame_locals_sized_to_count() {
        let mut frame = StackFrame::new(1, 0, 9, 3);
        assert_eq!(frame.locals.len(), 3);
        frame.store(2, Value::from_int(7)).unwrap();
        assert_eq!(frame.load(2).unwrap().as_int(), 7);
        assert_eq!(
            frame.load(3),
            Err(Fault::InvalidLocal { index: 3, count: 3 })
        );
    }

    #[test]
    fn test_globals_bounds() {
        let mut globals = Globals::new(1);
        globals.store(0, Value::from_int(5)).unwrap();
        assert_eq!(globals.load(0).unwrap().as_int(), 5);
        assert!(matches!(
            globals.store(1, Value::ZERO),
            Err(Fault::InvalidGlobal { index: 1, count: 1 })
        ));
    }

    #[test]
    fn test_roots_cover_stack_locals_globals() {
        let mut memory = Memory::new(16, 4, 1, Heap::new());
        memory.stack.push(Value::from_int(1)).unwrap();
        let mut frame = StackFrame::new(0, 0, RETURN_SENTINEL, 1);
        frame.store(0, Value::from_int(2)).unwrap();
        memory.frames.push(frame).unwrap();
        memory.globals.store(0, Value::from_int(3)).unwrap();

        let roots: Vec<i64> = memory.roots().map(Value::as_int).collect();
        assert_eq!(roots, vec![1, 2, 3]);
    }
}
