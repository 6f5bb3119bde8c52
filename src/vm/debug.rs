//! Execution tracing for diagnostics.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::Op;

/// One interpreted instruction, reported before it executes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceEvent {
    /// Function index
    pub function: u16,
    /// Byte offset of the instruction
    pub pc: usize,
    pub op: Op,
    /// Operand stack depth before the instruction
    pub stack_depth: usize,
    /// Call stack depth
    pub call_depth: usize,
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[fn {} @ {:04x}] {:<12} stack={} depth={}",
            self.function,
            self.pc,
            self.op.name(),
            self.stack_depth,
            self.call_depth
        )
    }
}

/// Callback installed with `VM::set_trace_hook`.
pub type TraceHook = Box<dyn FnMut(&TraceEvent)>;

/// Trace hook that collects events into a shared vector. Handy in tests.
pub fn recording_hook() -> (TraceHook, Rc<RefCell<Vec<TraceEvent>>>) {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    let hook: TraceHook = Box::new(move |event: &TraceEvent| sink.borrow_mut().push(*event));
    (hook, events)
}
