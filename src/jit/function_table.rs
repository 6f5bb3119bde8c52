//! Per-function JIT records.
//!
//! One record per module function, indexed by function id. A record moves
//! from `Pending` to either `Compiled` or `Failed` at most once; a failed
//! function is never retried and always runs in the interpreter.

use std::rc::Rc;
use std::time::Duration;

use super::native::CompiledFunction;

#[derive(Default)]
pub enum CompileState {
    #[default]
    Pending,
    Compiled(Rc<CompiledFunction>),
    Failed(String),
}

/// JIT bookkeeping for one function.
#[derive(Default)]
pub struct FunctionRecord {
    pub state: CompileState,
    /// Calls observed by the runtime, interpreted or native.
    pub call_count: u64,
    pub compile_count: u32,
    pub native_executions: u64,
    /// Wall time spent in native code, nested calls included.
    pub native_time: Duration,
}

impl FunctionRecord {
    pub fn compiled(&self) -> Option<&Rc<CompiledFunction>> {
        match &self.state {
            CompileState::Compiled(code) => Some(code),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, CompileState::Failed(_))
    }
}

/// Arena of function records indexed by function id.
pub struct JitFunctionTable {
    records: Vec<FunctionRecord>,
}

impl JitFunctionTable {
    /// Create a table with a pending record for each of `function_count`
    /// functions.
    pub fn new(function_count: usize) -> Self {
        Self {
            records: (0..function_count).map(|_| FunctionRecord::default()).collect(),
        }
    }

    pub fn get(&self, function: u16) -> Option<&FunctionRecord> {
        self.records.get(function as usize)
    }

    pub fn get_mut(&mut self, function: u16) -> Option<&mut FunctionRecord> {
        self.records.get_mut(function as usize)
    }

    /// Compiled code for `function`, if any. The `Rc` lets the caller run it
    /// while the table stays mutably reachable.
    pub fn compiled(&self, function: u16) -> Option<Rc<CompiledFunction>> {
        self.get(function).and_then(FunctionRecord::compiled).cloned()
    }

    /// Record a successful compilation.
    pub fn install(&mut self, function: u16, code: CompiledFunction) {
        if let Some(record) = self.get_mut(function) {
            record.state = CompileState::Compiled(Rc::new(code));
            record.compile_count += 1;
        }
    }

    /// Record a failed compilation. The function is not attempted again.
    pub fn mark_failed(&mut self, function: u16, reason: String) {
        if let Some(record) = self.get_mut(function) {
            record.state = CompileState::Failed(reason);
        }
    }

    pub fn record_execution(&mut self, function: u16, elapsed: Duration) {
        if let Some(record) = self.get_mut(function) {
            record.native_executions += 1;
            record.native_time += elapsed;
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &FunctionRecord)> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, r)| (i as u16, r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::compiler::{compile, CompileOptions};
    use crate::jit::native;
    use crate::vm::{assemble_ops, BytecodeModule, Op};

    fn compiled_stub() -> CompiledFunction {
        let module = BytecodeModule::single(assemble_ops(&[Op::PushInt(1), Op::Halt]));
        native::build(compile(&module, 0, &CompileOptions::default()).unwrap())
    }

    #[test]
    fn test_new_table_is_pending() {
        let table = JitFunctionTable::new(3);
        assert_eq!(table.len(), 3);
        for (_, record) in table.iter() {
            assert!(matches!(record.state, CompileState::Pending));
            assert_eq!(record.call_count, 0);
        }
        assert!(table.get(3).is_none());
    }

    #[test]
    fn test_install_and_lookup() {
        let mut table = JitFunctionTable::new(2);
        table.install(1, compiled_stub());
        assert!(table.compiled(0).is_none());
        assert!(table.compiled(1).is_some());
        assert_eq!(table.get(1).unwrap().compile_count, 1);
    }

    #[test]
    fn test_mark_failed() {
        let mut table = JitFunctionTable::new(1);
        table.mark_failed(0, "bad jump".to_string());
        assert!(table.get(0).unwrap().is_failed());
        assert!(table.compiled(0).is_none());
    }

    #[test]
    fn test_out_of_range_ids_ignored() {
        let mut table = JitFunctionTable::new(1);
        table.install(5, compiled_stub());
        table.record_execution(5, Duration::from_millis(1));
        assert!(table.compiled(5).is_none());
    }
}
