//! Mark-and-sweep collection over the array heap.
//!
//! Roots are the operand stack, every frame's locals and the globals. Marking
//! uses an explicit worklist, so deep array chains and cycles are handled
//! without recursion.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use super::heap::Heap;
use super::memory::Memory;
use super::Value;

/// Cumulative collector statistics for one VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GcStats {
    pub cycles: u64,
    pub arrays_freed: u64,
    pub total_pause: Duration,
    pub max_pause: Duration,
    /// Live words after the most recent cycle.
    pub live_words: usize,
}

impl GcStats {
    fn record(&mut self, freed: usize, live_words: usize, pause: Duration) {
        self.cycles += 1;
        self.arrays_freed += freed as u64;
        self.total_pause += pause;
        self.max_pause = self.max_pause.max(pause);
        self.live_words = live_words;
    }
}

/// Run one full cycle over `memory`. Returns the number of arrays freed.
pub fn collect(memory: &mut Memory, stats: &mut GcStats) -> usize {
    let start = Instant::now();
    let roots: Vec<Value> = memory.roots().filter(|v| v.is_array()).collect();

    mark(&mut memory.heap, &roots);
    let freed = sweep(&mut memory.heap);

    let pause = start.elapsed();
    let live = memory.heap.words_allocated();
    stats.record(freed, live, pause);
    debug!(
        target: "stackvm::gc",
        freed,
        live_words = live,
        next_threshold = memory.heap.gc_threshold(),
        pause_us = pause.as_micros() as u64,
        "collection finished"
    );
    freed
}

/// Mark every array reachable from `roots`.
pub fn mark(heap: &mut Heap, roots: &[Value]) {
    let mut worklist: Vec<Value> = roots.to_vec();

    while let Some(value) = worklist.pop() {
        let Some(handle) = value.handle() else {
            continue;
        };
        let Some(slot) = heap.slots.get_mut(handle.index as usize) else {
            continue;
        };
        // Stale handles and already-visited arrays end the walk here.
        if slot.generation != handle.generation || slot.marked {
            continue;
        }
        let Some(data) = slot.data.as_deref() else {
            continue;
        };
        slot.marked = true;
        worklist.extend(data.iter().copied().filter(|v| v.is_array()));
    }
}

/// Free every unmarked array and clear the marks of survivors. Returns the
/// number of arrays freed.
pub fn sweep(heap: &mut Heap) -> usize {
    let mut freed = 0;
    for (index, slot) in heap.slots.iter_mut().enumerate() {
        if slot.data.is_none() {
            continue;
        }
        if slot.marked {
            slot.marked = false;
        } else {
            if slot.release() {
                heap.free.push_back(index as u32);
            }
            freed += 1;
        }
    }

    heap.words_allocated = heap.live_words();
    heap.adapt_threshold();
    freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::memory::StackFrame;
    use crate::vm::{Handle, MAX_GENERATION, RETURN_SENTINEL};

    fn memory() -> Memory {
        Memory::new(64, 8, 2, Heap::new_with_config(16, true))
    }

    #[test]
    fn test_unreachable_collected() {
        let mut mem = memory();
        let kept = mem.heap.alloc_value(2).unwrap();
        let dropped = mem.heap.alloc_value(2).unwrap();
        mem.stack.push(kept).unwrap();

        let mut stats = GcStats::default();
        assert_eq!(collect(&mut mem, &mut stats), 1);
        assert!(mem.heap.is_live(kept));
        assert!(!mem.heap.is_live(dropped));
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.arrays_freed, 1);
        assert_eq!(stats.live_words, 3);
    }

    #[test]
    fn test_nested_from_global_survives() {
        let mut mem = memory();
        let outer = mem.heap.alloc_value(1).unwrap();
        let inner = mem.heap.alloc_value(1).unwrap();
        let leaf = mem.heap.alloc_value(1).unwrap();
        mem.heap.store(outer, Value::ZERO, inner).unwrap();
        mem.heap.store(inner, Value::ZERO, leaf).unwrap();
        mem.globals.store(1, outer).unwrap();

        assert_eq!(collect(&mut mem, &mut GcStats::default()), 0);
        assert!(mem.heap.is_live(leaf));
    }

    #[test]
    fn test_cycle_survives_then_collected() {
        let mut mem = memory();
        let a = mem.heap.alloc_value(1).unwrap();
        let b = mem.heap.alloc_value(1).unwrap();
        mem.heap.store(a, Value::ZERO, b).unwrap();
        mem.heap.store(b, Value::ZERO, a).unwrap();

        let mut frame = StackFrame::new(0, 0, RETURN_SENTINEL, 1);
        frame.store(0, a).unwrap();
        mem.frames.push(frame).unwrap();

        assert_eq!(collect(&mut mem, &mut GcStats::default()), 0);
        assert_eq!(mem.heap.load(b, Value::ZERO).unwrap(), a);

        mem.frames.top_mut().unwrap().store(0, Value::ZERO).unwrap();
        assert_eq!(collect(&mut mem, &mut GcStats::default()), 2);
        assert_eq!(mem.heap.object_count(), 0);
    }

    #[test]
    fn test_freed_slot_reused_with_new_generation() {
        let mut mem = memory();
        let stale = mem.heap.alloc_value(1).unwrap();
        collect(&mut mem, &mut GcStats::default());

        let fresh = mem.heap.alloc_value(1).unwrap();
        assert_eq!(fresh.handle().unwrap().index, stale.handle().unwrap().index);
        assert_ne!(fresh, stale);
        assert!(mem.heap.load(stale, Value::ZERO).is_err());
        assert_eq!(mem.heap.capacity(), 1);
    }

    #[test]
    fn test_slot_at_last_generation_not_reused() {
        let mut mem = memory();
        mem.heap.alloc_value(1).unwrap();
        mem.heap.slots[0].generation = MAX_GENERATION;
        let last = Value::from_handle(Handle::with_generation(0, MAX_GENERATION));

        assert_eq!(collect(&mut mem, &mut GcStats::default()), 1);
        assert!(mem.heap.free.is_empty());
        let fresh = mem.heap.alloc_value(1).unwrap();
        assert_eq!(fresh.handle().unwrap().index, 1);
        assert!(mem.heap.load(last, Value::ZERO).is_err());
    }

    #[test]
    fn test_deep_chain_marks_without_recursion() {
        let mut mem = memory();
        let head = mem.heap.alloc_value(1).unwrap();
        let mut prev = head;
        for _ in 0..100_000 {
            let next = mem.heap.alloc_value(1).unwrap();
            mem.heap.store(prev, Value::ZERO, next).unwrap();
            prev = next;
        }
        mem.stack.push(head).unwrap();
        assert_eq!(collect(&mut mem, &mut GcStats::default()), 0);
        assert_eq!(mem.heap.object_count(), 100_001);
    }

    #[test]
    fn test_threshold_adapts_to_live_size() {
        let mut mem = memory();
        let big = mem.heap.alloc_value(99).unwrap();
        mem.stack.push(big).unwrap();
        collect(&mut mem, &mut GcStats::default());
        assert_eq!(mem.heap.words_allocated(), 100);
        assert_eq!(mem.heap.gc_threshold(), 200);
    }
}
