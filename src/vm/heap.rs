use std::collections::VecDeque;

use super::error::Fault;
use super::value::{Handle, MAX_GENERATION};
use super::Value;

/// Initial automatic-collection threshold, in words.
pub const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;

/// Per-array bookkeeping counted against the threshold, in words.
const ARRAY_HEADER_WORDS: usize = 1;

// =============================================================================
// Slot - one entry of the handle table
// =============================================================================

/// A handle-table entry. `data` is `None` once the collector freed the slot;
/// the generation is bumped at the same time so older handles stop resolving.
#[derive(Debug, Default)]
pub(super) struct Slot {
    pub(super) generation: u32,
    pub(super) marked: bool,
    pub(super) data: Option<Box<[Value]>>,
}

impl Slot {
    fn size_words(&self) -> usize {
        self.data
            .as_ref()
            .map_or(0, |d| d.len() + ARRAY_HEADER_WORDS)
    }

    /// Drop the array and advance the generation. Returns whether the slot
    /// may be handed out again; a slot at `MAX_GENERATION` is retired.
    pub(super) fn release(&mut self) -> bool {
        self.data = None;
        self.marked = false;
        if self.generation >= MAX_GENERATION {
            return false;
        }
        self.generation += 1;
        true
    }
}

// =============================================================================
// Heap - handle-indexed array storage
// =============================================================================

/// The garbage-collected array heap.
///
/// Arrays live in a vector of slots indexed by handle. Freed slots are queued
/// and handed out again, oldest first, by later allocations.
#[derive(Debug)]
pub struct Heap {
    pub(super) slots: Vec<Slot>,
    /// Freed slot indices awaiting reuse.
    pub(super) free: VecDeque<u32>,
    /// Words held by arrays allocated since the last sweep, plus survivors.
    pub(super) words_allocated: usize,
    pub(super) gc_threshold: usize,
    initial_threshold: usize,
    gc_enabled: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self::new_with_config(DEFAULT_GC_THRESHOLD, true)
    }

    /// Create a heap with a custom automatic-collection policy.
    ///
    /// # Arguments
    /// * `gc_threshold` - Words allocated before `should_gc` reports true
    /// * `gc_enabled` - Whether automatic collection is allowed at all
    pub fn new_with_config(gc_threshold: usize, gc_enabled: bool) -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            words_allocated: 0,
            gc_threshold,
            initial_threshold: gc_threshold,
            gc_enabled,
        }
    }

    /// Allocate a zero-filled array of `len` elements.
    pub fn alloc(&mut self, len: i64) -> Result<Handle, Fault> {
        if len < 0 {
            return Err(Fault::NegativeArrayLength(len));
        }
        let mut data = Vec::new();
        data.try_reserve_exact(len as usize)
            .map_err(|_| Fault::OutOfMemory(len))?;
        data.resize(len as usize, Value::ZERO);
        let data = data.into_boxed_slice();
        self.words_allocated += data.len() + ARRAY_HEADER_WORDS;

        if let Some(index) = self.free.pop_front() {
            let slot = &mut self.slots[index as usize];
            slot.data = Some(data);
            slot.marked = false;
            return Ok(Handle::with_generation(index, slot.generation));
        }

        let index = u32::try_from(self.slots.len()).map_err(|_| Fault::OutOfMemory(len))?;
        self.slots.push(Slot {
            generation: 0,
            marked: false,
            data: Some(data),
        });
        Ok(Handle::new(index))
    }

    /// Allocate an array and return it as a tagged value.
    pub fn alloc_value(&mut self, len: i64) -> Result<Value, Fault> {
        self.alloc(len).map(Value::from_handle)
    }

    /// Resolve a value to the live array it names.
    pub fn get(&self, value: Value) -> Result<&[Value], Fault> {
        let handle = value.handle().ok_or(Fault::NotAnArray(value.bits()))?;
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.data.as_deref())
            .ok_or(Fault::InvalidHandle(value.bits()))
    }

    fn get_mut(&mut self, value: Value) -> Result<&mut [Value], Fault> {
        let handle = value.handle().ok_or(Fault::NotAnArray(value.bits()))?;
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.data.as_deref_mut())
            .ok_or(Fault::InvalidHandle(value.bits()))
    }

    #[inline]
    pub fn load(&self, array: Value, index: Value) -> Result<Value, Fault> {
        let data = self.get(array)?;
        let i = check_index(index.as_int(), data.len())?;
        Ok(data[i])
    }

    #[inline]
    pub fn store(&mut self, array: Value, index: Value, value: Value) -> Result<(), Fault> {
        let data = self.get_mut(array)?;
        let i = check_index(index.as_int(), data.len())?;
        data[i] = value;
        Ok(())
    }

    pub fn len(&self, array: Value) -> Result<usize, Fault> {
        self.get(array).map(<[Value]>::len)
    }

    /// Whether `value` names a live array.
    pub fn is_live(&self, value: Value) -> bool {
        self.get(value).is_ok()
    }

    /// Check if an automatic collection is due.
    pub fn should_gc(&self) -> bool {
        self.gc_enabled && self.words_allocated >= self.gc_threshold
    }

    pub fn words_allocated(&self) -> usize {
        self.words_allocated
    }

    pub fn gc_threshold(&self) -> usize {
        self.gc_threshold
    }

    /// Raise the threshold to twice the surviving size, never below the
    /// configured starting point.
    pub(super) fn adapt_threshold(&mut self) {
        self.gc_threshold = (self.words_allocated * 2).max(self.initial_threshold);
    }

    /// Number of live arrays.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.data.is_some()).count()
    }

    /// Number of slots ever created, live or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Drop every array. Generations survive so handles from a previous run
    /// stay invalid.
    pub fn clear(&mut self) {
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let reusable = if slot.data.is_some() {
                slot.release()
            } else {
                slot.generation < MAX_GENERATION
            };
            if reusable {
                self.free.push_back(index as u32);
            }
        }
        self.words_allocated = 0;
        self.gc_threshold = self.initial_threshold;
    }

    pub(super) fn live_words(&self) -> usize {
        self.slots.iter().map(Slot::size_words).sum()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn check_index(index: i64, len: usize) -> Result<usize, Fault> {
    if index < 0 || index as u64 >= len as u64 {
        return Err(Fault::IndexOutOfBounds { index, len });
    }
    Ok(index as usize)
}
