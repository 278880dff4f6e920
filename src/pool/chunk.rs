//! Fixed-capacity chunks: item slots plus one parallel column per component.
//!
//! Every slot is an epoch-managed pointer. Writers (allocation, compaction,
//! registration) publish cells with release stores; weakly consistent
//! readers pin an epoch guard, load with acquire semantics and validate the
//! observed item id against the slot they read it from. Vacated cells are
//! reclaimed through the epoch collector, never freed in place, so a reader
//! that lost a race still dereferences live memory.

use std::{
    any::Any,
    hint,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, OnceLock,
    },
};

use crossbeam::epoch::{Atomic, Guard, Owned, Shared};

use crate::pool::{id_schema::IdSchema, Item};

/// A shared, type-erased component value.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// A chunk column cell holding one shared component value.
///
/// The value inside is reference-counted so reads can hand out clones that
/// outlive compaction.
pub struct DataCell {
    value: ErasedValue,
}

impl DataCell {
    /// Erase an owned component value.
    #[inline]
    pub fn of<C: Any + Send + Sync>(value: C) -> Self {
        Self {
            value: Arc::new(value),
        }
    }

    /// Wrap an already-shared value (prefab cloning, migration copies).
    #[inline]
    pub(crate) fn share(value: ErasedValue) -> Self {
        Self { value }
    }

    /// The shared value.
    #[inline]
    pub(crate) fn value(&self) -> &ErasedValue {
        &self.value
    }
}

/// A chunk slot's hold on a shared item record.
pub(crate) struct ItemCell<T> {
    pub(crate) item: Arc<T>,
}

/// One fixed-capacity block of a tenant's slots.
///
/// Chunks are owned by the pool's chunk table and identified by chunk-id;
/// the intra-tenant links (`previous`, `next`) are stored as chunk-ids, so
/// walking a tenant is a cursor `(chunk_id, slot)` resolved through the
/// table.
pub struct LinkedChunk<T: Item> {
    id: u32,
    schema: IdSchema,

    /// Fill cursor: number of reserved slots. Clamped to the capacity for
    /// size reporting; transiently overshoots while an optimistic
    /// reservation is being undone.
    index: AtomicI32,

    items: Box<[Atomic<ItemCell<T>>]>,

    /// One column per component of the owning composition, parallel to
    /// `items`. State tenants have no columns.
    data: Box<[Box<[Atomic<DataCell>]>]>,

    previous: Option<u32>,
    next: OnceLock<u32>,
}

/// A capacity-sized run of empty epoch slots.
fn empty_column<U>(capacity: usize) -> Box<[Atomic<U>]> {
    (0..capacity)
        .map(|_| Atomic::null())
        .collect::<Vec<_>>()
        .into_boxed_slice()
}

impl<T: Item> LinkedChunk<T> {
    pub(crate) fn new(id: u32, schema: IdSchema, arity: usize, previous: Option<u32>) -> Self {
        let capacity = schema.chunk_capacity() as usize;
        Self {
            id,
            schema,
            index: AtomicI32::new(0),
            items: empty_column(capacity),
            data: (0..arity).map(|_| empty_column(capacity)).collect(),
            previous,
            next: OnceLock::new(),
        }
    }

    /// The chunk-id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The previous chunk of the owning tenant, if any.
    #[inline]
    pub fn previous(&self) -> Option<u32> {
        self.previous
    }

    /// The next chunk of the owning tenant, once one exists.
    #[inline]
    pub fn next(&self) -> Option<u32> {
        self.next.get().copied()
    }

    /// Link the successor chunk. Called exactly once, under the tenant's
    /// write lock.
    pub(crate) fn set_next(&self, next: u32) {
        let linked = self.next.set(next);
        debug_assert!(linked.is_ok());
    }

    /// Number of component columns.
    #[inline]
    pub fn arity(&self) -> usize {
        self.data.len()
    }

    /// Logical size: reserved slots, clamped to the capacity.
    #[inline]
    pub fn size(&self) -> u32 {
        self.index
            .load(Ordering::Acquire)
            .clamp(0, self.schema.chunk_capacity() as i32) as u32
    }

    /// Whether no slot is reserved.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether a fresh slot can still be reserved.
    #[inline]
    pub fn has_capacity(&self) -> bool {
        self.index.load(Ordering::Acquire) < self.schema.chunk_capacity() as i32
    }

    /// Reserve the next slot, returning its index (possibly out of range;
    /// the caller validates and undoes).
    #[inline]
    pub(crate) fn increment_index(&self) -> i32 {
        self.index.fetch_add(1, Ordering::AcqRel)
    }

    /// Undo a failed reservation.
    #[inline]
    pub(crate) fn decrement_index(&self) {
        self.index.fetch_sub(1, Ordering::AcqRel);
    }

    /// Grow the size window back over a reused slot.
    #[inline]
    fn restore_window(&self, slot: u32) {
        self.index.fetch_max(slot as i32 + 1, Ordering::AcqRel);
    }

    /// Load the item at a slot, cloning its shared record.
    pub(crate) fn item_arc(&self, slot: u32, guard: &Guard) -> Option<Arc<T>> {
        let shared = self.items[slot as usize].load(Ordering::Acquire, guard);
        // SAFETY: non-null cells stay allocated for the lifetime of the
        // guard; reclamation is epoch-deferred.
        unsafe { shared.as_ref() }.map(|cell| Arc::clone(&cell.item))
    }

    /// Load a column cell at a slot without cloning.
    pub(crate) fn data_shared<'g>(
        &self,
        column: usize,
        slot: u32,
        guard: &'g Guard,
    ) -> Shared<'g, DataCell> {
        self.data[column][slot as usize].load(Ordering::Acquire, guard)
    }

    /// Load and share the component value of a column cell.
    pub(crate) fn data_value(
        &self,
        column: usize,
        slot: u32,
        guard: &Guard,
    ) -> Option<ErasedValue> {
        let shared = self.data_shared(column, slot, guard);
        // SAFETY: see `item_arc`.
        unsafe { shared.as_ref() }.map(|cell| Arc::clone(cell.value()))
    }

    /// Install an item and its component cells into a slot.
    ///
    /// Columns are published before the item: readers key off the item, so
    /// an observed item implies observable data.
    pub(crate) fn set(&self, item: Arc<T>, cells: Vec<Option<DataCell>>, slot: u32, guard: &Guard) {
        debug_assert!(cells.len() == self.arity());
        for (column, cell) in cells.into_iter().enumerate() {
            let Some(cell) = cell else {
                continue;
            };
            let old = self.data[column][slot as usize].swap(
                Owned::new(cell),
                Ordering::AcqRel,
                guard,
            );
            if !old.is_null() {
                // SAFETY: `old` was removed from the column and is no longer
                // reachable by new readers.
                unsafe { guard.defer_destroy(old) };
            }
        }
        let old = self.items[slot as usize].swap(
            Owned::new(ItemCell { item }),
            Ordering::AcqRel,
            guard,
        );
        if !old.is_null() {
            // SAFETY: as above.
            unsafe { guard.defer_destroy(old) };
        }
        self.restore_window(slot);
    }

    /// Replace one component cell in place (add of an already-present type).
    pub(crate) fn replace_data(&self, column: usize, slot: u32, cell: DataCell, guard: &Guard) {
        let old = self.data[column][slot as usize].swap(Owned::new(cell), Ordering::AcqRel, guard);
        if !old.is_null() {
            // SAFETY: `old` was removed from the column.
            unsafe { guard.defer_destroy(old) };
        }
    }

    /// Vacate a slot and compact by moving the frontier slot into it.
    ///
    /// Returns the frontier slot index (the moved slot's old position); when
    /// the freed slot *was* the frontier, that is the freed slot itself and
    /// nothing moves. Must run under the owning tenant's write lock with
    /// reservations quiesced, which keeps the cursor stable here.
    pub(crate) fn remove(
        &self,
        freed_slot: u32,
        is_state: bool,
        destroying: bool,
        guard: &Guard,
    ) -> u32 {
        // Vacate the freed slot first so the move below never clobbers it.
        let old_item = self.items[freed_slot as usize].swap(Shared::null(), Ordering::AcqRel, guard);
        // SAFETY: guard-protected load, cell alive for the guard's lifetime.
        if let Some(cell) = unsafe { old_item.as_ref() } {
            if destroying && !is_state {
                cell.item.set_id(IdSchema::detach(cell.item.id()));
            }
            // SAFETY: removed from the slot, unreachable to new readers.
            unsafe { guard.defer_destroy(old_item) };
        }
        for column in self.data.iter() {
            let old = column[freed_slot as usize].swap(Shared::null(), Ordering::AcqRel, guard);
            if !old.is_null() {
                // SAFETY: as above.
                unsafe { guard.defer_destroy(old) };
            }
        }

        let count = self.index.fetch_sub(1, Ordering::AcqRel);
        let last = count - 1;
        if last < 0 || last as u32 <= freed_slot {
            if last < 0 || (last as u32) < freed_slot {
                // Freed outside the window (stale id); restore the cursor.
                self.index.fetch_add(1, Ordering::AcqRel);
            }
            return freed_slot;
        }
        let last = last as u32;

        // Wait out an in-flight `register` for the frontier slot;
        // registration is lock-free and completes in a few stores.
        let moved = loop {
            let shared = self.items[last as usize].load(Ordering::Acquire, guard);
            if !shared.is_null() {
                break shared;
            }
            hint::spin_loop();
        };

        // Swap-with-last: move the columns, publish the item, then clear the
        // frontier. A scan that still sees the item at the frontier skips it
        // because its id no longer matches that slot.
        for column in self.data.iter() {
            let cell = column[last as usize].swap(Shared::null(), Ordering::AcqRel, guard);
            if !cell.is_null() {
                column[freed_slot as usize].store(cell, Ordering::Release);
            }
        }
        self.items[freed_slot as usize].store(moved, Ordering::Release);
        // SAFETY: `moved` was loaded under the guard.
        let moved_cell = unsafe { moved.deref() };
        let new_id = self.schema.compose(self.id, freed_slot);
        if is_state {
            moved_cell.item.set_state_id(new_id);
        } else {
            moved_cell.item.set_id(new_id);
        }
        self.items[last as usize].store(Shared::null(), Ordering::Release);
        last
    }
}

impl<T: Item> Drop for LinkedChunk<T> {
    fn drop(&mut self) {
        // The chunk is only dropped once no reader can hold it (the table
        // and all iterators release their Arcs), so cells can be reclaimed
        // eagerly.
        let guard = unsafe { crossbeam::epoch::unprotected() };
        for slot in self.items.iter() {
            let shared = slot.load(Ordering::Relaxed, guard);
            if !shared.is_null() {
                drop(unsafe { shared.into_owned() });
            }
        }
        for column in self.data.iter() {
            for slot in column.iter() {
                let shared = slot.load(Ordering::Relaxed, guard);
                if !shared.is_null() {
                    drop(unsafe { shared.into_owned() });
                }
            }
        }
    }
}
