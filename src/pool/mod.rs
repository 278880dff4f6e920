//! The chunked arena pool: concurrent slab allocation of dense 32-bit ids.
//!
//! The pool owns a table of fixed-capacity chunks indexed by chunk-id and
//! hands out ids that encode `(chunk-id, slot)`. Allocation happens through
//! per-tenant views; a tenant is exclusive to one (composition, optional
//! state) pair and is the only writer of its chunks' fill cursors.
//!
//! # Allocation protocol
//!
//! `next_id` first reuses freed ids from the tenant's LIFO stack. Otherwise
//! it runs an optimistic reservation: snapshot the tenant's stamp, read the
//! current chunk, atomically bump its cursor, then validate the stamp. On
//! overflow or invalidation the reservation is undone and the allocation
//! retried under the tenant's write lock, where a successor chunk is
//! installed when the current one is full. After all threads quiesce, the
//! ids handed out by one tenant form a contiguous, duplicate-free range.
//!
//! # Compaction
//!
//! `free_id` vacates a slot and moves the chunk's frontier slot into it,
//! rewriting the moved item's id. Freeing in the current chunk regresses the
//! cursor so the frontier is reallocated in place; freeing in an older chunk
//! pushes the vacated frontier id onto the free stack instead, keeping the
//! current chunk the only allocation frontier.

use std::{
    hint,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, RwLock,
    },
};

use crossbeam::epoch::{self, Guard};
use log::trace;

use crate::{error::EcsError, index::IndexKey};

mod chunk;
mod id_schema;
mod lock;
mod stack;

pub use chunk::{DataCell, ErasedValue, LinkedChunk};
pub use id_schema::IdSchema;

use lock::StampedLock;
use stack::IdStack;

/// A record that can live in a pool slot.
///
/// Ids are rewritten by compaction without any entity-level lock, so the
/// implementation must back them with atomics.
pub trait Item: Send + Sync + 'static {
    /// The current pool id.
    fn id(&self) -> u32;

    /// Rewrite the pool id (compaction, migration).
    fn set_id(&self, id: u32);

    /// The current state-tenant id, or [`IdSchema::NIL`].
    fn state_id(&self) -> u32;

    /// Rewrite the state-tenant id.
    fn set_state_id(&self, id: u32);
}

/// Concurrent chunked slab arena. See the module docs.
pub struct ChunkedPool<T: Item> {
    schema: IdSchema,

    /// Chunk table indexed by chunk-id. Slots are written once, on chunk
    /// creation.
    chunks: RwLock<Vec<Arc<LinkedChunk<T>>>>,

    closed: AtomicBool,
}

impl<T: Item> ChunkedPool<T> {
    /// Create an empty pool for the given id schema.
    pub fn new(schema: IdSchema) -> Arc<Self> {
        Arc::new(Self {
            schema,
            chunks: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// The id schema of this pool.
    #[inline]
    pub fn schema(&self) -> IdSchema {
        self.schema
    }

    /// Resolve a chunk by chunk-id. `None` once the pool is closed or for
    /// ids this pool never issued.
    pub(crate) fn chunk(&self, chunk_id: u32) -> Option<Arc<LinkedChunk<T>>> {
        self.chunks.read().unwrap().get(chunk_id as usize).cloned()
    }

    /// Allocate and install the next chunk. Fails when the chunk-id space
    /// is exhausted.
    fn new_chunk(
        &self,
        arity: usize,
        previous: Option<u32>,
    ) -> Result<Arc<LinkedChunk<T>>, EcsError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EcsError::PoolFull);
        }
        let mut chunks = self.chunks.write().unwrap();
        let id = chunks.len() as u32;
        if id >= self.schema.chunk_count() {
            return Err(EcsError::PoolFull);
        }
        let chunk = Arc::new(LinkedChunk::new(id, self.schema, arity, previous));
        chunks.push(Arc::clone(&chunk));
        trace!("allocated chunk {id} (arity {arity})");
        Ok(chunk)
    }

    /// Create a tenant with one empty chunk.
    pub fn new_tenant(
        self: &Arc<Self>,
        arity: usize,
        state: Option<IndexKey>,
    ) -> Result<Arc<Tenant<T>>, EcsError> {
        let first = self.new_chunk(arity, None)?;
        Ok(Arc::new(Tenant {
            pool: Arc::clone(self),
            arity,
            state,
            first_chunk: first.id(),
            current_chunk: AtomicU32::new(first.id()),
            stack: IdStack::new(),
            lock: StampedLock::new(),
            reserving: AtomicU32::new(0),
        }))
    }

    /// O(1) lookup of the item registered under an id.
    pub fn get_entry(&self, id: u32) -> Option<Arc<T>> {
        let chunk = self.chunk(self.schema.chunk_id(id))?;
        let guard = epoch::pin();
        chunk.item_arc(self.schema.slot(id), &guard)
    }

    /// Total number of reserved slots across all chunks.
    pub fn size(&self) -> u32 {
        self.chunks
            .read()
            .unwrap()
            .iter()
            .map(|chunk| chunk.size())
            .sum()
    }

    /// Release the chunk table. Outstanding iterators finish against the
    /// chunks they already hold; every other lookup resolves to nothing.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.chunks.write().unwrap().clear();
    }
}

/// A view over the pool exclusive to one (composition, state) pair.
pub struct Tenant<T: Item> {
    pool: Arc<ChunkedPool<T>>,
    arity: usize,
    state: Option<IndexKey>,
    first_chunk: u32,
    current_chunk: AtomicU32,
    stack: IdStack,
    lock: StampedLock,

    /// In-flight optimistic reservations; writers wait these out after
    /// taking the lock so the cursors they read are stable.
    reserving: AtomicU32,
}

impl<T: Item> Tenant<T> {
    /// The pool this tenant draws from.
    #[inline]
    pub fn pool(&self) -> &Arc<ChunkedPool<T>> {
        &self.pool
    }

    /// The state key of a state tenant, `None` for a root tenant.
    #[inline]
    pub fn state(&self) -> Option<&IndexKey> {
        self.state.as_ref()
    }

    /// The tenant's first chunk-id.
    #[inline]
    pub(crate) fn first_chunk(&self) -> u32 {
        self.first_chunk
    }

    /// Allocate the next id.
    ///
    /// Callers must register an item under the returned id promptly:
    /// compaction briefly waits for in-flight registrations when it moves
    /// the frontier slot.
    pub fn next_id(&self) -> Result<u32, EcsError> {
        if let Some(id) = self.stack.pop() {
            return Ok(id);
        }
        let schema = self.pool.schema;

        // Optimistic fast path. The reservation counter is announced first
        // and the stamp re-validated before the cursor is touched: a writer
        // that bumped the stamp then saw no announced reservations knows no
        // reader can still reach the cursor.
        if let Some(stamp) = self.lock.optimistic_read() {
            let chunk_id = self.current_chunk.load(Ordering::Acquire);
            if let Some(chunk) = self.pool.chunk(chunk_id) {
                self.reserving.fetch_add(1, Ordering::SeqCst);
                let mut committed = None;
                if self.lock.validate(stamp) {
                    let slot = chunk.increment_index();
                    let ok = slot >= 0
                        && (slot as u32) < schema.chunk_capacity()
                        && self.lock.validate(stamp);
                    if ok {
                        committed = Some(schema.compose(chunk_id, slot as u32));
                    } else {
                        chunk.decrement_index();
                    }
                }
                self.reserving.fetch_sub(1, Ordering::SeqCst);
                if let Some(id) = committed {
                    return Ok(id);
                }
            }
        }

        // Contended or full: retry under the write lock.
        let _write = self.lock.write();
        self.quiesce();
        loop {
            let chunk_id = self.current_chunk.load(Ordering::Acquire);
            let chunk = self.pool.chunk(chunk_id).ok_or(EcsError::PoolFull)?;
            let slot = chunk.increment_index();
            if slot >= 0 && (slot as u32) < schema.chunk_capacity() {
                return Ok(schema.compose(chunk_id, slot as u32));
            }
            chunk.decrement_index();
            let fresh = self.pool.new_chunk(self.arity, Some(chunk_id))?;
            chunk.set_next(fresh.id());
            self.current_chunk.store(fresh.id(), Ordering::Release);
        }
    }

    /// Release an id, compacting its chunk by swap-with-last.
    ///
    /// Returns the moved slot's old id (the freed id itself when the freed
    /// slot was the frontier). With `destroying`, the vacated item is marked
    /// detached and its cells reclaimed.
    ///
    /// The id must be current; under concurrent compaction prefer
    /// [`Tenant::free_item`], which reads the item's id inside the critical
    /// section.
    pub fn free_id(&self, id: u32, destroying: bool) -> u32 {
        let guard = epoch::pin();
        let _write = self.lock.write();
        self.quiesce();
        self.release_slot(id, destroying, &guard)
    }

    /// Release the slot an item currently occupies.
    ///
    /// Compaction rewrites item ids under this tenant's lock, so reading the
    /// id inside the critical section makes the release race-free.
    pub fn free_item(&self, item: &Arc<T>, destroying: bool) -> u32 {
        let guard = epoch::pin();
        let _write = self.lock.write();
        self.quiesce();
        let id = if self.state.is_some() {
            item.state_id()
        } else {
            item.id()
        };
        self.release_slot(id, destroying, &guard)
    }

    /// Pull an item out of this tenant for migration: capture its component
    /// cells, vacate its slot and point its id at `new_id`, all in one
    /// critical section. Returns the cells in column order.
    ///
    /// The caller registers the item with its new tenant afterwards; between
    /// the two steps the item is briefly in neither tenant, which weakly
    /// consistent scans tolerate.
    pub(crate) fn withdraw(&self, item: &Arc<T>, new_id: u32) -> Vec<Option<ErasedValue>> {
        let schema = self.pool.schema;
        let guard = epoch::pin();
        let _write = self.lock.write();
        self.quiesce();

        let old_id = item.id();
        let mut cells = Vec::with_capacity(self.arity);
        if let Some(chunk) = self.pool.chunk(schema.chunk_id(old_id)) {
            let slot = schema.slot(old_id);
            for column in 0..self.arity {
                cells.push(chunk.data_value(column, slot, &guard));
            }
        } else {
            cells.resize_with(self.arity, || None);
        }
        self.release_slot(old_id, false, &guard);
        item.set_id(new_id);
        cells
    }

    /// Common body of the release paths. Must run under the write lock with
    /// reservations quiesced.
    fn release_slot(&self, id: u32, destroying: bool, guard: &Guard) -> u32 {
        let schema = self.pool.schema;
        let Some(chunk) = self.pool.chunk(schema.chunk_id(id)) else {
            return id;
        };
        if chunk.is_empty() {
            self.stack.push(id);
            return id;
        }
        let is_state = self.state.is_some();
        let not_current = self.current_chunk.load(Ordering::Acquire) != chunk.id();
        let moved_slot = chunk.remove(schema.slot(id), is_state, destroying, guard);
        let moved_id = schema.compose(chunk.id(), moved_slot);
        if not_current {
            self.stack.push(moved_id);
        }
        moved_id
    }

    /// Install an item (and its component cells, one per column) into the
    /// slot its id encodes. State tenants key off the item's state id.
    pub fn register(&self, item: Arc<T>, data: Vec<Option<DataCell>>) -> Arc<T> {
        let schema = self.pool.schema;
        let id = if self.state.is_some() {
            item.state_id()
        } else {
            item.id()
        };
        let guard = epoch::pin();
        if let Some(chunk) = self.pool.chunk(schema.chunk_id(id)) {
            chunk.set(Arc::clone(&item), data, schema.slot(id), &guard);
        }
        item
    }

    /// Size of the tenant's current chunk.
    pub fn current_chunk_size(&self) -> u32 {
        let chunk_id = self.current_chunk.load(Ordering::Acquire);
        self.pool.chunk(chunk_id).map_or(0, |chunk| chunk.size())
    }

    /// Take the tenant's write lock for a short external critical section
    /// that must not race compaction (in-place column replacement).
    pub(crate) fn guarded<R>(&self, section: impl FnOnce() -> R) -> R {
        let _write = self.lock.write();
        section()
    }

    /// Weakly consistent scan of the tenant's items, first chunk forward.
    pub fn iter(&self) -> TenantIter<T> {
        TenantIter {
            pool: Arc::clone(&self.pool),
            chunk: self.pool.chunk(self.first_chunk),
            slot: 0,
            is_state: self.state.is_some(),
            guard: epoch::pin(),
        }
    }

    /// Wait out announced optimistic reservations. Callers hold the write
    /// lock, so no further reservation can pass validation; the cursors are
    /// stable once this returns.
    fn quiesce(&self) {
        while self.reserving.load(Ordering::SeqCst) != 0 {
            hint::spin_loop();
        }
    }
}

/// Iterator over a tenant's registered items.
///
/// Visits `chunk.size()` slots per chunk; slots whose observed item id does
/// not match the slot (moved by compaction mid-scan) and vacant slots are
/// skipped.
pub struct TenantIter<T: Item> {
    pool: Arc<ChunkedPool<T>>,
    chunk: Option<Arc<LinkedChunk<T>>>,
    slot: u32,
    is_state: bool,
    guard: Guard,
}

impl<T: Item> Iterator for TenantIter<T> {
    type Item = Arc<T>;

    fn next(&mut self) -> Option<Arc<T>> {
        loop {
            let chunk = self.chunk.as_ref()?;
            if self.slot >= chunk.size() {
                self.chunk = chunk.next().and_then(|id| self.pool.chunk(id));
                self.slot = 0;
                continue;
            }
            let slot = self.slot;
            self.slot += 1;
            if let Some(item) = chunk.item_arc(slot, &self.guard) {
                let id = if self.is_state {
                    item.state_id()
                } else {
                    item.id()
                };
                if id == self.pool.schema.compose(chunk.id(), slot) {
                    return Some(item);
                }
            }
        }
    }
}
