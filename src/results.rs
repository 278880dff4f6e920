//! Query results: lazy, single-pass iteration over matching compositions.
//!
//! A query over k component types yields `WithK` records carrying k typed
//! component references plus the entity handle. Iteration concatenates
//! per-composition chunk scans: a tight loop over slot indices reading
//! column pointers by indices precomputed once per composition.
//!
//! Scans are weakly consistent. Each slot read validates the observed item
//! id against the slot it came from — an item moved by compaction mid-scan
//! no longer matches and is skipped — and disabled entities are filtered
//! right here at the chunk-scan level.

use std::{fmt, hint, marker::PhantomData, ops::Deref, sync::Arc};

use crossbeam::epoch::{self, Guard};

use crate::{
    composition::DataComposition,
    entity::{Entity, IntEntity},
    index::{ClassIndex, Component},
    pool::{ChunkedPool, DataCell, ErasedValue, IdSchema, Item, LinkedChunk},
};

/// A shared, typed view of one stored component value.
///
/// The view keeps the value alive independently of the entity's storage:
/// it stays valid after compaction moves, migrations, or destruction of the
/// entity it was read from.
pub struct ComponentRef<T: Component> {
    ptr: *const T,
    _own: ErasedValue,
}

impl<T: Component> ComponentRef<T> {
    pub(crate) fn new(value: ErasedValue) -> Option<Self> {
        let ptr = value.downcast_ref::<T>()? as *const T;
        Some(Self { ptr, _own: value })
    }
}

impl<T: Component> Deref for ComponentRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: `ptr` was derived from `_own`, which keeps the allocation
        // alive for as long as this view exists.
        unsafe { &*self.ptr }
    }
}

// SAFETY: the pointee is owned by the shared cell in `_own`, and `T` is
// `Send + Sync` by the `Component` bound.
unsafe impl<T: Component> Send for ComponentRef<T> {}
unsafe impl<T: Component> Sync for ComponentRef<T> {}

impl<T: Component + fmt::Debug> fmt::Debug for ComponentRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

/// A tuple of component types selectable by a query, arity 1..=6.
pub trait Selection {
    /// The record yielded per entity.
    type Output;

    /// The borrowed projection handed to [`ResultSet::for_each`].
    type Refs<'a>;

    /// Class ids of the selected types, in tuple order; `None` if any type
    /// was never registered (no entity can match).
    fn class_ids(index: &ClassIndex) -> Option<Vec<u32>>;

    /// Column indices of the selected types within a composition, in tuple
    /// order.
    fn columns(composition: &DataComposition) -> Option<Vec<usize>>;

    /// Build the owned record from loaded cells (tuple order).
    fn assemble(cells: &mut [Option<ErasedValue>], entity: Entity) -> Option<Self::Output>;

    /// Build the borrowed projection from cell references (tuple order).
    fn refs<'a>(cells: &[Option<&'a DataCell>], entity: &'a Entity) -> Option<Self::Refs<'a>>;
}

macro_rules! selection_tuple {
    ($with:ident, $(($field:ident, $t:ident, $idx:tt)),+) => {
        /// Typed record yielded by a query of this arity.
        pub struct $with<$($t: Component),+> {
            $(pub $field: ComponentRef<$t>,)+
            pub entity: Entity,
        }

        impl<$($t: Component),+> Selection for ($($t,)+) {
            type Output = $with<$($t),+>;
            type Refs<'a> = ($(&'a $t,)+ &'a Entity);

            fn class_ids(index: &ClassIndex) -> Option<Vec<u32>> {
                Some(vec![$(index.index_of::<$t>()?),+])
            }

            fn columns(composition: &DataComposition) -> Option<Vec<usize>> {
                Some(vec![$(composition.column_of::<$t>()?),+])
            }

            fn assemble(
                cells: &mut [Option<ErasedValue>],
                entity: Entity,
            ) -> Option<Self::Output> {
                Some($with {
                    $($field: ComponentRef::new(cells[$idx].take()?)?,)+
                    entity,
                })
            }

            fn refs<'a>(
                cells: &[Option<&'a DataCell>],
                entity: &'a Entity,
            ) -> Option<Self::Refs<'a>> {
                Some(($(cells[$idx]?.value().downcast_ref::<$t>()?,)+ entity))
            }
        }
    };
}

selection_tuple!(With1, (comp, T1, 0));
selection_tuple!(With2, (comp1, T1, 0), (comp2, T2, 1));
selection_tuple!(With3, (comp1, T1, 0), (comp2, T2, 1), (comp3, T3, 2));
selection_tuple!(With4, (comp1, T1, 0), (comp2, T2, 1), (comp3, T3, 2), (comp4, T4, 3));
selection_tuple!(
    With5,
    (comp1, T1, 0),
    (comp2, T2, 1),
    (comp3, T3, 2),
    (comp4, T4, 3),
    (comp5, T5, 4)
);
selection_tuple!(
    With6,
    (comp1, T1, 0),
    (comp2, T2, 1),
    (comp3, T3, 2),
    (comp4, T4, 3),
    (comp5, T5, 4),
    (comp6, T6, 5)
);

/// Highest selection arity; fixed-size scratch buffers are sized by it.
const MAX_ARITY: usize = 6;

/// The lazily evaluated result of a `find_components` query.
pub struct ResultSet<Q: Selection> {
    pool: Arc<ChunkedPool<IntEntity>>,
    compositions: Vec<Arc<DataComposition>>,
    _query: PhantomData<Q>,
}

impl<Q: Selection> ResultSet<Q> {
    pub(crate) fn new(
        pool: Arc<ChunkedPool<IntEntity>>,
        compositions: Vec<Arc<DataComposition>>,
    ) -> Self {
        Self {
            pool,
            compositions,
            _query: PhantomData,
        }
    }

    /// Iterate the matching entities, yielding owned records.
    pub fn iter(&self) -> ResultIter<Q> {
        ResultIter {
            pool: Arc::clone(&self.pool),
            compositions: self.compositions.clone(),
            composition: 0,
            columns: Vec::new(),
            chunk: None,
            slot: 0,
            guard: epoch::pin(),
            _query: PhantomData,
        }
    }

    /// Drive `visit` with borrowed component references, fused into the
    /// chunk scan: no per-element record or shared-cell clone is made.
    pub fn for_each<F: for<'a> FnMut(Q::Refs<'a>)>(&self, mut visit: F) {
        let schema = self.pool.schema();
        let guard = epoch::pin();
        for composition in &self.compositions {
            let Some(columns) = Q::columns(composition) else {
                continue;
            };
            let mut chunk = self.pool.chunk(composition.tenant().first_chunk());
            while let Some(current) = chunk {
                for slot in 0..current.size() {
                    scan_slot(&current, slot, &columns, schema, &guard, |refs, entity| {
                        if let Some(projection) = Q::refs(refs, entity) {
                            visit(projection);
                        }
                    });
                }
                chunk = current.next().and_then(|id| self.pool.chunk(id));
            }
        }
    }
}

impl<Q: Selection> IntoIterator for &ResultSet<Q> {
    type Item = Q::Output;
    type IntoIter = ResultIter<Q>;

    fn into_iter(self) -> ResultIter<Q> {
        self.iter()
    }
}

impl<Q: Selection> IntoIterator for ResultSet<Q> {
    type Item = Q::Output;
    type IntoIter = ResultIter<Q>;

    fn into_iter(self) -> ResultIter<Q> {
        self.iter()
    }
}

/// Read one slot to a stable (item, cells) view and hand it to `consume`.
/// Vacated, moved and disabled slots are skipped without a callback.
fn scan_slot(
    chunk: &LinkedChunk<IntEntity>,
    slot: u32,
    columns: &[usize],
    schema: IdSchema,
    guard: &Guard,
    consume: impl FnOnce(&[Option<&DataCell>], &Entity),
) {
    let expected = schema.compose(chunk.id(), slot);
    loop {
        let Some(item) = chunk.item_arc(slot, guard) else {
            return;
        };
        if item.id() != expected {
            // Moved by compaction; it is (or will be) visible at its new
            // slot.
            return;
        }
        if !item.is_enabled() {
            return;
        }
        let mut cells: [Option<&DataCell>; MAX_ARITY] = [None; MAX_ARITY];
        let mut complete = true;
        for (i, &column) in columns.iter().enumerate() {
            let shared = chunk.data_shared(column, slot, guard);
            // SAFETY: guard-protected load; the cell outlives this scan
            // step even if compaction vacates it concurrently.
            match unsafe { shared.as_ref() } {
                Some(cell) => cells[i] = Some(cell),
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if item.id() != expected {
            return;
        }
        if !complete {
            // Mid-compaction gap between cell moves; settle and re-read.
            hint::spin_loop();
            continue;
        }
        let entity = Entity::from_arc(item);
        consume(&cells[..columns.len()], &entity);
        return;
    }
}

/// Iterator over a result set, yielding one owned record per entity.
pub struct ResultIter<Q: Selection> {
    pool: Arc<ChunkedPool<IntEntity>>,
    compositions: Vec<Arc<DataComposition>>,
    composition: usize,
    columns: Vec<usize>,
    chunk: Option<Arc<LinkedChunk<IntEntity>>>,
    slot: u32,
    guard: Guard,
    _query: PhantomData<Q>,
}

impl<Q: Selection> ResultIter<Q> {
    /// Move the cursor to the next composition with a live first chunk.
    fn advance_composition(&mut self) -> Option<()> {
        loop {
            let composition = self.compositions.get(self.composition)?;
            self.composition += 1;
            if let Some(columns) = Q::columns(composition) {
                self.chunk = self.pool.chunk(composition.tenant().first_chunk());
                if self.chunk.is_some() {
                    self.columns = columns;
                    self.slot = 0;
                    return Some(());
                }
            }
        }
    }
}

impl<Q: Selection> Iterator for ResultIter<Q> {
    type Item = Q::Output;

    fn next(&mut self) -> Option<Q::Output> {
        let schema = self.pool.schema();
        loop {
            let Some(chunk) = self.chunk.clone() else {
                self.advance_composition()?;
                continue;
            };
            if self.slot >= chunk.size() {
                self.chunk = chunk.next().and_then(|id| self.pool.chunk(id));
                self.slot = 0;
                if self.chunk.is_none() {
                    self.advance_composition()?;
                }
                continue;
            }
            let slot = self.slot;
            self.slot += 1;

            let mut output = None;
            scan_slot(
                &chunk,
                slot,
                &self.columns,
                schema,
                &self.guard,
                |cells, entity| {
                    let mut owned: [Option<ErasedValue>; MAX_ARITY] = Default::default();
                    for (i, cell) in cells.iter().enumerate() {
                        owned[i] = cell.map(|c| Arc::clone(c.value()));
                    }
                    output = Q::assemble(&mut owned, entity.clone());
                },
            );
            if output.is_some() {
                return output;
            }
        }
    }
}
