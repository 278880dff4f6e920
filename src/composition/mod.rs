//! Archetypes: one `DataComposition` per unique component type-set.
//!
//! A composition owns the canonical, ascending-class-id layout of its
//! component columns, the root pool tenant its entities live in, and the
//! lazily created state tenants for entities tagged with an enum state.
//! The dense `component_index` array turns a class id into a column index
//! in O(1); it is only materialized for multi-component compositions, the
//! single-component case always projects column 0.

use std::{fmt, sync::Arc, sync::Weak};

use dashmap::DashMap;
use fixedbitset::FixedBitSet;
use log::debug;

use crate::{
    entity::{Entity, IntEntity},
    error::EcsError,
    index::{ClassIndex, Component, IndexKey},
    pool::{ChunkedPool, DataCell, Tenant},
};

mod repository;

pub use repository::CompositionRepository;

/// One component column's identity within a composition.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ComponentType {
    pub(crate) class_id: u32,
    pub(crate) name: &'static str,
}

/// A unique component type-set and the storage behind it.
///
/// Two compositions are equal iff their type-sets are equal; the repository
/// guarantees at most one instance per set.
pub struct DataComposition {
    /// Component types in canonical (ascending class id) column order.
    types: Box<[ComponentType]>,

    /// Class-id membership, for superset tests in the query index.
    bits: FixedBitSet,

    /// Canonical identity of the type-set.
    key: IndexKey,

    /// `component_index[class_id] -> column`, −1 when absent. Only
    /// materialized for arity >= 2.
    component_index: Option<Box<[i32]>>,

    /// Root tenant holding this composition's entities.
    tenant: Arc<Tenant<IntEntity>>,

    /// State tenants keyed by `(enum class id, ordinal)`.
    state_tenants: DashMap<IndexKey, Arc<Tenant<IntEntity>>>,

    repository: Weak<CompositionRepository>,
    class_index: Arc<ClassIndex>,
}

impl DataComposition {
    pub(crate) fn new(
        repository: Weak<CompositionRepository>,
        pool: &Arc<ChunkedPool<IntEntity>>,
        class_index: Arc<ClassIndex>,
        class_ids: Vec<u32>,
    ) -> Result<Arc<Self>, EcsError> {
        debug_assert!(class_ids.windows(2).all(|w| w[0] < w[1]));
        let tenant = pool.new_tenant(class_ids.len(), None)?;

        let capacity = class_index.capacity() as usize;
        let mut bits = FixedBitSet::with_capacity(capacity);
        for &class_id in &class_ids {
            bits.insert(class_id as usize);
        }

        let component_index = (class_ids.len() > 1).then(|| {
            let mut index = vec![-1i32; capacity].into_boxed_slice();
            for (column, &class_id) in class_ids.iter().enumerate() {
                index[class_id as usize] = column as i32;
            }
            index
        });

        let types: Box<[ComponentType]> = class_ids
            .iter()
            .map(|&class_id| ComponentType {
                class_id,
                name: class_index.name_of(class_id),
            })
            .collect();
        let key = IndexKey::from_sorted(class_ids);

        let composition = Arc::new(Self {
            types,
            bits,
            key,
            component_index,
            tenant,
            state_tenants: DashMap::new(),
            repository,
            class_index,
        });
        debug!("creating {composition}");
        Ok(composition)
    }

    /// Number of component types (the arity).
    #[inline]
    pub fn arity(&self) -> usize {
        self.types.len()
    }

    /// Whether this composition has two or more component types.
    #[inline]
    pub fn is_multi_component(&self) -> bool {
        self.arity() > 1
    }

    /// The canonical type-set key.
    #[inline]
    pub fn key(&self) -> &IndexKey {
        &self.key
    }

    /// Class-id membership bits.
    #[inline]
    pub(crate) fn bits(&self) -> &FixedBitSet {
        &self.bits
    }

    /// The composition's class ids in column order.
    pub fn class_ids(&self) -> Vec<u32> {
        self.types.iter().map(|t| t.class_id).collect()
    }

    /// The root tenant.
    #[inline]
    pub fn tenant(&self) -> &Arc<Tenant<IntEntity>> {
        &self.tenant
    }

    /// The owning repository, while the world is alive.
    #[inline]
    pub(crate) fn repository(&self) -> Option<Arc<CompositionRepository>> {
        self.repository.upgrade()
    }

    /// The world's class index.
    #[inline]
    pub(crate) fn class_index(&self) -> &Arc<ClassIndex> {
        &self.class_index
    }

    /// The column of a class id, or −1 when the class is not part of this
    /// composition.
    pub fn fetch_component_index(&self, class_id: u32) -> i32 {
        match &self.component_index {
            Some(index) => index
                .get(class_id as usize)
                .copied()
                .unwrap_or(-1),
            None => match self.types.first() {
                Some(only) if only.class_id == class_id => 0,
                _ => -1,
            },
        }
    }

    /// The column of a component type, if present (and registered at all).
    pub fn column_of<C: Component>(&self) -> Option<usize> {
        let class_id = self.class_index.index_of::<C>()?;
        let column = self.fetch_component_index(class_id);
        (column >= 0).then_some(column as usize)
    }

    /// Whether the composition carries a class.
    #[inline]
    pub fn has_class(&self, class_id: u32) -> bool {
        (class_id as usize) < self.bits.len() && self.bits.contains(class_id as usize)
    }

    /// Permute caller-supplied cells in place so positions match column
    /// indices. One O(k) cycle-walk pass over the k cells.
    fn sort_cells_by_index(&self, cells: &mut [(u32, DataCell)]) {
        for i in 0..cells.len() {
            loop {
                let target = self.fetch_component_index(cells[i].0);
                debug_assert!(target >= 0);
                let target = target as usize;
                if target == i {
                    break;
                }
                cells.swap(i, target);
            }
        }
    }

    /// Allocate an id, write the component columns and register a fresh
    /// entity record.
    ///
    /// With `prepared == false` the cells are permuted in place first so
    /// each lands in the column its class selects.
    pub(crate) fn create_entity(
        this: &Arc<Self>,
        prepared: bool,
        mut cells: Vec<(u32, DataCell)>,
    ) -> Result<Entity, EcsError> {
        if !prepared && this.is_multi_component() {
            this.sort_cells_by_index(&mut cells);
        }
        let id = this.tenant.next_id()?;
        let record = IntEntity::new(id, Arc::clone(this));
        let data = cells.into_iter().map(|(_, cell)| Some(cell)).collect();
        this.tenant.register(Arc::clone(&record), data);
        Ok(Entity::from_arc(record))
    }

    /// Migrate an entity's record from its current composition into this
    /// one.
    ///
    /// `index_mapping[column]` names the source column feeding this
    /// composition's `column` (−1 for new columns); `added_mapping[i]` names
    /// the column the i-th added component fills. The source slot is freed
    /// inside the withdrawal, with `destroying == false` so the record stays
    /// valid.
    pub(crate) fn attach_entity(
        &self,
        source: &DataComposition,
        entity: &Arc<IntEntity>,
        index_mapping: &[i32],
        added_mapping: &[i32],
        added: Vec<DataCell>,
    ) -> Result<(), EcsError> {
        debug_assert!(index_mapping.len() == self.arity());
        let new_id = self.tenant.next_id()?;
        let source_cells = source.tenant.withdraw(entity, new_id);

        let mut cells: Vec<Option<DataCell>> = Vec::with_capacity(self.arity());
        for &src in index_mapping {
            let cell = (src >= 0)
                .then(|| source_cells.get(src as usize).cloned().flatten())
                .flatten()
                .map(DataCell::share);
            cells.push(cell);
        }
        for (added_column, cell) in added_mapping.iter().zip(added) {
            if *added_column >= 0 {
                cells[*added_column as usize] = Some(cell);
            }
        }
        self.tenant.register(Arc::clone(entity), cells);
        Ok(())
    }

    /// Get-or-create the state tenant for a state key. The factory runs at
    /// most once per key.
    pub fn fetch_state_tenant(&self, key: &IndexKey) -> Result<Arc<Tenant<IntEntity>>, EcsError> {
        if let Some(tenant) = self.state_tenants.get(key) {
            return Ok(Arc::clone(tenant.value()));
        }
        match self.state_tenants.entry(key.clone()) {
            dashmap::Entry::Occupied(occupied) => Ok(Arc::clone(occupied.get())),
            dashmap::Entry::Vacant(vacant) => {
                let tenant = self.tenant.pool().new_tenant(0, Some(key.clone()))?;
                debug!("adding state tenant {key:?} to {self}");
                vacant.insert(Arc::clone(&tenant));
                Ok(tenant)
            }
        }
    }

    /// The state tenant for a key, if it was ever created.
    pub fn state_tenant(&self, key: &IndexKey) -> Option<Arc<Tenant<IntEntity>>> {
        self.state_tenants.get(key).map(|t| Arc::clone(t.value()))
    }
}

impl fmt::Display for DataComposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Composition=[")?;
        for (i, ty) in self.types.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            // Strip module paths the way a debug log wants to read.
            write!(f, "{}", ty.name.rsplit("::").next().unwrap_or(ty.name))?;
        }
        write!(f, "]")
    }
}
