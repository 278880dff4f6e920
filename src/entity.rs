//! The per-entity record and its public handle.
//!
//! An [`IntEntity`] is the record threaded into one chunk of one
//! composition. Its id and state id are atomics because compaction rewrites
//! them without taking any entity-level lock; everything structural (the
//! composition pointer and the state key) lives behind the shape lock,
//! which doubles as the per-entity transaction lock for `add`, `remove`,
//! `set_state` and destruction.

use std::{
    fmt, hint,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, RwLock,
    },
};

use crossbeam::epoch;

use crate::{
    composition::DataComposition,
    error::EcsError,
    index::{Component, IndexKey, State},
    pool::{DataCell, IdSchema, Item},
    results::ComponentRef,
};

/// Structural state of an entity, guarded by the shape lock.
pub(crate) struct Shape {
    /// The owning composition; `None` once the entity is destroyed.
    pub(crate) composition: Option<Arc<DataComposition>>,

    /// The current state key, if any.
    pub(crate) state: Option<IndexKey>,
}

/// The pool record behind an [`Entity`] handle.
pub struct IntEntity {
    id: AtomicU32,
    state_id: AtomicU32,
    enabled: AtomicBool,
    shape: RwLock<Shape>,
}

impl IntEntity {
    pub(crate) fn new(id: u32, composition: Arc<DataComposition>) -> Arc<Self> {
        Arc::new(Self {
            id: AtomicU32::new(id),
            state_id: AtomicU32::new(IdSchema::NIL),
            enabled: AtomicBool::new(true),
            shape: RwLock::new(Shape {
                composition: Some(composition),
                state: None,
            }),
        })
    }

    /// Whether the entity participates in query iteration.
    #[inline]
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl Item for IntEntity {
    #[inline]
    fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    #[inline]
    fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Release);
    }

    #[inline]
    fn state_id(&self) -> u32 {
        self.state_id.load(Ordering::Acquire)
    }

    #[inline]
    fn set_state_id(&self, id: u32) {
        self.state_id.store(id, Ordering::Release);
    }
}

/// Handle to an entity in a world.
///
/// Handles are cheap to clone and compare by record identity. Mutations on
/// a destroyed entity are no-ops returning the deleted sentinel (`false`).
#[derive(Clone)]
pub struct Entity {
    inner: Arc<IntEntity>,
}

impl Entity {
    pub(crate) fn from_arc(inner: Arc<IntEntity>) -> Self {
        Self { inner }
    }

    /// The entity's current pool id. Compaction may rewrite it at any
    /// time; treat it as a diagnostic, not a stable key.
    #[inline]
    pub fn id(&self) -> u32 {
        self.inner.id()
    }

    /// Whether the entity has been destroyed.
    pub fn is_deleted(&self) -> bool {
        self.inner.shape.read().unwrap().composition.is_none()
    }

    /// Whether the entity participates in query iteration.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    /// Enable or disable the entity. Disabled entities stay addressable
    /// through the handle but are filtered out of query scans.
    pub fn set_enabled(&self, enabled: bool) -> &Self {
        self.inner.enabled.store(enabled, Ordering::Release);
        self
    }

    /// Whether the entity's composition carries the component type.
    pub fn has<C: Component>(&self) -> bool {
        let shape = self.inner.shape.read().unwrap();
        shape
            .composition
            .as_ref()
            .is_some_and(|composition| composition.column_of::<C>().is_some())
    }

    /// Read the entity's component of type `C`.
    ///
    /// The returned reference shares the stored value; it stays valid after
    /// the entity moves, mutates or dies.
    pub fn get<C: Component>(&self) -> Option<ComponentRef<C>> {
        let shape = self.inner.shape.read().unwrap();
        let composition = shape.composition.as_ref()?;
        let column = composition.column_of::<C>()?;
        let pool = composition.tenant().pool();
        let schema = pool.schema();
        let guard = epoch::pin();
        loop {
            let id = self.inner.id();
            if IdSchema::is_detached(id) {
                return None;
            }
            let chunk = pool.chunk(schema.chunk_id(id))?;
            let value = chunk.data_value(column, schema.slot(id), &guard);
            // Compaction may have moved the record mid-read; the id is
            // rewritten under the tenant lock, so an unchanged id pins the
            // slot we just read.
            if self.inner.id() == id {
                match value {
                    Some(value) => return ComponentRef::new(value),
                    None => hint::spin_loop(),
                }
            }
        }
    }

    /// Whether the entity holds a component equal to `component`.
    pub fn contains<C: Component + PartialEq>(&self, component: &C) -> bool {
        self.get::<C>().is_some_and(|stored| *stored == *component)
    }

    /// Attach a component, migrating the entity to the composition that
    /// carries the union type-set. Adding a type the entity already has
    /// replaces the stored value in place.
    ///
    /// Returns `Ok(false)` if the entity is deleted.
    pub fn add<C: Component>(&self, component: C) -> Result<bool, EcsError> {
        let mut shape = self.inner.shape.write().unwrap();
        let Some(source) = shape.composition.clone() else {
            return Ok(false);
        };
        let Some(repository) = source.repository() else {
            return Ok(false);
        };
        let class_id = repository.class_index().register::<C>()?;
        let cell = DataCell::of(component);

        let column = source.fetch_component_index(class_id);
        if column >= 0 {
            // Same composition: swap the column cell under the tenant lock
            // so the write cannot race compaction's slot moves.
            let pool = source.tenant().pool().clone();
            let schema = pool.schema();
            source.tenant().guarded(|| {
                let guard = epoch::pin();
                let id = self.inner.id();
                if let Some(chunk) = pool.chunk(schema.chunk_id(id)) {
                    chunk.replace_data(column as usize, schema.slot(id), cell, &guard);
                }
            });
            return Ok(true);
        }

        repository.modify_components(&self.inner, &mut shape, Some((class_id, cell)), None)?;
        Ok(true)
    }

    /// Detach the component of type `C`, migrating the entity to the
    /// composition without it.
    ///
    /// Returns `Ok(false)` if the entity is deleted or never had the type.
    pub fn remove<C: Component>(&self) -> Result<bool, EcsError> {
        let mut shape = self.inner.shape.write().unwrap();
        let Some(source) = shape.composition.clone() else {
            return Ok(false);
        };
        let Some(repository) = source.repository() else {
            return Ok(false);
        };
        let Some(class_id) = repository.class_index().index_of::<C>() else {
            return Ok(false);
        };
        if source.fetch_component_index(class_id) < 0 {
            return Ok(false);
        }
        repository.modify_components(&self.inner, &mut shape, None, Some(class_id))?;
        Ok(true)
    }

    /// Tag the entity with an enum state, or clear it with `None`.
    ///
    /// The entity moves between state tenants of its composition; its root
    /// id is untouched. Returns `Ok(false)` if the entity is deleted.
    pub fn set_state<S: State>(&self, state: Option<S>) -> Result<bool, EcsError> {
        let mut shape = self.inner.shape.write().unwrap();
        let Some(composition) = shape.composition.clone() else {
            return Ok(false);
        };

        if let Some(old_key) = shape.state.take() {
            if let Some(tenant) = composition.state_tenant(&old_key) {
                tenant.free_item(&self.inner, false);
            }
            self.inner.set_state_id(IdSchema::NIL);
        }

        if let Some(state) = state {
            let key = composition.class_index().state_key(&state)?;
            let tenant = composition.fetch_state_tenant(&key)?;
            let state_id = tenant.next_id()?;
            self.inner.set_state_id(state_id);
            tenant.register(Arc::clone(&self.inner), Vec::new());
            shape.state = Some(key);
        }
        Ok(true)
    }

    /// Destroy the entity: release its state and root slots and null its
    /// composition pointer. Returns whether it was alive.
    pub(crate) fn destroy(&self) -> bool {
        let mut shape = self.inner.shape.write().unwrap();
        let Some(composition) = shape.composition.take() else {
            return false;
        };
        if let Some(key) = shape.state.take() {
            if let Some(tenant) = composition.state_tenant(&key) {
                tenant.free_item(&self.inner, false);
            }
            self.inner.set_state_id(IdSchema::NIL);
        }
        composition.tenant().free_item(&self.inner, true);
        true
    }

    /// Snapshot the entity's components as shared cells, column by column.
    /// Empty for a deleted entity.
    pub(crate) fn snapshot_cells(&self) -> Vec<(u32, DataCell)> {
        let shape = self.inner.shape.read().unwrap();
        let Some(composition) = shape.composition.as_ref() else {
            return Vec::new();
        };
        let class_ids = composition.class_ids();
        let pool = composition.tenant().pool();
        let schema = pool.schema();
        let guard = epoch::pin();
        loop {
            let id = self.inner.id();
            let Some(chunk) = pool.chunk(schema.chunk_id(id)) else {
                return Vec::new();
            };
            let mut cells = Vec::with_capacity(class_ids.len());
            let mut complete = true;
            for (column, &class_id) in class_ids.iter().enumerate() {
                match chunk.data_value(column, schema.slot(id), &guard) {
                    Some(value) => cells.push((class_id, DataCell::share(value))),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete && self.inner.id() == id {
                return cells;
            }
            hint::spin_loop();
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.inner.id())
            .field("enabled", &self.inner.is_enabled())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
