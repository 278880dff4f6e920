//! Class identity: the mapping from runtime types to dense small integers.
//!
//! Every component type used in a world is assigned a class id in
//! `[0, capacity)` exactly once. The class id is the single point that turns
//! a runtime type into a column position, a bitset bit and a key fragment;
//! nothing downstream ever inspects a `TypeId` again.
//!
//! Lookups are lock-free reads through a sharded concurrent map; registration
//! uses the map's entry API so the id allocation runs at most once per type,
//! no matter how many threads race on the first touch.

use std::{
    any::{type_name, TypeId},
    sync::{
        atomic::{AtomicU32, Ordering},
        RwLock,
    },
};

use dashmap::DashMap;

use crate::error::EcsError;

mod key;

pub use key::IndexKey;

/// A component: any plain data value attached to an entity.
///
/// There is no registration ceremony; any `Send + Sync + 'static` value
/// qualifies and is identified by its runtime type.
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

/// An enum-like state value taggable onto an entity.
///
/// `ordinal` must be stable for a given variant within a program run; for
/// `#[repr(u32)]` field-less enums, `*self as u32` is the natural impl.
pub trait State: Send + Sync + 'static {
    /// The variant's ordinal.
    fn ordinal(&self) -> u32;
}

/// Bidirectional mapping from type identity to a dense integer in
/// `[0, capacity)`.
pub struct ClassIndex {
    /// TypeId -> class id. Lock-free reads via sharded concurrent map.
    map: DashMap<TypeId, u32>,

    /// Class id -> type name, for diagnostics. Rarely written.
    names: RwLock<Vec<&'static str>>,

    /// Next class id to hand out.
    next: AtomicU32,

    /// Hard cap on distinct classes.
    capacity: u32,
}

impl ClassIndex {
    /// Default capacity: 1024 distinct component types.
    pub const CAPACITY: u32 = 1 << 10;

    /// Create a class index with the default capacity.
    #[inline]
    pub fn new() -> Self {
        Self::with_capacity(Self::CAPACITY)
    }

    /// Create a class index with an explicit capacity.
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            map: DashMap::new(),
            names: RwLock::new(Vec::new()),
            next: AtomicU32::new(0),
            capacity,
        }
    }

    /// The capacity of this index.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of classes registered so far.
    #[inline]
    pub fn len(&self) -> u32 {
        self.next.load(Ordering::Acquire).min(self.capacity)
    }

    /// Whether no class has been registered yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the class id of `T`, registering it if this is the first touch.
    ///
    /// Thread-safe and at-most-once: concurrent callers for the same type
    /// all observe the same id. Fails with
    /// [`EcsError::ClassIndexCapacity`] once `capacity` distinct types exist.
    pub fn register<T: Component>(&self) -> Result<u32, EcsError> {
        let type_id = TypeId::of::<T>();

        // Fast path: lock-free read.
        if let Some(id) = self.map.get(&type_id) {
            return Ok(*id);
        }

        // Slow path: the entry API serializes racing first touches.
        match self.map.entry(type_id) {
            dashmap::Entry::Occupied(occupied) => Ok(*occupied.get()),
            dashmap::Entry::Vacant(vacant) => {
                let id = self
                    .next
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < self.capacity).then_some(n + 1)
                    })
                    .map_err(|_| EcsError::ClassIndexCapacity(self.capacity))?;

                let mut names = self.names.write().unwrap();
                if names.len() <= id as usize {
                    names.resize(id as usize + 1, "");
                }
                names[id as usize] = type_name::<T>();
                drop(names);

                vacant.insert(id);
                Ok(id)
            }
        }
    }

    /// The class id of `T`, if it has ever been registered.
    #[inline]
    pub fn index_of<T: Component>(&self) -> Option<u32> {
        self.map.get(&TypeId::of::<T>()).map(|id| *id)
    }

    /// The type name registered under a class id.
    pub fn name_of(&self, class_id: u32) -> &'static str {
        self.names
            .read()
            .unwrap()
            .get(class_id as usize)
            .copied()
            .unwrap_or("")
    }

    /// Canonical key of a set of class ids.
    #[inline]
    pub fn index_key_of(&self, class_ids: Vec<u32>) -> IndexKey {
        IndexKey::of(class_ids)
    }

    /// Key of an enum state value: the ordered pair
    /// `(enum class id, ordinal)`, stable within a program run.
    pub fn state_key<S: State>(&self, state: &S) -> Result<IndexKey, EcsError> {
        let class_id = self.register::<S>()?;
        Ok(IndexKey::pair(class_id, state.ordinal()))
    }
}

impl Default for ClassIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    struct Comp1;
    struct Comp2;

    #[test]
    fn registration_is_stable() {
        // Given
        let index = ClassIndex::new();

        // When
        let id1 = index.register::<Comp1>().unwrap();
        let id2 = index.register::<Comp2>().unwrap();

        // Then
        assert_ne!(id1, id2);
        assert_eq!(index.register::<Comp1>().unwrap(), id1);
        assert_eq!(index.index_of::<Comp2>(), Some(id2));
        assert!(index.name_of(id1).contains("Comp1"));
    }

    #[test]
    fn unregistered_type_has_no_index() {
        struct Never;
        let index = ClassIndex::new();
        assert_eq!(index.index_of::<Never>(), None);
    }

    #[test]
    fn capacity_is_enforced() {
        // Given
        let index = ClassIndex::with_capacity(2);
        index.register::<Comp1>().unwrap();
        index.register::<Comp2>().unwrap();

        // When
        struct Comp3;
        let overflow = index.register::<Comp3>();

        // Then
        assert_eq!(overflow, Err(EcsError::ClassIndexCapacity(2)));
        // Existing registrations still resolve.
        assert!(index.index_of::<Comp1>().is_some());
    }

    #[test]
    fn concurrent_registration_agrees_on_ids() {
        // Given
        let index = Arc::new(ClassIndex::new());

        // When
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    if i % 2 == 0 {
                        index.register::<Comp1>().unwrap()
                    } else {
                        index.register::<Comp2>().unwrap()
                    }
                })
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Then
        let comp1_ids: Vec<_> = ids.iter().step_by(2).collect();
        let comp2_ids: Vec<_> = ids.iter().skip(1).step_by(2).collect();
        assert!(comp1_ids.iter().all(|&&id| id == *comp1_ids[0]));
        assert!(comp2_ids.iter().all(|&&id| id == *comp2_ids[0]));
        assert_ne!(comp1_ids[0], comp2_ids[0]);
    }

    #[test]
    fn state_keys_namespace_by_enum_type() {
        // Given
        #[repr(u32)]
        #[derive(Clone, Copy)]
        enum Phase {
            Solid,
            Liquid,
        }
        impl State for Phase {
            fn ordinal(&self) -> u32 {
                *self as u32
            }
        }

        let index = ClassIndex::new();

        // When
        let solid = index.state_key(&Phase::Solid).unwrap();
        let liquid = index.state_key(&Phase::Liquid).unwrap();

        // Then
        assert_ne!(solid, liquid);
        assert_eq!(solid, index.state_key(&Phase::Solid).unwrap());
    }
}
