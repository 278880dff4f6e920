//! The canonical composition table and the query index.
//!
//! `compositions` maps a type-set key to its unique [`DataComposition`].
//! `nodes` is the query index: a node caches every composition whose
//! type-set is a superset of the node's set, so a query resolves its result
//! set with one lookup.
//!
//! Nodes are built demand-driven on first query, then kept current by
//! composition creation. Both sides publish their own record before
//! scanning the other table: a composition is inserted into `compositions`
//! before its creator scans `nodes`, and a node is inserted into `nodes`
//! empty before any query scans `compositions` to populate it. If both
//! scans missed each other, each scan would have to precede the other
//! side's insert while following its own — a cycle — so at least one side
//! always links the pair, and the double link is idempotent. A node
//! carries a `populated` flag flipped after a full scan completes; until
//! then every query on it re-runs the scan, so a half-built node is never
//! trusted.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use dashmap::DashMap;
use fixedbitset::FixedBitSet;
use log::debug;

use crate::{
    composition::DataComposition,
    entity::{IntEntity, Shape},
    error::EcsError,
    index::{ClassIndex, IndexKey},
    pool::{ChunkedPool, DataCell, IdSchema, Item},
};

/// Query-index node: the compositions matching one required type-set.
struct Node {
    bits: FixedBitSet,
    matching: DashMap<IndexKey, Arc<DataComposition>>,

    /// Set once a full compositions scan has completed for this node.
    populated: AtomicBool,
}

impl Node {
    fn new(capacity: usize, class_ids: &[u32]) -> Self {
        let mut bits = FixedBitSet::with_capacity(capacity);
        for &class_id in class_ids {
            bits.insert(class_id as usize);
        }
        Self {
            bits,
            matching: DashMap::new(),
            populated: AtomicBool::new(false),
        }
    }
}

/// Maps type-sets to compositions and answers superset queries.
pub struct CompositionRepository {
    class_index: Arc<ClassIndex>,
    pool: Arc<ChunkedPool<IntEntity>>,
    compositions: DashMap<IndexKey, Arc<DataComposition>>,
    nodes: DashMap<IndexKey, Arc<Node>>,
    weak_self: Weak<CompositionRepository>,
}

impl CompositionRepository {
    pub fn new(class_index: Arc<ClassIndex>, pool: Arc<ChunkedPool<IntEntity>>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            class_index,
            pool,
            compositions: DashMap::new(),
            nodes: DashMap::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// The world's class index.
    #[inline]
    pub fn class_index(&self) -> &Arc<ClassIndex> {
        &self.class_index
    }

    /// The world's pool.
    #[inline]
    pub fn pool(&self) -> &Arc<ChunkedPool<IntEntity>> {
        &self.pool
    }

    /// Number of distinct compositions.
    pub fn composition_count(&self) -> usize {
        self.compositions.len()
    }

    /// Canonicalise a type-set and return its unique composition, creating
    /// it (and linking it into the query index) at most once.
    pub fn get_or_create(
        &self,
        mut class_ids: Vec<u32>,
    ) -> Result<Arc<DataComposition>, EcsError> {
        class_ids.sort_unstable();
        class_ids.dedup();
        let key = IndexKey::from_sorted(class_ids.clone());

        // Fast path: lock-free lookup.
        if let Some(composition) = self.compositions.get(&key) {
            return Ok(Arc::clone(composition.value()));
        }

        let (composition, created) = match self.compositions.entry(key) {
            dashmap::Entry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
            dashmap::Entry::Vacant(vacant) => {
                let composition = DataComposition::new(
                    self.weak_self.clone(),
                    &self.pool,
                    Arc::clone(&self.class_index),
                    class_ids,
                )?;
                vacant.insert(Arc::clone(&composition));
                (composition, true)
            }
        };
        // The entry guard is released, so the composition is already
        // visible to any node population scan; link it into every node
        // whose set it covers (a population scan doing the same is
        // idempotent).
        if created {
            for node in self.nodes.iter() {
                if node.bits.is_subset(composition.bits()) {
                    node.matching
                        .insert(composition.key().clone(), Arc::clone(&composition));
                }
            }
        }
        Ok(composition)
    }

    /// The compositions whose type-set is a superset of `class_ids`
    /// (sorted, deduplicated).
    pub fn find(&self, class_ids: Vec<u32>) -> Vec<Arc<DataComposition>> {
        debug_assert!(class_ids.windows(2).all(|w| w[0] < w[1]));
        let key = IndexKey::from_sorted(class_ids.clone());
        let node = match self.nodes.get(&key) {
            Some(node) => Arc::clone(node.value()),
            None => {
                let capacity = self.class_index.capacity() as usize;
                match self.nodes.entry(key) {
                    dashmap::Entry::Occupied(occupied) => Arc::clone(occupied.get()),
                    dashmap::Entry::Vacant(vacant) => {
                        // Publish the node empty, before any scan: a
                        // composition creator that misses the scan below
                        // necessarily sees the node and links itself.
                        let node = Arc::new(Node::new(capacity, &class_ids));
                        vacant.insert(Arc::clone(&node));
                        node
                    }
                }
            }
        };
        // Populate by scanning the composition table. The node was
        // published before this scan and compositions publish themselves
        // before scanning nodes, so whichever scan runs second sees the
        // other record: no (composition, node) pair is missed by both
        // sides. Until one full scan completes, every query re-runs it
        // rather than trusting a node another thread is still filling.
        if !node.populated.load(Ordering::Acquire) {
            for composition in self.compositions.iter() {
                if node.bits.is_subset(composition.bits()) {
                    node.matching
                        .insert(composition.key().clone(), Arc::clone(composition.value()));
                }
            }
            node.populated.store(true, Ordering::Release);
        }
        node.matching
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Re-derive an entity's composition after a component add/remove and
    /// migrate its record. Runs under the entity's shape lock, held by the
    /// caller.
    pub(crate) fn modify_components(
        &self,
        entity: &Arc<IntEntity>,
        shape: &mut Shape,
        added: Option<(u32, DataCell)>,
        removed_class: Option<u32>,
    ) -> Result<bool, EcsError> {
        let Some(source) = shape.composition.clone() else {
            return Ok(false);
        };

        let mut class_ids = source.class_ids();
        if let Some(removed) = removed_class {
            class_ids.retain(|&id| id != removed);
        }
        let added_class = added.as_ref().map(|(class_id, _)| *class_id);
        if let Some(added_class) = added_class {
            class_ids.push(added_class);
        }

        let target = self.get_or_create(class_ids)?;
        if Arc::ptr_eq(&target, &source) {
            return Ok(true);
        }
        debug!("moving entity from {source} to {target}");

        // Column remaps: source column feeding each target column, and the
        // column the added component fills.
        let target_ids = target.class_ids();
        let index_mapping: Vec<i32> = target_ids
            .iter()
            .map(|&class_id| {
                if Some(class_id) == added_class {
                    -1
                } else {
                    source.fetch_component_index(class_id)
                }
            })
            .collect();
        let (added_mapping, added_cells) = match added {
            Some((class_id, cell)) => (vec![target.fetch_component_index(class_id)], vec![cell]),
            None => (Vec::new(), Vec::new()),
        };

        target.attach_entity(&source, entity, &index_mapping, &added_mapping, added_cells)?;
        shape.composition = Some(Arc::clone(&target));

        // An enum state follows the entity into the target's state tenant;
        // the root id never changes because of state.
        if let Some(key) = shape.state.clone() {
            if let Some(old_tenant) = source.state_tenant(&key) {
                old_tenant.free_item(entity, false);
            }
            match target.fetch_state_tenant(&key) {
                Ok(new_tenant) => {
                    let state_id = new_tenant.next_id()?;
                    entity.set_state_id(state_id);
                    new_tenant.register(Arc::clone(entity), Vec::new());
                }
                Err(error) => {
                    shape.state = None;
                    entity.set_state_id(IdSchema::NIL);
                    return Err(error);
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::IdSchema;
    use std::thread;

    struct CompA;
    struct CompB;
    struct CompC;

    fn repository() -> Arc<CompositionRepository> {
        CompositionRepository::new(
            Arc::new(ClassIndex::new()),
            ChunkedPool::new(IdSchema::new(8)),
        )
    }

    #[test]
    fn get_or_create_is_canonical() {
        // Given
        let repo = repository();
        let a = repo.class_index().register::<CompA>().unwrap();
        let b = repo.class_index().register::<CompB>().unwrap();

        // When - the same set in any order, duplicates included
        let first = repo.get_or_create(vec![b, a]).unwrap();
        let second = repo.get_or_create(vec![a, b, a]).unwrap();

        // Then
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(repo.composition_count(), 1);
    }

    #[test]
    fn find_matches_supersets() {
        // Given
        let repo = repository();
        let a = repo.class_index().register::<CompA>().unwrap();
        let b = repo.class_index().register::<CompB>().unwrap();
        let c = repo.class_index().register::<CompC>().unwrap();
        let ab = repo.get_or_create(vec![a, b]).unwrap();
        let abc = repo.get_or_create(vec![a, b, c]).unwrap();
        let bc = repo.get_or_create(vec![b, c]).unwrap();

        // When
        let matching = repo.find(vec![a, b]);

        // Then - {A,B} and {A,B,C} match, {B,C} does not
        assert_eq!(matching.len(), 2);
        assert!(matching.iter().any(|m| Arc::ptr_eq(m, &ab)));
        assert!(matching.iter().any(|m| Arc::ptr_eq(m, &abc)));
        assert!(!matching.iter().any(|m| Arc::ptr_eq(m, &bc)));
    }

    #[test]
    fn nodes_pick_up_compositions_created_later() {
        // Given - a node built before any matching composition exists
        let repo = repository();
        let a = repo.class_index().register::<CompA>().unwrap();
        let b = repo.class_index().register::<CompB>().unwrap();
        assert!(repo.find(vec![a]).is_empty());

        // When
        let ab = repo.get_or_create(vec![a, b]).unwrap();

        // Then
        let matching = repo.find(vec![a]);
        assert_eq!(matching.len(), 1);
        assert!(Arc::ptr_eq(&matching[0], &ab));
    }

    #[test]
    fn empty_set_is_a_valid_composition() {
        let repo = repository();
        let empty = repo.get_or_create(Vec::new()).unwrap();
        assert_eq!(empty.arity(), 0);
        assert!(Arc::ptr_eq(&empty, &repo.get_or_create(Vec::new()).unwrap()));
    }

    #[test]
    fn queries_racing_composition_creation_never_drop_matches() {
        // Composition creation and demand-driven node building race on
        // independent map shards; whichever scan runs second must link the
        // pair. Several rounds widen the window where the node for {base}
        // is being built while brand-new supersets of it appear.
        let creators = 4u32;
        let sets_per_creator = 8u32;
        for _ in 0..16 {
            let repo = repository();
            let base = 0u32;

            let handles: Vec<_> = (0..creators)
                .map(|t| {
                    let repo = Arc::clone(&repo);
                    thread::spawn(move || {
                        for i in 0..sets_per_creator {
                            // A brand-new type-set per iteration, all
                            // supersets of {base}.
                            let unique = 1 + t * sets_per_creator + i;
                            repo.get_or_create(vec![base, unique]).unwrap();
                        }
                    })
                })
                .collect();
            let finder = {
                let repo = Arc::clone(&repo);
                thread::spawn(move || {
                    for _ in 0..64 {
                        let _ = repo.find(vec![base]);
                    }
                })
            };
            for handle in handles {
                handle.join().unwrap();
            }
            finder.join().unwrap();

            // Quiesced: the {base} node must know every created
            // composition, with no silently dropped link.
            let total = (creators * sets_per_creator) as usize;
            assert_eq!(repo.composition_count(), total);
            assert_eq!(repo.find(vec![base]).len(), total);
        }
    }
}
