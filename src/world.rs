//! The world façade: entity creation, destruction, queries and teardown.
//!
//! A world wires the three core layers together: one class index, one
//! chunked pool and one composition repository. Implementations are also
//! discoverable by name through a process-wide provider registry, so hosts
//! can select an engine with a string identifier.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use log::{debug, info};

use crate::{
    composition::{CompositionRepository, DataComposition},
    config::WorldConfig,
    entity::Entity,
    error::EcsError,
    index::{ClassIndex, Component},
    pool::{ChunkedPool, DataCell, IdSchema},
    results::{ResultSet, Selection},
};

/// A set of component values creatable in one transaction.
///
/// Implemented for tuples of up to eight component types; the unit tuple
/// creates an entity with no components.
pub trait ComponentBundle {
    /// Erase the values into `(class id, cell)` pairs, registering the
    /// types on first use.
    fn erase(self, index: &ClassIndex) -> Result<Vec<(u32, DataCell)>, EcsError>;
}

/// The unit tuple: an entity with no components.
impl ComponentBundle for () {
    fn erase(self, _index: &ClassIndex) -> Result<Vec<(u32, DataCell)>, EcsError> {
        Ok(Vec::new())
    }
}

macro_rules! bundle_tuple {
    ($($t:ident : $idx:tt),+) => {
        impl<$($t: Component),+> ComponentBundle for ($($t,)+) {
            fn erase(self, index: &ClassIndex) -> Result<Vec<(u32, DataCell)>, EcsError> {
                Ok(vec![$((index.register::<$t>()?, DataCell::of(self.$idx)),)+])
            }
        }
    };
}

bundle_tuple!(A: 0);
bundle_tuple!(A: 0, B: 1);
bundle_tuple!(A: 0, B: 1, C: 2);
bundle_tuple!(A: 0, B: 1, C: 2, D: 3);
bundle_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);
bundle_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
bundle_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
bundle_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

/// An entity registry over one pool.
pub struct World {
    config: WorldConfig,
    class_index: Arc<ClassIndex>,
    pool: Arc<ChunkedPool<crate::entity::IntEntity>>,
    repository: Arc<CompositionRepository>,
}

impl World {
    /// Create a world from a configuration.
    pub fn new(config: WorldConfig) -> Self {
        let schema = IdSchema::from(&config);
        let class_index = Arc::new(ClassIndex::new());
        let pool = ChunkedPool::new(schema);
        let repository = CompositionRepository::new(Arc::clone(&class_index), Arc::clone(&pool));
        info!(
            "creating world '{}' (chunk capacity {}, up to {} chunks)",
            config.name,
            schema.chunk_capacity(),
            schema.chunk_count()
        );
        Self {
            config,
            class_index,
            pool,
            repository,
        }
    }

    /// The world's configuration.
    #[inline]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// The world's class index.
    #[inline]
    pub fn class_index(&self) -> &Arc<ClassIndex> {
        &self.class_index
    }

    /// The composition repository.
    #[inline]
    pub fn repository(&self) -> &Arc<CompositionRepository> {
        &self.repository
    }

    /// Total number of live pool slots (entities plus state registrations).
    pub fn size(&self) -> u32 {
        self.pool.size()
    }

    /// Create an entity carrying the given components, all of distinct
    /// types.
    pub fn create_entity<B: ComponentBundle>(&self, components: B) -> Result<Entity, EcsError> {
        let cells = components.erase(&self.class_index)?;
        self.reject_duplicates(&cells)?;
        let class_ids = cells.iter().map(|(class_id, _)| *class_id).collect();
        let composition = self.repository.get_or_create(class_ids)?;
        DataComposition::create_entity(&composition, false, cells)
    }

    /// Create an entity carrying the union of a prefab's components and the
    /// extra ones. The prefab's component values are shared, not copied.
    pub fn create_entity_as<B: ComponentBundle>(
        &self,
        prefab: &Entity,
        components: B,
    ) -> Result<Entity, EcsError> {
        let mut cells = prefab.snapshot_cells();
        cells.extend(components.erase(&self.class_index)?);
        self.reject_duplicates(&cells)?;
        let class_ids = cells.iter().map(|(class_id, _)| *class_id).collect();
        let composition = self.repository.get_or_create(class_ids)?;
        DataComposition::create_entity(&composition, false, cells)
    }

    /// Destroy an entity, releasing its ids. Returns whether it was alive.
    pub fn destroy_entity(&self, entity: &Entity) -> bool {
        let destroyed = entity.destroy();
        if destroyed {
            debug!("destroyed {entity:?}");
        }
        destroyed
    }

    /// Find every entity whose composition carries all the queried
    /// component types (1 to 6 of them).
    pub fn find_components<Q: Selection>(&self) -> ResultSet<Q> {
        let Some(mut class_ids) = Q::class_ids(&self.class_index) else {
            // A type nobody ever attached matches nothing.
            return ResultSet::new(Arc::clone(&self.pool), Vec::new());
        };
        class_ids.sort_unstable();
        class_ids.dedup();
        let compositions = self.repository.find(class_ids);
        ResultSet::new(Arc::clone(&self.pool), compositions)
    }

    /// Release the pool. Outstanding entity handles stay safe to touch but
    /// resolve to nothing. Also runs on drop.
    pub fn close(&self) {
        info!("closing world '{}'", self.config.name);
        self.pool.close();
    }

    fn reject_duplicates(&self, cells: &[(u32, DataCell)]) -> Result<(), EcsError> {
        let mut class_ids: Vec<u32> = cells.iter().map(|(class_id, _)| *class_id).collect();
        class_ids.sort_unstable();
        for pair in class_ids.windows(2) {
            if pair[0] == pair[1] {
                return Err(EcsError::DuplicateComponent(
                    self.class_index.name_of(pair[0]),
                ));
            }
        }
        Ok(())
    }
}

impl Drop for World {
    fn drop(&mut self) {
        self.close();
    }
}

/// A named world factory.
pub type Provider = fn(WorldConfig) -> World;

/// The built-in provider name.
pub const DEFAULT_PROVIDER: &str = "archon";

fn providers() -> &'static DashMap<&'static str, Provider> {
    static PROVIDERS: OnceLock<DashMap<&'static str, Provider>> = OnceLock::new();
    PROVIDERS.get_or_init(|| {
        let registry = DashMap::new();
        registry.insert(DEFAULT_PROVIDER, World::new as Provider);
        registry
    })
}

/// Register a world implementation under a name, replacing any previous
/// registration of that name.
pub fn register_provider(name: &'static str, provider: Provider) {
    providers().insert(name, provider);
}

/// Create a world from the default provider and configuration.
pub fn init() -> World {
    init_with(DEFAULT_PROVIDER, WorldConfig::default())
        .expect("default provider is always registered")
}

/// Create a world from the provider registered under `name`.
pub fn init_with(name: &str, config: WorldConfig) -> Result<World, EcsError> {
    let provider = *providers()
        .get(name)
        .ok_or_else(|| EcsError::ProviderNotFound(name.to_string()))?;
    Ok(provider(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_resolves_the_default_provider() {
        let world = init();
        assert_eq!(world.config().chunk_bit, 14);
    }

    #[test]
    fn unknown_provider_is_not_found() {
        let error = init_with("no-such-engine", WorldConfig::default()).err();
        assert_eq!(
            error,
            Some(EcsError::ProviderNotFound("no-such-engine".to_string()))
        );
    }

    #[test]
    fn registered_providers_resolve() {
        register_provider("small-worlds", |mut config| {
            config.chunk_bit = crate::config::Size::Small.chunk_bit();
            World::new(config)
        });
        let world = init_with("small-worlds", WorldConfig::default()).unwrap();
        assert_eq!(world.config().chunk_bit, 10);
    }
}
