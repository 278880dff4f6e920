//! archon: a chunked-arena archetype ECS core.
//!
//! Entities are grouped by the exact set of component types they carry
//! (their composition), component instances live in chunked columnar
//! arenas for linear iteration, and entity identity is a stable 32-bit id
//! allocated concurrently and recycled in O(1) by swap-with-last
//! compaction.
//!
//! # Quick start
//!
//! ```rust
//! use archon::init;
//!
//! struct Position { x: f32, y: f32 }
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let world = init();
//! let entity = world
//!     .create_entity((Position { x: 0.0, y: 0.0 }, Velocity { dx: 1.0, dy: 0.0 }))
//!     .unwrap();
//!
//! for found in &world.find_components::<(Position, Velocity)>() {
//!     assert_eq!(found.comp2.dx, 1.0);
//!     assert_eq!(found.entity, entity);
//! }
//! ```
//!
//! # Layers
//!
//! - [`pool`]: the concurrent chunked slab arena behind entity identity.
//! - [`composition`]: the archetype table, migration and the query index.
//! - [`entity`]: the per-entity record and its transactional handle.
//! - [`results`]: typed, lazy iteration over query matches.
//! - [`world`]: the façade tying the layers together, plus named provider
//!   discovery.

pub mod composition;
pub mod config;
pub mod entity;
pub mod error;
pub mod index;
pub mod pool;
pub mod results;
pub mod world;

pub use config::{Size, WorldConfig};
pub use entity::Entity;
pub use error::EcsError;
pub use index::{ClassIndex, Component, IndexKey, State};
pub use results::{
    ComponentRef, ResultSet, Selection, With1, With2, With3, With4, With5, With6,
};
pub use world::{init, init_with, register_provider, ComponentBundle, World};
