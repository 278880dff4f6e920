use std::{error::Error, fmt};

/// Error type for user-visible ECS failures.
///
/// Internal contention (optimistic read invalidation, compaction races) is
/// always retried and never surfaces here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// No implementation is registered under the requested provider name.
    ProviderNotFound(String),

    /// `create_entity` received two components of the same type.
    DuplicateComponent(&'static str),

    /// The pool's chunk-id space is exhausted; no further ids can be issued.
    PoolFull,

    /// More distinct component types were registered than the class index
    /// can hold.
    ClassIndexCapacity(u32),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::ProviderNotFound(name) => {
                write!(f, "no ECS provider registered under '{name}'")
            }
            EcsError::DuplicateComponent(ty) => {
                write!(f, "duplicate component type '{ty}'")
            }
            EcsError::PoolFull => write!(f, "chunked pool is full: chunk-id space exhausted"),
            EcsError::ClassIndexCapacity(cap) => {
                write!(f, "class index capacity of {cap} distinct types exceeded")
            }
        }
    }
}

impl Error for EcsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failure() {
        assert!(
            EcsError::ProviderNotFound("missing".into())
                .to_string()
                .contains("missing")
        );
        assert!(EcsError::PoolFull.to_string().contains("chunk-id"));
        assert!(EcsError::ClassIndexCapacity(1024).to_string().contains("1024"));
    }
}
