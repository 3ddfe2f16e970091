//! Keyed registries shared by the orchestrator, worker pool, job manager,
//! teaching recorder and workflow store.

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{KeyedStore, Mutation};
