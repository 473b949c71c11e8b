//! The storage-agnostic backend contract, its registry, and the built-in
//! adapters.

pub mod episodic;
pub mod hierarchical;
pub mod null_backend;
pub mod registry;
pub mod types;

pub use types::{
    Capabilities, ChunkPayload, CoreResult, CorpusPayload, HealthStatus, IdKind, IndexResult,
    MemoryBackend, PrepareResult, QueryItem, QueryPayload, QueryResult, MANIFEST_VERSION,
};
