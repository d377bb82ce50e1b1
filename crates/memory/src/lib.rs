//! Memory retrieval for ctxgate: a hashing embedder, vector indexes, and
//! the retriever the context assembler calls.

pub mod embedder;
pub mod in_memory;
pub mod noop;
pub mod retriever;
pub mod vector;

pub use embedder::HashEmbedder;
pub use in_memory::InMemoryIndex;
pub use noop::NoopIndex;
pub use retriever::{DEFAULT_TEMPLATE, MemoryRetriever};
pub use vector::{cosine_similarity, rank_by_similarity};
