//! Persistence layer: the `GraphStore` contract, the in-memory reference
//! backend, and batched cascade writes.

pub mod batch_writer;
pub mod error;
pub mod graph_store;
pub mod memory_store;

pub use batch_writer::{BatchWriter, MAX_BATCH_WRITES};
pub use error::StoreError;
pub use graph_store::{GraphStore, Txn, WriteBatch};
pub use memory_store::MemoryGraphStore;
