//! Storage adapters implementing the work-queue and control-plane ports.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
