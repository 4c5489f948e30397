pub mod memory;
pub mod sqlite;

pub use memory::MemoryFlowStore;
pub use sqlite::SqliteFlowStore;
