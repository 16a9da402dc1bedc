pub mod init;
pub mod memory;
pub mod models;
pub mod operations;
pub mod queries;
pub mod schema;
pub mod store;
#[cfg(test)]
pub mod testing;

pub use memory::MemoryStore;
pub use operations::ClickHouseStore;
pub use store::Store;
