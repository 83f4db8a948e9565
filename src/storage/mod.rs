pub mod duckdb;
pub mod pending;
pub mod tasks;
pub mod traits;

pub use duckdb::DuckDbStorage;
pub use pending::PendingRows;
pub use tasks::InFlightTasks;
pub use traits::{RetrievedBatch, Storage, StorageError};
