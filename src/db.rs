pub use self::error::DatabaseError;
pub use self::json::JsonMappingStore;
pub use self::manager::DatabaseManager;
pub use self::models::{MappingEntry, MessageRef};
pub use self::stores::MappingStore;

pub mod error;
pub mod json;
pub mod manager;
pub mod models;
pub mod stores;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub mod schema_sqlite;
