use crate::config::{DatabaseConfig as ConfigDatabaseConfig, DbType as ConfigDbType};
use crate::db::{DatabaseError, JsonMappingStore, MappingStore};
use std::sync::Arc;
use tracing::info;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::SqliteMappingStore;

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    mapping_store: Arc<dyn MappingStore>,
    db_type: DbType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Json,
    Sqlite,
}

impl From<ConfigDbType> for DbType {
    fn from(value: ConfigDbType) -> Self {
        match value {
            ConfigDbType::Json => DbType::Json,
            ConfigDbType::Sqlite => DbType::Sqlite,
        }
    }
}

impl DatabaseManager {
    pub async fn new(config: &ConfigDatabaseConfig) -> Result<Self, DatabaseError> {
        let db_type = DbType::from(config.db_type());
        let path = config.path();
        info!("opening mapping store type={:?} path={}", db_type, path);

        match db_type {
            DbType::Json => {
                let store = JsonMappingStore::open(&path).await?;
                Ok(Self {
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    mapping_store: Arc::new(store),
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                if let Some(parent) = std::path::Path::new(&path).parent()
                    && !parent.as_os_str().is_empty()
                {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let store = SqliteMappingStore::new(Arc::new(path.clone()));
                Ok(Self {
                    sqlite_path: Some(path),
                    mapping_store: Arc::new(store),
                    db_type,
                })
            }
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match self.db_type {
            DbType::Json => Ok(()),
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let Some(path) = self.sqlite_path.clone() else {
                    return Ok(());
                };
                tokio::task::spawn_blocking(move || crate::db::sqlite::migrate(&path))
                    .await
                    .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
            }
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Ok(()),
        }
    }

    pub fn mapping_store(&self) -> Arc<dyn MappingStore> {
        self.mapping_store.clone()
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }
}
