use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db::schema_sqlite::message_mappings;

use super::{
    DatabaseError,
    models::{MappingEntry, MessageRef},
    stores::MappingStore,
};

// Fixed-width UTC strings so that lexical order matches time order
fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = message_mappings)]
struct DbMappingEntry {
    source_chat_id: i64,
    source_msg_id: i64,
    backup_chat_id: i64,
    backup_msg_id: i64,
    target_topic_id: Option<i64>,
    created_at: String,
}

impl DbMappingEntry {
    fn to_mapping_entry(&self) -> Result<MappingEntry, DatabaseError> {
        Ok(MappingEntry {
            source_chat_id: self.source_chat_id,
            source_msg_id: self.source_msg_id,
            backup_chat_id: self.backup_chat_id,
            backup_msg_id: self.backup_msg_id,
            target_topic_id: self.target_topic_id,
            timestamp: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = message_mappings)]
struct NewMappingEntry {
    source_chat_id: i64,
    source_msg_id: i64,
    backup_chat_id: i64,
    backup_msg_id: i64,
    target_topic_id: Option<i64>,
    created_at: String,
}

impl From<&MappingEntry> for NewMappingEntry {
    fn from(entry: &MappingEntry) -> Self {
        Self {
            source_chat_id: entry.source_chat_id,
            source_msg_id: entry.source_msg_id,
            backup_chat_id: entry.backup_chat_id,
            backup_msg_id: entry.backup_msg_id,
            target_topic_id: entry.target_topic_id,
            created_at: datetime_to_string(&entry.timestamp),
        }
    }
}

fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    let mut conn =
        SqliteConnection::establish(path).map_err(|e| DatabaseError::Connection(e.to_string()))?;
    diesel::sql_query("PRAGMA busy_timeout = 5000")
        .execute(&mut conn)
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;
    Ok(conn)
}

pub(crate) fn migrate(path: &str) -> Result<(), DatabaseError> {
    let mut conn = establish_connection(path)?;

    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS message_mappings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_chat_id BIGINT NOT NULL,
            source_msg_id BIGINT NOT NULL,
            backup_chat_id BIGINT NOT NULL,
            backup_msg_id BIGINT NOT NULL,
            target_topic_id BIGINT,
            created_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_message_mappings_source ON message_mappings(source_chat_id, source_msg_id)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_message_mappings_backup ON message_mappings(backup_chat_id, backup_msg_id)",
        "CREATE INDEX IF NOT EXISTS idx_message_mappings_created_at ON message_mappings(created_at)",
    ];

    for statement in statements {
        diesel::sql_query(statement)
            .execute(&mut conn)
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
    }

    Ok(())
}

pub struct SqliteMappingStore {
    db_path: Arc<String>,
    write_lock: Mutex<()>,
}

impl SqliteMappingStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self {
            db_path,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl MappingStore for SqliteMappingStore {
    async fn insert_entry(&self, entry: MappingEntry) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::message_mappings::dsl::*;

            let row = NewMappingEntry::from(&entry);
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                diesel::delete(
                    message_mappings
                        .filter(backup_chat_id.eq(entry.backup_chat_id))
                        .filter(backup_msg_id.eq(entry.backup_msg_id)),
                )
                .execute(conn)?;
                diesel::insert_into(message_mappings)
                    .values(&row)
                    .execute(conn)?;
                Ok(())
            })
            .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn get_backup_messages(
        &self,
        source: MessageRef,
    ) -> Result<Vec<MappingEntry>, DatabaseError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::message_mappings::dsl::*;
            message_mappings
                .filter(source_chat_id.eq(source.chat_id))
                .filter(source_msg_id.eq(source.message_id))
                .order(id.asc())
                .select(DbMappingEntry::as_select())
                .load::<DbMappingEntry>(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .iter()
                .map(DbMappingEntry::to_mapping_entry)
                .collect()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn get_source_info(
        &self,
        backup: MessageRef,
    ) -> Result<Option<MappingEntry>, DatabaseError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::message_mappings::dsl::*;
            message_mappings
                .filter(backup_chat_id.eq(backup.chat_id))
                .filter(backup_msg_id.eq(backup.message_id))
                .select(DbMappingEntry::as_select())
                .first::<DbMappingEntry>(&mut conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(|m| m.to_mapping_entry())
                .transpose()
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn remove_entries_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let db_path = self.db_path.clone();
        let cutoff = datetime_to_string(&cutoff);
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            use crate::db::schema_sqlite::message_mappings::dsl::*;
            diesel::delete(message_mappings.filter(created_at.lt(cutoff)))
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}
