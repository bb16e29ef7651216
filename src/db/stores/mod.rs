use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::DatabaseError;
use super::models::{MappingEntry, MessageRef};

/// Bidirectional index between source messages and their relayed copies.
///
/// Implementations keep the forward index (source -> ordered copies) and the
/// reverse index (copy -> entry) consistent after every mutating call, and make
/// each mutating call atomic with respect to the others.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Appends `entry` to its source's list and upserts the reverse index for
    /// its backup message, then persists.
    async fn insert_entry(&self, entry: MappingEntry) -> Result<(), DatabaseError>;

    async fn get_backup_messages(
        &self,
        source: MessageRef,
    ) -> Result<Vec<MappingEntry>, DatabaseError>;

    async fn get_source_info(
        &self,
        backup: MessageRef,
    ) -> Result<Option<MappingEntry>, DatabaseError>;

    /// Drops every entry stamped strictly before `cutoff` and returns how many
    /// were removed. Persists only when something changed.
    async fn remove_entries_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError>;

    async fn add_mapping(
        &self,
        source: MessageRef,
        backup: MessageRef,
        target_topic_id: Option<i64>,
    ) -> Result<MappingEntry, DatabaseError> {
        let entry = MappingEntry::new(source, backup, target_topic_id, Utc::now());
        self.insert_entry(entry.clone()).await?;
        Ok(entry)
    }

    /// A retention of zero days keeps everything.
    async fn cleanup_old_mappings(&self, retention_days: u32) -> Result<usize, DatabaseError> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        self.remove_entries_before(cutoff).await
    }
}
