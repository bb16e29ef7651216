use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::DatabaseError;
use super::models::{MappingEntry, MessageRef, UndatedEntry};
use super::stores::MappingStore;

/// Mapping store persisted as one JSON document keyed by `"{chat}_{message}"`.
///
/// The in-memory indices and the file write sit behind a single mutex, so an
/// append, its reverse upsert and the persist step happen as one unit.
pub struct JsonMappingStore {
    path: PathBuf,
    index: Mutex<MappingIndex>,
}

#[derive(Debug, Clone, Default)]
struct MappingIndex {
    forward: BTreeMap<String, Vec<MappingEntry>>,
    reverse: HashMap<MessageRef, MappingEntry>,
}

impl MappingIndex {
    fn from_forward(forward: BTreeMap<String, Vec<MappingEntry>>) -> Self {
        let mut index = Self {
            forward,
            reverse: HashMap::new(),
        };
        index.rebuild_reverse();
        index
    }

    fn rebuild_reverse(&mut self) {
        self.reverse = self
            .forward
            .values()
            .flatten()
            .map(|entry| (entry.backup(), entry.clone()))
            .collect();
    }

    fn insert(&mut self, entry: MappingEntry) {
        let backup = entry.backup();
        if let Some(previous) = self.reverse.get(&backup).cloned() {
            // A backup message has exactly one origin; the newer record wins.
            self.remove_from_forward(&previous);
        }
        self.forward
            .entry(entry.source().key())
            .or_default()
            .push(entry.clone());
        self.reverse.insert(backup, entry);
    }

    fn remove_from_forward(&mut self, entry: &MappingEntry) {
        let key = entry.source().key();
        let Some(entries) = self.forward.get_mut(&key) else {
            return;
        };
        entries.retain(|existing| existing.backup() != entry.backup());
        if entries.is_empty() {
            self.forward.remove(&key);
        }
    }

    fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.forward.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| entry.timestamp >= cutoff);
            removed += before - entries.len();
            !entries.is_empty()
        });
        if removed > 0 {
            self.rebuild_reverse();
        }
        removed
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let forward_count: usize = self.forward.values().map(Vec::len).sum();
        forward_count == self.reverse.len()
            && self
                .forward
                .values()
                .flatten()
                .all(|entry| self.reverse.get(&entry.backup()) == Some(entry))
    }
}

impl JsonMappingStore {
    /// Opens the store at `path`. A missing file starts an empty store; an
    /// unreadable one is set aside and also starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, DatabaseError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let forward = load_forward(&path).await;
        let index = MappingIndex::from_forward(forward);
        info!(
            "loaded message mappings path={} sources={} copies={}",
            path.display(),
            index.forward.len(),
            index.reverse.len()
        );

        Ok(Self {
            path,
            index: Mutex::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, index: &MappingIndex) -> Result<(), DatabaseError> {
        let payload = serde_json::to_vec_pretty(&index.forward)?;
        let tmp_path = self.path.with_extension("json.tmp");

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&payload).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        debug!(
            "persisted message mappings path={} bytes={}",
            self.path.display(),
            payload.len()
        );
        Ok(())
    }
}

async fn load_forward(path: &Path) -> BTreeMap<String, Vec<MappingEntry>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(err) => {
            error!(
                "failed to read message mappings path={}: {}; starting empty, edits and recalls of earlier messages will not propagate",
                path.display(),
                err
            );
            return BTreeMap::new();
        }
    };

    match serde_json::from_slice::<BTreeMap<String, serde_json::Value>>(&bytes) {
        Ok(raw) => {
            let loaded_at = Utc::now();
            raw.into_iter()
                .map(|(key, value)| {
                    let entries = entries_from_value(&key, value, loaded_at);
                    (key, entries)
                })
                .filter(|(_, entries)| !entries.is_empty())
                .collect()
        }
        Err(err) => {
            let corrupt_path = path.with_extension("json.corrupt");
            error!(
                "failed to parse message mappings path={}: {}; starting empty, edits and recalls of earlier messages will not propagate",
                path.display(),
                err
            );
            if let Err(copy_err) = tokio::fs::copy(path, &corrupt_path).await {
                warn!(
                    "failed to keep unreadable mapping file at {}: {}",
                    corrupt_path.display(),
                    copy_err
                );
            }
            BTreeMap::new()
        }
    }
}

/// Reads one forward value. Older files stored a single object per key.
fn entries_from_value(
    key: &str,
    value: serde_json::Value,
    loaded_at: DateTime<Utc>,
) -> Vec<MappingEntry> {
    let items = match value {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };
    items
        .into_iter()
        .filter_map(|item| entry_from_value(key, item, loaded_at))
        .collect()
}

/// Entries with an unreadable timestamp are kept as of `loaded_at`; entries
/// without usable ids are dropped.
fn entry_from_value(
    key: &str,
    item: serde_json::Value,
    loaded_at: DateTime<Utc>,
) -> Option<MappingEntry> {
    let err = match MappingEntry::deserialize(&item) {
        Ok(entry) => return Some(entry),
        Err(err) => err,
    };
    match UndatedEntry::deserialize(&item) {
        Ok(undated) => {
            warn!(
                "mapping under {} has no readable timestamp ({}), keeping it as of load time",
                key, err
            );
            Some(undated.dated(loaded_at))
        }
        Err(_) => {
            warn!("dropping malformed mapping under {}: {}", key, err);
            None
        }
    }
}

#[async_trait]
impl MappingStore for JsonMappingStore {
    async fn insert_entry(&self, entry: MappingEntry) -> Result<(), DatabaseError> {
        let mut index = self.index.lock().await;
        let mut next = index.clone();
        next.insert(entry);
        self.persist(&next).await?;
        *index = next;
        Ok(())
    }

    async fn get_backup_messages(
        &self,
        source: MessageRef,
    ) -> Result<Vec<MappingEntry>, DatabaseError> {
        let index = self.index.lock().await;
        Ok(index.forward.get(&source.key()).cloned().unwrap_or_default())
    }

    async fn get_source_info(
        &self,
        backup: MessageRef,
    ) -> Result<Option<MappingEntry>, DatabaseError> {
        let index = self.index.lock().await;
        Ok(index.reverse.get(&backup).cloned())
    }

    async fn remove_entries_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let mut index = self.index.lock().await;
        let mut next = index.clone();
        let removed = next.prune_before(cutoff);
        if removed > 0 {
            self.persist(&next).await?;
            *index = next;
            info!(
                "pruned {} message mappings older than {} ({} sources left)",
                removed,
                cutoff,
                index.forward.len()
            );
        } else {
            debug!("no message mappings older than {}", cutoff);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    use super::JsonMappingStore;
    use crate::db::models::{MappingEntry, MessageRef};
    use crate::db::stores::MappingStore;

    async fn open_store(dir: &TempDir) -> JsonMappingStore {
        JsonMappingStore::open(dir.path().join("message_mapping.json"))
            .await
            .expect("store opens")
    }

    #[tokio::test]
    async fn fan_out_is_reverse_lookupable() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir).await;
        let source = MessageRef::new(100, 1);

        for (chat, msg) in [(200, 10), (300, 20), (400, 30)] {
            store
                .add_mapping(source, MessageRef::new(chat, msg), None)
                .await
                .expect("mapping added");
        }

        let copies = store.get_backup_messages(source).await.expect("lookup");
        assert_eq!(copies.len(), 3);
        assert_eq!(
            copies.iter().map(|e| e.backup_chat_id).collect::<Vec<_>>(),
            vec![200, 300, 400]
        );
        for copy in &copies {
            let origin = store
                .get_source_info(copy.backup())
                .await
                .expect("reverse lookup")
                .expect("origin exists");
            assert_eq!(origin.source(), source);
        }
        assert!(store.index.lock().await.is_consistent());
    }

    #[tokio::test]
    async fn unknown_source_returns_empty_list() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir).await;
        let copies = store
            .get_backup_messages(MessageRef::new(1, 1))
            .await
            .expect("lookup");
        assert!(copies.is_empty());
        assert!(
            store
                .get_source_info(MessageRef::new(2, 2))
                .await
                .expect("lookup")
                .is_none()
        );
    }

    #[tokio::test]
    async fn mappings_survive_reopen() {
        let dir = TempDir::new().expect("temp dir");
        {
            let store = open_store(&dir).await;
            store
                .add_mapping(MessageRef::new(100, 1), MessageRef::new(200, 5), Some(9))
                .await
                .expect("mapping added");
        }

        let reopened = open_store(&dir).await;
        let copies = reopened
            .get_backup_messages(MessageRef::new(100, 1))
            .await
            .expect("lookup");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].target_topic_id, Some(9));

        let raw = std::fs::read_to_string(reopened.path()).expect("file readable");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert!(value.get("100_1").is_some_and(|v| v.is_array()));
    }

    #[tokio::test]
    async fn legacy_single_object_values_load() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("message_mapping.json");
        std::fs::write(
            &path,
            r#"{"100_1": {"source_chat_id": 100, "source_msg_id": 1, "backup_chat_id": 200,
                "backup_msg_id": 5, "target_topic_id": null, "timestamp": "2024-01-01T00:00:00"}}"#,
        )
        .expect("seed file");

        let store = JsonMappingStore::open(&path).await.expect("store opens");
        let origin = store
            .get_source_info(MessageRef::new(200, 5))
            .await
            .expect("lookup")
            .expect("origin exists");
        assert_eq!(origin.source(), MessageRef::new(100, 1));
    }

    #[tokio::test]
    async fn unreadable_timestamps_do_not_drop_history() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("message_mapping.json");
        std::fs::write(
            &path,
            r#"{
                "100_1": [{"source_chat_id": 100, "source_msg_id": 1, "backup_chat_id": 200,
                           "backup_msg_id": 5, "target_topic_id": null,
                           "timestamp": "2024-01-01T00:00:00"}],
                "100_2": [{"source_chat_id": 100, "source_msg_id": 2, "backup_chat_id": 200,
                           "backup_msg_id": 6, "target_topic_id": null, "timestamp": null},
                          {"note": "not a mapping"}]
            }"#,
        )
        .expect("seed file");

        let store = JsonMappingStore::open(&path).await.expect("store opens");
        for (source, backup) in [(1, 5), (2, 6)] {
            let origin = store
                .get_source_info(MessageRef::new(200, backup))
                .await
                .expect("lookup")
                .expect("origin kept");
            assert_eq!(origin.source(), MessageRef::new(100, source));
        }
        assert_eq!(
            store
                .get_backup_messages(MessageRef::new(100, 2))
                .await
                .expect("lookup")
                .len(),
            1
        );
        assert!(!dir.path().join("message_mapping.json.corrupt").exists());
    }

    #[tokio::test]
    async fn failed_persist_leaves_store_unchanged() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir).await;
        store
            .add_mapping(MessageRef::new(100, 1), MessageRef::new(200, 10), None)
            .await
            .expect("first mapping");
        store
            .insert_entry(MappingEntry::new(
                MessageRef::new(100, 2),
                MessageRef::new(200, 11),
                None,
                Utc::now() - Duration::days(90),
            ))
            .await
            .expect("old mapping");

        // A directory where the temporary file goes makes every write fail.
        std::fs::create_dir(dir.path().join("message_mapping.json.tmp")).expect("block tmp");

        assert!(
            store
                .add_mapping(MessageRef::new(100, 3), MessageRef::new(200, 12), None)
                .await
                .is_err()
        );
        assert!(
            store
                .get_backup_messages(MessageRef::new(100, 3))
                .await
                .expect("lookup")
                .is_empty()
        );
        assert!(
            store
                .get_source_info(MessageRef::new(200, 12))
                .await
                .expect("lookup")
                .is_none()
        );

        assert!(store.cleanup_old_mappings(30).await.is_err());
        assert!(
            store
                .get_source_info(MessageRef::new(200, 11))
                .await
                .expect("lookup")
                .is_some()
        );
        assert!(store.index.lock().await.is_consistent());
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("message_mapping.json");
        std::fs::write(&path, "{ not json").expect("seed file");

        let store = JsonMappingStore::open(&path).await.expect("store opens");
        assert!(
            store
                .get_backup_messages(MessageRef::new(100, 1))
                .await
                .expect("lookup")
                .is_empty()
        );
        assert!(dir.path().join("message_mapping.json.corrupt").exists());
    }

    #[tokio::test]
    async fn retention_removes_only_expired_entries() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir).await;
        let now = Utc::now();

        let stale = MappingEntry::new(
            MessageRef::new(100, 1),
            MessageRef::new(200, 10),
            None,
            now - Duration::days(40),
        );
        let fresh_sibling = MappingEntry::new(
            MessageRef::new(100, 1),
            MessageRef::new(300, 11),
            None,
            now - Duration::days(5),
        );
        let stale_alone = MappingEntry::new(
            MessageRef::new(100, 2),
            MessageRef::new(200, 12),
            None,
            now - Duration::days(31),
        );
        for entry in [stale, fresh_sibling.clone(), stale_alone] {
            store.insert_entry(entry).await.expect("insert");
        }

        let removed = store.cleanup_old_mappings(30).await.expect("cleanup");
        assert_eq!(removed, 2);

        assert_eq!(
            store
                .get_backup_messages(MessageRef::new(100, 1))
                .await
                .expect("lookup"),
            vec![fresh_sibling]
        );
        assert!(
            store
                .get_backup_messages(MessageRef::new(100, 2))
                .await
                .expect("lookup")
                .is_empty()
        );
        assert!(
            store
                .get_source_info(MessageRef::new(200, 10))
                .await
                .expect("lookup")
                .is_none()
        );
        let index = store.index.lock().await;
        assert!(index.is_consistent());
        assert!(!index.forward.contains_key("100_2"));
    }

    #[tokio::test]
    async fn zero_retention_keeps_everything() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir).await;
        store
            .insert_entry(MappingEntry::new(
                MessageRef::new(100, 1),
                MessageRef::new(200, 10),
                None,
                Utc::now() - Duration::days(4000),
            ))
            .await
            .expect("insert");

        assert_eq!(store.cleanup_old_mappings(0).await.expect("cleanup"), 0);
        assert_eq!(
            store
                .get_backup_messages(MessageRef::new(100, 1))
                .await
                .expect("lookup")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn reused_backup_id_moves_to_newest_origin() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir).await;
        let backup = MessageRef::new(200, 10);

        store
            .add_mapping(MessageRef::new(100, 1), backup, None)
            .await
            .expect("first");
        store
            .add_mapping(MessageRef::new(100, 2), backup, None)
            .await
            .expect("second");

        assert!(
            store
                .get_backup_messages(MessageRef::new(100, 1))
                .await
                .expect("lookup")
                .is_empty()
        );
        let origin = store
            .get_source_info(backup)
            .await
            .expect("lookup")
            .expect("origin");
        assert_eq!(origin.source(), MessageRef::new(100, 2));
        assert!(store.index.lock().await.is_consistent());
    }

    #[tokio::test]
    async fn concurrent_appends_lose_nothing() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(open_store(&dir).await);
        let source = MessageRef::new(100, 1);

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .add_mapping(source, MessageRef::new(200 + i % 4, i), None)
                        .await
                        .expect("mapping added");
                })
            })
            .collect();
        for handle in handles {
            handle.await.expect("task joins");
        }

        assert_eq!(store.get_backup_messages(source).await.expect("lookup").len(), 32);
        assert!(store.index.lock().await.is_consistent());

        let reopened = open_store(&dir).await;
        assert_eq!(
            reopened.get_backup_messages(source).await.expect("lookup").len(),
            32
        );
    }
}
