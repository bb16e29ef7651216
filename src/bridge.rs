use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::DatabaseManager;
use crate::transport::Transport;
use crate::utils::formatting::preview_text;
use crate::web::metrics::Metrics;

pub mod dispatcher;
pub mod formatter;
pub mod logic;
pub mod message;
pub mod state;
pub mod worker;

pub use self::dispatcher::Dispatcher;
pub use self::formatter::Formatter;
pub use self::message::{DestinationTarget, MediaRef, QueueKey, RelayTask, Sender, SourceMessage};
pub use self::state::ChatStateTracker;
pub use self::worker::{RelayContext, TaskOutcome, WorkerSettings};

/// Entry point for source events: resolves relays and hands work to the
/// dispatcher.
pub struct BridgeCore {
    config: Arc<Config>,
    db_manager: Arc<DatabaseManager>,
    dispatcher: Arc<Dispatcher>,
    relays: HashMap<i64, Vec<DestinationTarget>>,
}

impl BridgeCore {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        db_manager: Arc<DatabaseManager>,
    ) -> Self {
        let relays = config
            .relays
            .iter()
            .map(|relay| {
                let targets = relay.targets.iter().map(DestinationTarget::from).collect();
                (relay.source_id, targets)
            })
            .collect();

        let ctx = Arc::new(RelayContext {
            transport,
            store: db_manager.mapping_store(),
            chat_states: Arc::new(ChatStateTracker::new()),
            formatter: Arc::new(Formatter::from_config(&config)),
            settings: WorkerSettings {
                auto_delete_ignore_days: config.bridge.auto_delete_ignore_days,
                backoff: Duration::from_millis(config.bridge.worker_backoff_ms),
            },
        });

        Self {
            dispatcher: Arc::new(Dispatcher::new(ctx)),
            config,
            db_manager,
            relays,
        }
    }

    /// Runs the periodic mapping retention sweep. Never returns under normal
    /// operation.
    pub async fn start(&self) -> Result<()> {
        info!(
            "bridge core started relays={} retention_days={}",
            self.relays.len(),
            self.config.bridge.mapping_retention_days
        );

        let interval = Duration::from_secs(self.config.bridge.cleanup_interval_secs.max(60));
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.run_retention_sweep().await;
        }
    }

    pub async fn run_retention_sweep(&self) -> usize {
        let retention_days = self.config.bridge.mapping_retention_days;
        match self
            .db_manager
            .mapping_store()
            .cleanup_old_mappings(retention_days)
            .await
        {
            Ok(0) => {
                debug!("retention sweep found nothing older than {} days", retention_days);
                0
            }
            Ok(removed) => {
                info!("retention sweep removed {} mappings", removed);
                Metrics::mappings_pruned(removed);
                removed
            }
            Err(err) => {
                warn!("retention sweep failed: {}", err);
                0
            }
        }
    }

    pub fn is_monitored(&self, source_conversation_id: i64) -> bool {
        self.relays.contains_key(&source_conversation_id)
    }

    pub fn targets_for(&self, source_conversation_id: i64) -> &[DestinationTarget] {
        self.relays
            .get(&source_conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn handle_new_message(&self, message: SourceMessage) -> usize {
        let targets = self.targets_for(message.source_conversation_id);
        if targets.is_empty() {
            return 0;
        }
        debug!(
            "source message {} from {} text={}",
            message.source_ref().key(),
            message.sender_id,
            preview_text(message.text())
        );
        self.dispatcher.on_new_message(&message, targets)
    }

    pub async fn handle_edited_message(&self, message: SourceMessage) -> usize {
        self.dispatcher.on_edited_message(&message).await
    }

    pub async fn handle_deleted_messages(&self, source_conversation_id: i64, message_ids: &[i64]) -> usize {
        debug!(
            "{} messages deleted in {}",
            message_ids.len(),
            source_conversation_id
        );
        self.dispatcher
            .on_deleted_messages(source_conversation_id, message_ids)
            .await
    }

    pub fn active_lanes(&self) -> usize {
        self.dispatcher.active_lanes()
    }

    pub fn db(&self) -> Arc<DatabaseManager> {
        self.db_manager.clone()
    }
}
