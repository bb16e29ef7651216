use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender, error::SendError};
use tracing::{debug, error, warn};

use crate::bridge::message::{DestinationTarget, QueueKey, RelayTask, SourceMessage};
use crate::bridge::worker::{LaneWorker, RelayContext};
use crate::db::MessageRef;
use crate::web::metrics::Metrics;

/// One FIFO queue and worker per destination lane, created on first use.
pub(crate) struct LaneRegistry {
    ctx: Arc<RelayContext>,
    lanes: Mutex<HashMap<QueueKey, UnboundedSender<RelayTask>>>,
}

impl LaneRegistry {
    fn new(ctx: Arc<RelayContext>) -> Self {
        Self {
            ctx,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    fn spawn_lane(&self, lane: QueueKey) -> UnboundedSender<RelayTask> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(LaneWorker::new(lane, self.ctx.clone()).run(rx));
        tx
    }

    /// Appends `task` to `lane`'s queue. A lane whose worker has exited gets a
    /// fresh worker and the task is handed to it.
    fn dispatch(&self, lane: QueueKey, task: RelayTask) {
        let mut lanes = self.lanes.lock();
        let delivered = match lanes.get(&lane) {
            Some(queue) => queue.send(task),
            None => Err(SendError(task)),
        };

        if let Err(SendError(task)) = delivered {
            if lanes.contains_key(&lane) {
                warn!("lane {} worker exited, restarting it", lane);
            } else {
                debug!("starting worker for lane {}", lane);
            }
            let queue = self.spawn_lane(lane);
            if queue.send(task).is_err() {
                error!("fresh worker for lane {} rejected a task", lane);
            }
            lanes.insert(lane, queue);
            Metrics::set_active_lanes(lanes.len());
        }
    }

    fn len(&self) -> usize {
        self.lanes.lock().len()
    }
}

/// Routes source events to the lane workers.
pub struct Dispatcher {
    ctx: Arc<RelayContext>,
    registry: LaneRegistry,
}

impl Dispatcher {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        Self {
            registry: LaneRegistry::new(ctx.clone()),
            ctx,
        }
    }

    /// Queues a relay of `message` for every target that accepts it and
    /// returns how many tasks were queued.
    pub fn on_new_message(&self, message: &SourceMessage, targets: &[DestinationTarget]) -> usize {
        if message.is_service {
            debug!(
                "skipping service message {}",
                message.source_ref().key()
            );
            return 0;
        }

        let mut queued = 0;
        for target in targets.iter().filter(|target| target.accepts(message)) {
            self.registry.dispatch(
                target.queue_key(),
                RelayTask::New {
                    message: message.clone(),
                    target: target.clone(),
                },
            );
            queued += 1;
        }
        queued
    }

    /// Queues an edit for every recorded copy of `message`.
    pub async fn on_edited_message(&self, message: &SourceMessage) -> usize {
        let copies = match self.ctx.store.get_backup_messages(message.source_ref()).await {
            Ok(copies) => copies,
            Err(err) => {
                warn!(
                    "copy lookup for edited {} failed: {}",
                    message.source_ref().key(),
                    err
                );
                return 0;
            }
        };
        if copies.is_empty() {
            debug!("edited {} has no recorded copies", message.source_ref().key());
            return 0;
        }

        let queued = copies.len();
        for entry in copies {
            self.registry.dispatch(
                QueueKey::from(&entry),
                RelayTask::Edit {
                    message: message.clone(),
                    entry,
                },
            );
        }
        queued
    }

    /// Queues a recall for every recorded copy of each deleted message.
    pub async fn on_deleted_messages(&self, source_conversation_id: i64, message_ids: &[i64]) -> usize {
        let mut queued = 0;
        for &message_id in message_ids {
            let source = MessageRef::new(source_conversation_id, message_id);
            let copies = match self.ctx.store.get_backup_messages(source).await {
                Ok(copies) => copies,
                Err(err) => {
                    warn!("copy lookup for deleted {} failed: {}", source.key(), err);
                    continue;
                }
            };
            for entry in copies {
                self.registry
                    .dispatch(QueueKey::from(&entry), RelayTask::Delete { entry });
                queued += 1;
            }
        }
        queued
    }

    pub fn active_lanes(&self) -> usize {
        self.registry.len()
    }
}
