use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bridge::formatter::Formatter;
use crate::bridge::logic::{DeliveryPlan, plan_delivery, recall_is_ignored, resolve_reply_target};
use crate::bridge::message::{DestinationTarget, QueueKey, RelayTask, Sender, SourceMessage};
use crate::bridge::state::ChatStateTracker;
use crate::db::{MappingEntry, MappingStore, MessageRef};
use crate::transport::{SendOptions, Transport};
use crate::utils::formatting::{preview_text, truncate_chars};
use crate::web::metrics::Metrics;

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub auto_delete_ignore_days: u32,
    pub backoff: Duration,
}

/// Collaborators shared by every lane worker.
pub struct RelayContext {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn MappingStore>,
    pub chat_states: Arc<ChatStateTracker>,
    pub formatter: Arc<Formatter>,
    pub settings: WorkerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Relayed { destination_message_id: i64 },
    EditApplied,
    EditSkipped,
    RecallApplied,
    /// The copy could not be marked; only a standalone alert went out.
    RecallAlertOnly,
    RecallSkipped,
    Failed,
}

/// Drains one lane's queue strictly in order.
pub struct LaneWorker {
    lane: QueueKey,
    ctx: Arc<RelayContext>,
}

impl LaneWorker {
    pub fn new(lane: QueueKey, ctx: Arc<RelayContext>) -> Self {
        Self { lane, ctx }
    }

    pub async fn run(self, mut queue: mpsc::UnboundedReceiver<RelayTask>) {
        info!("lane worker started lane={}", self.lane);
        while let Some(task) = queue.recv().await {
            let kind = task.kind();
            let outcome = AssertUnwindSafe(self.handle_task(task)).catch_unwind().await;
            if let Err(panic) = outcome {
                error!(
                    "lane worker {} panicked on {} task: {}; resuming after {:?}",
                    self.lane,
                    kind,
                    panic_message(panic.as_ref()),
                    self.ctx.settings.backoff
                );
                Metrics::relay_failed();
                tokio::time::sleep(self.ctx.settings.backoff).await;
            }
        }
        warn!("lane worker stopped lane={} reason=queue_closed", self.lane);
    }

    /// Processes one task. Failures are logged and never stop the lane.
    pub async fn handle_task(&self, task: RelayTask) -> TaskOutcome {
        let kind = task.kind();
        let result = match task {
            RelayTask::New { message, target } => self.relay_new(&message, &target).await,
            RelayTask::Edit { message, entry } => self.apply_edit(&message, &entry).await,
            RelayTask::Delete { entry } => self.apply_recall(&entry).await,
        };

        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("lane {} failed to process {} task: {:#}", self.lane, kind, err);
                Metrics::relay_failed();
                TaskOutcome::Failed
            }
        }
    }

    async fn resolve_sender(&self, message: &SourceMessage) -> Sender {
        match self.ctx.transport.fetch_sender(message).await {
            Ok(Some(sender)) => sender,
            Ok(None) => {
                debug!(
                    "sender {} of message {} not found",
                    message.sender_id, message.source_message_id
                );
                Sender::unknown()
            }
            Err(err) => {
                warn!(
                    "failed to resolve sender {} of message {}: {}",
                    message.sender_id, message.source_message_id, err
                );
                Sender::unknown()
            }
        }
    }

    async fn reply_copies(&self, message: &SourceMessage) -> Vec<MappingEntry> {
        let Some(reply_id) = message.reply_to_message_id else {
            return Vec::new();
        };
        let source = MessageRef::new(message.source_conversation_id, reply_id);
        self.ctx
            .store
            .get_backup_messages(source)
            .await
            .unwrap_or_else(|err| {
                warn!("reply lookup for {} failed, sending without reply: {}", source.key(), err);
                Vec::new()
            })
    }

    async fn relay_new(
        &self,
        message: &SourceMessage,
        target: &DestinationTarget,
    ) -> Result<TaskOutcome> {
        let transport = &self.ctx.transport;
        let formatter = &self.ctx.formatter;

        let sender = self.resolve_sender(message).await;
        let show_header = self.ctx.chat_states.observe_sender(&self.lane, sender.id);
        let content = formatter.build_content(message, &sender, target, show_header);
        let reply_to = resolve_reply_target(&self.reply_copies(message).await, &self.lane);

        debug!(
            "relaying {} to lane {} header={} text={}",
            message.source_ref().key(),
            self.lane,
            show_header,
            preview_text(message.text())
        );

        let plan = plan_delivery(message, show_header, content, || {
            formatter.timestamp_caption(message.timestamp)
        });
        let destination_message_id = match plan {
            DeliveryPlan::LinkPreview { text } => {
                let options = SendOptions {
                    link_preview: true,
                    reply_to,
                };
                transport.send_text(&self.lane, &text, options).await?
            }
            DeliveryPlan::Text { text } => {
                transport
                    .send_text(&self.lane, &text, SendOptions::reply(reply_to))
                    .await?
            }
            DeliveryPlan::Media { caption } => {
                transport
                    .send_media(&self.lane, &message.media, &caption, SendOptions::reply(reply_to))
                    .await?
            }
            DeliveryPlan::MediaThenHeader { header } => {
                let media_id = transport
                    .send_media(&self.lane, &message.media, "", SendOptions::reply(reply_to))
                    .await?;
                if let Err(err) = transport
                    .send_text(&self.lane, &header, SendOptions::reply(Some(media_id)))
                    .await
                {
                    warn!("header for media {} on lane {} was not sent: {}", media_id, self.lane, err);
                }
                media_id
            }
        };

        let backup = MessageRef::new(self.lane.conversation_id, destination_message_id);
        self.ctx
            .store
            .add_mapping(message.source_ref(), backup, target.destination_topic_id)
            .await
            .with_context(|| {
                format!(
                    "copy {} of {} was sent but not recorded",
                    backup.key(),
                    message.source_ref().key()
                )
            })?;

        Metrics::message_relayed();
        Ok(TaskOutcome::Relayed {
            destination_message_id,
        })
    }

    async fn apply_edit(&self, message: &SourceMessage, entry: &MappingEntry) -> Result<TaskOutcome> {
        let lane = QueueKey::from(entry);
        let Some(current) = self
            .ctx
            .transport
            .fetch_message(&lane, entry.backup_msg_id)
            .await?
        else {
            debug!("copy {} is gone, edit not mirrored", entry.backup().key());
            return Ok(TaskOutcome::EditSkipped);
        };

        let limit = self.ctx.transport.max_text_chars();
        let edited_at = message.edited_at.unwrap_or_else(Utc::now);
        // Long edits are cut so the block never crowds out the copy itself.
        let block = truncate_chars(
            &self.ctx.formatter.edit_annotation(message, edited_at),
            limit / 2,
        );
        if current.text.contains(&block) {
            debug!("edit already mirrored on copy {}", entry.backup().key());
            return Ok(TaskOutcome::EditSkipped);
        }

        let updated = self
            .ctx
            .formatter
            .append_block_within(&current.text, &block, limit);
        self.ctx
            .transport
            .edit_message(&lane, entry.backup_msg_id, &updated)
            .await?;
        Metrics::edit_applied();
        Ok(TaskOutcome::EditApplied)
    }

    async fn apply_recall(&self, entry: &MappingEntry) -> Result<TaskOutcome> {
        let now = Utc::now();
        if recall_is_ignored(entry, now, self.ctx.settings.auto_delete_ignore_days) {
            debug!("copy {} is past the recall window", entry.backup().key());
            return Ok(TaskOutcome::RecallSkipped);
        }

        let lane = QueueKey::from(entry);
        match self.mark_recalled(&lane, entry, now).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(
                    "could not mark copy {} as recalled, sending standalone alert: {:#}",
                    entry.backup().key(),
                    err
                );
                let alert = self.ctx.formatter.fallback_recall_alert(now);
                self.ctx
                    .transport
                    .send_text(&lane, &alert, SendOptions::reply(Some(entry.backup_msg_id)))
                    .await?;
                Metrics::recall_applied();
                Ok(TaskOutcome::RecallAlertOnly)
            }
        }
    }

    async fn mark_recalled(
        &self,
        lane: &QueueKey,
        entry: &MappingEntry,
        now: DateTime<Utc>,
    ) -> Result<TaskOutcome> {
        let transport = &self.ctx.transport;
        let formatter = &self.ctx.formatter;

        if let Some(current) = transport.fetch_message(lane, entry.backup_msg_id).await? {
            if current.text.contains(formatter.recall_marker()) {
                debug!("copy {} already marked as recalled", entry.backup().key());
                return Ok(TaskOutcome::RecallSkipped);
            }
            let updated = formatter.append_block_within(
                &current.text,
                &formatter.recall_marker_line(now),
                transport.max_text_chars(),
            );
            transport
                .edit_message(lane, entry.backup_msg_id, &updated)
                .await?;
        }

        transport
            .send_text(
                lane,
                &formatter.recall_alert(now),
                SendOptions::reply(Some(entry.backup_msg_id)),
            )
            .await?;
        Metrics::recall_applied();
        Ok(TaskOutcome::RecallApplied)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    use super::{LaneWorker, RelayContext, TaskOutcome, WorkerSettings};
    use crate::bridge::formatter::Formatter;
    use crate::bridge::message::fixtures::{photo, target, text_message};
    use crate::bridge::message::{QueueKey, RelayTask};
    use crate::bridge::state::ChatStateTracker;
    use crate::config::LabelsConfig;
    use crate::db::{JsonMappingStore, MappingEntry, MappingStore, MessageRef};
    use crate::transport::testing::{Call, Op, RecordingTransport, TEXT_LIMIT};

    pub(crate) async fn context(
        transport: Arc<RecordingTransport>,
        dir: &TempDir,
        ignore_days: u32,
    ) -> Arc<RelayContext> {
        let store = JsonMappingStore::open(dir.path().join("mapping.json"))
            .await
            .expect("open store");
        Arc::new(RelayContext {
            transport,
            store: Arc::new(store),
            chat_states: Arc::new(ChatStateTracker::new()),
            formatter: Arc::new(Formatter::new("UTC", LabelsConfig::default(), true)),
            settings: WorkerSettings {
                auto_delete_ignore_days: ignore_days,
                backoff: Duration::from_millis(10),
            },
        })
    }

    fn new_task(id: i64, sender: i64, text: &str) -> RelayTask {
        RelayTask::New {
            message: text_message(100, id, sender, text),
            target: target(200),
        }
    }

    async fn recorded_copy(ctx: &RelayContext, source_id: i64) -> MappingEntry {
        ctx.store
            .get_backup_messages(MessageRef::new(100, source_id))
            .await
            .expect("lookup")
            .into_iter()
            .next()
            .expect("copy recorded")
    }

    #[tokio::test]
    async fn new_message_is_sent_and_recorded() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        let ctx = context(transport.clone(), &dir, 30).await;
        let worker = LaneWorker::new(QueueKey::new(200, None), ctx.clone());

        let outcome = worker.handle_task(new_task(1, 7, "hello")).await;
        let TaskOutcome::Relayed {
            destination_message_id,
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };

        let entry = recorded_copy(&ctx, 1).await;
        assert_eq!(entry.backup(), MessageRef::new(200, destination_message_id));
        let text = transport
            .text_of(200, destination_message_id)
            .expect("copy text");
        assert!(text.starts_with("🧑[u] user7\n🕐 "));
        assert!(text.ends_with("hello"));
    }

    #[tokio::test]
    async fn same_sender_is_grouped_without_header() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        let ctx = context(transport.clone(), &dir, 30).await;
        let worker = LaneWorker::new(QueueKey::new(200, None), ctx);

        worker.handle_task(new_task(1, 7, "first")).await;
        worker.handle_task(new_task(2, 7, "second")).await;
        worker.handle_task(new_task(3, 8, "third")).await;

        let texts: Vec<String> = transport
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Text { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert!(texts[0].starts_with("🧑"));
        assert_eq!(texts[1], "second\n\n`2024-05-01 03:04:05`");
        assert!(texts[2].starts_with("🧑[u] user8"));
    }

    #[tokio::test]
    async fn unresolved_sender_falls_back_to_unknown() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        transport.resolve_no_senders();
        let ctx = context(transport.clone(), &dir, 30).await;
        let worker = LaneWorker::new(QueueKey::new(200, None), ctx);

        worker.handle_task(new_task(1, 7, "hello")).await;
        let Call::Text { text, .. } = &transport.calls()[0] else {
            panic!("expected text call");
        };
        assert!(text.starts_with("🧑[U] Unknown\n"));
    }

    #[tokio::test]
    async fn reply_threads_to_copy_in_same_conversation() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        let ctx = context(transport.clone(), &dir, 30).await;
        ctx.store
            .add_mapping(MessageRef::new(100, 1), MessageRef::new(300, 31), None)
            .await
            .expect("other copy");
        ctx.store
            .add_mapping(MessageRef::new(100, 1), MessageRef::new(200, 21), None)
            .await
            .expect("same-conversation copy");
        let worker = LaneWorker::new(QueueKey::new(200, None), ctx);

        let mut reply = text_message(100, 2, 7, "answer");
        reply.reply_to_message_id = Some(1);
        worker
            .handle_task(RelayTask::New {
                message: reply,
                target: target(200),
            })
            .await;

        let Call::Text { options, .. } = &transport.calls()[0] else {
            panic!("expected text call");
        };
        assert_eq!(options.reply_to, Some(21));
    }

    #[tokio::test]
    async fn topic_lane_anchors_on_topic() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        let ctx = context(transport.clone(), &dir, 30).await;
        let mut destination = target(200);
        destination.destination_topic_id = Some(5);
        let worker = LaneWorker::new(destination.queue_key(), ctx.clone());

        worker
            .handle_task(RelayTask::New {
                message: text_message(100, 1, 7, "in topic"),
                target: destination,
            })
            .await;

        let Call::Text { options, .. } = &transport.calls()[0] else {
            panic!("expected text call");
        };
        assert_eq!(options.reply_to, Some(5));
        assert_eq!(recorded_copy(&ctx, 1).await.target_topic_id, Some(5));
    }

    #[tokio::test]
    async fn captionless_media_sends_header_as_reply() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        let ctx = context(transport.clone(), &dir, 30).await;
        let worker = LaneWorker::new(QueueKey::new(200, None), ctx.clone());

        let mut message = text_message(100, 1, 7, "");
        message.text = None;
        message.media.push(photo());
        let outcome = worker
            .handle_task(RelayTask::New {
                message,
                target: target(200),
            })
            .await;

        let calls = transport.calls();
        let Call::Media { id: media_id, caption, .. } = &calls[0] else {
            panic!("expected media first");
        };
        assert!(caption.is_empty());
        let Call::Text { options, text, .. } = &calls[1] else {
            panic!("expected header reply");
        };
        assert_eq!(options.reply_to, Some(*media_id));
        assert!(text.starts_with("🧑[u] user7"));
        assert_eq!(
            outcome,
            TaskOutcome::Relayed {
                destination_message_id: *media_id
            }
        );
        assert_eq!(recorded_copy(&ctx, 1).await.backup_msg_id, *media_id);
    }

    #[tokio::test]
    async fn failed_send_records_nothing() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        transport.fail(Op::SendText);
        let ctx = context(transport.clone(), &dir, 30).await;
        let worker = LaneWorker::new(QueueKey::new(200, None), ctx.clone());

        assert_eq!(
            worker.handle_task(new_task(1, 7, "hello")).await,
            TaskOutcome::Failed
        );
        assert!(
            ctx.store
                .get_backup_messages(MessageRef::new(100, 1))
                .await
                .expect("lookup")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn edit_appends_annotation_once() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        let ctx = context(transport.clone(), &dir, 30).await;
        let worker = LaneWorker::new(QueueKey::new(200, None), ctx.clone());

        worker.handle_task(new_task(1, 7, "draft")).await;
        let entry = recorded_copy(&ctx, 1).await;

        let mut edited = text_message(100, 1, 7, "final");
        edited.edited_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        let edit = RelayTask::Edit {
            message: edited,
            entry: entry.clone(),
        };

        assert_eq!(worker.handle_task(edit.clone()).await, TaskOutcome::EditApplied);
        assert_eq!(worker.handle_task(edit).await, TaskOutcome::EditSkipped);

        let text = transport.text_of(200, entry.backup_msg_id).expect("copy");
        assert!(text.ends_with(
            "draft\n\n----\n🕐 Edited at: 2024-05-01 09:00:00 (UTC)\nfinal"
        ));
        assert_eq!(text.matches("----").count(), 1);
    }

    #[tokio::test]
    async fn long_copy_keeps_edit_and_recall_blocks() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        let ctx = context(transport.clone(), &dir, 30).await;
        let worker = LaneWorker::new(QueueKey::new(200, None), ctx.clone());

        let body = "w".repeat(2100);
        worker.handle_task(new_task(1, 7, &body)).await;
        let entry = recorded_copy(&ctx, 1).await;
        let copy_text = |transport: &RecordingTransport| {
            transport.text_of(200, entry.backup_msg_id).expect("copy")
        };
        assert_eq!(copy_text(&transport).chars().count(), TEXT_LIMIT);

        let mut edited = text_message(100, 1, 7, "fixed typo");
        edited.edited_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        let edit = RelayTask::Edit {
            message: edited,
            entry: entry.clone(),
        };
        assert_eq!(worker.handle_task(edit.clone()).await, TaskOutcome::EditApplied);
        assert_eq!(worker.handle_task(edit).await, TaskOutcome::EditSkipped);
        let text = copy_text(&transport);
        assert!(text.ends_with("2024-05-01 09:00:00 (UTC)\nfixed typo"));
        assert!(text.chars().count() <= TEXT_LIMIT);

        let delete = RelayTask::Delete {
            entry: entry.clone(),
        };
        assert_eq!(worker.handle_task(delete.clone()).await, TaskOutcome::RecallApplied);
        assert_eq!(worker.handle_task(delete).await, TaskOutcome::RecallSkipped);
        let text = copy_text(&transport);
        assert!(text.contains("fixed typo\n\n#recalled `"));
        assert!(text.chars().count() <= TEXT_LIMIT);
    }

    #[tokio::test]
    async fn edit_of_vanished_copy_is_skipped() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        let ctx = context(transport.clone(), &dir, 30).await;
        let worker = LaneWorker::new(QueueKey::new(200, None), ctx);

        let entry = MappingEntry::new(
            MessageRef::new(100, 1),
            MessageRef::new(200, 9),
            None,
            Utc::now(),
        );
        let outcome = worker
            .handle_task(RelayTask::Edit {
                message: text_message(100, 1, 7, "x"),
                entry,
            })
            .await;
        assert_eq!(outcome, TaskOutcome::EditSkipped);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn recall_marks_copy_and_alerts_once() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        let ctx = context(transport.clone(), &dir, 30).await;
        let worker = LaneWorker::new(QueueKey::new(200, None), ctx.clone());

        worker.handle_task(new_task(1, 7, "oops")).await;
        let entry = recorded_copy(&ctx, 1).await;

        let delete = RelayTask::Delete {
            entry: entry.clone(),
        };
        assert_eq!(worker.handle_task(delete.clone()).await, TaskOutcome::RecallApplied);
        assert_eq!(worker.handle_task(delete).await, TaskOutcome::RecallSkipped);

        let text = transport.text_of(200, entry.backup_msg_id).expect("copy");
        assert!(text.contains("oops\n\n#recalled `"));

        let alerts: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Text { text, .. } if text.starts_with("⚠️")))
            .collect();
        assert_eq!(alerts.len(), 1);
        let Call::Text { options, .. } = &alerts[0] else {
            unreachable!();
        };
        assert_eq!(options.reply_to, Some(entry.backup_msg_id));
    }

    #[tokio::test]
    async fn recall_of_old_copy_is_ignored() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        let ctx = context(transport.clone(), &dir, 30).await;
        let worker = LaneWorker::new(QueueKey::new(200, None), ctx);
        transport.seed_message(200, 9, "ancient");

        let entry = MappingEntry::new(
            MessageRef::new(100, 1),
            MessageRef::new(200, 9),
            None,
            Utc::now() - chrono::Duration::days(45),
        );
        assert_eq!(
            worker.handle_task(RelayTask::Delete { entry }).await,
            TaskOutcome::RecallSkipped
        );
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn recall_of_missing_copy_still_alerts() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        let ctx = context(transport.clone(), &dir, 30).await;
        let worker = LaneWorker::new(QueueKey::new(200, None), ctx);

        let entry = MappingEntry::new(
            MessageRef::new(100, 1),
            MessageRef::new(200, 9),
            None,
            Utc::now(),
        );
        assert_eq!(
            worker.handle_task(RelayTask::Delete { entry }).await,
            TaskOutcome::RecallApplied
        );
        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], Call::Text { options, .. } if options.reply_to == Some(9)));
    }

    #[tokio::test]
    async fn recall_falls_back_to_standalone_alert() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        transport.fail(Op::Fetch);
        let ctx = context(transport.clone(), &dir, 30).await;
        let worker = LaneWorker::new(QueueKey::new(200, None), ctx);

        let entry = MappingEntry::new(
            MessageRef::new(100, 1),
            MessageRef::new(200, 9),
            None,
            Utc::now(),
        );
        assert_eq!(
            worker.handle_task(RelayTask::Delete { entry }).await,
            TaskOutcome::RecallAlertOnly
        );
        let Call::Text { text, options, .. } = &transport.calls()[0] else {
            panic!("expected fallback alert");
        };
        assert!(text.ends_with("\n#recalled"));
        assert_eq!(options.reply_to, Some(9));
    }

    #[tokio::test]
    async fn worker_keeps_draining_after_failure() {
        let dir = TempDir::new().expect("temp dir");
        let transport = RecordingTransport::new();
        let ctx = context(transport.clone(), &dir, 30).await;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(LaneWorker::new(QueueKey::new(200, None), ctx).run(rx));

        transport.fail(Op::SendText);
        tx.send(new_task(1, 7, "lost")).expect("queue open");
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.recover(Op::SendText);
        tx.send(new_task(2, 7, "delivered")).expect("queue open");

        transport.wait_for_calls(200, 1).await;
        let Call::Text { text, .. } = &transport.calls()[0] else {
            panic!("expected text call");
        };
        // sender 7 was already seen on this lane, so the copy is grouped
        assert!(text.starts_with("delivered\n\n`"));
    }
}
