use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serenity::all::{
    Channel, ChannelId, Client as SerenityClient, Context as SerenityContext, CreateAllowedMentions,
    CreateAttachment, CreateMessage, EditMessage, EventHandler as SerenityEventHandler,
    GatewayIntents, GuildId, Http, Message as SerenityMessage, MessageFlags, MessageId,
    MessageReference, MessageType, MessageUpdateEvent, Ready, Timestamp, UserId,
};
use tokio::sync::{Mutex, RwLock, oneshot};
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeCore, MediaRef, QueueKey, Sender, SourceMessage};
use crate::config::Config;
use crate::media::MediaHandler;
use crate::transport::{FetchedMessage, SendOptions, Transport};
use crate::utils::formatting::{contains_link, truncate_chars};
use crate::web::metrics::Metrics;

const INITIAL_LOGIN_RETRY_SECONDS: u64 = 2;
const MAX_LOGIN_RETRY_SECONDS: u64 = 300;
const MAX_MESSAGE_CHARS: usize = 2000;

/// Discord gateway ingress plus the REST calls the relay needs.
pub struct DiscordClient {
    config: Arc<Config>,
    token: SecretString,
    http: Arc<Http>,
    media: MediaHandler,
    login_state: Mutex<DiscordLoginState>,
    bridge: Arc<RwLock<Option<Arc<BridgeCore>>>>,
}

#[derive(Default)]
struct DiscordLoginState {
    is_logged_in: bool,
    gateway_task: Option<tokio::task::JoinHandle<()>>,
}

struct MirrorEventHandler {
    ready_sender: Mutex<Option<oneshot::Sender<()>>>,
    bridge: Arc<RwLock<Option<Arc<BridgeCore>>>>,
}

impl MirrorEventHandler {
    async fn bridge(&self) -> Option<Arc<BridgeCore>> {
        let bridge = self.bridge.read().await.clone();
        if bridge.is_none() {
            debug!("ignoring discord event before bridge binding");
        }
        bridge
    }
}

#[serenity::async_trait]
impl SerenityEventHandler for MirrorEventHandler {
    async fn ready(&self, _ctx: SerenityContext, ready: Ready) {
        info!(
            "discord gateway ready as {} ({})",
            ready.user.name, ready.user.id
        );
        if let Some(sender) = self.ready_sender.lock().await.take() {
            let _ = sender.send(());
        }
    }

    async fn message(&self, ctx: SerenityContext, msg: SerenityMessage) {
        if msg.author.id == ctx.cache.current_user().id {
            return;
        }
        let Some(bridge) = self.bridge().await else {
            return;
        };

        let (conversation_id, topic_id) = resolve_conversation(&ctx, msg.channel_id).await;
        if !bridge.is_monitored(conversation_id) {
            return;
        }

        Metrics::source_event_received();
        let queued = bridge.handle_new_message(to_source_message(&msg, conversation_id, topic_id));
        debug!(
            "discord message {} in {} queued for {} targets",
            msg.id, conversation_id, queued
        );
    }

    async fn message_update(
        &self,
        ctx: SerenityContext,
        _old_if_available: Option<SerenityMessage>,
        new: Option<SerenityMessage>,
        event: MessageUpdateEvent,
    ) {
        let Some(bridge) = self.bridge().await else {
            return;
        };

        let msg = match new {
            Some(msg) => msg,
            None => match event.channel_id.message(&ctx, event.id).await {
                Ok(msg) => msg,
                Err(err) => {
                    warn!("failed to fetch edited discord message {}: {}", event.id, err);
                    return;
                }
            },
        };
        // Embed unfurls arrive as updates without an edit timestamp.
        if msg.edited_timestamp.is_none() || msg.author.id == ctx.cache.current_user().id {
            return;
        }

        let (conversation_id, topic_id) = resolve_conversation(&ctx, msg.channel_id).await;
        if !bridge.is_monitored(conversation_id) {
            return;
        }

        Metrics::source_event_received();
        let queued = bridge
            .handle_edited_message(to_source_message(&msg, conversation_id, topic_id))
            .await;
        debug!("discord edit {} queued for {} copies", msg.id, queued);
    }

    async fn message_delete(
        &self,
        ctx: SerenityContext,
        channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        self.mirror_deletes(&ctx, channel_id, vec![deleted_message_id])
            .await;
    }

    async fn message_delete_bulk(
        &self,
        ctx: SerenityContext,
        channel_id: ChannelId,
        deleted_messages_ids: Vec<MessageId>,
        _guild_id: Option<GuildId>,
    ) {
        self.mirror_deletes(&ctx, channel_id, deleted_messages_ids)
            .await;
    }
}

impl MirrorEventHandler {
    async fn mirror_deletes(
        &self,
        ctx: &SerenityContext,
        channel_id: ChannelId,
        message_ids: Vec<MessageId>,
    ) {
        let Some(bridge) = self.bridge().await else {
            return;
        };
        let (conversation_id, _) = resolve_conversation(ctx, channel_id).await;
        if !bridge.is_monitored(conversation_id) {
            return;
        }

        Metrics::source_event_received();
        let ids: Vec<i64> = unique_message_ids(message_ids)
            .into_iter()
            .map(|id| snowflake_to_i64(id.get()))
            .collect();
        let queued = bridge.handle_deleted_messages(conversation_id, &ids).await;
        debug!(
            "{} discord deletions in {} queued {} recalls",
            ids.len(),
            conversation_id,
            queued
        );
    }
}

/// Threads are topics of their parent channel.
async fn resolve_conversation(ctx: &SerenityContext, channel_id: ChannelId) -> (i64, Option<i64>) {
    let channel = snowflake_to_i64(channel_id.get());
    match channel_id.to_channel(ctx).await {
        Ok(Channel::Guild(guild_channel)) if guild_channel.thread_metadata.is_some() => {
            match guild_channel.parent_id {
                Some(parent) => (snowflake_to_i64(parent.get()), Some(channel)),
                None => (channel, None),
            }
        }
        Ok(_) => (channel, None),
        Err(err) => {
            debug!("could not resolve discord channel {}: {}", channel_id, err);
            (channel, None)
        }
    }
}

fn to_source_message(
    msg: &SerenityMessage,
    conversation_id: i64,
    topic_id: Option<i64>,
) -> SourceMessage {
    let media: Vec<MediaRef> = msg
        .attachments
        .iter()
        .map(|attachment| MediaRef {
            url: attachment.url.clone(),
            filename: attachment.filename.clone(),
        })
        .collect();
    let is_link_preview =
        media.is_empty() && (!msg.embeds.is_empty() || contains_link(&msg.content));

    SourceMessage {
        source_conversation_id: conversation_id,
        source_message_id: snowflake_to_i64(msg.id.get()),
        sender_id: snowflake_to_i64(msg.author.id.get()),
        sender_display_name: msg
            .author
            .global_name
            .clone()
            .unwrap_or_else(|| msg.author.name.clone()),
        sender_handle: Some(msg.author.name.clone()),
        timestamp: timestamp_to_utc(msg.timestamp),
        text: (!msg.content.is_empty()).then(|| msg.content.clone()),
        media,
        is_link_preview,
        is_service: !carries_user_content(msg.kind),
        edited_at: msg.edited_timestamp.map(timestamp_to_utc),
        topic_id,
        reply_to_message_id: msg
            .message_reference
            .as_ref()
            .and_then(|reference| reference.message_id)
            .map(|id| snowflake_to_i64(id.get())),
    }
}

fn carries_user_content(kind: MessageType) -> bool {
    matches!(kind, MessageType::Regular | MessageType::InlineReply)
}

fn timestamp_to_utc(timestamp: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp.unix_timestamp(), 0).unwrap_or_else(Utc::now)
}

fn snowflake_to_i64(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn to_snowflake(id: i64) -> Result<u64> {
    u64::try_from(id)
        .ok()
        .filter(|value| *value != 0)
        .ok_or_else(|| anyhow!("invalid discord id: {id}"))
}

/// Messages for a topic lane go into the thread channel itself.
fn lane_channel(lane: &QueueKey) -> Result<ChannelId> {
    to_snowflake(lane.topic_id.unwrap_or(lane.conversation_id)).map(ChannelId::new)
}

/// A reply to the topic anchor only places the message in the thread.
fn reply_reference(lane: &QueueKey, reply_to: Option<i64>) -> Option<i64> {
    reply_to.filter(|id| Some(*id) != lane.topic_id)
}

/// Replies to a message that no longer exists are posted without the
/// reference instead of being rejected.
fn reply_to_message(channel: ChannelId, message: MessageId) -> MessageReference {
    let mut reference = MessageReference::from((channel, message));
    reference.fail_if_not_exists = Some(false);
    reference
}

fn unique_message_ids(ids: Vec<MessageId>) -> Vec<MessageId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

fn is_not_found(err: &serenity::Error) -> bool {
    match err {
        serenity::Error::Http(http_err) => http_err
            .status_code()
            .is_some_and(|status| status.as_u16() == 404),
        _ => false,
    }
}

impl DiscordClient {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        info!("initializing discord client");
        let token = SecretString::from(config.auth.bot_token.clone());
        let http = Arc::new(Http::new(token.expose_secret()));
        Ok(Self {
            config,
            token,
            http,
            media: MediaHandler::new(),
            login_state: Mutex::new(DiscordLoginState::default()),
            bridge: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn set_bridge(&self, bridge: Arc<BridgeCore>) {
        *self.bridge.write().await = Some(bridge);
    }

    fn intents(&self) -> GatewayIntents {
        let base = GatewayIntents::GUILDS | GatewayIntents::GUILD_MESSAGES;
        if self.config.auth.use_privileged_intents {
            base | GatewayIntents::MESSAGE_CONTENT
        } else {
            base
        }
    }

    pub async fn login(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if state.is_logged_in {
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let event_handler = MirrorEventHandler {
            ready_sender: Mutex::new(Some(ready_tx)),
            bridge: self.bridge.clone(),
        };

        let mut gateway_client = SerenityClient::builder(self.token.expose_secret(), self.intents())
            .event_handler(event_handler)
            .await
            .map_err(|err| anyhow!("failed to build discord gateway client: {err}"))?;

        let gateway_task = tokio::spawn(async move {
            if let Err(err) = gateway_client.start_autosharded().await {
                error!("discord gateway stopped: {err}");
            }
        });

        match tokio::time::timeout(std::time::Duration::from_secs(30), ready_rx).await {
            Ok(Ok(())) => {
                state.is_logged_in = true;
                state.gateway_task = Some(gateway_task);
                info!("discord bot login succeeded and gateway is connected");
                Ok(())
            }
            Ok(Err(_)) => {
                gateway_task.abort();
                Err(anyhow!("discord gateway exited before receiving Ready event"))
            }
            Err(_) => {
                gateway_task.abort();
                Err(anyhow!("timed out waiting for discord Ready event"))
            }
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut retry_seconds = INITIAL_LOGIN_RETRY_SECONDS;

        loop {
            match self.login().await {
                Ok(()) => {
                    info!("discord client is ready");
                    return Ok(());
                }
                Err(err) => {
                    error!(
                        "failed to start discord client: {err}. retrying in {} seconds",
                        retry_seconds
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(retry_seconds)).await;
                    retry_seconds = (retry_seconds * 2).min(MAX_LOGIN_RETRY_SECONDS);
                }
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if !state.is_logged_in {
            return Ok(());
        }

        if let Some(gateway_task) = state.gateway_task.take() {
            gateway_task.abort();
            match gateway_task.await {
                Ok(()) => info!("discord gateway task exited"),
                Err(join_err) if join_err.is_cancelled() => {
                    info!("discord gateway task aborted")
                }
                Err(join_err) => {
                    error!("discord gateway task join error: {join_err}");
                }
            }
        }

        state.is_logged_in = false;
        info!("discord client stopped");
        Ok(())
    }

    fn message_builder(
        &self,
        lane: &QueueKey,
        channel: ChannelId,
        content: &str,
        options: SendOptions,
    ) -> Result<CreateMessage> {
        let mut builder = CreateMessage::new().allowed_mentions(CreateAllowedMentions::new());
        if !content.is_empty() {
            builder = builder.content(truncate_chars(content, MAX_MESSAGE_CHARS));
        }
        if !options.link_preview {
            builder = builder.flags(MessageFlags::SUPPRESS_EMBEDS);
        }
        if let Some(reply_id) = reply_reference(lane, options.reply_to) {
            let reply_id = MessageId::new(to_snowflake(reply_id)?);
            builder = builder.reference_message(reply_to_message(channel, reply_id));
        }
        Ok(builder)
    }
}

#[async_trait]
impl Transport for DiscordClient {
    async fn send_text(&self, lane: &QueueKey, text: &str, options: SendOptions) -> Result<i64> {
        let channel = lane_channel(lane)?;
        let builder = self.message_builder(lane, channel, text, options)?;
        let sent = channel
            .send_message(self.http.as_ref(), builder)
            .await
            .map_err(|err| anyhow!("failed to send message to discord channel {channel}: {err}"))?;
        Ok(snowflake_to_i64(sent.id.get()))
    }

    async fn send_media(
        &self,
        lane: &QueueKey,
        media: &[MediaRef],
        caption: &str,
        options: SendOptions,
    ) -> Result<i64> {
        let channel = lane_channel(lane)?;
        let mut files = Vec::with_capacity(media.len());
        for item in media {
            let info = self.media.download(item).await?;
            files.push(CreateAttachment::bytes(info.data, info.filename));
        }

        let builder = self
            .message_builder(lane, channel, caption, options)?
            .add_files(files);
        let sent = channel
            .send_message(self.http.as_ref(), builder)
            .await
            .map_err(|err| anyhow!("failed to upload media to discord channel {channel}: {err}"))?;
        Ok(snowflake_to_i64(sent.id.get()))
    }

    async fn edit_message(&self, lane: &QueueKey, message_id: i64, text: &str) -> Result<()> {
        let channel = lane_channel(lane)?;
        let message = MessageId::new(to_snowflake(message_id)?);
        channel
            .edit_message(
                self.http.as_ref(),
                message,
                EditMessage::new().content(truncate_chars(text, MAX_MESSAGE_CHARS)),
            )
            .await
            .map_err(|err| anyhow!("failed to edit discord message {message}: {err}"))?;
        Ok(())
    }

    async fn fetch_message(
        &self,
        lane: &QueueKey,
        message_id: i64,
    ) -> Result<Option<FetchedMessage>> {
        let channel = lane_channel(lane)?;
        let message = MessageId::new(to_snowflake(message_id)?);
        match channel.message(self.http.as_ref(), message).await {
            Ok(found) => Ok(Some(FetchedMessage {
                text: found.content,
            })),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(anyhow!("failed to fetch discord message {message}: {err}")),
        }
    }

    async fn fetch_sender(&self, message: &SourceMessage) -> Result<Option<Sender>> {
        if !message.sender_display_name.is_empty() {
            return Ok(Some(Sender {
                id: message.sender_id,
                display_name: message.sender_display_name.clone(),
                handle: message.sender_handle.clone(),
            }));
        }

        let user_id = UserId::new(to_snowflake(message.sender_id)?);
        match self.http.get_user(user_id).await {
            Ok(user) => Ok(Some(Sender {
                id: message.sender_id,
                display_name: user.global_name.clone().unwrap_or_else(|| user.name.clone()),
                handle: Some(user.name),
            })),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(anyhow!("failed to fetch discord user {user_id}: {err}")),
        }
    }

    fn max_text_chars(&self) -> usize {
        MAX_MESSAGE_CHARS
    }
}
