use chrono::Utc;
use serenity::all::Command;
use serenity::all::CommandDataOptionValue;
use serenity::all::CommandInteraction;
use serenity::all::CommandOptionType;
use serenity::all::CreateCommand;
use serenity::all::CreateCommandOption;
use serenity::all::CreateInteractionResponse;
use serenity::all::CreateInteractionResponseMessage;
use serenity::all::Interaction;
use serenity::all::Ready;
use serenity::all::UserId;
use serenity::async_trait;
use serenity::model::voice::VoiceState;
use serenity::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::query;
use crate::sweeper::{self, PresenceError, VoicePresence};
use crate::tracker::VoiceTracker;

pub struct TrackerKey;

impl TypeMapKey for TrackerKey {
    type Value = Arc<VoiceTracker>;
}

pub struct Handler {
    sweep_interval: Duration,
    shutdown: watch::Receiver<bool>,
    sweeper_started: AtomicBool,
}

impl Handler {
    pub fn new(sweep_interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            sweep_interval,
            shutdown,
            sweeper_started: AtomicBool::new(false),
        }
    }
}

/// Ground truth from the serenity guild cache. An empty or missing cache
/// entry is "could not determine", never "disconnected".
struct CachePresence {
    cache: Arc<serenity::cache::Cache>,
}

#[async_trait]
impl VoicePresence for CachePresence {
    async fn connected_channel(&self, user_id: u64) -> Result<Option<String>, PresenceError> {
        let guild_ids = self.cache.guilds();
        if guild_ids.is_empty() {
            return Err(PresenceError::Unavailable("no guilds in cache".to_string()));
        }
        let user_id = UserId::new(user_id);
        for guild_id in guild_ids {
            let Some(guild) = self.cache.guild(guild_id) else {
                return Err(PresenceError::Unavailable(format!(
                    "guild {guild_id} not cached"
                )));
            };
            if let Some(channel_id) = guild
                .voice_states
                .get(&user_id)
                .and_then(|vs| vs.channel_id)
            {
                let name = guild
                    .channels
                    .get(&channel_id)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| channel_id.to_string());
                return Ok(Some(name));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(bot = %ready.user.name, "connected to Discord");

        let tracker = shared_tracker(&ctx).await;

        // Members already sitting in voice channels get tracked from now;
        // whatever came before this process is unknowable.
        let mut entries = Vec::new();
        for guild_id in ctx.cache.guilds() {
            if let Some(guild) = ctx.cache.guild(guild_id) {
                for (user_id, vs) in guild.voice_states.iter() {
                    if let Some(channel_id) = vs.channel_id {
                        let username = guild
                            .members
                            .get(user_id)
                            .map(|m| m.user.name.clone())
                            .unwrap_or_else(|| user_id.to_string());
                        let channel = guild
                            .channels
                            .get(&channel_id)
                            .map(|c| c.name.clone())
                            .unwrap_or_else(|| channel_id.to_string());
                        entries.push((user_id.get(), username, channel));
                    }
                }
            }
        }
        tracker.seed_snapshot(entries, Utc::now()).await;

        for cmd in [voicetime_command(), leaderboard_command()] {
            if let Err(e) = Command::create_global_command(&ctx.http, cmd).await {
                error!(error = ?e, "global command registration failed");
            }
        }

        // Guild registration too, so the commands show up without the
        // global propagation delay.
        for guild_id in ctx.cache.guilds() {
            for cmd in [voicetime_command(), leaderboard_command()] {
                if let Err(e) = guild_id.create_command(&ctx.http, cmd).await {
                    error!(%guild_id, error = ?e, "guild command registration failed");
                }
            }
        }

        // ready can fire again on reconnect; the sweeper must only exist once.
        if !self.sweeper_started.swap(true, Ordering::SeqCst) {
            let presence: Arc<dyn VoicePresence> = Arc::new(CachePresence {
                cache: ctx.cache.clone(),
            });
            tokio::spawn(sweeper::run(
                tracker,
                presence,
                self.sweep_interval,
                self.shutdown.clone(),
            ));
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let guild_id = match new.guild_id {
            Some(id) => id,
            None => return,
        };
        let (user_id, username) = match new.member {
            Some(ref member) => (member.user.id, member.user.name.clone()),
            None => (new.user_id, new.user_id.to_string()),
        };

        let tracker = shared_tracker(&ctx).await;
        let now = Utc::now();

        match (old.as_ref().and_then(|v| v.channel_id), new.channel_id) {
            (None, Some(channel_id)) => {
                let channel = channel_name(&ctx, guild_id, channel_id).await;
                tracker
                    .handle_join(user_id.get(), &username, &channel, now)
                    .await;
            }
            (Some(_), None) => {
                if let Err(e) = tracker.handle_leave(user_id.get(), now).await {
                    error!(user_id = user_id.get(), error = %e, "failed to flush session on leave");
                }
            }
            (Some(old_channel_id), Some(channel_id)) if old_channel_id != channel_id => {
                let channel = channel_name(&ctx, guild_id, channel_id).await;
                tracker
                    .handle_move(user_id.get(), &username, &channel, now)
                    .await;
            }
            _ => {}
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(cmd) = interaction {
            match cmd.data.name.as_str() {
                "voicetime" => handle_voicetime(&ctx, &cmd).await,
                "leaderboard" => handle_leaderboard(&ctx, &cmd).await,
                _ => {}
            }
        }
    }
}

fn voicetime_command() -> CreateCommand {
    CreateCommand::new("voicetime")
        .description("Show how long a user has spent in voice channels")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::User,
                "user",
                "User to look up (defaults to you)",
            )
            .required(false),
        )
}

fn leaderboard_command() -> CreateCommand {
    CreateCommand::new("leaderboard").description("Show the voice channel time leaderboard")
}

async fn handle_voicetime(ctx: &Context, cmd: &CommandInteraction) {
    let picked = cmd
        .data
        .options
        .iter()
        .find(|o| o.name == "user")
        .and_then(|o| match &o.value {
            CommandDataOptionValue::User(id) => Some(*id),
            _ => None,
        });
    let (target, target_name) = match picked {
        Some(id) => (
            id,
            cmd.data
                .resolved
                .users
                .get(&id)
                .map(|u| u.name.clone())
                .unwrap_or_else(|| id.to_string()),
        ),
        None => (cmd.user.id, cmd.user.name.clone()),
    };

    let tracker = shared_tracker(ctx).await;
    let text = match query::user_total(&tracker, target.get(), Utc::now()).await {
        None => format!("{target_name} has no recorded voice channel time."),
        Some(total) => match total.live_secs {
            Some(live) if total.stored_secs == 0.0 => format!(
                "{target_name} is currently in a voice channel and has been there for {}.",
                query::format_duration(live)
            ),
            Some(live) => format!(
                "{target_name} has spent {} in voice channels.\nCurrent session: {}.",
                query::format_duration(total.stored_secs),
                query::format_duration(live)
            ),
            None => format!(
                "{target_name} has spent {} in voice channels.",
                query::format_duration(total.stored_secs)
            ),
        },
    };
    respond(ctx, cmd, text).await;
}

async fn handle_leaderboard(ctx: &Context, cmd: &CommandInteraction) {
    let tracker = shared_tracker(ctx).await;
    let board = query::leaderboard(&tracker, 10, Utc::now()).await;

    if board.is_empty() {
        respond(ctx, cmd, "No voice channel data recorded yet.".to_string()).await;
        return;
    }

    let mut lines = vec!["**Voice Channel Time Leaderboard**".to_string()];
    for (i, entry) in board.iter().enumerate() {
        let status = if entry.in_voice {
            " (currently in voice)"
        } else {
            ""
        };
        lines.push(format!(
            "{}. {}{}: {}",
            i + 1,
            entry.username,
            status,
            query::format_duration(entry.total_secs)
        ));
    }
    respond(ctx, cmd, lines.join("\n")).await;
}

async fn respond(ctx: &Context, cmd: &CommandInteraction, text: String) {
    if let Err(e) = cmd
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().content(text),
            ),
        )
        .await
    {
        error!(error = ?e, "failed to respond to interaction");
    }
}

async fn shared_tracker(ctx: &Context) -> Arc<VoiceTracker> {
    let data = ctx.data.read().await;
    data.get::<TrackerKey>()
        .expect("voice tracker missing from client data")
        .clone()
}

async fn channel_name(
    ctx: &Context,
    guild_id: serenity::model::id::GuildId,
    channel_id: serenity::model::id::ChannelId,
) -> String {
    if let Some(guild) = ctx.cache.guild(guild_id) {
        if let Some(channel) = guild.channels.get(&channel_id) {
            return channel.name.clone();
        }
    }
    channel_id.to_string()
}
