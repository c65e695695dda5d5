use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use rand::RngExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::{CommandContext, CommandHandler, HandlerKind};
use crate::protocol::{InboundMessage, Presence};
use crate::settings::{BotSettings, Mode};

const MAX_PREFIX_LEN: usize = 3;
const MODE_REPLY_TTL: Duration = Duration::from_secs(60);

pub fn builtin() -> Vec<Arc<dyn CommandHandler>> {
    vec![
        Arc::new(StatusReaction),
        Arc::new(AutoRecording),
        Arc::new(Ping),
        Arc::new(Settings),
        Arc::new(SetPrefix),
        Arc::new(ModeCommand),
        Arc::new(DeleteMe),
    ]
}

/// View and react to status updates.
pub struct StatusReaction;

#[async_trait]
impl CommandHandler for StatusReaction {
    fn name(&self) -> &str {
        "status"
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Hook
    }

    fn matches(&self, ctx: &CommandContext) -> bool {
        ctx.message.is_status()
            && !ctx.message.key.from_me
            && (ctx.settings.auto_view_status || ctx.settings.auto_like_status)
    }

    async fn handle(&self, ctx: &CommandContext) -> anyhow::Result<()> {
        let key = &ctx.message.key;
        if ctx.settings.auto_view_status {
            ctx.connection().read_messages(std::slice::from_ref(key)).await?;
        }
        if ctx.settings.auto_like_status {
            if let Some(emoji) = pick_emoji(&ctx.settings.auto_like_emoji) {
                ctx.connection().react(key, emoji).await?;
                tracing::debug!("{}: reacted {} to status {}", ctx.number(), emoji, key.id);
            }
        }
        Ok(())
    }
}

fn pick_emoji(choices: &[String]) -> Option<&str> {
    if choices.is_empty() {
        return None;
    }
    let idx = rand::rng().random_range(0..choices.len());
    choices.get(idx).map(String::as_str)
}

/// Show a "recording audio" presence in chats that message the account.
pub struct AutoRecording;

#[async_trait]
impl CommandHandler for AutoRecording {
    fn name(&self) -> &str {
        "recording"
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Hook
    }

    fn matches(&self, ctx: &CommandContext) -> bool {
        ctx.settings.auto_recording && !ctx.message.is_status() && !ctx.message.key.from_me
    }

    async fn handle(&self, ctx: &CommandContext) -> anyhow::Result<()> {
        ctx.connection()
            .send_presence(&ctx.message.key.chat, Presence::Recording)
            .await
    }
}

pub struct Ping;

#[async_trait]
impl CommandHandler for Ping {
    fn name(&self) -> &str {
        "ping"
    }

    async fn handle(&self, ctx: &CommandContext) -> anyhow::Result<()> {
        let latency_ms = if ctx.message.timestamp > 0 {
            (Utc::now().timestamp_millis() - ctx.message.timestamp * 1000).max(0)
        } else {
            0
        };
        ctx.reply(&format!("🏓 Pong! {latency_ms}ms")).await
    }
}

pub fn settings_text(number: &str, settings: &BotSettings) -> String {
    format!(
        "⚙️ *SETTINGS* for {number}\n\n\
         Prefix: {}\n\
         Mode: {}\n\
         Auto view status: {}\n\
         Auto like status: {}\n\
         Auto recording: {}\n\
         Status emoji: {}",
        settings.prefix,
        settings.mode,
        settings.auto_view_status,
        settings.auto_like_status,
        settings.auto_recording,
        settings.auto_like_emoji.join(" "),
    )
}

pub struct Settings;

#[async_trait]
impl CommandHandler for Settings {
    fn name(&self) -> &str {
        "settings"
    }

    async fn handle(&self, ctx: &CommandContext) -> anyhow::Result<()> {
        ctx.reply(&settings_text(ctx.number(), &ctx.settings)).await
    }
}

pub struct SetPrefix;

#[async_trait]
impl CommandHandler for SetPrefix {
    fn name(&self) -> &str {
        "setprefix"
    }

    async fn handle(&self, ctx: &CommandContext) -> anyhow::Result<()> {
        if !ctx.is_privileged() {
            return ctx.reply("❌ Only the bot owner can change the prefix.").await;
        }
        let Some(prefix) = ctx.args().first() else {
            return ctx
                .reply(&format!("Usage: {}setprefix <symbol>", ctx.settings.prefix))
                .await;
        };
        if prefix.chars().count() > MAX_PREFIX_LEN {
            return ctx
                .reply(&format!("❌ Prefix must be at most {MAX_PREFIX_LEN} characters."))
                .await;
        }
        ctx.manager
            .resolver()
            .set(ctx.number(), "prefix", json!(prefix))?;
        ctx.reply(&format!("✅ Prefix changed to *{prefix}*")).await
    }
}

/// `mode public|private` sets directly; bare `mode` asks and waits for a
/// numbered reply from the same sender.
pub struct ModeCommand;

#[async_trait]
impl CommandHandler for ModeCommand {
    fn name(&self) -> &str {
        "mode"
    }

    async fn handle(&self, ctx: &CommandContext) -> anyhow::Result<()> {
        if !ctx.is_privileged() {
            return ctx.reply("❌ Only the bot owner can change the mode.").await;
        }

        if let Some(arg) = ctx.args().first() {
            return match arg.parse::<Mode>() {
                Ok(mode) => apply_mode(ctx, mode).await,
                Err(_) => ctx.reply("❌ Mode must be *public* or *private*.").await,
            };
        }

        let manager = ctx.manager.clone();
        let session = ctx.session.clone();
        let interactions = ctx.manager.dispatcher().interactions();
        let registration = interactions.register(
            ctx.number(),
            &ctx.message.key.chat,
            &ctx.message.sender,
            MODE_REPLY_TTL,
            Box::new(|m: &InboundMessage| matches!(m.text(), "1" | "2")),
            Box::new(move |reply: InboundMessage| {
                async move {
                    let mode = if reply.text() == "1" {
                        Mode::Public
                    } else {
                        Mode::Private
                    };
                    let ctx = CommandContext::new(manager, session, reply);
                    if let Err(e) = apply_mode(&ctx, mode).await {
                        tracing::warn!("{}: failed to apply mode: {:#}", ctx.number(), e);
                    }
                }
                .boxed()
            }),
        );

        let prompt = format!(
            "🌐 Current mode: *{}*\n\nReply with:\n1. Public\n2. Private",
            ctx.settings.mode
        );
        if let Err(e) = ctx.reply(&prompt).await {
            interactions.cancel(registration);
            return Err(e);
        }
        Ok(())
    }
}

async fn apply_mode(ctx: &CommandContext, mode: Mode) -> anyhow::Result<()> {
    ctx.manager
        .resolver()
        .set(ctx.number(), "mode", json!(mode))?;
    ctx.reply(&format!("✅ Mode set to *{mode}*")).await
}

/// Log the account out and delete its stored session.
pub struct DeleteMe;

#[async_trait]
impl CommandHandler for DeleteMe {
    fn name(&self) -> &str {
        "deleteme"
    }

    async fn handle(&self, ctx: &CommandContext) -> anyhow::Result<()> {
        if !ctx.is_privileged() {
            return ctx.reply("❌ Only the bot owner can delete this session.").await;
        }
        if let Err(e) = ctx
            .reply("🗑️ Your session is being deleted. Pair again to reconnect.")
            .await
        {
            tracing::debug!("{}: deleteme notice not sent: {:#}", ctx.number(), e);
        }
        tracing::info!("{}: session deletion requested from chat", ctx.number());
        ctx.manager.logout(ctx.number(), Some(ctx.session.id)).await;
        Ok(())
    }
}
