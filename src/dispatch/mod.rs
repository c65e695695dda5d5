//! Inbound message routing.
//!
//! Every message event of a live session ends up in [`Dispatcher::dispatch`]
//! with the account's freshly resolved settings. A pending interaction
//! registration gets first claim on the message; otherwise every handler
//! whose predicate matches runs in registration order. Handlers are
//! independent: one failing is logged and does not stop the rest.

pub mod commands;
pub mod interactions;

use async_trait::async_trait;
use std::sync::Arc;

use crate::number;
use crate::protocol::{Connection, InboundMessage};
use crate::session::{LiveSession, SessionManager};
use crate::settings::{BotSettings, Mode};
use interactions::InteractionBook;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
}

impl ParsedCommand {
    /// `.SetPrefix !` with prefix `.` -> name `setprefix`, args `["!"]`.
    pub fn parse(text: &str, prefix: &str) -> Option<Self> {
        if prefix.is_empty() {
            return None;
        }
        let rest = text.trim().strip_prefix(prefix)?;
        let mut words = rest.split_whitespace();
        let name = words.next()?.to_lowercase();
        Some(Self {
            name,
            args: words.map(String::from).collect(),
        })
    }
}

/// Everything a handler sees for one inbound message.
pub struct CommandContext {
    pub manager: Arc<SessionManager>,
    pub session: Arc<LiveSession>,
    pub settings: BotSettings,
    pub message: InboundMessage,
    pub command: Option<ParsedCommand>,
}

impl CommandContext {
    pub fn new(
        manager: Arc<SessionManager>,
        session: Arc<LiveSession>,
        message: InboundMessage,
    ) -> Self {
        let settings = manager.resolver().resolve(&session.number);
        let command = ParsedCommand::parse(message.text(), &settings.prefix);
        Self {
            manager,
            session,
            settings,
            message,
            command,
        }
    }

    /// The account this message arrived on.
    pub fn number(&self) -> &str {
        &self.session.number
    }

    pub fn connection(&self) -> &dyn Connection {
        self.session.connection.as_ref()
    }

    pub fn args(&self) -> &[String] {
        self.command.as_ref().map(|c| c.args.as_slice()).unwrap_or(&[])
    }

    /// The account itself or the operator.
    pub fn is_privileged(&self) -> bool {
        if self.message.key.from_me {
            return true;
        }
        let Ok(sender) = number::normalize(&self.message.sender) else {
            return false;
        };
        sender == self.session.number
            || number::normalize(&self.manager.config().owner_number).is_ok_and(|owner| owner == sender)
    }

    /// Whether the sender may invoke commands under the account's mode.
    pub fn may_invoke(&self) -> bool {
        match self.settings.mode {
            Mode::Public => true,
            Mode::Private => self.is_privileged(),
        }
    }

    /// Reply in the chat the message came from.
    pub async fn reply(&self, text: &str) -> anyhow::Result<()> {
        self.connection()
            .send_text(&self.message.key.chat, text)
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Invoked by name with the prefix; subject to the account mode.
    Command,
    /// Runs on every matching message regardless of mode.
    Hook,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> HandlerKind {
        HandlerKind::Command
    }

    fn matches(&self, ctx: &CommandContext) -> bool {
        ctx.command.as_ref().is_some_and(|c| c.name == self.name())
    }

    async fn handle(&self, ctx: &CommandContext) -> anyhow::Result<()>;
}

pub struct Dispatcher {
    handlers: Vec<Arc<dyn CommandHandler>>,
    interactions: Arc<InteractionBook>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_handlers(commands::builtin())
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handlers(handlers: Vec<Arc<dyn CommandHandler>>) -> Self {
        Self {
            handlers,
            interactions: Arc::new(InteractionBook::new()),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.handlers.push(handler);
    }

    pub fn interactions(&self) -> &Arc<InteractionBook> {
        &self.interactions
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub async fn dispatch(&self, ctx: CommandContext) {
        if !ctx.message.is_status() {
            if let Some(callback) = self.interactions.take(ctx.number(), &ctx.message) {
                callback(ctx.message.clone()).await;
                return;
            }
        }

        for handler in &self.handlers {
            if !handler.matches(&ctx) {
                continue;
            }
            if handler.kind() == HandlerKind::Command && !ctx.may_invoke() {
                tracing::debug!(
                    "{}: ignoring `{}` from {} in private mode",
                    ctx.number(),
                    handler.name(),
                    ctx.message.sender
                );
                continue;
            }
            if let Err(e) = handler.handle(&ctx).await {
                tracing::warn!("{}: handler `{}` failed: {:#}", ctx.number(), handler.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixed_commands() {
        let cmd = ParsedCommand::parse(".SetPrefix  !", ".").unwrap();
        assert_eq!(cmd.name, "setprefix");
        assert_eq!(cmd.args, vec!["!"]);

        assert_eq!(ParsedCommand::parse("!ping", "!").unwrap().name, "ping");
        assert!(ParsedCommand::parse("ping", ".").is_none());
        assert!(ParsedCommand::parse(".", ".").is_none());
        assert!(ParsedCommand::parse(".ping", "").is_none());
    }

    #[test]
    fn builtins_are_registered() {
        let dispatcher = Dispatcher::new();
        let names = dispatcher.handler_names();
        for expected in ["status", "recording", "ping", "settings", "setprefix", "mode", "deleteme"] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }
}
