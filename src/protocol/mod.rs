//! Seam to the WhatsApp device-linking protocol.
//!
//! The session core never speaks the wire protocol itself. A [`Connector`]
//! opens one [`Connection`] per account and hands back the stream of
//! lifecycle events that connection produces.

pub mod bridge;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::store::CredentialBlob;

/// Chat that carries status (story) updates.
pub const STATUS_BROADCAST: &str = "status@broadcast";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageKey {
    /// JID of the chat the message lives in.
    pub chat: String,
    pub id: String,
    #[serde(default)]
    pub from_me: bool,
    /// Author inside group/status chats.
    #[serde(default)]
    pub participant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub key: MessageKey,
    /// JID of the author.
    pub sender: String,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl InboundMessage {
    pub fn is_status(&self) -> bool {
        self.key.chat == STATUS_BROADCAST
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("").trim()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectReason {
    /// Protocol status code of the closing stream, when there was one.
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub message: String,
}

impl DisconnectReason {
    pub const LOGGED_OUT: u16 = 401;

    pub fn new(code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Transport dropped without a protocol-level close.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    /// Explicit logout/unauthorized: the credentials are dead.
    pub fn is_logged_out(&self) -> bool {
        self.code == Some(Self::LOGGED_OUT)
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The protocol rotated its credentials; persist the new blob.
    CredsUpdate(CredentialBlob),
    /// Connection authenticated and usable. `jid` is the account's own JID.
    Open { jid: String },
    Close(DisconnectReason),
    Message(InboundMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Available,
    Composing,
    Recording,
    Paused,
}

/// Public "about" text of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct About {
    pub status: Option<String>,
    /// Unix seconds when the text was set.
    pub set_at: Option<i64>,
}

/// A live, possibly not yet linked, protocol connection for one account.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether the credentials this connection runs on are linked to a device.
    fn is_registered(&self) -> bool;

    async fn request_pairing_code(&self, number: &str) -> anyhow::Result<String>;

    /// Send plain text; returns the message id.
    async fn send_text(&self, to: &str, text: &str) -> anyhow::Result<String>;

    async fn react(&self, key: &MessageKey, emoji: &str) -> anyhow::Result<()>;

    async fn read_messages(&self, keys: &[MessageKey]) -> anyhow::Result<()>;

    async fn send_presence(&self, chat: &str, presence: Presence) -> anyhow::Result<()>;

    /// Accept a group invite; returns the group JID.
    async fn join_group(&self, invite_code: &str) -> anyhow::Result<String>;

    async fn follow_newsletter(&self, jid: &str) -> anyhow::Result<()>;

    async fn fetch_about(&self, jid: &str) -> anyhow::Result<Option<About>>;

    /// Close the underlying connection. Does not log the device out.
    async fn close(&self);
}

pub struct Connected {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection for `number`, resuming from `creds` when present.
    async fn connect(
        &self,
        number: &str,
        creds: Option<CredentialBlob>,
    ) -> anyhow::Result<Connected>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_401_is_logged_out() {
        assert!(DisconnectReason::new(Some(401), "logged out").is_logged_out());
        assert!(!DisconnectReason::new(Some(428), "closed").is_logged_out());
        assert!(!DisconnectReason::new(Some(515), "restart required").is_logged_out());
        assert!(!DisconnectReason::connection_lost("eof").is_logged_out());
    }

    #[test]
    fn status_messages_are_detected() {
        let msg = InboundMessage {
            key: MessageKey {
                chat: STATUS_BROADCAST.into(),
                id: "ABC".into(),
                from_me: false,
                participant: Some("111222333@s.whatsapp.net".into()),
            },
            sender: "111222333@s.whatsapp.net".into(),
            push_name: None,
            text: Some("  hi  ".into()),
            timestamp: 0,
        };
        assert!(msg.is_status());
        assert_eq!(msg.text(), "hi");
    }
}
