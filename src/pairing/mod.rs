//! Device linking for brand-new accounts.
//!
//! A link goes `Requested -> CodeIssuing -> CodeIssued -> AwaitingLink ->
//! Connected`, or ends in `Failed` once every code request has failed. The
//! code is handed to the caller exactly once; the first `Open` after a code
//! was issued triggers first-link setup.

use serde::Serialize;
use std::sync::Arc;

use crate::config::PairingConfig;
use crate::error::SessionError;
use crate::protocol::Connection;
use crate::session::{LiveSession, SessionManager};
use crate::settings::BotSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    Requested,
    CodeIssuing,
    CodeIssued,
    AwaitingLink,
    Connected,
    Failed,
}

impl PairingState {
    pub fn can_advance_to(self, next: PairingState) -> bool {
        use PairingState::*;
        matches!(
            (self, next),
            (Requested, CodeIssuing)
                | (CodeIssuing, CodeIssued)
                | (CodeIssuing, Failed)
                | (CodeIssued, AwaitingLink)
                | (AwaitingLink, Connected)
                | (AwaitingLink, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PairingState::Connected | PairingState::Failed)
    }
}

/// Progress of one account's link.
#[derive(Debug, Clone)]
pub struct PairingFlow {
    number: String,
    state: PairingState,
}

impl PairingFlow {
    pub fn new(number: &str) -> Self {
        Self {
            number: number.to_string(),
            state: PairingState::Requested,
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    /// Move to `next`. Illegal transitions are ignored and return `false`.
    pub fn advance(&mut self, next: PairingState) -> bool {
        if !self.state.can_advance_to(next) {
            tracing::debug!(
                "pairing for {}: ignoring transition {:?} -> {:?}",
                self.number,
                self.state,
                next
            );
            return false;
        }
        tracing::debug!("pairing for {}: {:?} -> {:?}", self.number, self.state, next);
        self.state = next;
        true
    }

    /// Record the issued code. Only the first call yields it back.
    pub fn issue(&mut self, code: String) -> Option<String> {
        self.advance(PairingState::CodeIssued).then_some(code)
    }
}

/// Ask the protocol for a pairing code, retrying with linear backoff.
pub async fn request_code(
    connection: &dyn Connection,
    number: &str,
    policy: &PairingConfig,
) -> Result<String, SessionError> {
    let attempts = policy.max_retries.max(1);
    for attempt in 1..=attempts {
        match connection.request_pairing_code(number).await {
            Ok(code) => {
                tracing::info!("pairing code issued for {} (attempt {})", number, attempt);
                return Ok(code);
            }
            Err(e) => {
                tracing::warn!(
                    "pairing code request for {} failed (attempt {}/{}): {:#}",
                    number,
                    attempt,
                    attempts,
                    e
                );
                if attempt < attempts {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
        }
    }
    Err(SessionError::PairingFailed {
        number: number.to_string(),
        attempts,
    })
}

/// Invite code from a `https://chat.whatsapp.com/<code>` link.
pub fn invite_code(link: &str) -> Option<&str> {
    let path = link.trim().split('?').next()?;
    let code = path.trim_end_matches('/').rsplit('/').next()?;
    (!code.is_empty() && !code.contains(':')).then_some(code)
}

pub fn welcome_text(number: &str, settings: &BotSettings, caption: &str, channel: &str) -> String {
    format!(
        "*{caption}*\n\n\
         ✅ Connected successfully!\n\n\
         🔢 Number: {number}\n\
         🔣 Prefix: {prefix}\n\
         🌐 Mode: {mode}\n\
         👀 Auto view status: {view}\n\
         ❤️ Auto like status: {like}\n\
         🎙️ Auto recording: {rec}\n\n\
         Type *{prefix}settings* to see your config.\n\
         📢 {channel}",
        prefix = settings.prefix,
        mode = settings.mode,
        view = on_off(settings.auto_view_status),
        like = on_off(settings.auto_like_status),
        rec = on_off(settings.auto_recording),
    )
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

/// First-link setup. Network steps are best-effort; a failure is logged and
/// the remaining steps still run.
pub async fn onboard(manager: &Arc<SessionManager>, session: &Arc<LiveSession>) {
    let number = &session.number;
    let connection = session.connection.as_ref();
    let onboarding = &manager.config().onboarding;

    if let Err(e) = manager.store().ensure_record(number) {
        tracing::warn!("failed to create config record for {}: {:#}", number, e);
    }
    if let Err(e) = manager.store().add_known(number) {
        tracing::warn!("failed to add {} to known numbers: {:#}", number, e);
    }

    if let Some(code) = onboarding.group_invite_link.as_deref().and_then(invite_code) {
        match connection.join_group(code).await {
            Ok(group) => tracing::info!("{} joined group {}", number, group),
            Err(e) => tracing::warn!("{} failed to join group: {:#}", number, e),
        }
    }

    for newsletter in &onboarding.newsletter_jids {
        if let Err(e) = connection.follow_newsletter(newsletter).await {
            tracing::warn!("{} failed to follow {}: {:#}", number, newsletter, e);
        }
    }

    let settings = manager.resolver().resolve(number);
    let text = welcome_text(number, &settings, &onboarding.caption, &onboarding.channel_link);
    if let Err(e) = connection.send_text(&session.own_jid(), &text).await {
        tracing::warn!("failed to send welcome message to {}: {:#}", number, e);
    }

    tracing::info!("first-link setup finished for {}", number);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_handed_out_once() {
        let mut flow = PairingFlow::new("263719647303");
        assert!(flow.advance(PairingState::CodeIssuing));
        assert_eq!(flow.issue("ABCD-1234".into()).as_deref(), Some("ABCD-1234"));
        assert_eq!(flow.issue("ABCD-1234".into()), None);
        assert_eq!(flow.state(), PairingState::CodeIssued);
    }

    #[test]
    fn transitions_follow_the_link_order() {
        let mut flow = PairingFlow::new("263719647303");
        assert!(!flow.advance(PairingState::Connected));
        assert!(flow.advance(PairingState::CodeIssuing));
        assert!(flow.advance(PairingState::CodeIssued));
        assert!(flow.advance(PairingState::AwaitingLink));
        assert!(flow.advance(PairingState::Connected));
        assert!(flow.state().is_terminal());
        assert!(!flow.advance(PairingState::Failed));
    }

    #[test]
    fn failure_only_from_issuing_or_waiting() {
        assert!(PairingState::CodeIssuing.can_advance_to(PairingState::Failed));
        assert!(PairingState::AwaitingLink.can_advance_to(PairingState::Failed));
        assert!(!PairingState::Requested.can_advance_to(PairingState::Failed));
    }

    #[test]
    fn invite_code_is_last_path_segment() {
        assert_eq!(
            invite_code("https://chat.whatsapp.com/BeJsVhuJFSj5P3aCbFaf4w"),
            Some("BeJsVhuJFSj5P3aCbFaf4w")
        );
        assert_eq!(invite_code("https://chat.whatsapp.com/abc/?x=1"), Some("abc"));
        assert_eq!(invite_code("   "), None);
    }

    #[test]
    fn welcome_text_lists_settings() {
        let text = welcome_text("263719647303", &BotSettings::default(), "BOT", "https://x");
        assert!(text.contains("263719647303"));
        assert!(text.contains("Prefix: ."));
        assert!(text.contains("Auto recording: off"));
    }
}
