//! Per-session event loop.
//!
//! One task per live connection drains its event stream: persists credential
//! rotations, marks the session open, hands messages to the dispatcher and,
//! when the connection closes, decides between purging the account and
//! scheduling a reconnect.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{EnsureMode, EnsureOutcome, LiveSession, SessionManager};
use crate::dispatch::CommandContext;
use crate::pairing;
use crate::protocol::{ConnectionEvent, DisconnectReason};
use crate::store::CredentialBlob;

const CREDS_WRITE_ATTEMPTS: u32 = 3;

pub(crate) fn spawn(
    manager: Arc<SessionManager>,
    session: Arc<LiveSession>,
    events: mpsc::Receiver<ConnectionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(run(manager, session, events))
}

async fn run(
    manager: Arc<SessionManager>,
    session: Arc<LiveSession>,
    mut events: mpsc::Receiver<ConnectionEvent>,
) {
    let number = session.number.clone();
    tracing::debug!("supervisor started for {} (session {})", number, session.id);

    let reason = loop {
        let Some(event) = events.recv().await else {
            break DisconnectReason::connection_lost("event stream ended");
        };
        match event {
            ConnectionEvent::CredsUpdate(blob) => persist_creds(&manager, &number, &blob).await,
            ConnectionEvent::Open { jid } => on_open(&manager, &session, &jid),
            ConnectionEvent::Message(message) => {
                let dispatcher = manager.dispatcher().clone();
                let ctx = CommandContext::new(manager.clone(), session.clone(), message);
                tokio::spawn(async move { dispatcher.dispatch(ctx).await });
            }
            ConnectionEvent::Close(reason) => break reason,
        }
    };

    session.mark_closed();
    if session.is_retired() {
        tracing::debug!("session {} for {} closed locally", session.id, number);
        return;
    }
    on_close(&manager, &session, reason).await;
}

/// Every rotation is persisted; a failed write is retried a couple of times
/// and then logged, leaving the previous blob in place.
async fn persist_creds(manager: &SessionManager, number: &str, blob: &CredentialBlob) {
    let observed_at = Utc::now();
    for attempt in 1..=CREDS_WRITE_ATTEMPTS {
        match manager.store().put(number, blob, observed_at) {
            Ok(true) => {
                tracing::debug!("credentials saved for {}", number);
                return;
            }
            Ok(false) => {
                tracing::debug!("stale credential update for {} discarded", number);
                return;
            }
            Err(e) if attempt < CREDS_WRITE_ATTEMPTS => {
                tracing::warn!(
                    "credential write for {} failed (attempt {}/{}): {:#}",
                    number,
                    attempt,
                    CREDS_WRITE_ATTEMPTS,
                    e
                );
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
            Err(e) => {
                tracing::error!("giving up on credential write for {}: {:#}", number, e);
            }
        }
    }
}

fn on_open(manager: &Arc<SessionManager>, session: &Arc<LiveSession>, jid: &str) {
    let number = &session.number;
    session.mark_open(jid);
    manager.reset_reconnects(number);
    tracing::info!("{} connected (session {})", number, session.id);

    if let Err(e) = manager.store().touch_active(number) {
        tracing::warn!("failed to record activity for {}: {:#}", number, e);
    }
    if let Err(e) = manager.store().add_known(number) {
        tracing::warn!("failed to add {} to known numbers: {:#}", number, e);
    }

    if manager.take_pairing(number).is_some() {
        let manager = manager.clone();
        let session = session.clone();
        tokio::spawn(async move { pairing::onboard(&manager, &session).await });
    }
}

async fn on_close(manager: &Arc<SessionManager>, session: &Arc<LiveSession>, reason: DisconnectReason) {
    let number = session.number.clone();

    if reason.is_logged_out() {
        tracing::warn!("{} logged out ({}), purging session", number, reason.message);
        manager.logout(&number, Some(session.id)).await;
        return;
    }

    if manager.is_shutting_down() {
        return;
    }

    tracing::info!(
        "{} disconnected (code {:?}: {}), scheduling reconnect",
        number,
        reason.code,
        reason.message
    );

    let policy = manager.config().reconnect.clone();
    let mut first_try = true;
    loop {
        let attempt = manager.record_reconnect_attempt(&number);
        if policy.max_attempts.is_some_and(|max| attempt > max) {
            tracing::warn!("{} exceeded {} reconnect attempts, giving up", number, attempt - 1);
            manager.teardown(&number, Some(session.id)).await;
            manager.reset_reconnects(&number);
            manager.fail_pairing(&number);
            return;
        }

        tokio::time::sleep(policy.cooldown()).await;
        // Torn down by someone else while we waited.
        if manager.is_shutting_down() || (first_try && session.is_retired()) {
            return;
        }
        first_try = false;

        // The stale handle must be gone before a new one can be registered.
        manager.teardown(&number, Some(session.id)).await;

        match manager.ensure(&number, EnsureMode::Restore).await {
            Ok(EnsureOutcome::NotRegistered) => {
                tracing::warn!("{} has no linked credentials, not reconnecting", number);
                manager.reset_reconnects(&number);
                manager.fail_pairing(&number);
                return;
            }
            Ok(outcome) => {
                tracing::info!("{} reconnect attempt {}: {}", number, attempt, outcome.status());
                return;
            }
            Err(e) => {
                tracing::warn!("{} reconnect attempt {} failed: {}", number, attempt, e);
            }
        }
    }
}
