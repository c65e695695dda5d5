//! Short-lived "waiting for a reply" registrations used by interactive
//! commands. A registration is keyed by account, chat and sender, matched at
//! most once, and ignored after its deadline. Expired entries are dropped
//! lazily on lookup and by the background sweeper.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::protocol::InboundMessage;

pub type ReplyPredicate = Box<dyn Fn(&InboundMessage) -> bool + Send + Sync>;
pub type ReplyCallback = Box<dyn FnOnce(InboundMessage) -> BoxFuture<'static, ()> + Send>;

struct Registration {
    id: u64,
    account: String,
    chat: String,
    sender: String,
    predicate: ReplyPredicate,
    callback: ReplyCallback,
    expires_at: Instant,
}

impl Registration {
    fn accepts(&self, account: &str, message: &InboundMessage) -> bool {
        self.account == account
            && self.chat == message.key.chat
            && self.sender == message.sender
            && (self.predicate)(message)
    }
}

#[derive(Default)]
pub struct InteractionBook {
    entries: Mutex<Vec<Registration>>,
    next_id: Mutex<u64>,
}

impl InteractionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for a reply from `sender` in `chat` on `account` matching
    /// `predicate`. Returns the registration id.
    pub fn register(
        &self,
        account: &str,
        chat: &str,
        sender: &str,
        ttl: Duration,
        predicate: ReplyPredicate,
        callback: ReplyCallback,
    ) -> u64 {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.entries.lock().push(Registration {
            id,
            account: account.to_string(),
            chat: chat.to_string(),
            sender: sender.to_string(),
            predicate,
            callback,
            expires_at: Instant::now() + ttl,
        });
        id
    }

    /// Remove and return the callback of the first live registration the
    /// message satisfies.
    pub fn take(&self, account: &str, message: &InboundMessage) -> Option<ReplyCallback> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|r| r.expires_at > now);
        let idx = entries.iter().position(|r| r.accepts(account, message))?;
        let registration = entries.swap_remove(idx);
        tracing::debug!("interaction {} matched on {}", registration.id, account);
        Some(registration.callback)
    }

    pub fn cancel(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|r| r.id != id);
        before != entries.len()
    }

    /// Drop expired registrations. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|r| r.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
