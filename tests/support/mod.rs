//! In-process stand-in for the protocol sidecar.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use subzero_mini::config::BotConfig;
use subzero_mini::protocol::{
    About, Connected, Connection, ConnectionEvent, Connector, DisconnectReason, InboundMessage,
    MessageKey, Presence,
};
use subzero_mini::state::{AppState, SharedState};

pub const NUMBER: &str = "263719647303";
pub const OWNER: &str = "999888777666";
pub const PAIRING_CODE: &str = "FAKE-CODE";

pub fn linked_creds() -> Value {
    json!({ "registered": true, "noiseKey": "abc" })
}

pub struct FakeConnection {
    pub number: String,
    registered: bool,
    pairing_failures: AtomicU32,
    pub pairing_requests: AtomicUsize,
    pub sent: Mutex<Vec<(String, String)>>,
    pub reactions: Mutex<Vec<(String, String)>>,
    pub reads: Mutex<Vec<String>>,
    pub presences: Mutex<Vec<(String, Presence)>>,
    pub joined: Mutex<Vec<String>>,
    pub followed: Mutex<Vec<String>>,
    pub about: Mutex<Option<About>>,
    pub closed: AtomicBool,
}

impl FakeConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent_to(&self, jid: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(to, _)| to == jid)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn is_registered(&self) -> bool {
        self.registered
    }

    async fn request_pairing_code(&self, _number: &str) -> anyhow::Result<String> {
        self.pairing_requests.fetch_add(1, Ordering::SeqCst);
        let remaining = self.pairing_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.pairing_failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("pairing service unavailable");
        }
        Ok(PAIRING_CODE.into())
    }

    async fn send_text(&self, to: &str, text: &str) -> anyhow::Result<String> {
        let mut sent = self.sent.lock();
        sent.push((to.to_string(), text.to_string()));
        Ok(format!("MSG{}", sent.len()))
    }

    async fn react(&self, key: &MessageKey, emoji: &str) -> anyhow::Result<()> {
        self.reactions.lock().push((key.id.clone(), emoji.to_string()));
        Ok(())
    }

    async fn read_messages(&self, keys: &[MessageKey]) -> anyhow::Result<()> {
        self.reads.lock().extend(keys.iter().map(|k| k.id.clone()));
        Ok(())
    }

    async fn send_presence(&self, chat: &str, presence: Presence) -> anyhow::Result<()> {
        self.presences.lock().push((chat.to_string(), presence));
        Ok(())
    }

    async fn join_group(&self, invite_code: &str) -> anyhow::Result<String> {
        self.joined.lock().push(invite_code.to_string());
        Ok("120363000000000000@g.us".into())
    }

    async fn follow_newsletter(&self, jid: &str) -> anyhow::Result<()> {
        self.followed.lock().push(jid.to_string());
        Ok(())
    }

    async fn fetch_about(&self, _jid: &str) -> anyhow::Result<Option<About>> {
        Ok(self.about.lock().clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct Opened {
    pub connection: Arc<FakeConnection>,
    pub events: mpsc::Sender<ConnectionEvent>,
}

#[derive(Default)]
pub struct FakeConnector {
    connects: AtomicUsize,
    opened: Mutex<Vec<(String, Arc<FakeConnection>, mpsc::Sender<ConnectionEvent>)>>,
    pub fail_connects: AtomicBool,
    pub pairing_failures: AtomicU32,
    pub connect_delay: Mutex<Duration>,
    /// Set when a connection opened while an earlier one for the same number
    /// was still up.
    pub overlap_seen: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connections opened for `number`, oldest first.
    pub fn opened(&self, number: &str) -> Vec<Opened> {
        self.opened
            .lock()
            .iter()
            .filter(|(n, _, _)| n == number)
            .map(|(_, connection, events)| Opened {
                connection: connection.clone(),
                events: events.clone(),
            })
            .collect()
    }

    pub fn latest(&self, number: &str) -> Opened {
        self.opened(number)
            .pop()
            .expect("no connection opened for number")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, number: &str, creds: Option<Value>) -> anyhow::Result<Connected> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connects.load(Ordering::SeqCst) {
            anyhow::bail!("sidecar unreachable");
        }

        let still_open = self
            .opened
            .lock()
            .iter()
            .any(|(n, c, _)| n == number && !c.is_closed());
        if still_open {
            self.overlap_seen.store(true, Ordering::SeqCst);
        }

        let registered = creds
            .as_ref()
            .and_then(|c| c.get("registered"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let connection = Arc::new(FakeConnection {
            number: number.to_string(),
            registered,
            pairing_failures: AtomicU32::new(self.pairing_failures.load(Ordering::SeqCst)),
            pairing_requests: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
            presences: Mutex::new(Vec::new()),
            joined: Mutex::new(Vec::new()),
            followed: Mutex::new(Vec::new()),
            about: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::channel(64);
        self.opened
            .lock()
            .push((number.to_string(), connection.clone(), tx));
        Ok(Connected {
            connection,
            events: rx,
        })
    }
}

pub fn test_config(dir: &tempfile::TempDir) -> BotConfig {
    let mut cfg: BotConfig = toml::from_str("").unwrap();
    cfg.database_path = dir.path().join("sessions.db");
    cfg.owner_number = OWNER.into();
    cfg.reconnect.cooldown_ms = 20;
    cfg.pairing.retry_base_ms = 1;
    cfg.onboarding.group_invite_link = Some("https://chat.whatsapp.com/InviteCode123".into());
    cfg.onboarding.newsletter_jids = vec!["120363402507750390@newsletter".into()];
    cfg
}

pub fn harness_with(
    cfg: BotConfig,
    connector: Arc<FakeConnector>,
) -> SharedState {
    AppState::init(cfg, connector).unwrap()
}

pub fn harness() -> (tempfile::TempDir, Arc<FakeConnector>, SharedState) {
    let dir = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new();
    let state = harness_with(test_config(&dir), connector.clone());
    (dir, connector, state)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

pub fn own_jid(number: &str) -> String {
    format!("{number}@s.whatsapp.net")
}

pub fn open_event(number: &str) -> ConnectionEvent {
    ConnectionEvent::Open {
        jid: format!("{number}:3@s.whatsapp.net"),
    }
}

pub fn close_event(code: u16) -> ConnectionEvent {
    ConnectionEvent::Close(DisconnectReason::new(Some(code), "stream closed"))
}

pub fn text_message(chat: &str, sender: &str, text: &str, from_me: bool) -> ConnectionEvent {
    ConnectionEvent::Message(InboundMessage {
        key: MessageKey {
            chat: chat.into(),
            id: format!("ID-{text}"),
            from_me,
            participant: None,
        },
        sender: sender.into(),
        push_name: None,
        text: Some(text.into()),
        timestamp: chrono::Utc::now().timestamp(),
    })
}

/// Pull the 6-digit code out of an OTP delivery message.
pub fn extract_otp(text: &str) -> String {
    text.split('*')
        .find(|part| part.len() == 6 && part.chars().all(|c| c.is_ascii_digit()))
        .expect("no OTP in message")
        .to_string()
}
