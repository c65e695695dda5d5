//! Live connection registry.
//!
//! [`SessionManager`] is the only place that creates or destroys live
//! connections. Each account number maps to a slot guarded by an async mutex:
//! whoever holds the slot is the one establishing or tearing down that
//! account, so two concurrent `ensure` calls for the same number can never
//! produce two connections. The second caller waits and then observes the
//! first caller's handle. Different numbers never contend.

pub mod supervisor;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::BotConfig;
use crate::dispatch::Dispatcher;
use crate::error::SessionError;
use crate::number;
use crate::pairing::{self, PairingFlow, PairingState};
use crate::protocol::{Connected, Connection, Connector};
use crate::settings::ConfigResolver;
use crate::store::CredentialStore;

/// In-memory handle to one account's protocol connection.
pub struct LiveSession {
    pub id: Uuid,
    pub number: String,
    pub connection: Arc<dyn Connection>,
    pub created_at: DateTime<Utc>,
    open: AtomicBool,
    /// Set once the manager tore this handle down on purpose.
    retired: AtomicBool,
    own_jid: Mutex<Option<String>>,
}

impl LiveSession {
    pub fn new(number: &str, connection: Arc<dyn Connection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            number: number.to_string(),
            connection,
            created_at: Utc::now(),
            open: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            own_jid: Mutex::new(None),
        }
    }

    /// Authenticated and usable (an `Open` event has been seen).
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// The account's own chat JID.
    pub fn own_jid(&self) -> String {
        self.own_jid
            .lock()
            .clone()
            .unwrap_or_else(|| number::jid(&self.number))
    }

    pub(crate) fn mark_open(&self, jid: &str) {
        // Strip the device suffix: 263...:12@s.whatsapp.net -> 263...@s.whatsapp.net
        let own = number::normalize(jid)
            .map(|n| number::jid(&n))
            .unwrap_or_else(|_| number::jid(&self.number));
        *self.own_jid.lock() = Some(own);
        self.open.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Whether the handle was torn down by the manager rather than dropped
    /// by the remote side.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn mark_retired(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }
}

/// How far `ensure` may go for an account without usable credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureMode {
    /// Request a pairing code when the account isn't linked yet.
    Pair,
    /// Only resume accounts whose stored credentials are already linked.
    Restore,
}

pub enum EnsureOutcome {
    /// A handle already existed; nothing was created.
    AlreadyConnected(Arc<LiveSession>),
    /// Connected from stored credentials.
    Connected(Arc<LiveSession>),
    /// New link started; `code` must be entered on the phone.
    PairingCode {
        session: Arc<LiveSession>,
        code: String,
    },
    /// `Restore` mode and nothing linked to restore.
    NotRegistered,
}

impl EnsureOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            EnsureOutcome::AlreadyConnected(s) if s.is_open() => "already_connected",
            EnsureOutcome::AlreadyConnected(_) => "pairing_in_progress",
            EnsureOutcome::Connected(_) => "connected",
            EnsureOutcome::PairingCode { .. } => "pairing_code_issued",
            EnsureOutcome::NotRegistered => "not_registered",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectResult {
    pub number: String,
    pub status: String,
}

enum SlotState {
    Empty,
    Live(Arc<LiveSession>),
    /// Removed from the registry; waiters must look the number up again.
    Retired,
}

struct Slot {
    state: tokio::sync::Mutex<SlotState>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(SlotState::Empty),
        }
    }
}

pub struct SessionManager {
    config: Arc<BotConfig>,
    store: Arc<CredentialStore>,
    resolver: Arc<ConfigResolver>,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<Dispatcher>,
    registry: Mutex<HashMap<String, Arc<Slot>>>,
    /// Accounts that got a pairing code and haven't linked yet.
    pairings: Mutex<HashMap<String, PairingFlow>>,
    /// Consecutive reconnect attempts since the last `Open`.
    reconnects: Mutex<HashMap<String, u32>>,
    shutting_down: AtomicBool,
}

impl SessionManager {
    pub fn new(
        config: Arc<BotConfig>,
        store: Arc<CredentialStore>,
        resolver: Arc<ConfigResolver>,
        connector: Arc<dyn Connector>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            resolver,
            connector,
            dispatcher,
            registry: Mutex::new(HashMap::new()),
            pairings: Mutex::new(HashMap::new()),
            reconnects: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<ConfigResolver> {
        &self.resolver
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn slot(&self, number: &str) -> Arc<Slot> {
        self.registry
            .lock()
            .entry(number.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    /// Mark `slot` retired and drop it from the registry if it is still the
    /// registered one. Caller holds the slot lock.
    fn retire(&self, number: &str, slot: &Arc<Slot>, state: &mut SlotState) {
        *state = SlotState::Retired;
        let mut registry = self.registry.lock();
        if registry.get(number).is_some_and(|cur| Arc::ptr_eq(cur, slot)) {
            registry.remove(number);
        }
    }

    /// Return the live handle for `number`, creating one if there is none.
    pub async fn ensure(
        self: &Arc<Self>,
        raw_number: &str,
        mode: EnsureMode,
    ) -> Result<EnsureOutcome, SessionError> {
        let number = number::normalize(raw_number)?;

        let session = loop {
            let slot = self.slot(&number);
            let mut state = slot.state.lock().await;
            match &*state {
                SlotState::Live(session) => {
                    return Ok(EnsureOutcome::AlreadyConnected(session.clone()));
                }
                SlotState::Retired => continue,
                SlotState::Empty => {}
            }

            match self.establish(&number, mode).await {
                Ok(Some(session)) => {
                    *state = SlotState::Live(session.clone());
                    tracing::info!(
                        "session {} registered for {} (registered={})",
                        session.id,
                        number,
                        session.connection.is_registered()
                    );
                    break session;
                }
                Ok(None) => {
                    self.retire(&number, &slot, &mut state);
                    return Ok(EnsureOutcome::NotRegistered);
                }
                Err(e) => {
                    self.retire(&number, &slot, &mut state);
                    tracing::warn!("failed to establish session for {}: {}", number, e);
                    return Err(e);
                }
            }
        };

        if session.connection.is_registered() {
            return Ok(EnsureOutcome::Connected(session));
        }

        // Brand-new account: the slot is released so concurrent callers see
        // the pending handle while the code is being requested.
        let mut flow = PairingFlow::new(&number);
        flow.advance(PairingState::CodeIssuing);
        match pairing::request_code(session.connection.as_ref(), &number, &self.config.pairing)
            .await
        {
            Ok(code) => {
                let Some(code) = flow.issue(code) else {
                    return Ok(EnsureOutcome::AlreadyConnected(session));
                };
                if let Err(e) = self.store.ensure_record(&number) {
                    self.teardown(&number, Some(session.id)).await;
                    return Err(SessionError::Store(e));
                }
                flow.advance(PairingState::AwaitingLink);
                self.pairings.lock().insert(number.clone(), flow);
                Ok(EnsureOutcome::PairingCode { session, code })
            }
            Err(e) => {
                flow.advance(PairingState::Failed);
                self.teardown(&number, Some(session.id)).await;
                Err(e)
            }
        }
    }

    /// Load credentials and open the protocol connection. `Ok(None)` means
    /// there was nothing to restore in `Restore` mode.
    async fn establish(
        self: &Arc<Self>,
        number: &str,
        mode: EnsureMode,
    ) -> Result<Option<Arc<LiveSession>>, SessionError> {
        let creds = self.store.get(number)?;
        if creds.is_none() && mode == EnsureMode::Restore {
            return Ok(None);
        }

        let Connected { connection, events } = self
            .connector
            .connect(number, creds)
            .await
            .map_err(|e| SessionError::Protocol(format!("{e:#}")))?;

        if !connection.is_registered() && mode == EnsureMode::Restore {
            tracing::info!("{} has credentials but is not linked, skipping restore", number);
            connection.close().await;
            return Ok(None);
        }

        let session = Arc::new(LiveSession::new(number, connection));
        supervisor::spawn(self.clone(), session.clone(), events);
        Ok(Some(session))
    }

    /// Close and unregister the handle for `number`. With `only`, the handle
    /// is removed only if it is that exact session. Persisted credentials are
    /// left alone. Returns whether a handle was removed.
    pub async fn teardown(&self, number: &str, only: Option<Uuid>) -> bool {
        let Some(slot) = self.registry.lock().get(number).cloned() else {
            return false;
        };
        let mut state = slot.state.lock().await;
        let session = match &*state {
            SlotState::Live(session) if only.map_or(true, |id| id == session.id) => session.clone(),
            _ => return false,
        };
        self.retire(number, &slot, &mut state);
        drop(state);

        session.mark_retired();
        session.connection.close().await;
        tracing::info!("session {} for {} torn down", session.id, number);
        true
    }

    /// Terminal end of an account: tear down and purge its record.
    pub async fn logout(&self, number: &str, only: Option<Uuid>) {
        self.teardown(number, only).await;
        self.pairings.lock().remove(number);
        self.reconnects.lock().remove(number);
        match self.store.purge(number) {
            Ok(existed) => tracing::info!("purged session record for {} (existed={})", number, existed),
            Err(e) => tracing::error!("failed to purge session record for {}: {:#}", number, e),
        }
        self.notify_logged_out(number).await;
    }

    /// Operator deletion: same as a logout, for a raw number.
    pub async fn delete(&self, raw_number: &str) -> Result<(), SessionError> {
        let number = number::normalize(raw_number)?;
        self.logout(&number, None).await;
        Ok(())
    }

    /// The dead account can't send anything itself; tell its owner through the
    /// operator's session when that one is up.
    async fn notify_logged_out(&self, number: &str) {
        let Ok(owner) = number::normalize(&self.config.owner_number) else {
            return;
        };
        if owner == number {
            return;
        }
        let Some(owner_session) = self.get(&owner).filter(|s| s.is_open()) else {
            tracing::debug!("no operator session to notify {} about logout", number);
            return;
        };
        let text = format!(
            "⚠️ Your bot session for {number} was logged out and its saved session has been removed. Pair again to reconnect."
        );
        if let Err(e) = owner_session
            .connection
            .send_text(&number::jid(number), &text)
            .await
        {
            tracing::warn!("failed to notify {} about logout: {:#}", number, e);
        }
    }

    /// The registered handle for `number`, if any. Slots busy connecting or
    /// tearing down count as absent.
    pub fn get(&self, number: &str) -> Option<Arc<LiveSession>> {
        let slot = self.registry.lock().get(number).cloned()?;
        let state = slot.state.try_lock().ok()?;
        match &*state {
            SlotState::Live(session) => Some(session.clone()),
            _ => None,
        }
    }

    pub fn has_handle(&self, number: &str) -> bool {
        self.get(number).is_some()
    }

    /// Numbers with an open connection, sorted.
    pub fn active_numbers(&self) -> Vec<String> {
        let slots: Vec<(String, Arc<Slot>)> = self
            .registry
            .lock()
            .iter()
            .map(|(n, s)| (n.clone(), s.clone()))
            .collect();
        let mut numbers: Vec<String> = slots
            .into_iter()
            .filter(|(_, slot)| {
                slot.state
                    .try_lock()
                    .is_ok_and(|state| matches!(&*state, SlotState::Live(s) if s.is_open()))
            })
            .map(|(n, _)| n)
            .collect();
        numbers.sort();
        numbers
    }

    /// Number of registry slots, including ones still connecting or awaiting
    /// a link.
    pub fn handle_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Run `ensure(Restore)` for every number lacking a handle, concurrently
    /// and independently.
    pub async fn connect_numbers(self: &Arc<Self>, numbers: Vec<String>) -> Vec<ConnectResult> {
        let tasks = numbers.into_iter().map(|number| {
            let manager = self.clone();
            async move {
                if manager.has_handle(&number) {
                    return ConnectResult {
                        number,
                        status: "already_connected".into(),
                    };
                }
                let status = match manager.ensure(&number, EnsureMode::Restore).await {
                    Ok(outcome) => outcome.status().to_string(),
                    Err(e) => {
                        tracing::warn!("connect failed for {}: {}", number, e);
                        format!("failed: {e}")
                    }
                };
                ConnectResult { number, status }
            }
        });
        join_all(tasks).await
    }

    /// Bring back every persisted Account Session. One account's failure does
    /// not affect the others.
    pub async fn restore_all(self: &Arc<Self>) -> anyhow::Result<Vec<ConnectResult>> {
        let numbers = self.store.numbers()?;
        tracing::info!("restoring {} stored session(s)", numbers.len());
        let results = self.connect_numbers(numbers).await;
        let restored = results.iter().filter(|r| r.status == "connected").count();
        tracing::info!("restored {}/{} session(s)", restored, results.len());
        Ok(results)
    }

    /// Close every connection without touching persisted credentials.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let numbers: Vec<String> = self.registry.lock().keys().cloned().collect();
        for number in numbers {
            self.teardown(&number, None).await;
        }
        tracing::info!("all sessions closed");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Complete a pending pairing, if this account had one.
    pub(crate) fn take_pairing(&self, number: &str) -> Option<PairingFlow> {
        let mut flow = self.pairings.lock().remove(number)?;
        flow.advance(PairingState::Connected);
        Some(flow)
    }

    /// Abandon a pending pairing whose connection went away before linking.
    pub(crate) fn fail_pairing(&self, number: &str) {
        let Some(mut flow) = self.pairings.lock().remove(number) else {
            return;
        };
        flow.advance(PairingState::Failed);
        tracing::info!("pairing for {} abandoned before the device linked", number);
    }

    pub fn pairing_state(&self, number: &str) -> Option<PairingState> {
        self.pairings.lock().get(number).map(PairingFlow::state)
    }

    pub(crate) fn record_reconnect_attempt(&self, number: &str) -> u32 {
        let mut map = self.reconnects.lock();
        let count = map.entry(number.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub(crate) fn reset_reconnects(&self, number: &str) {
        self.reconnects.lock().remove(number);
    }
}
