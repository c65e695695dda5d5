//! Per-account configuration resolution.
//!
//! The resolved config is never stored: every call overlays the account's
//! sparse override mapping on a fresh copy of the process-wide defaults, so
//! the override mapping stays the single source of truth.

pub mod otp;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::Connection;
use crate::store::{CredentialStore, Overrides};
use otp::{OtpBook, OtpChallenge, OtpError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Anyone may invoke commands.
    #[default]
    Public,
    /// Only the account itself and the operator.
    Private,
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Mode::Public),
            "private" => Ok(Mode::Private),
            other => anyhow::bail!("unknown mode `{other}` (expected public or private)"),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Public => f.write_str("public"),
            Mode::Private => f.write_str("private"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotSettings {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "enabled")]
    pub auto_view_status: bool,
    #[serde(default = "enabled")]
    pub auto_like_status: bool,
    #[serde(default)]
    pub auto_recording: bool,
    #[serde(default = "default_emoji")]
    pub auto_like_emoji: Vec<String>,
    /// Options the core doesn't interpret; carried through for command plug-ins.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_prefix() -> String {
    ".".into()
}

fn enabled() -> bool {
    true
}

fn default_emoji() -> Vec<String> {
    ["💋", "🍬", "🫆", "💗", "🎈", "🎉", "🥳", "❤️", "🧫", "🐭"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            mode: Mode::default(),
            auto_view_status: true,
            auto_like_status: true,
            auto_recording: false,
            auto_like_emoji: default_emoji(),
            extra: BTreeMap::new(),
        }
    }
}

/// Overlay `overrides` on `defaults` key by key. A key whose value does not
/// fit the option's type is skipped so one bad key can't hide the others.
pub fn merge(defaults: &BotSettings, overrides: &Overrides) -> BotSettings {
    let mut base = match serde_json::to_value(defaults) {
        Ok(Value::Object(map)) => map,
        _ => return defaults.clone(),
    };

    for (key, value) in overrides {
        let previous = base.insert(key.clone(), value.clone());
        if serde_json::from_value::<BotSettings>(Value::Object(base.clone())).is_err() {
            tracing::warn!("ignoring override `{}`: value {} has the wrong type", key, value);
            match previous {
                Some(prev) => base.insert(key.clone(), prev),
                None => base.remove(key),
            };
        }
    }

    serde_json::from_value(Value::Object(base)).unwrap_or_else(|_| defaults.clone())
}

/// Accept a config payload only if it is a JSON object.
pub fn parse_overrides(raw: &str) -> Result<Overrides, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("config must be a JSON object".into()),
        Err(e) => Err(format!("invalid JSON config: {e}")),
    }
}

pub struct ConfigResolver {
    store: Arc<CredentialStore>,
    defaults: BotSettings,
    otp: OtpBook,
    otp_ttl: Duration,
}

impl ConfigResolver {
    pub fn new(store: Arc<CredentialStore>, defaults: BotSettings, otp_ttl: Duration) -> Self {
        Self {
            store,
            defaults,
            otp: OtpBook::new(),
            otp_ttl,
        }
    }

    pub fn defaults(&self) -> &BotSettings {
        &self.defaults
    }

    /// Resolved config for `number`. Never fails: any read problem yields the
    /// defaults.
    pub fn resolve(&self, number: &str) -> BotSettings {
        match self.store.overrides(number) {
            Ok(Some(overrides)) => merge(&self.defaults, &overrides),
            Ok(None) => self.defaults.clone(),
            Err(e) => {
                tracing::warn!("config read failed for {}, using defaults: {:#}", number, e);
                self.defaults.clone()
            }
        }
    }

    /// Replace the override mapping for `number`.
    pub fn update(&self, number: &str, overrides: &Overrides) -> anyhow::Result<()> {
        self.store.put_overrides(number, overrides)
    }

    /// Set a single option, keeping the other overrides.
    pub fn set(&self, number: &str, key: &str, value: Value) -> anyhow::Result<()> {
        let mut overrides = self.store.overrides(number)?.unwrap_or_else(Map::new);
        overrides.insert(key.to_string(), value);
        self.update(number, &overrides)
    }

    /// Start a gated config change: deliver a one-time code to the account's
    /// own chat and remember the pending payload. Nothing is stored if the
    /// code can't be delivered.
    pub async fn request_change(
        &self,
        number: &str,
        own_jid: &str,
        pending: Overrides,
        connection: &dyn Connection,
    ) -> anyhow::Result<()> {
        let (code, challenge) = OtpChallenge::new(pending, self.otp_ttl);
        let minutes = (self.otp_ttl.as_secs() / 60).max(1);
        let text = format!(
            "🔐 *CONFIG UPDATE*\n\nYour OTP for the config update is: *{code}*\nThis OTP will expire in {minutes} minute(s)."
        );
        connection.send_text(own_jid, &text).await?;
        self.otp.insert(number, challenge);
        tracing::info!("config change OTP issued for {}", number);
        Ok(())
    }

    /// Validate `code` and apply the pending payload.
    pub fn confirm_change(&self, number: &str, code: &str) -> Result<Overrides, ConfirmError> {
        let pending = self.otp.confirm(number, code)?;
        self.update(number, &pending).map_err(ConfirmError::Store)?;
        tracing::info!("config change applied for {}", number);
        Ok(pending)
    }

    pub fn has_pending(&self, number: &str) -> bool {
        self.otp.is_pending(number)
    }

    /// Drop expired challenges.
    pub fn sweep(&self) -> usize {
        self.otp.sweep()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfirmError {
    #[error(transparent)]
    Otp(#[from] OtpError),
    #[error("failed to store config: {0:#}")]
    Store(anyhow::Error),
}
