use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::settings::BotSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    /// Operator number; always allowed to run commands and notified on logouts.
    #[serde(default = "default_owner")]
    pub owner_number: String,
    /// Process-wide defaults every account's overrides are layered on.
    #[serde(default)]
    pub defaults: BotSettings,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default = "default_otp_expiry_ms")]
    pub otp_expiry_ms: u64,
    #[serde(default)]
    pub onboarding: OnboardingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PairingConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_pairing_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_ms: default_pairing_retry_base_ms(),
        }
    }
}

impl PairingConfig {
    /// Backoff before retry `attempt` (1-based): `attempt * base`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_ms.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Unset means retry forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_reconnect_cooldown_ms(),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// First-link setup: where a freshly paired account is sent.
#[derive(Debug, Deserialize, Clone)]
pub struct OnboardingConfig {
    #[serde(default = "default_group_invite_link")]
    pub group_invite_link: Option<String>,
    #[serde(default = "default_newsletter_jids")]
    pub newsletter_jids: Vec<String>,
    #[serde(default = "default_channel_link")]
    pub channel_link: String,
    #[serde(default = "default_caption")]
    pub caption: String,
}

impl Default for OnboardingConfig {
    fn default() -> Self {
        Self {
            group_invite_link: default_group_invite_link(),
            newsletter_jids: default_newsletter_jids(),
            channel_link: default_channel_link(),
            caption: default_caption(),
        }
    }
}

impl BotConfig {
    pub fn otp_expiry(&self) -> Duration {
        Duration::from_millis(self.otp_expiry_ms)
    }
}

// Default functions
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    5000
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/sessions.db")
}
fn default_bridge_url() -> String {
    "ws://127.0.0.1:7070".into()
}
fn default_owner() -> String {
    "263719647303".into()
}
fn default_max_retries() -> u32 {
    3
}
fn default_pairing_retry_base_ms() -> u64 {
    2_000
}
fn default_reconnect_cooldown_ms() -> u64 {
    10_000
}
fn default_otp_expiry_ms() -> u64 {
    300_000
}
fn default_group_invite_link() -> Option<String> {
    Some("https://chat.whatsapp.com/BeJsVhuJFSj5P3aCbFaf4w".into())
}
fn default_newsletter_jids() -> Vec<String> {
    vec!["120363402507750390@newsletter".into()]
}
fn default_channel_link() -> String {
    "https://whatsapp.com/channel/0029VagQEmB002T7MWo3Sj1D".into()
}
fn default_caption() -> String {
    "SUBZERO MD MINI".into()
}

/// Parse a list given either as a JSON array or as comma-separated values.
pub fn parse_list(raw: &str) -> Vec<String> {
    if let Ok(items) = serde_json::from_str::<Vec<String>>(raw) {
        return items;
    }
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Load config from TOML file with env var overrides.
pub fn load(path: &str) -> anyhow::Result<BotConfig> {
    let content = if std::path::Path::new(path).exists() {
        std::fs::read_to_string(path)?
    } else {
        tracing::warn!("Config file not found at {}, using defaults", path);
        String::new()
    };

    let mut config: BotConfig = toml::from_str(&content)?;
    apply_env(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Env var overrides. Takes a lookup function so tests don't touch the process env.
pub fn apply_env(
    config: &mut BotConfig,
    var: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = var("HOST") {
        config.host = v;
    }
    if let Some(v) = var("PORT") {
        config.port = v.parse()?;
    }
    if let Some(v) = var("DATABASE_PATH") {
        config.database_path = PathBuf::from(v);
    }
    if let Some(v) = var("BRIDGE_URL") {
        config.bridge_url = v;
    }
    if let Some(v) = var("OWNER_NUMBER") {
        config.owner_number = v;
    }
    if let Some(v) = var("PREFIX") {
        config.defaults.prefix = v;
    }
    if let Some(v) = var("MODE") {
        config.defaults.mode = v.parse()?;
    }
    if let Some(v) = var("AUTO_VIEW_STATUS") {
        config.defaults.auto_view_status = parse_flag(&v);
    }
    if let Some(v) = var("AUTO_LIKE_STATUS") {
        config.defaults.auto_like_status = parse_flag(&v);
    }
    if let Some(v) = var("AUTO_RECORDING") {
        config.defaults.auto_recording = parse_flag(&v);
    }
    if let Some(v) = var("AUTO_LIKE_EMOJI") {
        config.defaults.auto_like_emoji = parse_list(&v);
    }
    if let Some(v) = var("MAX_RETRIES") {
        config.pairing.max_retries = v.parse()?;
    }
    if let Some(v) = var("PAIRING_RETRY_BASE_MS") {
        config.pairing.retry_base_ms = v.parse()?;
    }
    if let Some(v) = var("RECONNECT_COOLDOWN_MS") {
        config.reconnect.cooldown_ms = v.parse()?;
    }
    if let Some(v) = var("MAX_RECONNECT_ATTEMPTS") {
        config.reconnect.max_attempts = Some(v.parse()?);
    }
    if let Some(v) = var("OTP_EXPIRY") {
        config.otp_expiry_ms = v.parse()?;
    }
    if let Some(v) = var("NEWSLETTER_JID") {
        config.onboarding.newsletter_jids = parse_list(&v);
    }
    if let Some(v) = var("GROUP_INVITE_LINK") {
        config.onboarding.group_invite_link = Some(v).filter(|s| !s.trim().is_empty());
    }
    if let Some(v) = var("CHANNEL_LINK") {
        config.onboarding.channel_link = v;
    }
    if let Some(v) = var("CAPTION") {
        config.onboarding.caption = v;
    }
    Ok(())
}
