use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::rate_limit::RateLimiter;
use crate::config::BotConfig;
use crate::dispatch::Dispatcher;
use crate::protocol::Connector;
use crate::session::SessionManager;
use crate::settings::ConfigResolver;
use crate::store::CredentialStore;

/// `/verify-otp` attempts allowed per number within [`VERIFY_WINDOW`].
pub const VERIFY_MAX_ATTEMPTS: usize = 5;
pub const VERIFY_WINDOW: Duration = Duration::from_secs(15 * 60);

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub config: Arc<BotConfig>,
    pub store: Arc<CredentialStore>,
    pub resolver: Arc<ConfigResolver>,
    pub manager: Arc<SessionManager>,
    pub verify_limiter: RateLimiter,
}

impl AppState {
    /// Open the store and wire up the session core. A store that can't be
    /// opened is fatal.
    pub fn init(config: BotConfig, connector: Arc<dyn Connector>) -> anyhow::Result<SharedState> {
        let store = Arc::new(
            CredentialStore::open(&config.database_path).with_context(|| {
                format!(
                    "failed to open credential store at {}",
                    config.database_path.display()
                )
            })?,
        );
        Ok(Self::with_store(config, store, connector, Dispatcher::new()))
    }

    pub fn with_store(
        config: BotConfig,
        store: Arc<CredentialStore>,
        connector: Arc<dyn Connector>,
        dispatcher: Dispatcher,
    ) -> SharedState {
        let config = Arc::new(config);
        let resolver = Arc::new(ConfigResolver::new(
            store.clone(),
            config.defaults.clone(),
            config.otp_expiry(),
        ));
        let manager = SessionManager::new(
            config.clone(),
            store.clone(),
            resolver.clone(),
            connector,
            Arc::new(dispatcher),
        );
        Arc::new(Self {
            config,
            store,
            resolver,
            manager,
            verify_limiter: RateLimiter::new(VERIFY_WINDOW, VERIFY_MAX_ATTEMPTS),
        })
    }
}
