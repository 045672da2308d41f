//! Transport host surface
//!
//! One WebSocket endpoint carries all realtime traffic; `/healthz` is
//! for probes. Admin CRUD lives in a separate service.

pub mod ws;

use crate::agents::AgentManager;
use crate::auth::{AuthVerifier, TokenVerifier};
use crate::config::Config;
use crate::db::Database;
use crate::dispatch::Dispatcher;
use crate::fetch::{ByteFetcher, HttpFetcher};
use crate::hub::Hub;
use crate::llm::{GeminiClient, Generator, ModelRegistry};
use crate::matcher::Matcher;
use crate::notify::Notifier;
use crate::presence::PresenceRegistry;
use crate::proactive::ProactiveOrchestrator;
use crate::session::AssignmentCache;
use crate::spool::Spool;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub hub: Arc<Hub>,
    pub dispatcher: Arc<Dispatcher>,
    pub agents: Arc<AgentManager>,
    pub proactive: Arc<ProactiveOrchestrator>,
}

impl AppState {
    pub fn new(db: Database, config: &Config) -> Self {
        let hub = Arc::new(Hub::new());
        let presence = Arc::new(PresenceRegistry::new(config.disconnect_grace));
        let cache = Arc::new(AssignmentCache::new());
        let matcher = Arc::new(Matcher::default());
        let spool = Spool::start(db.clone());
        let notifier = Arc::new(Notifier::new(db.clone(), hub.clone()));

        let generator: Option<Arc<dyn Generator>> = config.gemini_api_key.as_ref().map(|key| {
            let client = Arc::new(GeminiClient::new(key.clone()));
            let registry = ModelRegistry::new(client, &config.gemini_model);
            tracing::info!(
                model = %registry.current_model(),
                fallbacks = ?registry.available_models(),
                "Gemini registry initialized"
            );
            Arc::new(registry) as Arc<dyn Generator>
        });
        let fetcher: Arc<dyn ByteFetcher> = Arc::new(HttpFetcher::new(
            config.private_storage_prefix.clone(),
            config.storage_proxy_url.clone(),
        ));
        let verifier: Arc<dyn AuthVerifier> = Arc::new(TokenVerifier::new(
            config.auth_signing_key.clone(),
            config.admin_shared_secret.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            hub.clone(),
            presence.clone(),
            cache.clone(),
            matcher,
            generator,
            fetcher,
            spool,
            notifier.clone(),
            config,
        ));
        let agents = Arc::new(AgentManager::new(
            db.clone(),
            hub.clone(),
            presence.clone(),
            cache.clone(),
            verifier,
            notifier,
        ));
        let proactive = Arc::new(ProactiveOrchestrator::new(
            db.clone(),
            hub.clone(),
            presence.clone(),
            cache,
        ));

        Self {
            db,
            hub,
            dispatcher,
            agents,
            proactive,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let db_ok = state.db.get_setting(crate::db::SETTING_SYSTEM_PROMPT).is_ok();
    Json(serde_json::json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
