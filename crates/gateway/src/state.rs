//! Shared application state

use std::sync::Arc;
use std::time::Duration;

use voxstream_broker::Broker;
use voxstream_config::Settings;

use crate::session::SessionManager;

/// State handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub broker: Arc<dyn Broker>,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(settings: Settings, broker: Arc<dyn Broker>) -> Self {
        let sessions = Arc::new(SessionManager::new(
            settings.gateway.max_sessions,
            Duration::from_millis(settings.gateway.idle_timeout_ms),
        ));
        Self {
            settings: Arc::new(settings),
            broker,
            sessions,
        }
    }
}
