//! Gateway application state (spec §6 control plane).

use crate::config::AppConfig;
use crate::fanout::Fanout;
use crate::session_manager::SessionManager;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub fanout: Arc<Fanout>,
    pub app_config: Arc<AppConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>, fanout: Arc<Fanout>, app_config: Arc<AppConfig>) -> Self {
        Self {
            sessions,
            fanout,
            app_config,
            started_at: Instant::now(),
        }
    }
}
