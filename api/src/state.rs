use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::model::ProviderRegistry;

/// Per-turn orchestration limits, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct TurnSettings {
    /// Maximum model/tool-call iterations per turn. Multi-step tool use must
    /// terminate; an unbounded loop is a correctness bug.
    pub max_steps: usize,
    /// Bound on each individual tool-server connection attempt.
    pub connect_timeout: Duration,
}

impl TurnSettings {
    pub fn from_env() -> Self {
        let max_steps = std::env::var("PARLEY_MAX_STEPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8);
        let connect_timeout_ms = std::env::var("PARLEY_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5_000);
        Self {
            max_steps,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub models: Arc<ProviderRegistry>,
    pub turn: TurnSettings,
}
