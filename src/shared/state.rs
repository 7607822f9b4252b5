use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::email::Notifier;
use crate::llm::Classify;
use crate::shared::db::DbPool;

/// Shared application state; every collaborator the handlers and the triage
/// worker need is injected here so tests can substitute fakes.
pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub classifier: Arc<dyn Classify>,
    pub notifier: Arc<dyn Notifier>,
    /// Best-effort nudge to the triage worker after an event row is committed.
    pub triage_tx: mpsc::UnboundedSender<Uuid>,
}
