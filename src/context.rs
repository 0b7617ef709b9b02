//! Engine context
//!
//! Everything the components share, built once at startup and handed to each
//! constructor. Nothing in the crate reaches for a global.

use crate::config::EngineConfig;
use crate::control::{publish_best_effort, ControlChannel, LogControlChannel, Notification};
use crate::observability::EngineMetrics;
use crate::session::SessionHandle;
use crate::state::StateStore;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub state: Arc<StateStore>,
    pub control: Arc<dyn ControlChannel>,
    pub metrics: Arc<EngineMetrics>,
    /// The one browser session, owned by the supervisor and lent to the rest
    pub session: SessionHandle,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        state: Arc<StateStore>,
        control: Arc<dyn ControlChannel>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            state,
            control,
            metrics,
            session: SessionHandle::new(),
        }
    }

    /// Load state from the configured file; notifications go to `control`
    pub fn from_config(config: EngineConfig, control: Arc<dyn ControlChannel>) -> Self {
        let state = Arc::new(StateStore::load(&config.engine.state_file));
        let snapshot = state.snapshot();
        info!(
            state_file = %config.engine.state_file.display(),
            skip_size = snapshot.skip.len(),
            active = ?snapshot.active,
            enabled = snapshot.enabled,
            "Engine state loaded"
        );
        Self::new(config, state, control, Arc::new(EngineMetrics::new()))
    }

    /// Context whose notifications only reach the log
    pub fn log_only(config: EngineConfig) -> Self {
        Self::from_config(config, Arc::new(LogControlChannel))
    }

    pub fn engine_id(&self) -> &str {
        &self.config.engine.id
    }

    pub async fn notify(&self, notification: Notification) {
        publish_best_effort(self.control.as_ref(), notification).await;
    }

    /// Release the control channel
    pub async fn shutdown(&self) {
        if let Err(e) = self.control.shutdown().await {
            warn!(error = %e, "Control channel shutdown failed");
        }
        self.metrics.set_engine_state("stopped");
    }
}
