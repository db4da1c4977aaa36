use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use sw_domain::config::{
    AllocatorConfig, AllocatorConfigPatch, Config, ContextConfig, ContextSettingsPatch,
};
use sw_domain::error::Result;
use sw_invoker::AgentInvoker;
use sw_sessions::IdeaStore;

use crate::quota_source::QuotaSource;
use crate::runtime::quota::UtilizationSample;
use crate::runtime::{
    ChannelBroadcaster, ContextManager, ProcessMap, QuotaAllocator, SessionManager,
};
use crate::settings::SettingsStore;

/// Shared services, built once after config load and passed to every
/// front end.
///
/// Fields are grouped by concern:
/// - **Core**: config, runtime-mutable settings, shutdown signal
/// - **Managers**: sessions, context window, quota allocator
/// - **Plumbing**: broadcaster, process map, agent invoker, quota source
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub settings: Arc<SettingsStore>,
    pub shutdown: CancellationToken,

    // ── Managers ──────────────────────────────────────────────────────
    pub sessions: Arc<SessionManager>,
    pub context: Arc<ContextManager>,
    pub allocator: Arc<QuotaAllocator>,
    pub ideas: Arc<IdeaStore>,

    // ── Plumbing ──────────────────────────────────────────────────────
    pub broadcaster: Arc<ChannelBroadcaster>,
    pub processes: Arc<ProcessMap>,
    pub invoker: Arc<dyn AgentInvoker>,
    pub quota_source: Option<Arc<dyn QuotaSource>>,
}

impl AppState {
    /// Persist an allocator patch and apply it to the live allocator.
    pub fn update_allocator(&self, patch: AllocatorConfigPatch) -> Result<AllocatorConfig> {
        let config = self.settings.update_allocator(patch)?;
        self.allocator.set_config(config.clone());
        Ok(config)
    }

    /// Persist a context-settings patch and apply it to the live manager.
    pub fn update_context(&self, patch: ContextSettingsPatch) -> Result<ContextConfig> {
        let config = self.settings.update_context(patch)?;
        self.context.set_config(config.clone());
        Ok(config)
    }

    /// Take one reading from the quota source, if one is configured.
    pub async fn sample_quota(&self) -> Result<Option<UtilizationSample>> {
        match &self.quota_source {
            Some(source) => self.allocator.record_utilization_sample(source.as_ref()).await,
            None => Ok(None),
        }
    }
}
