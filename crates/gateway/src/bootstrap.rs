//! Service construction.
//!
//! [`build_app_state`] wires the real collaborators from config;
//! [`build_app_state_with`] takes the agent invoker and quota source
//! explicitly so tests and offline mode can substitute their own.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sw_domain::config::Config;
use sw_invoker::{AgentInvoker, CliInvoker};
use sw_sessions::{IdeaStore, ScratchSpace};

use crate::promote::LocalRepoMaterializer;
use crate::quota_source::{HttpQuotaSource, QuotaSource};
use crate::runtime::broadcast::EventBroadcaster;
use crate::runtime::sampler::spawn_sampler;
use crate::runtime::{
    ChannelBroadcaster, ContextManager, ManagerDeps, ProcessMap, QuotaAllocator, SessionManager,
};
use crate::settings::SettingsStore;
use crate::state::AppState;

/// Build the state with the CLI agent invoker and the HTTP quota source
/// (when `[quota_source].url` is set).
pub fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let invoker: Arc<dyn AgentInvoker> = Arc::new(CliInvoker::new(config.agent.clone()));
    let quota_source = HttpQuotaSource::from_config(&config.quota_source)
        .context("building quota source")?
        .map(|s| Arc::new(s) as Arc<dyn QuotaSource>);
    build_app_state_with(config, invoker, quota_source)
}

pub fn build_app_state_with(
    config: Arc<Config>,
    invoker: Arc<dyn AgentInvoker>,
    quota_source: Option<Arc<dyn QuotaSource>>,
) -> anyhow::Result<AppState> {
    // ── Settings (TOML seeds, settings.json overrides) ────────────────
    let settings = Arc::new(
        SettingsStore::open(
            &config.state.settings_path(),
            config.allocator.clone(),
            config.context.clone(),
        )
        .context("opening settings store")?,
    );

    // ── Shared plumbing ──────────────────────────────────────────────
    let broadcaster = Arc::new(ChannelBroadcaster::new(config.sessions.event_buffer));
    let processes = Arc::new(ProcessMap::new());
    let allocator = Arc::new(QuotaAllocator::new(settings.allocator()));
    let context = Arc::new(ContextManager::new(
        settings.context(),
        config.agent.summarization_model.clone(),
        invoker.clone(),
        broadcaster.clone() as Arc<dyn EventBroadcaster>,
        processes.clone(),
    ));

    // ── Persistence ──────────────────────────────────────────────────
    let ideas = Arc::new(
        IdeaStore::new(&config.state.ideas_path()).context("opening idea store")?,
    );
    let scratch = ScratchSpace::new(config.state.scratch_root());

    let sessions = SessionManager::new(ManagerDeps {
        sessions: config.sessions.clone(),
        promotion: config.promotion.clone(),
        default_model: config.agent.default_model.clone(),
        invoker: invoker.clone(),
        broadcaster: broadcaster.clone(),
        processes: processes.clone(),
        context: context.clone(),
        allocator: allocator.clone(),
        quota_source: quota_source.clone(),
        store: ideas.clone(),
        scratch,
        materializer: Arc::new(LocalRepoMaterializer::new(&config.promotion)),
    });
    let restored = sessions.restore_saved();

    tracing::info!(
        restored,
        quota_source = quota_source.is_some(),
        allocator_enabled = allocator.config().enabled,
        state_dir = %config.state.path.display(),
        "runtime ready"
    );

    Ok(AppState {
        config,
        settings,
        shutdown: CancellationToken::new(),
        sessions,
        context,
        allocator,
        ideas,
        broadcaster,
        processes,
        invoker,
        quota_source,
    })
}

/// Spawn the long-running background tasks. They stop when
/// `state.shutdown` is cancelled.
pub fn spawn_background_tasks(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    // ── Quota sampler ────────────────────────────────────────────────
    match (&state.quota_source, state.allocator.config().enabled) {
        (Some(source), true) => {
            let every = Duration::from_secs(state.config.quota_source.poll_interval_secs.max(1));
            tasks.push(spawn_sampler(
                state.allocator.clone(),
                source.clone(),
                Some(state.sessions.clone()),
                every,
                state.shutdown.clone(),
            ));
            tracing::info!(interval_secs = every.as_secs(), "quota sampler started");
        }
        (None, true) => tracing::info!("no quota source configured, sampler not started"),
        (_, false) => tracing::info!("allocator disabled, sampler not started"),
    }

    tasks
}
