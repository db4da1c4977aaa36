//! `slipway quota`: one quota reading and the allocator's view of it.

use std::sync::Arc;

use sw_domain::config::Config;

use super::render::print_snapshot;

pub async fn quota(config: Arc<Config>, json: bool) -> anyhow::Result<()> {
    let state = crate::bootstrap::build_app_state(config)?;

    if state.quota_source.is_none() {
        eprintln!("no [quota_source] configured; showing defaults only");
    }
    if let Err(e) = state.sample_quota().await {
        eprintln!("quota source: {e}");
    }

    let snapshot = state.allocator.snapshot();
    if json {
        let out = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| anyhow::anyhow!("serializing snapshot: {e}"))?;
        println!("{out}");
    } else {
        print_snapshot(&snapshot);
    }
    Ok(())
}
