//! `slipway settings`: inspect and patch the runtime settings document.

use std::sync::Arc;

use sw_domain::config::{AllocatorConfigPatch, Config, ContextSettingsPatch};

use super::SettingsCommand;

pub fn run(config: Arc<Config>, command: SettingsCommand) -> anyhow::Result<()> {
    let state = super::build_state(config, true)?;

    match command {
        SettingsCommand::Show => {}
        SettingsCommand::Allocator { patch } => {
            let patch: AllocatorConfigPatch = serde_json::from_str(&patch)
                .map_err(|e| anyhow::anyhow!("invalid allocator patch: {e}"))?;
            state.update_allocator(patch)?;
        }
        SettingsCommand::Context { patch } => {
            let patch: ContextSettingsPatch = serde_json::from_str(&patch)
                .map_err(|e| anyhow::anyhow!("invalid context patch: {e}"))?;
            state.update_context(patch)?;
        }
    }

    let out = serde_json::json!({
        "allocator": state.settings.allocator(),
        "context": state.settings.context(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
