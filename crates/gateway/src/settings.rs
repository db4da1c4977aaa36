//! Runtime-mutable settings.
//!
//! `settings.json` under the state directory holds the allocator config and
//! the context-window overrides. The TOML file seeds both; once a field has
//! been patched at runtime the stored value wins. Updates are read, merge
//! per field, write.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sw_domain::config::{
    AllocatorConfig, AllocatorConfigPatch, ContextConfig, ContextSettingsPatch,
};
use sw_domain::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allocator: Option<AllocatorConfig>,
    #[serde(default)]
    context: ContextSettingsPatch,
}

pub struct SettingsStore {
    path: PathBuf,
    seed_allocator: AllocatorConfig,
    seed_context: ContextConfig,
    doc: RwLock<SettingsDocument>,
}

impl SettingsStore {
    /// Open the document at `path`, falling back to the seeds for anything
    /// it does not hold. An unreadable document is logged and ignored.
    pub fn open(
        path: &Path,
        seed_allocator: AllocatorConfig,
        seed_context: ContextConfig,
    ) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let doc = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "settings unreadable, using config file values"
                );
                SettingsDocument::default()
            })
        } else {
            SettingsDocument::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            seed_allocator,
            seed_context,
            doc: RwLock::new(doc),
        })
    }

    pub fn allocator(&self) -> AllocatorConfig {
        self.doc
            .read()
            .allocator
            .clone()
            .unwrap_or_else(|| self.seed_allocator.clone())
    }

    pub fn context(&self) -> ContextConfig {
        let mut config = self.seed_context.clone();
        config.apply(self.doc.read().context.clone());
        config
    }

    pub fn update_allocator(&self, patch: AllocatorConfigPatch) -> Result<AllocatorConfig> {
        let mut next = self.allocator();
        next.apply(patch);
        validate_allocator(&next)?;
        self.doc.write().allocator = Some(next.clone());
        self.flush()?;
        tracing::info!("allocator settings updated");
        Ok(next)
    }

    pub fn update_context(&self, patch: ContextSettingsPatch) -> Result<ContextConfig> {
        let merged = {
            let stored = &self.doc.read().context;
            ContextSettingsPatch {
                max_prompt_tokens: patch.max_prompt_tokens.or(stored.max_prompt_tokens),
                summarization_threshold: patch
                    .summarization_threshold
                    .or(stored.summarization_threshold),
                split_threshold: patch.split_threshold.or(stored.split_threshold),
                verbatim_recent_count: patch
                    .verbatim_recent_count
                    .or(stored.verbatim_recent_count),
                max_message_length: patch.max_message_length.or(stored.max_message_length),
            }
        };
        let mut next = self.seed_context.clone();
        next.apply(merged.clone());
        validate_context(&next)?;
        self.doc.write().context = merged;
        self.flush()?;
        tracing::info!("context settings updated");
        Ok(next)
    }

    fn flush(&self) -> Result<()> {
        let raw = serde_json::to_string_pretty(&*self.doc.read())?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn validate_context(c: &ContextConfig) -> Result<()> {
    for (name, v) in [
        ("summarization_threshold", c.summarization_threshold),
        ("split_threshold", c.split_threshold),
    ] {
        if !(v > 0.0 && v <= 1.0) {
            return Err(Error::Config(format!("{name} must be in (0, 1], got {v}")));
        }
    }
    if c.max_prompt_tokens == 0 || c.max_message_length == 0 {
        return Err(Error::Config(
            "max_prompt_tokens and max_message_length must be positive".into(),
        ));
    }
    Ok(())
}

fn validate_allocator(c: &AllocatorConfig) -> Result<()> {
    if !c.warn_thresholds.windows(2).all(|w| w[0] < w[1]) {
        return Err(Error::Config(format!(
            "warn_thresholds must be strictly ascending, got {:?}",
            c.warn_thresholds
        )));
    }
    for (name, v) in [
        ("session_cap_percent_5h", c.session_cap_percent_5h),
        ("workspace_weekly_cap_percent", c.workspace_weekly_cap_percent),
        ("reserve_percent", c.reserve_percent),
        ("queue_auto_pause_percent", c.queue_auto_pause_percent),
    ] {
        if !(0.0..=100.0).contains(&v) {
            return Err(Error::Config(format!("{name} must be within 0..=100, got {v}")));
        }
    }
    Ok(())
}
