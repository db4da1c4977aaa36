pub mod chat;
pub mod config;
pub mod ideas;
pub mod quota;
pub mod render;
pub mod run;
pub mod settings;

use clap::{Parser, Subcommand};

/// Slipway: run agent sessions under context and quota control.
#[derive(Debug, Parser)]
#[command(name = "slipway", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Interactive chat (default when no subcommand is given).
    Chat {
        /// Continue a saved idea instead of starting a new session.
        #[arg(long)]
        session: Option<String>,
        /// Use a local echo agent instead of spawning the agent binary.
        #[arg(long)]
        offline: bool,
    },
    /// Send a single message, print the reply and exit.
    Run {
        /// The message to send.
        message: String,
        /// Saved idea to continue.
        #[arg(long)]
        session: Option<String>,
        /// Print every session event as JSON instead of plain text.
        #[arg(long)]
        json: bool,
        /// Save the session afterwards.
        #[arg(long)]
        save: bool,
        #[arg(long)]
        offline: bool,
    },
    /// Sample the quota source once and print burn rate, cost estimate and
    /// budget status.
    Quota {
        #[arg(long)]
        json: bool,
    },
    /// Keep sampling quota in the foreground and log every sample.
    Monitor,
    /// List saved ideas.
    Ideas,
    /// Runtime settings stored next to the state.
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    /// Print the effective allocator and context settings as JSON.
    Show,
    /// Merge a JSON patch into the allocator settings,
    /// e.g. `{"session_cap_percent_5h": 70}`.
    Allocator { patch: String },
    /// Merge a JSON patch into the context settings,
    /// e.g. `{"max_prompt_tokens": 100000}`.
    Context { patch: String },
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path in `SW_CONFIG` (or `slipway.toml`
/// by default). A missing file yields the defaults. Returns the parsed
/// [`Config`](sw_domain::config::Config) and the path that was used.
pub fn load_config() -> anyhow::Result<(sw_domain::config::Config, String)> {
    let config_path = std::env::var("SW_CONFIG").unwrap_or_else(|_| "slipway.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        sw_domain::config::Config::default()
    };

    Ok((config, config_path))
}

/// Build the runtime, swapping in the echo agent when `offline`.
pub(crate) fn build_state(
    config: std::sync::Arc<sw_domain::config::Config>,
    offline: bool,
) -> anyhow::Result<crate::state::AppState> {
    if offline {
        crate::bootstrap::build_app_state_with(
            config,
            std::sync::Arc::new(sw_invoker::ScriptedInvoker::new()),
            None,
        )
    } else {
        crate::bootstrap::build_app_state(config)
    }
}
